//! Persistent bonding store.
//!
//! [`BondingStore`] is the contract every subsystem programs against. It is implemented by
//! [`FullDb`], which keeps any number of bondings (bounded by the settings file and
//! [`MAX_BONDINGS`](crate::config::MAX_BONDINGS)), and by [`SingleSlot`], which keeps one
//! BLE and one Classic pairing under fixed ids and evicts the previous occupant on every
//! store. Pick one when the services are constructed.
//!
//! Failures never cross this interface: they are logged, the persisted state is left as
//! it was and the call returns `false`, [`BondingId::INVALID`] or `None`.
//!
//! # Bonding id reuse
//!
//! [`FullDb`] hands out the lowest free id. An id freed by a deletion is given to the
//! next new bonding, so anything outside the device that remembers bonding ids can be
//! confused by a later, unrelated bonding carrying the same id.

mod base;
mod full_db;
mod single_slot;

use bt_hci::param::BdAddr;

pub use self::full_db::FullDb;
pub use self::single_slot::{SingleSlot, BLE_SLOT, CLASSIC_SLOT};
use crate::types::{
    BlePairing, BondingId, BondingKind, ClassicPairing, DeviceName, LinkKey, PairingInfo, RootKey, RootKeyKind,
    RootKeys, SystemCapabilities,
};

/// Fixed keys of the local device state.
pub mod keys {
    pub const ACTIVE_GATEWAY: &[u8] = b"ACTIVE_GATEWAY";
    pub const IS_UNFAITHFUL: &[u8] = b"IS_UNFAITHFUL";
    pub const ROOT_KEYS: &[u8] = b"ROOT_KEYS";
    pub const DEVICE_NAME: &[u8] = b"DEVICE_NAME";
    pub const AIRPLANE_MODE: &[u8] = b"AIRPLANE_MODE";
    pub const SYSTEM_CAPABILITIES: &[u8] = b"SYSTEM_CAPABILITIES";
    pub const BLE_PINNED_ADDRESS: &[u8] = b"BLE_PINNED_ADDRESS";
}

/// Persistent store of BT Classic and BLE bondings plus the local device state.
///
/// # Re-entrancy
///
/// The `for_each_*` callbacks run while the store lock is held. They must not call back
/// into the store.
pub trait BondingStore {
    /// Store the result of an LE pairing.
    ///
    /// A pairing with the same remote identity as a stored one updates that bonding in
    /// place (`DidChange`), keeping its id. Otherwise a new bonding is created (`DidAdd`).
    /// `device_name: None` keeps the stored name. Address pinning, once required, stays
    /// required. Returns [`BondingId::INVALID`] for empty pairing info or when the
    /// bonding could not be written.
    fn store_ble_pairing(
        &self,
        pairing_info: &PairingInfo,
        is_gateway: bool,
        device_name: Option<&str>,
        requires_address_pinning: bool,
        flags: u8,
    ) -> BondingId;

    /// Rename a BLE bonding. Fails if `id` is not a BLE bonding.
    fn update_ble_device_name(&self, id: BondingId, name: &str) -> bool;

    /// Record whether the remote of a BLE bonding supports ANCS.
    fn update_ble_supports_ancs(&self, id: BondingId, supports_ancs: bool) -> bool;

    /// Delete a BLE bonding. `WillDelete` is reported before the record goes away.
    fn delete_ble_pairing_by_id(&self, id: BondingId);

    /// Delete the BLE bonding with identity address `device`.
    fn delete_ble_pairing_by_addr(&self, device: &BdAddr) -> bool;

    fn get_ble_pairing_by_id(&self, id: BondingId) -> Option<BlePairing>;

    /// Find a BLE bonding by remote identity address.
    fn get_ble_pairing_by_addr(&self, device: &BdAddr) -> Option<(BondingId, BlePairing)>;

    /// Visit every BLE bonding.
    fn for_each_ble_pairing(&self, f: &mut dyn FnMut(BondingId, &BlePairing));

    /// Does any BLE bonding require the local address to stay pinned?
    fn has_pinned_ble_pairings(&self) -> bool;

    /// Store the result of a BR/EDR pairing. A known `addr` is updated in place, with
    /// `None` arguments keeping the stored values. A new bonding needs a link key.
    fn store_bt_classic_pairing(
        &self,
        addr: &BdAddr,
        link_key: Option<&LinkKey>,
        name: Option<&str>,
        platform_bits: Option<u8>,
    ) -> BondingId;

    fn delete_bt_classic_pairing_by_id(&self, id: BondingId);

    fn delete_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> bool;

    fn get_bt_classic_pairing_by_id(&self, id: BondingId) -> Option<ClassicPairing>;

    fn get_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> Option<(BondingId, ClassicPairing)>;

    fn for_each_bt_classic_pairing(&self, f: &mut dyn FnMut(BondingId, &ClassicPairing));

    /// The active gateway, if it still refers to a stored bonding.
    fn active_gateway(&self) -> Option<(BondingId, BondingKind)>;

    /// Make `id` the active gateway.
    ///
    /// Nothing is written if it already is. Otherwise the store becomes unfaithful and
    /// the cached system capabilities are dropped, forcing a renegotiation.
    fn set_active_gateway(&self, id: BondingId);

    /// Has the active gateway changed without the remote knowing yet?
    fn is_unfaithful(&self) -> bool;

    fn set_unfaithful(&self, unfaithful: bool);

    fn get_root_key(&self, kind: RootKeyKind) -> Option<RootKey>;

    fn set_root_keys(&self, keys: &RootKeys) -> bool;

    fn get_local_device_name(&self) -> Option<DeviceName>;

    fn set_local_device_name(&self, name: &str) -> bool;

    fn get_ble_pinned_address(&self) -> Option<BdAddr>;

    /// Persist the pinned private resolvable address, or forget it with `None`.
    fn set_ble_pinned_address(&self, addr: Option<&BdAddr>) -> bool;

    fn get_airplane_mode_enabled(&self) -> bool;

    fn set_airplane_mode_enabled(&self, enabled: bool) -> bool;

    /// Capabilities last reported by the gateway, [`SystemCapabilities::NONE`] if unknown.
    fn get_cached_system_capabilities(&self) -> SystemCapabilities;

    /// Cache gateway capabilities. A change event carrying the flipped bits is published
    /// only if at least one bit changed.
    fn set_cached_system_capabilities(&self, capabilities: SystemCapabilities);

    /// Delete every bonding, keeping the local device state.
    fn delete_all_pairings(&self);

    /// Is there an active gateway of kind `kind`?
    fn has_active_gateway(&self, kind: BondingKind) -> bool {
        matches!(self.active_gateway(), Some((_, k)) if k == kind)
    }

    /// Does any BLE bonding support ANCS?
    fn has_ble_ancs_bonding(&self) -> bool {
        let mut found = false;
        self.for_each_ble_pairing(&mut |_, pairing| found |= pairing.supports_ancs);
        found
    }
}

/// Copy of the gateway pairing kept where recovery firmware can read it.
///
/// Writes through this interface do not produce bonding change notifications.
pub trait SharedStorage {
    fn store_gateway_ble_pairing(&self, pairing: &BlePairing) -> bool;
    fn delete_gateway_ble_pairing(&self);
    fn gateway_ble_pairing(&self) -> Option<BlePairing>;
    fn store_gateway_bt_classic_pairing(&self, pairing: &ClassicPairing) -> bool;
    fn delete_gateway_bt_classic_pairing(&self);
    fn gateway_bt_classic_pairing(&self) -> Option<ClassicPairing>;
    fn store_root_keys(&self, keys: &RootKeys) -> bool;
    fn store_local_device_name(&self, name: &str) -> bool;
}
