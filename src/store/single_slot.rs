use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;

use super::base::{
    expect_ble, expect_classic, found, local_state_methods, read_record, write_record, write_value, written,
    ActiveGateway, StoreCore,
};
use super::{keys, BondingStore, SharedStorage};
use crate::kv::SettingsFile;
use crate::notify::Notifier;
use crate::record::BondingRecord;
use crate::types::{
    device_name, BlePairing, BondingChangeOp, BondingId, BondingKind, ClassicPairing, DeviceName, LinkKey,
    PairingInfo, RootKeys,
};
use crate::Error;

/// Id of the only BLE bonding of a [`SingleSlot`] store.
pub const BLE_SLOT: BondingId = BondingId(0);
/// Id of the only BT Classic bonding of a [`SingleSlot`] store.
pub const CLASSIC_SLOT: BondingId = BondingId(1);

const BLE_KEY: &[u8] = b"BLE_PAIRING";
const CLASSIC_KEY: &[u8] = b"BT_CLASSIC_PAIRING";

/// Store keeping at most one BLE and one BT Classic bonding, as used by recovery
/// firmware.
///
/// Storing a pairing of another remote evicts the current occupant of the slot: a
/// `WillDelete` is reported for it before the new pairing is written. The eviction is
/// not undone when that write fails: the slot is then left empty and
/// [`BondingId::INVALID`] is returned.
///
/// The store also implements [`SharedStorage`], so that the full database of the main
/// firmware can keep the recovery copy of the active gateway up to date. Those writes
/// are not reported to the notifier.
pub struct SingleSlot<'d, M: RawMutex, F: SettingsFile> {
    core: StoreCore<'d, M, F>,
}

fn slot_key(kind: BondingKind) -> &'static [u8] {
    match kind {
        BondingKind::Ble => BLE_KEY,
        BondingKind::BtClassic => CLASSIC_KEY,
    }
}

fn slot_id(kind: BondingKind) -> BondingId {
    match kind {
        BondingKind::Ble => BLE_SLOT,
        BondingKind::BtClassic => CLASSIC_SLOT,
    }
}

impl<'d, M: RawMutex, F: SettingsFile> SingleSlot<'d, M, F> {
    pub fn new(file: F, notifier: &'d Notifier<'d, M>) -> Self {
        Self {
            core: StoreCore::new(file, notifier, None),
        }
    }

    /// Run `f` on the settings file with the store lock held.
    pub fn with_settings<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        self.core.with_file(f)
    }

    fn read_ble(file: &mut F) -> Result<BlePairing, Error> {
        expect_ble(BLE_SLOT, read_record(file, BLE_KEY)?)
    }

    fn read_classic(file: &mut F) -> Result<ClassicPairing, Error> {
        expect_classic(CLASSIC_SLOT, read_record(file, CLASSIC_KEY)?)
    }

    fn is_occupied(&self, kind: BondingKind) -> bool {
        self.core.with_file(|file| match kind {
            BondingKind::Ble => found(Self::read_ble(file)).is_some(),
            BondingKind::BtClassic => found(Self::read_classic(file)).is_some(),
        })
    }

    /// Empty the slot of `kind` without reporting it.
    fn clear_slot(file: &mut F, kind: BondingKind) -> Result<(), Error> {
        StoreCore::<M, F>::clear_active_gateway(file, slot_id(kind), kind)?;
        file.delete(slot_key(kind))
    }

    /// Report and remove the occupant of the slot of `kind`.
    fn evict(&self, kind: BondingKind) {
        let id = slot_id(kind);
        self.core.notify(self, id, kind, BondingChangeOp::WillDelete);
        if written(self.core.with_file(|file| Self::clear_slot(file, kind))) {
            info!("[bonding] evicted {:?} bonding {:?}", kind, id);
        }
    }

    fn update_ble(&self, id: BondingId, update: impl FnOnce(&mut BlePairing)) -> bool {
        if id != BLE_SLOT {
            warn!("[bonding] {:?} is not the BLE slot", id);
            return false;
        }
        let result = self.core.with_file(|file| {
            let mut pairing = Self::read_ble(file)?;
            update(&mut pairing);
            write_record(file, BLE_KEY, &BondingRecord::Ble(pairing))
        });
        if written(result) {
            self.core.notify(self, BLE_SLOT, BondingKind::Ble, BondingChangeOp::DidChange);
            true
        } else {
            false
        }
    }
}

impl<M: RawMutex, F: SettingsFile> BondingStore for SingleSlot<'_, M, F> {
    fn store_ble_pairing(
        &self,
        pairing_info: &PairingInfo,
        is_gateway: bool,
        name: Option<&str>,
        requires_address_pinning: bool,
        flags: u8,
    ) -> BondingId {
        if pairing_info.is_empty() {
            warn!("[bonding] refusing to store empty pairing info");
            return BondingId::INVALID;
        }
        let current = self.core.with_file(|file| found(Self::read_ble(file)));
        let (op, pairing) = match current {
            Some(mut pairing) if pairing.pairing_info.is_same_remote(pairing_info) => {
                pairing.pairing_info = *pairing_info;
                pairing.is_gateway = is_gateway;
                pairing.requires_address_pinning |= requires_address_pinning;
                pairing.flags = flags;
                if let Some(name) = name {
                    pairing.name = device_name(name);
                }
                (BondingChangeOp::DidChange, pairing)
            }
            current => {
                if current.is_some() {
                    self.evict(BondingKind::Ble);
                }
                let pairing = BlePairing {
                    pairing_info: *pairing_info,
                    name: name.map(device_name).unwrap_or_else(DeviceName::new),
                    is_gateway,
                    supports_ancs: false,
                    requires_address_pinning,
                    flags,
                };
                (BondingChangeOp::DidAdd, pairing)
            }
        };

        let result = self.core.with_file(|file| {
            write_record(file, BLE_KEY, &BondingRecord::Ble(pairing))?;
            if is_gateway {
                let gateway = ActiveGateway {
                    id: BLE_SLOT,
                    kind: BondingKind::Ble,
                };
                StoreCore::<M, F>::write_active_gateway(file, gateway)?;
            }
            Ok(())
        });
        if !written(result) {
            return BondingId::INVALID;
        }
        info!("[bonding] stored BLE bonding in slot ({:?})", op);
        self.core.notify(self, BLE_SLOT, BondingKind::Ble, op);
        BLE_SLOT
    }

    fn update_ble_device_name(&self, id: BondingId, name: &str) -> bool {
        self.update_ble(id, |pairing| pairing.name = device_name(name))
    }

    fn update_ble_supports_ancs(&self, id: BondingId, supports_ancs: bool) -> bool {
        self.update_ble(id, |pairing| pairing.supports_ancs = supports_ancs)
    }

    fn delete_ble_pairing_by_id(&self, id: BondingId) {
        if id == BLE_SLOT && self.is_occupied(BondingKind::Ble) {
            self.evict(BondingKind::Ble);
        }
    }

    fn delete_ble_pairing_by_addr(&self, device: &BdAddr) -> bool {
        if self.get_ble_pairing_by_addr(device).is_none() {
            return false;
        }
        self.evict(BondingKind::Ble);
        true
    }

    fn get_ble_pairing_by_id(&self, id: BondingId) -> Option<BlePairing> {
        if id != BLE_SLOT {
            return None;
        }
        self.core.with_file(|file| found(Self::read_ble(file)))
    }

    fn get_ble_pairing_by_addr(&self, device: &BdAddr) -> Option<(BondingId, BlePairing)> {
        self.get_ble_pairing_by_id(BLE_SLOT)
            .filter(|pairing| {
                pairing.pairing_info.is_remote_identity_info_valid && pairing.pairing_info.identity.addr == *device
            })
            .map(|pairing| (BLE_SLOT, pairing))
    }

    fn for_each_ble_pairing(&self, f: &mut dyn FnMut(BondingId, &BlePairing)) {
        if let Some(pairing) = self.get_ble_pairing_by_id(BLE_SLOT) {
            f(BLE_SLOT, &pairing);
        }
    }

    fn has_pinned_ble_pairings(&self) -> bool {
        self.get_ble_pairing_by_id(BLE_SLOT)
            .map(|pairing| pairing.requires_address_pinning)
            .unwrap_or(false)
    }

    fn store_bt_classic_pairing(
        &self,
        addr: &BdAddr,
        link_key: Option<&LinkKey>,
        name: Option<&str>,
        platform_bits: Option<u8>,
    ) -> BondingId {
        let current = self.core.with_file(|file| found(Self::read_classic(file)));
        let (op, pairing) = match current {
            Some(mut pairing) if pairing.addr == *addr => {
                if let Some(link_key) = link_key {
                    pairing.link_key = *link_key;
                }
                if let Some(name) = name {
                    pairing.name = device_name(name);
                }
                if let Some(platform_bits) = platform_bits {
                    pairing.platform_bits = platform_bits;
                }
                (BondingChangeOp::DidChange, pairing)
            }
            current => {
                let Some(link_key) = link_key else {
                    warn!("[bonding] new BT Classic pairing without link key");
                    return BondingId::INVALID;
                };
                if current.is_some() {
                    self.evict(BondingKind::BtClassic);
                }
                let pairing = ClassicPairing {
                    addr: *addr,
                    link_key: *link_key,
                    name: name.map(device_name).unwrap_or_else(DeviceName::new),
                    platform_bits: platform_bits.unwrap_or(0),
                };
                (BondingChangeOp::DidAdd, pairing)
            }
        };

        if !written(self.core.with_file(|file| write_record(file, CLASSIC_KEY, &BondingRecord::BtClassic(pairing)))) {
            return BondingId::INVALID;
        }
        info!("[bonding] stored BT Classic bonding in slot ({:?})", op);
        self.core.notify(self, CLASSIC_SLOT, BondingKind::BtClassic, op);
        CLASSIC_SLOT
    }

    fn delete_bt_classic_pairing_by_id(&self, id: BondingId) {
        if id == CLASSIC_SLOT && self.is_occupied(BondingKind::BtClassic) {
            self.evict(BondingKind::BtClassic);
        }
    }

    fn delete_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> bool {
        if self.get_bt_classic_pairing_by_addr(addr).is_none() {
            return false;
        }
        self.evict(BondingKind::BtClassic);
        true
    }

    fn get_bt_classic_pairing_by_id(&self, id: BondingId) -> Option<ClassicPairing> {
        if id != CLASSIC_SLOT {
            return None;
        }
        self.core.with_file(|file| found(Self::read_classic(file)))
    }

    fn get_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> Option<(BondingId, ClassicPairing)> {
        self.get_bt_classic_pairing_by_id(CLASSIC_SLOT)
            .filter(|pairing| pairing.addr == *addr)
            .map(|pairing| (CLASSIC_SLOT, pairing))
    }

    fn for_each_bt_classic_pairing(&self, f: &mut dyn FnMut(BondingId, &ClassicPairing)) {
        if let Some(pairing) = self.get_bt_classic_pairing_by_id(CLASSIC_SLOT) {
            f(CLASSIC_SLOT, &pairing);
        }
    }

    fn active_gateway(&self) -> Option<(BondingId, BondingKind)> {
        let gateway = self.core.with_file(|file| StoreCore::<M, F>::active_gateway_raw(file))?;
        (gateway.id == slot_id(gateway.kind) && self.is_occupied(gateway.kind)).then_some((gateway.id, gateway.kind))
    }

    fn set_active_gateway(&self, id: BondingId) {
        let kind = match id {
            BLE_SLOT => BondingKind::Ble,
            CLASSIC_SLOT => BondingKind::BtClassic,
            _ => {
                warn!("[bonding] cannot make {:?} the active gateway", id);
                return;
            }
        };
        if !self.is_occupied(kind) {
            warn!("[bonding] cannot make empty slot {:?} the active gateway", id);
            return;
        }
        let result = self
            .core
            .with_file(|file| StoreCore::<M, F>::write_active_gateway(file, ActiveGateway { id, kind }));
        if let Err(e) = result {
            error!("[bonding] failed to write active gateway: {:?}", e);
        }
    }

    fn delete_all_pairings(&self) {
        for kind in [BondingKind::Ble, BondingKind::BtClassic] {
            if self.is_occupied(kind) {
                self.evict(kind);
            }
        }
    }

    local_state_methods!();
}

impl<M: RawMutex, F: SettingsFile> SharedStorage for SingleSlot<'_, M, F> {
    fn store_gateway_ble_pairing(&self, pairing: &BlePairing) -> bool {
        written(self.core.with_file(|file| {
            write_record(file, BLE_KEY, &BondingRecord::Ble(pairing.clone()))?;
            let gateway = ActiveGateway {
                id: BLE_SLOT,
                kind: BondingKind::Ble,
            };
            write_value(file, keys::ACTIVE_GATEWAY, &gateway)
        }))
    }

    fn delete_gateway_ble_pairing(&self) {
        let _ = written(self.core.with_file(|file| Self::clear_slot(file, BondingKind::Ble)));
    }

    fn gateway_ble_pairing(&self) -> Option<BlePairing> {
        self.core.with_file(|file| found(Self::read_ble(file)))
    }

    fn store_gateway_bt_classic_pairing(&self, pairing: &ClassicPairing) -> bool {
        written(self.core.with_file(|file| {
            write_record(file, CLASSIC_KEY, &BondingRecord::BtClassic(pairing.clone()))?;
            let gateway = ActiveGateway {
                id: CLASSIC_SLOT,
                kind: BondingKind::BtClassic,
            };
            write_value(file, keys::ACTIVE_GATEWAY, &gateway)
        }))
    }

    fn delete_gateway_bt_classic_pairing(&self) {
        let _ = written(self.core.with_file(|file| Self::clear_slot(file, BondingKind::BtClassic)));
    }

    fn gateway_bt_classic_pairing(&self) -> Option<ClassicPairing> {
        self.core.with_file(|file| found(Self::read_classic(file)))
    }

    fn store_root_keys(&self, root_keys: &RootKeys) -> bool {
        self.core.set_root_keys(root_keys)
    }

    fn store_local_device_name(&self, name: &str) -> bool {
        self.core.set_local_device_name(name)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::kv::RamSettingsFile;
    use crate::notify::{BondingChange, BondingChangeHandler, Stage};
    use crate::store::FullDb;
    use crate::testing::{init_log, pairing_info, FakeEvents};

    type File = RamSettingsFile<1024>;

    /// Records each change together with the BLE pairing visible at that point.
    struct SlotWatcher {
        seen: RefCell<std::vec::Vec<(BondingChangeOp, Option<PairingInfo>)>>,
    }

    impl BondingChangeHandler for SlotWatcher {
        fn bonding_changed(&self, store: &dyn BondingStore, change: &BondingChange) {
            let stored = store.get_ble_pairing_by_id(change.id).map(|p| p.pairing_info);
            self.seen.borrow_mut().push((change.op, stored));
        }
    }

    #[test]
    fn second_remote_evicts_the_first() {
        init_log();
        let events = FakeEvents::default();
        let watcher = SlotWatcher {
            seen: RefCell::new(std::vec::Vec::new()),
        };
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        notifier.subscribe(Stage::Reconnect, &watcher);
        let slot = SingleSlot::new(File::new(), &notifier);

        assert_eq!(slot.store_ble_pairing(&pairing_info(1), false, None, false, 0), BLE_SLOT);
        assert_eq!(slot.store_ble_pairing(&pairing_info(1), false, None, false, 0), BLE_SLOT);
        assert_eq!(slot.store_ble_pairing(&pairing_info(2), false, None, false, 0), BLE_SLOT);

        assert_eq!(
            *watcher.seen.borrow(),
            [
                (BondingChangeOp::DidAdd, Some(pairing_info(1))),
                (BondingChangeOp::DidChange, Some(pairing_info(1))),
                // The evicted pairing is still readable while it is reported
                (BondingChangeOp::WillDelete, Some(pairing_info(1))),
                (BondingChangeOp::DidAdd, Some(pairing_info(2))),
            ]
        );

        let mut count = 0;
        slot.for_each_ble_pairing(&mut |_, _| count += 1);
        assert_eq!(count, 1);
        assert!(slot.get_ble_pairing_by_addr(&pairing_info(1).identity.addr).is_none());
        assert!(slot.get_ble_pairing_by_addr(&pairing_info(2).identity.addr).is_some());
    }

    #[test]
    fn slots_are_independent() {
        let events = FakeEvents::default();
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let slot = SingleSlot::new(File::new(), &notifier);
        let car = BdAddr::new([7; 6]);

        assert_eq!(slot.store_ble_pairing(&pairing_info(1), false, None, true, 0), BLE_SLOT);
        assert_eq!(
            slot.store_bt_classic_pairing(&car, Some(&LinkKey(3)), Some("Car"), None),
            CLASSIC_SLOT
        );
        assert!(slot.has_pinned_ble_pairings());
        assert!(slot.get_bt_classic_pairing_by_id(BLE_SLOT).is_none());
        assert!(!slot.update_ble_device_name(CLASSIC_SLOT, "nope"));
        assert!(slot.update_ble_device_name(BLE_SLOT, "Phone"));
        assert_eq!(slot.get_ble_pairing_by_id(BLE_SLOT).unwrap().name.as_str(), "Phone");

        slot.set_active_gateway(CLASSIC_SLOT);
        assert_eq!(slot.active_gateway(), Some((CLASSIC_SLOT, BondingKind::BtClassic)));
        assert!(slot.delete_bt_classic_pairing_by_addr(&car));
        assert_eq!(slot.active_gateway(), None);

        slot.delete_all_pairings();
        assert!(slot.get_ble_pairing_by_id(BLE_SLOT).is_none());
        assert!(!slot.has_pinned_ble_pairings());
    }

    #[test]
    fn full_db_mirrors_the_gateway() {
        init_log();
        let events = FakeEvents::default();
        let shared_notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let shared = SingleSlot::new(File::new(), &shared_notifier);
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::with_shared_storage(RamSettingsFile::<4096>::new(), &notifier, &shared);

        db.store_ble_pairing(&pairing_info(1), false, None, false, 0);
        assert!(shared.gateway_ble_pairing().is_none());

        let gateway = db.store_ble_pairing(&pairing_info(2), true, Some("Phone"), false, 0);
        let mirrored = shared.gateway_ble_pairing().unwrap();
        assert_eq!(mirrored.pairing_info, pairing_info(2));
        assert_eq!(mirrored.name.as_str(), "Phone");
        assert_eq!(shared.active_gateway(), Some((BLE_SLOT, BondingKind::Ble)));

        assert!(db.set_local_device_name("Runner"));
        assert_eq!(shared.get_local_device_name().unwrap().as_str(), "Runner");

        // Only bonding changes of the full database are reported
        let reported: std::vec::Vec<_> = events
            .take()
            .into_iter()
            .filter(|e| matches!(e, crate::driver::Event::BondingChanged { .. }))
            .collect();
        assert_eq!(reported.len(), 2);

        db.delete_ble_pairing_by_id(gateway);
        assert!(shared.gateway_ble_pairing().is_none());
        assert_eq!(shared.active_gateway(), None);
    }
}
