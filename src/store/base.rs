//! State and helpers shared by both store backends.

use core::cell::RefCell;

use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use super::{keys, BondingStore, SharedStorage};
use crate::codec::{self, Decode, Encode, FixedSize};
use crate::driver::Event;
use crate::kv::SettingsFile;
use crate::notify::{BondingChange, Notifier};
use crate::record::{get_name, put_name, BondingRecord, MAX_RECORD_LEN};
use crate::types::{
    BlePairing, BondingChangeOp, BondingId, BondingKind, ClassicPairing, DeviceName, RootKey, RootKeyKind,
    RootKeys, SystemCapabilities, DEVICE_NAME_MAX,
};
use crate::Error;

/// Persisted pointer to the active gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ActiveGateway {
    pub id: BondingId,
    pub kind: BondingKind,
}

impl FixedSize for ActiveGateway {
    const SIZE: usize = 2;
}

impl Encode for ActiveGateway {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        codec::room::<Self>(dest)?;
        dest[0] = self.id.0;
        dest[1] = self.kind.into();
        Ok(())
    }
}

impl Decode<'_> for ActiveGateway {
    fn decode(src: &[u8]) -> Result<Self, codec::Error> {
        codec::exact::<Self>(src)?;
        Ok(Self {
            id: BondingId(src[0]),
            kind: BondingKind::try_from(src[1]).map_err(|_| codec::Error::InvalidValue)?,
        })
    }
}

impl FixedSize for RootKeys {
    const SIZE: usize = 32;
}

impl Encode for RootKeys {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        codec::room::<Self>(dest)?;
        dest[..16].copy_from_slice(&self.encryption.to_le_bytes());
        dest[16..32].copy_from_slice(&self.identity.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for RootKeys {
    fn decode(src: &[u8]) -> Result<Self, codec::Error> {
        codec::exact::<Self>(src)?;
        let mut encryption = [0u8; 16];
        let mut identity = [0u8; 16];
        encryption.copy_from_slice(&src[..16]);
        identity.copy_from_slice(&src[16..]);
        Ok(Self {
            encryption: RootKey::from_le_bytes(encryption),
            identity: RootKey::from_le_bytes(identity),
        })
    }
}

impl FixedSize for SystemCapabilities {
    const SIZE: usize = 8;
}

impl Encode for SystemCapabilities {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        self.0.encode(dest)
    }
}

impl Decode<'_> for SystemCapabilities {
    fn decode(src: &[u8]) -> Result<Self, codec::Error> {
        Ok(Self(u64::decode(src)?))
    }
}

impl FixedSize for BdAddr {
    const SIZE: usize = 6;
}

impl Encode for BdAddr {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        codec::room::<Self>(dest)?;
        dest[..6].copy_from_slice(self.raw());
        Ok(())
    }
}

impl Decode<'_> for BdAddr {
    fn decode(src: &[u8]) -> Result<Self, codec::Error> {
        codec::exact::<Self>(src)?;
        let mut addr = [0u8; 6];
        addr.copy_from_slice(src);
        Ok(BdAddr::new(addr))
    }
}

const VALUE_BUF: usize = 32;

pub(crate) fn read_value<T: FixedSize + for<'a> Decode<'a>>(file: &mut dyn SettingsFile, key: &[u8]) -> Result<T, Error> {
    let mut buf = [0u8; VALUE_BUF];
    let len = file.get(key, &mut buf)?;
    if len != T::SIZE {
        return Err(Error::Corrupt);
    }
    Ok(T::decode(&buf[..len])?)
}

pub(crate) fn write_value<T: FixedSize + Encode>(file: &mut dyn SettingsFile, key: &[u8], value: &T) -> Result<(), Error> {
    let mut buf = [0u8; VALUE_BUF];
    value.encode(&mut buf[..T::SIZE])?;
    file.set(key, &buf[..T::SIZE])
}

pub(crate) fn read_record(file: &mut dyn SettingsFile, key: &[u8]) -> Result<BondingRecord, Error> {
    let mut buf = [0u8; MAX_RECORD_LEN];
    let len = file.get(key, &mut buf)?;
    BondingRecord::decode(&buf[..len.min(MAX_RECORD_LEN)])
}

pub(crate) fn write_record(file: &mut dyn SettingsFile, key: &[u8], record: &BondingRecord) -> Result<(), Error> {
    let mut buf = [0u8; MAX_RECORD_LEN];
    let len = record.encode(&mut buf);
    file.set(key, &buf[..len])
}

/// The BLE pairing in `record`, or [`Error::NotFound`] if it holds another kind.
pub(crate) fn expect_ble(id: BondingId, record: BondingRecord) -> Result<BlePairing, Error> {
    match record {
        BondingRecord::Ble(pairing) => Ok(pairing),
        BondingRecord::BtClassic(_) => {
            warn!("[bonding] id {:?} is a BT Classic bonding, expected BLE", id);
            Err(Error::NotFound)
        }
    }
}

/// The BT Classic pairing in `record`, or [`Error::NotFound`] if it holds another kind.
pub(crate) fn expect_classic(id: BondingId, record: BondingRecord) -> Result<ClassicPairing, Error> {
    match record {
        BondingRecord::BtClassic(pairing) => Ok(pairing),
        BondingRecord::Ble(_) => {
            warn!("[bonding] id {:?} is a BLE bonding, expected BT Classic", id);
            Err(Error::NotFound)
        }
    }
}

/// Turn a failed lookup into `None`, logging anything worse than a missing key.
pub(crate) fn found<T>(result: Result<T, Error>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(Error::NotFound) => None,
        Err(e) => {
            warn!("[bonding] read failed: {:?}", e);
            None
        }
    }
}

/// Turn a failed write into `false`.
pub(crate) fn written(result: Result<(), Error>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("[bonding] write failed: {:?}", e);
            false
        }
    }
}

/// Settings file, lock, notifier and shared copy common to both backends.
pub(crate) struct StoreCore<'d, M: RawMutex, F: SettingsFile> {
    file: Mutex<M, RefCell<F>>,
    pub(crate) notifier: &'d Notifier<'d, M>,
    pub(crate) shared: Option<&'d dyn SharedStorage>,
}

impl<'d, M: RawMutex, F: SettingsFile> StoreCore<'d, M, F> {
    pub(crate) fn new(file: F, notifier: &'d Notifier<'d, M>, shared: Option<&'d dyn SharedStorage>) -> Self {
        Self {
            file: Mutex::new(RefCell::new(file)),
            notifier,
            shared,
        }
    }

    pub(crate) fn into_file(self) -> F {
        self.file.into_inner().into_inner()
    }

    /// Run `f` with the store lock held.
    pub(crate) fn with_file<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        self.file.lock(|file| f(&mut file.borrow_mut()))
    }

    pub(crate) fn notify(&self, store: &dyn BondingStore, id: BondingId, kind: BondingKind, op: BondingChangeOp) {
        self.notifier.notify(store, BondingChange { id, kind, op });
    }

    pub(crate) fn active_gateway_raw(file: &mut F) -> Option<ActiveGateway> {
        found(read_value::<ActiveGateway>(file, keys::ACTIVE_GATEWAY))
    }

    /// Point the active gateway at `gateway`. Returns whether anything changed.
    pub(crate) fn write_active_gateway(file: &mut F, gateway: ActiveGateway) -> Result<bool, Error> {
        if Self::active_gateway_raw(file) == Some(gateway) {
            return Ok(false);
        }
        write_value(file, keys::ACTIVE_GATEWAY, &gateway)?;
        write_value(file, keys::IS_UNFAITHFUL, &true)?;
        file.delete(keys::SYSTEM_CAPABILITIES)?;
        info!("[bonding] active gateway is now {:?} {:?}", gateway.kind, gateway.id);
        Ok(true)
    }

    /// Forget the active gateway if it is `id`.
    pub(crate) fn clear_active_gateway(file: &mut F, id: BondingId, kind: BondingKind) -> Result<bool, Error> {
        if Self::active_gateway_raw(file) == Some(ActiveGateway { id, kind }) {
            file.delete(keys::ACTIVE_GATEWAY)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn mirror_ble(&self, pairing: &BlePairing) {
        if let Some(shared) = self.shared {
            if !shared.store_gateway_ble_pairing(pairing) {
                warn!("[bonding] failed to mirror gateway pairing to shared storage");
            }
        }
    }

    pub(crate) fn mirror_classic(&self, pairing: &ClassicPairing) {
        if let Some(shared) = self.shared {
            if !shared.store_gateway_bt_classic_pairing(pairing) {
                warn!("[bonding] failed to mirror gateway pairing to shared storage");
            }
        }
    }

    pub(crate) fn is_unfaithful(&self) -> bool {
        self.with_file(|file| found(read_value::<bool>(file, keys::IS_UNFAITHFUL))).unwrap_or(false)
    }

    pub(crate) fn set_unfaithful(&self, unfaithful: bool) {
        let _ = written(self.with_file(|file| write_value(file, keys::IS_UNFAITHFUL, &unfaithful)));
    }

    pub(crate) fn get_root_key(&self, kind: RootKeyKind) -> Option<RootKey> {
        self.with_file(|file| found(read_value::<RootKeys>(file, keys::ROOT_KEYS)))
            .map(|keys| keys.get(kind))
    }

    pub(crate) fn set_root_keys(&self, root_keys: &RootKeys) -> bool {
        let ok = written(self.with_file(|file| write_value(file, keys::ROOT_KEYS, root_keys)));
        if ok {
            if let Some(shared) = self.shared {
                shared.store_root_keys(root_keys);
            }
        }
        ok
    }

    pub(crate) fn get_local_device_name(&self) -> Option<DeviceName> {
        self.with_file(|file| {
            let mut buf = [0u8; DEVICE_NAME_MAX];
            let len = found(file.get(keys::DEVICE_NAME, &mut buf))?;
            Some(get_name(&buf[..len.min(DEVICE_NAME_MAX)]))
        })
    }

    pub(crate) fn set_local_device_name(&self, name: &str) -> bool {
        let mut buf = [0u8; DEVICE_NAME_MAX];
        put_name(&mut buf, name);
        let len = buf.iter().position(|b| *b == 0).unwrap_or(DEVICE_NAME_MAX);
        let ok = written(self.with_file(|file| file.set(keys::DEVICE_NAME, &buf[..len])));
        if ok {
            if let Some(shared) = self.shared {
                shared.store_local_device_name(name);
            }
        }
        ok
    }

    pub(crate) fn get_ble_pinned_address(&self) -> Option<BdAddr> {
        self.with_file(|file| found(read_value::<BdAddr>(file, keys::BLE_PINNED_ADDRESS)))
    }

    pub(crate) fn set_ble_pinned_address(&self, addr: Option<&BdAddr>) -> bool {
        written(self.with_file(|file| match addr {
            Some(addr) => write_value(file, keys::BLE_PINNED_ADDRESS, addr),
            None => file.delete(keys::BLE_PINNED_ADDRESS),
        }))
    }

    pub(crate) fn get_airplane_mode_enabled(&self) -> bool {
        self.with_file(|file| found(read_value::<bool>(file, keys::AIRPLANE_MODE)))
            .unwrap_or(false)
    }

    pub(crate) fn set_airplane_mode_enabled(&self, enabled: bool) -> bool {
        written(self.with_file(|file| write_value(file, keys::AIRPLANE_MODE, &enabled)))
    }

    pub(crate) fn get_cached_system_capabilities(&self) -> SystemCapabilities {
        self.with_file(|file| found(read_value::<SystemCapabilities>(file, keys::SYSTEM_CAPABILITIES)))
            .unwrap_or(SystemCapabilities::NONE)
    }

    pub(crate) fn set_cached_system_capabilities(&self, capabilities: SystemCapabilities) {
        let changed = self.with_file(|file| {
            let old = found(read_value::<SystemCapabilities>(file, keys::SYSTEM_CAPABILITIES))
                .unwrap_or(SystemCapabilities::NONE);
            let changed = old.diff(&capabilities);
            if changed == 0 {
                return Ok(0);
            }
            write_value(file, keys::SYSTEM_CAPABILITIES, &capabilities).map(|_| changed)
        });
        match changed {
            Ok(0) => {}
            Ok(changed) => self.notifier.publish(Event::CapabilitiesChanged { capabilities, changed }),
            Err(e) => error!("[bonding] failed to cache capabilities: {:?}", e),
        }
    }
}

/// Implements the local device state part of [`BondingStore`] by forwarding to the
/// backend's `core`.
macro_rules! local_state_methods {
    () => {
        fn is_unfaithful(&self) -> bool {
            self.core.is_unfaithful()
        }

        fn set_unfaithful(&self, unfaithful: bool) {
            self.core.set_unfaithful(unfaithful)
        }

        fn get_root_key(&self, kind: crate::types::RootKeyKind) -> Option<crate::types::RootKey> {
            self.core.get_root_key(kind)
        }

        fn set_root_keys(&self, keys: &crate::types::RootKeys) -> bool {
            self.core.set_root_keys(keys)
        }

        fn get_local_device_name(&self) -> Option<crate::types::DeviceName> {
            self.core.get_local_device_name()
        }

        fn set_local_device_name(&self, name: &str) -> bool {
            self.core.set_local_device_name(name)
        }

        fn get_ble_pinned_address(&self) -> Option<bt_hci::param::BdAddr> {
            self.core.get_ble_pinned_address()
        }

        fn set_ble_pinned_address(&self, addr: Option<&bt_hci::param::BdAddr>) -> bool {
            self.core.set_ble_pinned_address(addr)
        }

        fn get_airplane_mode_enabled(&self) -> bool {
            self.core.get_airplane_mode_enabled()
        }

        fn set_airplane_mode_enabled(&self, enabled: bool) -> bool {
            self.core.set_airplane_mode_enabled(enabled)
        }

        fn get_cached_system_capabilities(&self) -> crate::types::SystemCapabilities {
            self.core.get_cached_system_capabilities()
        }

        fn set_cached_system_capabilities(&self, capabilities: crate::types::SystemCapabilities) {
            self.core.set_cached_system_capabilities(capabilities)
        }
    };
}

pub(crate) use local_state_methods;
