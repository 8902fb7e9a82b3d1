use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use super::base::{
    expect_ble, expect_classic, found, local_state_methods, read_record, write_record, written, ActiveGateway,
    StoreCore,
};
use super::{BondingStore, SharedStorage};
use crate::config::MAX_BONDINGS;
use crate::kv::SettingsFile;
use crate::notify::Notifier;
use crate::record::BondingRecord;
use crate::types::{
    device_name, BlePairing, BondingChangeOp, BondingId, BondingKind, ClassicPairing, DeviceName, LinkKey,
    PairingInfo,
};
use crate::Error;

/// Multi-record bonding database.
///
/// Every bonding is stored under a one byte key holding its id; the local device state
/// lives under the string keys of [`keys`](super::keys).
pub struct FullDb<'d, M: RawMutex, F: SettingsFile> {
    core: StoreCore<'d, M, F>,
}

fn key(id: BondingId) -> [u8; 1] {
    [id.0]
}

fn id_of(key: &[u8]) -> Option<BondingId> {
    match key {
        [id] => Some(BondingId(*id)),
        _ => None,
    }
}

impl<'d, M: RawMutex, F: SettingsFile> FullDb<'d, M, F> {
    pub fn new(file: F, notifier: &'d Notifier<'d, M>) -> Self {
        Self {
            core: StoreCore::new(file, notifier, None),
        }
    }

    /// Mirror the active gateway, root keys and device name to `shared`.
    pub fn with_shared_storage(file: F, notifier: &'d Notifier<'d, M>, shared: &'d dyn SharedStorage) -> Self {
        Self {
            core: StoreCore::new(file, notifier, Some(shared)),
        }
    }

    /// Run `f` on the settings file with the store lock held.
    pub fn with_settings<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        self.core.with_file(f)
    }

    /// Close the store, handing back the settings file.
    pub fn into_settings(self) -> F {
        self.core.into_file()
    }

    /// Visit every bonding record, including ones that fail to decode.
    pub(crate) fn for_each_record(file: &mut F, f: &mut dyn FnMut(BondingId, Result<BondingRecord, Error>)) {
        let result = file.each(&mut |key, value| {
            if let Some(id) = id_of(key) {
                f(id, BondingRecord::decode(value));
            }
        });
        if let Err(e) = result {
            error!("[bonding] failed to iterate bondings: {:?}", e);
        }
    }

    fn find_ble(file: &mut F, mut matches: impl FnMut(&BlePairing) -> bool) -> Option<(BondingId, BlePairing)> {
        let mut result = None;
        Self::for_each_record(file, &mut |id, record| match record {
            Ok(BondingRecord::Ble(pairing)) if result.is_none() && matches(&pairing) => {
                result = Some((id, pairing));
            }
            Err(e) => warn!("[bonding] skipping corrupt record {:?}: {:?}", id, e),
            _ => {}
        });
        result
    }

    fn find_classic(file: &mut F, addr: &BdAddr) -> Option<(BondingId, ClassicPairing)> {
        let mut result = None;
        Self::for_each_record(file, &mut |id, record| match record {
            Ok(BondingRecord::BtClassic(pairing)) if result.is_none() && pairing.addr == *addr => {
                result = Some((id, pairing));
            }
            Err(e) => warn!("[bonding] skipping corrupt record {:?}: {:?}", id, e),
            _ => {}
        });
        result
    }

    /// Lowest id without a record.
    fn free_id(file: &mut F) -> Result<BondingId, Error> {
        let mut used = [false; 256];
        let result = file.each(&mut |key, _| {
            if let Some(id) = id_of(key) {
                used[usize::from(id.0)] = true;
            }
        });
        result?;
        (0..MAX_BONDINGS.min(usize::from(BondingId::INVALID.0)))
            .find(|i| !used[*i])
            .map(|i| BondingId(i as u8))
            .ok_or(Error::StorageFull)
    }

    fn read_ble(file: &mut F, id: BondingId) -> Result<BlePairing, Error> {
        expect_ble(id, read_record(file, &key(id))?)
    }

    fn read_classic(file: &mut F, id: BondingId) -> Result<ClassicPairing, Error> {
        expect_classic(id, read_record(file, &key(id))?)
    }

    fn update_ble(&self, id: BondingId, update: impl FnOnce(&mut BlePairing)) -> bool {
        let result = self.core.with_file(|file| {
            let mut pairing = Self::read_ble(file, id)?;
            update(&mut pairing);
            write_record(file, &key(id), &BondingRecord::Ble(pairing.clone()))?;
            let is_gateway = Self::is_active(file, id, BondingKind::Ble);
            Ok::<_, Error>((pairing, is_gateway))
        });
        match result {
            Ok((pairing, is_gateway)) => {
                if is_gateway {
                    self.core.mirror_ble(&pairing);
                }
                self.core.notify(self, id, BondingKind::Ble, BondingChangeOp::DidChange);
                true
            }
            Err(e) => {
                warn!("[bonding] failed to update BLE bonding {:?}: {:?}", id, e);
                false
            }
        }
    }

    fn is_active(file: &mut F, id: BondingId, kind: BondingKind) -> bool {
        StoreCore::<M, F>::active_gateway_raw(file) == Some(ActiveGateway { id, kind })
    }

    fn delete(&self, id: BondingId, kind: BondingKind) {
        // Dependent subsystems tear down while the bonding is still readable
        self.core.notify(self, id, kind, BondingChangeOp::WillDelete);
        let was_gateway = self.core.with_file(|file| {
            let was_gateway = StoreCore::<M, F>::clear_active_gateway(file, id, kind);
            if let Err(e) = file.delete(&key(id)) {
                error!("[bonding] failed to delete {:?}: {:?}", id, e);
            }
            was_gateway.unwrap_or(false)
        });
        if was_gateway {
            if let Some(shared) = self.core.shared {
                match kind {
                    BondingKind::Ble => shared.delete_gateway_ble_pairing(),
                    BondingKind::BtClassic => shared.delete_gateway_bt_classic_pairing(),
                }
            }
        }
        info!("[bonding] deleted {:?} bonding {:?}", kind, id);
    }
}

impl<M: RawMutex, F: SettingsFile> BondingStore for FullDb<'_, M, F> {
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
        let result = self.core.with_file(|file| {
            let existing = Self::find_ble(file, |stored| stored.pairing_info.is_same_remote(pairing_info));
            let (id, op, pairing) = match existing {
                Some((id, mut pairing)) => {
                    pairing.pairing_info = *pairing_info;
                    pairing.is_gateway = is_gateway;
                    pairing.requires_address_pinning |= requires_address_pinning;
                    pairing.flags = flags;
                    if let Some(name) = name {
                        pairing.name = device_name(name);
                    }
                    (id, BondingChangeOp::DidChange, pairing)
                }
                None => {
                    let pairing = BlePairing {
                        pairing_info: *pairing_info,
                        name: name.map(device_name).unwrap_or_else(DeviceName::new),
                        is_gateway,
                        supports_ancs: false,
                        requires_address_pinning,
                        flags,
                    };
                    (Self::free_id(file)?, BondingChangeOp::DidAdd, pairing)
                }
            };
            write_record(file, &key(id), &BondingRecord::Ble(pairing.clone()))?;
            if is_gateway {
                StoreCore::<M, F>::write_active_gateway(file, ActiveGateway { id, kind: BondingKind::Ble })?;
            }
            let mirror = Self::is_active(file, id, BondingKind::Ble);
            Ok::<_, Error>((id, op, pairing, mirror))
        });

        match result {
            Ok((id, op, pairing, mirror)) => {
                info!("[bonding] stored BLE bonding {:?} ({:?})", id, op);
                if mirror {
                    self.core.mirror_ble(&pairing);
                }
                self.core.notify(self, id, BondingKind::Ble, op);
                id
            }
            Err(e) => {
                error!("[bonding] failed to store BLE pairing: {:?}", e);
                BondingId::INVALID
            }
        }
    }

    fn update_ble_device_name(&self, id: BondingId, name: &str) -> bool {
        self.update_ble(id, |pairing| pairing.name = device_name(name))
    }

    fn update_ble_supports_ancs(&self, id: BondingId, supports_ancs: bool) -> bool {
        self.update_ble(id, |pairing| pairing.supports_ancs = supports_ancs)
    }

    fn delete_ble_pairing_by_id(&self, id: BondingId) {
        if self.get_ble_pairing_by_id(id).is_none() {
            debug!("[bonding] no BLE bonding {:?} to delete", id);
            return;
        }
        self.delete(id, BondingKind::Ble);
    }

    fn delete_ble_pairing_by_addr(&self, device: &BdAddr) -> bool {
        match self.get_ble_pairing_by_addr(device) {
            Some((id, _)) => {
                self.delete(id, BondingKind::Ble);
                true
            }
            None => false,
        }
    }

    fn get_ble_pairing_by_id(&self, id: BondingId) -> Option<BlePairing> {
        if !id.is_valid() {
            return None;
        }
        self.core.with_file(|file| found(Self::read_ble(file, id)))
    }

    fn get_ble_pairing_by_addr(&self, device: &BdAddr) -> Option<(BondingId, BlePairing)> {
        self.core.with_file(|file| {
            Self::find_ble(file, |stored| {
                stored.pairing_info.is_remote_identity_info_valid && stored.pairing_info.identity.addr == *device
            })
        })
    }

    fn for_each_ble_pairing(&self, f: &mut dyn FnMut(BondingId, &BlePairing)) {
        self.core.with_file(|file| {
            Self::for_each_record(file, &mut |id, record| {
                if let Ok(BondingRecord::Ble(pairing)) = record {
                    f(id, &pairing);
                }
            })
        })
    }

    fn has_pinned_ble_pairings(&self) -> bool {
        let mut pinned = false;
        self.for_each_ble_pairing(&mut |_, pairing| pinned |= pairing.requires_address_pinning);
        pinned
    }

    fn store_bt_classic_pairing(
        &self,
        addr: &BdAddr,
        link_key: Option<&LinkKey>,
        name: Option<&str>,
        platform_bits: Option<u8>,
    ) -> BondingId {
        let result = self.core.with_file(|file| {
            let (id, op, pairing) = match Self::find_classic(file, addr) {
                Some((id, mut pairing)) => {
                    if let Some(link_key) = link_key {
                        pairing.link_key = *link_key;
                    }
                    if let Some(name) = name {
                        pairing.name = device_name(name);
                    }
                    if let Some(platform_bits) = platform_bits {
                        pairing.platform_bits = platform_bits;
                    }
                    (id, BondingChangeOp::DidChange, pairing)
                }
                None => {
                    let link_key = link_key.ok_or(Error::InvalidArgument)?;
                    let pairing = ClassicPairing {
                        addr: *addr,
                        link_key: *link_key,
                        name: name.map(device_name).unwrap_or_else(DeviceName::new),
                        platform_bits: platform_bits.unwrap_or(0),
                    };
                    (Self::free_id(file)?, BondingChangeOp::DidAdd, pairing)
                }
            };
            write_record(file, &key(id), &BondingRecord::BtClassic(pairing.clone()))?;
            let mirror = Self::is_active(file, id, BondingKind::BtClassic);
            Ok::<_, Error>((id, op, pairing, mirror))
        });

        match result {
            Ok((id, op, pairing, mirror)) => {
                info!("[bonding] stored BT Classic bonding {:?} ({:?})", id, op);
                if mirror {
                    self.core.mirror_classic(&pairing);
                }
                self.core.notify(self, id, BondingKind::BtClassic, op);
                id
            }
            Err(e) => {
                error!("[bonding] failed to store BT Classic pairing: {:?}", e);
                BondingId::INVALID
            }
        }
    }

    fn delete_bt_classic_pairing_by_id(&self, id: BondingId) {
        if self.get_bt_classic_pairing_by_id(id).is_none() {
            debug!("[bonding] no BT Classic bonding {:?} to delete", id);
            return;
        }
        self.delete(id, BondingKind::BtClassic);
    }

    fn delete_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> bool {
        match self.get_bt_classic_pairing_by_addr(addr) {
            Some((id, _)) => {
                self.delete(id, BondingKind::BtClassic);
                true
            }
            None => false,
        }
    }

    fn get_bt_classic_pairing_by_id(&self, id: BondingId) -> Option<ClassicPairing> {
        if !id.is_valid() {
            return None;
        }
        self.core.with_file(|file| found(Self::read_classic(file, id)))
    }

    fn get_bt_classic_pairing_by_addr(&self, addr: &BdAddr) -> Option<(BondingId, ClassicPairing)> {
        self.core.with_file(|file| Self::find_classic(file, addr))
    }

    fn for_each_bt_classic_pairing(&self, f: &mut dyn FnMut(BondingId, &ClassicPairing)) {
        self.core.with_file(|file| {
            Self::for_each_record(file, &mut |id, record| {
                if let Ok(BondingRecord::BtClassic(pairing)) = record {
                    f(id, &pairing);
                }
            })
        })
    }

    fn active_gateway(&self) -> Option<(BondingId, BondingKind)> {
        self.core.with_file(|file| {
            let gateway = StoreCore::<M, F>::active_gateway_raw(file)?;
            let exists = match gateway.kind {
                BondingKind::Ble => Self::read_ble(file, gateway.id).is_ok(),
                BondingKind::BtClassic => Self::read_classic(file, gateway.id).is_ok(),
            };
            exists.then_some((gateway.id, gateway.kind))
        })
    }

    fn set_active_gateway(&self, id: BondingId) {
        let result = self.core.with_file(|file| {
            let record = read_record(file, &key(id))?;
            let gateway = ActiveGateway { id, kind: record.kind() };
            let changed = StoreCore::<M, F>::write_active_gateway(file, gateway)?;
            Ok::<_, Error>((record, changed))
        });
        match result {
            Ok((BondingRecord::Ble(pairing), true)) => self.core.mirror_ble(&pairing),
            Ok((BondingRecord::BtClassic(pairing), true)) => self.core.mirror_classic(&pairing),
            Ok((_, false)) => {}
            Err(e) => warn!("[bonding] cannot make {:?} the active gateway: {:?}", id, e),
        }
    }

    fn delete_all_pairings(&self) {
        let mut bondings: Vec<(BondingId, BondingKind), 256> = Vec::new();
        self.core.with_file(|file| {
            Self::for_each_record(file, &mut |id, record| {
                if let Ok(record) = record {
                    let _ = bondings.push((id, record.kind()));
                }
            })
        });
        for (id, kind) in bondings.iter() {
            self.core.notify(self, *id, *kind, BondingChangeOp::WillDelete);
        }
        // Only bonding records go, the local device state stays. The gateway pointer
        // always names a bonding record, so it goes with them.
        let result = self.core.with_file(|file| {
            if let Some(gateway) = StoreCore::<M, F>::active_gateway_raw(file) {
                StoreCore::<M, F>::clear_active_gateway(file, gateway.id, gateway.kind)?;
            }
            file.rewrite(&mut |key, _| id_of(key).is_none())
        });
        if written(result) {
            if let Some(shared) = self.core.shared {
                shared.delete_gateway_ble_pairing();
                shared.delete_gateway_bt_classic_pairing();
            }
            info!("[bonding] deleted {} bondings", bondings.len());
        }
    }

    local_state_methods!();
}
