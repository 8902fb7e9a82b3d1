//! Human readable dump of the bonding database.
use core::fmt::{self, Write};

use bt_hci::param::BdAddr;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::kv::SettingsFile;
use crate::record::BondingRecord;
use crate::store::{BondingStore, FullDb, SharedStorage};
use crate::types::{BondingId, BondingKind, RootKeyKind};

/// Formats an address most significant byte first.
pub struct Addr<'a>(pub &'a BdAddr);

impl fmt::Display for Addr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.raw().iter().rev().enumerate() {
            if i > 0 {
                f.write_char(':')?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Write the local device state and every bonding record of `db` to `out`.
///
/// With `shared`, the copy of the active gateway kept there is compared against the
/// database and reported as `OK`, `MISMATCH` or `MISSING`.
pub fn dump<M: RawMutex, F: SettingsFile>(
    db: &FullDb<'_, M, F>,
    shared: Option<&dyn SharedStorage>,
    out: &mut dyn Write,
) -> fmt::Result {
    match db.get_local_device_name() {
        Some(name) => writeln!(out, "device name: {}", name)?,
        None => writeln!(out, "device name: <unset>")?,
    }
    match db.get_ble_pinned_address() {
        Some(addr) => writeln!(out, "pinned address: {}", Addr(&addr))?,
        None => writeln!(out, "pinned address: <unset>")?,
    }
    writeln!(
        out,
        "root keys: {}",
        yes_no(db.get_root_key(RootKeyKind::Encryption).is_some())
    )?;
    writeln!(out, "airplane mode: {}", yes_no(db.get_airplane_mode_enabled()))?;
    writeln!(out, "unfaithful: {}", yes_no(db.is_unfaithful()))?;
    writeln!(out, "capabilities: {:#018x}", db.get_cached_system_capabilities().0)?;
    let gateway = db.active_gateway();
    match gateway {
        Some((id, kind)) => writeln!(out, "active gateway: {:?} {}", kind, id)?,
        None => writeln!(out, "active gateway: <none>")?,
    }

    let mut result = Ok(());
    db.with_settings(|file| {
        FullDb::<M, F>::for_each_record(file, &mut |id, record| {
            if result.is_err() {
                return;
            }
            result = match record {
                Ok(BondingRecord::Ble(pairing)) => {
                    let info = &pairing.pairing_info;
                    writeln!(
                        out,
                        "bonding {}: BLE \"{}\" identity {}{} gateway {} ancs {} pinned {} mitm {} flags {:#04x}",
                        id,
                        pairing.name,
                        Addr(&info.identity.addr),
                        if info.is_remote_identity_info_valid { "" } else { " (invalid)" },
                        yes_no(pairing.is_gateway),
                        yes_no(pairing.supports_ancs),
                        yes_no(pairing.requires_address_pinning),
                        yes_no(info.is_mitm_protection_enabled),
                        pairing.flags,
                    )
                }
                Ok(BondingRecord::BtClassic(pairing)) => writeln!(
                    out,
                    "bonding {}: BT Classic \"{}\" address {} platform {:#04x}",
                    id,
                    pairing.name,
                    Addr(&pairing.addr),
                    pairing.platform_bits,
                ),
                Err(e) => writeln!(out, "bonding {}: CORRUPT ({})", id, e),
            };
        })
    });
    result?;

    if let Some(shared) = shared {
        check_shared(db, gateway, shared, out)?;
    }
    Ok(())
}

fn check_shared<M: RawMutex, F: SettingsFile>(
    db: &FullDb<'_, M, F>,
    gateway: Option<(BondingId, BondingKind)>,
    shared: &dyn SharedStorage,
    out: &mut dyn Write,
) -> fmt::Result {
    let ble = match gateway {
        Some((id, BondingKind::Ble)) => db.get_ble_pairing_by_id(id),
        _ => None,
    };
    let verdict = match (ble, shared.gateway_ble_pairing()) {
        (None, None) => "OK",
        (Some(_), None) => "MISSING",
        (Some(ours), Some(theirs)) if ours == theirs => "OK",
        _ => "MISMATCH",
    };
    writeln!(out, "shared BLE gateway: {}", verdict)?;

    let classic = match gateway {
        Some((id, BondingKind::BtClassic)) => db.get_bt_classic_pairing_by_id(id),
        _ => None,
    };
    let verdict = match (classic, shared.gateway_bt_classic_pairing()) {
        (None, None) => "OK",
        (Some(_), None) => "MISSING",
        (Some(ours), Some(theirs)) if ours == theirs => "OK",
        _ => "MISMATCH",
    };
    writeln!(out, "shared BT Classic gateway: {}", verdict)
}

#[cfg(test)]
mod tests {
    use std::string::String;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::kv::RamSettingsFile;
    use crate::notify::Notifier;
    use crate::store::SingleSlot;
    use crate::testing::{pairing_info, FakeEvents};
    use crate::types::device_name;

    #[test]
    fn dump_lists_records_and_checks_the_shared_copy() {
        let events = FakeEvents::default();
        let shared_notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let shared = SingleSlot::new(RamSettingsFile::<1024>::new(), &shared_notifier);
        let notifier: Notifier<NoopRawMutex> = Notifier::new(&events);
        let db = FullDb::with_shared_storage(RamSettingsFile::<4096>::new(), &notifier, &shared);

        db.set_local_device_name("Runner");
        db.store_ble_pairing(&pairing_info(1), true, Some("Phone"), false, 0);
        db.with_settings(|file| file.set(&[5], &[1, 2, 3]).unwrap());

        let mut out = String::new();
        dump(&db, Some(&shared), &mut out).unwrap();
        assert!(out.contains("device name: Runner"));
        assert!(out.contains("bonding 0: BLE \"Phone\" identity c0:04:03:02:01:01"));
        assert!(out.contains("bonding 5: CORRUPT"));
        assert!(out.contains("shared BLE gateway: OK"));
        assert!(out.contains("shared BT Classic gateway: OK"));

        shared.delete_gateway_ble_pairing();
        let mut out = String::new();
        dump(&db, Some(&shared), &mut out).unwrap();
        assert!(out.contains("shared BLE gateway: MISSING"));

        let mut stale = db.get_ble_pairing_by_id(BondingId(0)).unwrap();
        stale.name = device_name("Stale");
        shared.store_gateway_ble_pairing(&stale);
        let mut out = String::new();
        dump(&db, Some(&shared), &mut out).unwrap();
        assert!(out.contains("shared BLE gateway: MISMATCH"));
    }
}
