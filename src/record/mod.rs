//! Persisted bonding records.
//!
//! A record is a kind tag followed by a fixed size payload:
//!
//! ```text
//! BLE:     [1] [pairing info: 92 | legacy 70] [name: 20] [bond bits: 1] [flags: 1]
//! Classic: [0] [address: 6] [link key: 16] [name: 20] [platform bits: 1]
//! ```
//!
//! Bond bits: bit 0 gateway, bit 1 ANCS support, bit 2 address pinning. Names are NUL
//! padded. Records only ever grow: a record longer than the layout this firmware knows is
//! read through its known prefix.

pub mod legacy;
pub mod pairing;

use bt_hci::param::BdAddr;

pub use legacy::LEGACY_PAIRING_INFO_LEN;
pub use pairing::PAIRING_INFO_LEN;

use crate::types::{
    BlePairing, BondingKind, ClassicPairing, DeviceName, EncryptionInfo, LinkKey, LongTermKey, PairingInfo,
    DEVICE_NAME_MAX,
};
use crate::Error;

/// Size of an encoded BLE record.
pub const BLE_RECORD_LEN: usize = 1 + PAIRING_INFO_LEN + DEVICE_NAME_MAX + 2;
/// Size of an encoded BLE record in the legacy layout.
pub const LEGACY_BLE_RECORD_LEN: usize = 1 + LEGACY_PAIRING_INFO_LEN + DEVICE_NAME_MAX + 2;
/// Size of an encoded BT Classic record.
pub const CLASSIC_RECORD_LEN: usize = 1 + 6 + 16 + DEVICE_NAME_MAX + 1;
/// Largest record this firmware writes.
pub const MAX_RECORD_LEN: usize = BLE_RECORD_LEN;

const BOND_GATEWAY: u8 = 1 << 0;
const BOND_ANCS: u8 = 1 << 1;
const BOND_PINNED: u8 = 1 << 2;

/// A bonding as it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BondingRecord {
    BtClassic(ClassicPairing),
    Ble(BlePairing),
}

impl BondingRecord {
    pub fn kind(&self) -> BondingKind {
        match self {
            BondingRecord::BtClassic(_) => BondingKind::BtClassic,
            BondingRecord::Ble(_) => BondingKind::Ble,
        }
    }

    /// Encode into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8; MAX_RECORD_LEN]) -> usize {
        *buf = [0; MAX_RECORD_LEN];
        buf[0] = self.kind().into();
        match self {
            BondingRecord::Ble(ble) => {
                let mut pos = 1;
                buf[pos..pos + PAIRING_INFO_LEN].copy_from_slice(&pairing::encode(&ble.pairing_info));
                pos += PAIRING_INFO_LEN;
                put_name(&mut buf[pos..pos + DEVICE_NAME_MAX], &ble.name);
                pos += DEVICE_NAME_MAX;
                let mut bits = 0;
                if ble.is_gateway {
                    bits |= BOND_GATEWAY;
                }
                if ble.supports_ancs {
                    bits |= BOND_ANCS;
                }
                if ble.requires_address_pinning {
                    bits |= BOND_PINNED;
                }
                buf[pos] = bits;
                buf[pos + 1] = ble.flags;
                BLE_RECORD_LEN
            }
            BondingRecord::BtClassic(classic) => {
                buf[1..7].copy_from_slice(classic.addr.raw());
                buf[7..23].copy_from_slice(&classic.link_key.to_le_bytes());
                put_name(&mut buf[23..23 + DEVICE_NAME_MAX], &classic.name);
                buf[23 + DEVICE_NAME_MAX] = classic.platform_bits;
                CLASSIC_RECORD_LEN
            }
        }
    }

    /// Decode a stored record.
    ///
    /// Fails with [`Error::Corrupt`] on an unknown kind tag or a payload shorter than the
    /// layout of its kind.
    pub fn decode(src: &[u8]) -> Result<Self, Error> {
        let kind = BondingKind::try_from(*src.first().ok_or(Error::Corrupt)?)?;
        match kind {
            BondingKind::Ble if src.len() >= BLE_RECORD_LEN => {
                let mut info = [0u8; PAIRING_INFO_LEN];
                info.copy_from_slice(&src[1..1 + PAIRING_INFO_LEN]);
                Ok(Self::Ble(ble_tail(pairing::decode(&info), &src[1 + PAIRING_INFO_LEN..])))
            }
            BondingKind::Ble if src.len() == LEGACY_BLE_RECORD_LEN => {
                let mut info = [0u8; LEGACY_PAIRING_INFO_LEN];
                info.copy_from_slice(&src[1..1 + LEGACY_PAIRING_INFO_LEN]);
                let info = legacy::decode(&info).into();
                Ok(Self::Ble(ble_tail(info, &src[1 + LEGACY_PAIRING_INFO_LEN..])))
            }
            BondingKind::BtClassic if src.len() >= CLASSIC_RECORD_LEN => {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(&src[1..7]);
                let mut key = [0u8; 16];
                key.copy_from_slice(&src[7..23]);
                Ok(Self::BtClassic(ClassicPairing {
                    addr: BdAddr::new(addr),
                    link_key: LinkKey::from_le_bytes(key),
                    name: get_name(&src[23..23 + DEVICE_NAME_MAX]),
                    platform_bits: src[23 + DEVICE_NAME_MAX],
                }))
            }
            _ => Err(Error::Corrupt),
        }
    }
}

fn ble_tail(pairing_info: PairingInfo, tail: &[u8]) -> BlePairing {
    let bits = tail[DEVICE_NAME_MAX];
    BlePairing {
        pairing_info,
        name: get_name(&tail[..DEVICE_NAME_MAX]),
        is_gateway: bits & BOND_GATEWAY != 0,
        supports_ancs: bits & BOND_ANCS != 0,
        requires_address_pinning: bits & BOND_PINNED != 0,
        flags: tail[DEVICE_NAME_MAX + 1],
    }
}

pub(crate) fn put_name(dest: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(dest.len());
    dest[..len].copy_from_slice(&bytes[..len]);
    dest[len..].fill(0);
}

pub(crate) fn get_name(src: &[u8]) -> DeviceName {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    let valid = match core::str::from_utf8(&src[..end]) {
        Ok(s) => s,
        // Keep whatever decodes, the tail was cut mid character
        Err(e) => core::str::from_utf8(&src[..e.valid_up_to()]).unwrap_or_default(),
    };
    crate::types::device_name(valid)
}

pub(crate) fn get_u16(src: &[u8]) -> u16 {
    u16::from_le_bytes([src[0], src[1]])
}

pub(crate) fn get_u128(src: &[u8]) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&src[..16]);
    u128::from_le_bytes(bytes)
}

/// Writes LTK (16), Rand (8), EDIV (2).
pub(crate) fn put_encryption_info(dest: &mut [u8], info: &EncryptionInfo) {
    dest[..16].copy_from_slice(&info.ltk.to_le_bytes());
    dest[16..24].copy_from_slice(&info.rand.to_le_bytes());
    dest[24..26].copy_from_slice(&info.ediv.to_le_bytes());
}

pub(crate) fn get_encryption_info(src: &[u8]) -> EncryptionInfo {
    let mut rand = [0u8; 8];
    rand.copy_from_slice(&src[16..24]);
    EncryptionInfo {
        ltk: LongTermKey(get_u128(&src[..16])),
        rand: u64::from_le_bytes(rand),
        ediv: get_u16(&src[24..26]),
    }
}
