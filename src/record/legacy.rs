//! Legacy pairing info layout.
//!
//! Identical to the [current layout](super::pairing) except that the local encryption
//! info is stored as a diversifier pair instead of a full key:
//!
//! ```text
//!  offset  size  field
//!       0     2  local DIV
//!       2     2  local EDIV
//!       4    16  remote LTK
//!      20     8  remote Rand
//!      28     2  remote EDIV
//!      30    16  remote IRK
//!      46     6  remote identity address
//!      52     1  identity flags
//!      53    16  remote CSRK
//!      69     1  validity flags
//! ```

use bt_hci::param::BdAddr;

use super::pairing::{
    validity_flags, IDENTITY_RANDOM, LOCAL_ENC_VALID, MITM, REMOTE_ENC_VALID, REMOTE_IDENTITY_VALID,
    REMOTE_SIGNING_VALID,
};
use super::{get_encryption_info, get_u128, get_u16, put_encryption_info};
use crate::types::{Identity, IdentityResolvingKey, LegacyEncryptionInfo, LegacyPairingInfo, SignatureKey};

/// Encoded size of a [`LegacyPairingInfo`].
pub const LEGACY_PAIRING_INFO_LEN: usize = 70;

const LOCAL_DIV: usize = 0;
const LOCAL_EDIV: usize = 2;
const REMOTE_ENC: usize = 4;
const IRK: usize = 30;
const IDENTITY_ADDR: usize = 46;
const IDENTITY_FLAGS: usize = 52;
const CSRK: usize = 53;
const VALIDITY: usize = 69;

/// Encode pairing info to the legacy layout.
pub fn encode(info: &LegacyPairingInfo) -> [u8; LEGACY_PAIRING_INFO_LEN] {
    let mut buf = [0u8; LEGACY_PAIRING_INFO_LEN];
    buf[LOCAL_DIV..LOCAL_EDIV].copy_from_slice(&info.local_encryption_info.div.to_le_bytes());
    buf[LOCAL_EDIV..REMOTE_ENC].copy_from_slice(&info.local_encryption_info.ediv.to_le_bytes());
    put_encryption_info(&mut buf[REMOTE_ENC..IRK], &info.remote_encryption_info);
    buf[IRK..IDENTITY_ADDR].copy_from_slice(&info.irk.to_le_bytes());
    buf[IDENTITY_ADDR..IDENTITY_FLAGS].copy_from_slice(info.identity.addr.raw());
    if info.identity.is_random {
        buf[IDENTITY_FLAGS] |= IDENTITY_RANDOM;
    }
    buf[CSRK..VALIDITY].copy_from_slice(&info.csrk.to_le_bytes());
    buf[VALIDITY] = validity_flags(
        info.is_local_encryption_info_valid,
        info.is_remote_encryption_info_valid,
        info.is_remote_identity_info_valid,
        info.is_remote_signing_info_valid,
        info.is_mitm_protection_enabled,
    );
    buf
}

/// Decode pairing info from the legacy layout.
pub fn decode(buf: &[u8; LEGACY_PAIRING_INFO_LEN]) -> LegacyPairingInfo {
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&buf[IDENTITY_ADDR..IDENTITY_FLAGS]);
    let validity = buf[VALIDITY];
    LegacyPairingInfo {
        local_encryption_info: LegacyEncryptionInfo {
            div: get_u16(&buf[LOCAL_DIV..LOCAL_EDIV]),
            ediv: get_u16(&buf[LOCAL_EDIV..REMOTE_ENC]),
        },
        remote_encryption_info: get_encryption_info(&buf[REMOTE_ENC..IRK]),
        irk: IdentityResolvingKey(get_u128(&buf[IRK..IDENTITY_ADDR])),
        identity: Identity {
            addr: BdAddr::new(addr),
            is_random: buf[IDENTITY_FLAGS] & IDENTITY_RANDOM != 0,
        },
        csrk: SignatureKey(get_u128(&buf[CSRK..VALIDITY])),
        is_local_encryption_info_valid: validity & LOCAL_ENC_VALID != 0,
        is_remote_encryption_info_valid: validity & REMOTE_ENC_VALID != 0,
        is_remote_identity_info_valid: validity & REMOTE_IDENTITY_VALID != 0,
        is_remote_signing_info_valid: validity & REMOTE_SIGNING_VALID != 0,
        is_mitm_protection_enabled: validity & MITM != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncryptionInfo, LongTermKey};

    fn sample(validity: u8) -> LegacyPairingInfo {
        LegacyPairingInfo {
            local_encryption_info: LegacyEncryptionInfo { div: 0xbeef, ediv: 0x0102 },
            remote_encryption_info: EncryptionInfo {
                ltk: LongTermKey(0x1234_5678_9abc_def0_0fed_cba9_8765_4321),
                rand: 42,
                ediv: 0x7777,
            },
            irk: IdentityResolvingKey(99),
            identity: Identity::public([1, 2, 3, 4, 5, 6]),
            csrk: SignatureKey(u128::MAX),
            is_local_encryption_info_valid: validity & LOCAL_ENC_VALID != 0,
            is_remote_encryption_info_valid: validity & REMOTE_ENC_VALID != 0,
            is_remote_identity_info_valid: validity & REMOTE_IDENTITY_VALID != 0,
            is_remote_signing_info_valid: validity & REMOTE_SIGNING_VALID != 0,
            is_mitm_protection_enabled: validity & MITM != 0,
        }
    }

    #[test]
    fn lossless_for_every_validity_combination() {
        for validity in 0u8..32 {
            let info = sample(validity);
            assert_eq!(decode(&encode(&info)), info);
        }
    }

    #[test]
    fn diversifier_prefix() {
        let encoded = encode(&sample(LOCAL_ENC_VALID));
        assert_eq!(&encoded[..4], &[0xef, 0xbe, 0x02, 0x01]);
        assert_eq!(encoded[VALIDITY], LOCAL_ENC_VALID);
        assert_eq!(encoded[IDENTITY_FLAGS], 0);
    }

    #[test]
    fn upgrade_drops_local_key() {
        let info: crate::types::PairingInfo = sample(0x1f).into();
        assert!(!info.is_local_encryption_info_valid);
        assert!(info.is_remote_encryption_info_valid);
        assert_eq!(info.local_encryption_info.ediv, 0x0102);
        assert_eq!(info.remote_encryption_info.rand, 42);
    }
}
