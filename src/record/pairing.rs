//! Current pairing info layout.
//!
//! ```text
//!  offset  size  field
//!       0    16  local LTK
//!      16     8  local Rand
//!      24     2  local EDIV
//!      26    16  remote LTK
//!      42     8  remote Rand
//!      50     2  remote EDIV
//!      52    16  remote IRK
//!      68     6  remote identity address
//!      74     1  identity flags   (bit 0: address is random)
//!      75    16  remote CSRK
//!      91     1  validity flags   (see below)
//! ```
//!
//! Validity flags: bit 0 local encryption info, bit 1 remote encryption info, bit 2 remote
//! identity info, bit 3 remote signing info, bit 4 MITM protection. Reserved bits are
//! written as zero and ignored when read.

use bt_hci::param::BdAddr;

use super::{get_encryption_info, get_u128, put_encryption_info};
use crate::types::{Identity, IdentityResolvingKey, PairingInfo, SignatureKey};

/// Encoded size of a [`PairingInfo`].
pub const PAIRING_INFO_LEN: usize = 92;

const LOCAL_ENC: usize = 0;
const REMOTE_ENC: usize = 26;
const IRK: usize = 52;
const IDENTITY_ADDR: usize = 68;
const IDENTITY_FLAGS: usize = 74;
const CSRK: usize = 75;
const VALIDITY: usize = 91;

pub(crate) const IDENTITY_RANDOM: u8 = 1 << 0;

pub(crate) const LOCAL_ENC_VALID: u8 = 1 << 0;
pub(crate) const REMOTE_ENC_VALID: u8 = 1 << 1;
pub(crate) const REMOTE_IDENTITY_VALID: u8 = 1 << 2;
pub(crate) const REMOTE_SIGNING_VALID: u8 = 1 << 3;
pub(crate) const MITM: u8 = 1 << 4;

/// Encode pairing info to the current layout.
pub fn encode(info: &PairingInfo) -> [u8; PAIRING_INFO_LEN] {
    let mut buf = [0u8; PAIRING_INFO_LEN];
    put_encryption_info(&mut buf[LOCAL_ENC..REMOTE_ENC], &info.local_encryption_info);
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

/// Decode pairing info from the current layout.
pub fn decode(buf: &[u8; PAIRING_INFO_LEN]) -> PairingInfo {
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&buf[IDENTITY_ADDR..IDENTITY_FLAGS]);
    let validity = buf[VALIDITY];
    PairingInfo {
        local_encryption_info: get_encryption_info(&buf[LOCAL_ENC..REMOTE_ENC]),
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

pub(crate) fn validity_flags(local_enc: bool, remote_enc: bool, identity: bool, signing: bool, mitm: bool) -> u8 {
    let mut flags = 0;
    if local_enc {
        flags |= LOCAL_ENC_VALID;
    }
    if remote_enc {
        flags |= REMOTE_ENC_VALID;
    }
    if identity {
        flags |= REMOTE_IDENTITY_VALID;
    }
    if signing {
        flags |= REMOTE_SIGNING_VALID;
    }
    if mitm {
        flags |= MITM;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EncryptionInfo, LongTermKey};

    pub(crate) fn sample(validity: u8) -> PairingInfo {
        PairingInfo {
            local_encryption_info: EncryptionInfo {
                ltk: LongTermKey(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff),
                rand: 0x0102_0304_0506_0708,
                ediv: 0x1234,
            },
            remote_encryption_info: EncryptionInfo {
                ltk: LongTermKey(0xffee_ddcc_bbaa_9988_7766_5544_3322_1100),
                rand: 0x1112_1314_1516_1718,
                ediv: 0x4321,
            },
            irk: IdentityResolvingKey(0xa5a5_a5a5_0000_0000_5a5a_5a5a_ffff_0001),
            identity: Identity::random([0xc1, 2, 3, 4, 5, 0xc6]),
            csrk: SignatureKey(7),
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
            let encoded = encode(&info);
            assert_eq!(encoded[VALIDITY], validity);
            assert_eq!(decode(&encoded), info);
        }
    }

    #[test]
    fn field_offsets() {
        let info = sample(0x1f);
        let encoded = encode(&info);
        assert_eq!(&encoded[24..26], &[0x34, 0x12]);
        assert_eq!(&encoded[50..52], &[0x21, 0x43]);
        assert_eq!(&encoded[68..74], &[0xc1, 2, 3, 4, 5, 0xc6]);
        assert_eq!(encoded[74], IDENTITY_RANDOM);
        assert_eq!(encoded[75], 7);
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let info = sample(REMOTE_ENC_VALID | MITM);
        let mut encoded = encode(&info);
        encoded[IDENTITY_FLAGS] |= 0xfe;
        encoded[VALIDITY] |= 0xe0;
        assert_eq!(decode(&encoded), info);
    }
}
