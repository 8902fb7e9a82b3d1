//! Common types of the bonding subsystem.

use bt_hci::param::BdAddr;

/// Capacity of a device display name, in bytes.
pub const DEVICE_NAME_MAX: usize = 20;

/// A device display name.
pub type DeviceName = heapless::String<DEVICE_NAME_MAX>;

/// Builds a [`DeviceName`], truncating `name` on a character boundary if it is too long.
pub fn device_name(name: &str) -> DeviceName {
    let mut out = DeviceName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Opaque identifier of a stored bonding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BondingId(pub u8);

impl BondingId {
    /// Sentinel returned when a bonding could not be stored or found.
    pub const INVALID: BondingId = BondingId(0xff);

    /// Is this a real bonding id?
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl core::fmt::Display for BondingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// The transport a bonding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BondingKind {
    /// BR/EDR bonding, keyed by device address.
    BtClassic,
    /// LE bonding, keyed by remote identity.
    Ble,
}

impl From<BondingKind> for u8 {
    fn from(kind: BondingKind) -> u8 {
        match kind {
            BondingKind::BtClassic => 0,
            BondingKind::Ble => 1,
        }
    }
}

impl TryFrom<u8> for BondingKind {
    type Error = crate::Error;
    fn try_from(val: u8) -> Result<Self, crate::Error> {
        match val {
            0 => Ok(BondingKind::BtClassic),
            1 => Ok(BondingKind::Ble),
            _ => Err(crate::Error::Corrupt),
        }
    }
}

/// What happened to a bonding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BondingChangeOp {
    /// A new bonding was stored.
    DidAdd,
    /// An existing bonding was updated in place. Its id did not change.
    DidChange,
    /// The bonding is about to be removed. It is still readable from the store.
    WillDelete,
}

macro_rules! key128 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub struct $name(pub u128);

        impl $name {
            /// Create key from a little endian byte array.
            pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
                Self(u128::from_le_bytes(bytes))
            }

            /// Key as a little endian byte array.
            pub fn to_le_bytes(&self) -> [u8; 16] {
                self.0.to_le_bytes()
            }
        }
    };
}

key128!(
    /// LE Long Term Key (LTK)
    LongTermKey
);
key128!(
    /// LE Identity Resolving Key (IRK)
    IdentityResolvingKey
);
key128!(
    /// LE Connection Signature Resolving Key (CSRK)
    SignatureKey
);
key128!(
    /// BR/EDR link key
    LinkKey
);
key128!(
    /// Root key the local LTK and IRK are derived from
    RootKey
);

/// Encryption information exchanged during LE pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EncryptionInfo {
    /// Long term key
    pub ltk: LongTermKey,
    /// Random number
    pub rand: u64,
    /// Encrypted diversifier
    pub ediv: u16,
}

/// Local encryption information of legacy records, where the LTK is re-derived from
/// the diversifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LegacyEncryptionInfo {
    /// Diversifier
    pub div: u16,
    /// Encrypted diversifier
    pub ediv: u16,
}

/// Identity address of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// Public or static random address
    pub addr: BdAddr,
    /// Is `addr` a random address?
    pub is_random: bool,
}

impl Identity {
    /// Create a public identity.
    pub fn public(addr: [u8; 6]) -> Self {
        Self {
            addr: BdAddr::new(addr),
            is_random: false,
        }
    }

    /// Create a random identity.
    pub fn random(addr: [u8; 6]) -> Self {
        Self {
            addr: BdAddr::new(addr),
            is_random: true,
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::public([0; 6])
    }
}

/// Keys and identity information resulting from an LE pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PairingInfo {
    /// Keys we distributed
    pub local_encryption_info: EncryptionInfo,
    /// Keys the remote distributed
    pub remote_encryption_info: EncryptionInfo,
    /// Remote identity resolving key
    pub irk: IdentityResolvingKey,
    /// Remote identity address
    pub identity: Identity,
    /// Remote signature key
    pub csrk: SignatureKey,
    pub is_local_encryption_info_valid: bool,
    pub is_remote_encryption_info_valid: bool,
    pub is_remote_identity_info_valid: bool,
    pub is_remote_signing_info_valid: bool,
    pub is_mitm_protection_enabled: bool,
}

impl PairingInfo {
    /// True if no key material of any kind is valid.
    pub fn is_empty(&self) -> bool {
        !(self.is_local_encryption_info_valid
            || self.is_remote_encryption_info_valid
            || self.is_remote_identity_info_valid
            || self.is_remote_signing_info_valid)
    }

    /// Does `other` describe the same remote device?
    ///
    /// Devices that distributed identity information are matched on IRK and identity
    /// address, others on the remote LTK.
    pub fn is_same_remote(&self, other: &PairingInfo) -> bool {
        if self.is_remote_identity_info_valid && other.is_remote_identity_info_valid {
            self.irk == other.irk && self.identity == other.identity
        } else if self.is_remote_encryption_info_valid && other.is_remote_encryption_info_valid {
            self.remote_encryption_info == other.remote_encryption_info
        } else {
            false
        }
    }
}

/// Pairing info of the legacy record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LegacyPairingInfo {
    pub local_encryption_info: LegacyEncryptionInfo,
    pub remote_encryption_info: EncryptionInfo,
    pub irk: IdentityResolvingKey,
    pub identity: Identity,
    pub csrk: SignatureKey,
    pub is_local_encryption_info_valid: bool,
    pub is_remote_encryption_info_valid: bool,
    pub is_remote_identity_info_valid: bool,
    pub is_remote_signing_info_valid: bool,
    pub is_mitm_protection_enabled: bool,
}

impl From<LegacyPairingInfo> for PairingInfo {
    /// The legacy local LTK can only be re-derived by the radio from the diversifier, so
    /// the local encryption info is carried over without a key and marked invalid.
    fn from(legacy: LegacyPairingInfo) -> Self {
        PairingInfo {
            local_encryption_info: EncryptionInfo {
                ltk: LongTermKey(0),
                rand: 0,
                ediv: legacy.local_encryption_info.ediv,
            },
            remote_encryption_info: legacy.remote_encryption_info,
            irk: legacy.irk,
            identity: legacy.identity,
            csrk: legacy.csrk,
            is_local_encryption_info_valid: false,
            is_remote_encryption_info_valid: legacy.is_remote_encryption_info_valid,
            is_remote_identity_info_valid: legacy.is_remote_identity_info_valid,
            is_remote_signing_info_valid: legacy.is_remote_signing_info_valid,
            is_mitm_protection_enabled: legacy.is_mitm_protection_enabled,
        }
    }
}

/// A stored LE bonding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlePairing {
    pub pairing_info: PairingInfo,
    pub name: DeviceName,
    pub is_gateway: bool,
    pub supports_ancs: bool,
    pub requires_address_pinning: bool,
    /// Opaque flags owned by the caller.
    pub flags: u8,
}

/// A stored BR/EDR bonding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassicPairing {
    pub addr: BdAddr,
    pub link_key: LinkKey,
    pub name: DeviceName,
    /// Remote OS hint
    pub platform_bits: u8,
}

/// Which root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RootKeyKind {
    Encryption,
    Identity,
}

/// The two local root keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RootKeys {
    pub encryption: RootKey,
    pub identity: RootKey,
}

impl RootKeys {
    pub fn get(&self, kind: RootKeyKind) -> RootKey {
        match kind {
            RootKeyKind::Encryption => self.encryption,
            RootKeyKind::Identity => self.identity,
        }
    }
}

/// Protocol capabilities last reported by the remote gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemCapabilities(pub u64);

impl SystemCapabilities {
    /// No capabilities known.
    pub const NONE: SystemCapabilities = SystemCapabilities(0);

    /// Is `bit` set?
    pub fn contains(&self, bit: u8) -> bool {
        bit < 64 && self.0 & (1 << bit) != 0
    }

    /// Bits that differ between `self` and `other`.
    pub fn diff(&self, other: &SystemCapabilities) -> u64 {
        self.0 ^ other.0
    }
}
