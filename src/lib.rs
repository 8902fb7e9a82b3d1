//! Bluetooth bonding store and bonding lifecycle services.
//!
//! The crate keeps the persisted BT Classic and BLE pairings of a device, and the
//! services that react when those pairings change: private address cycling,
//! pairability, reconnection advertising, heart rate sharing and the stack
//! lifecycle itself.
//!
//! Everything is built around the [`store::BondingStore`] trait. Two backends implement
//! it: [`store::FullDb`], which keeps any number of bondings in a settings file, and
//! [`store::SingleSlot`], which keeps one BLE and one Classic pairing for recovery
//! firmware. Each successful mutation is fanned out synchronously, in a fixed order,
//! through the [`notify::Notifier`].
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod app_launch;
pub mod codec;
pub mod config;
pub mod conn_params;
pub mod connection_manager;
pub mod debug;
pub mod driver;
pub mod hrm;
pub mod kv;
pub mod local_addr;
pub mod notify;
pub mod pairability;
pub mod reconnect;
pub mod record;
pub mod runner;
pub mod stack;
pub mod store;
#[cfg(test)]
mod testing;
pub mod types;

pub use bt_hci::param::{BdAddr, ConnHandle};
pub use types::*;

/// Errors raised inside the bonding subsystem.
///
/// None of these cross the public [`store::BondingStore`] contract: the store logs them
/// and degrades to `false`, [`BondingId::INVALID`] or `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Key absent, or present with a different bonding kind.
    NotFound,
    /// Stored value has an unexpected length or kind tag.
    Corrupt,
    /// The settings file rejected a write because it is full.
    StorageFull,
    /// The settings file could not be opened, read or written.
    Io,
    /// Empty pairing info, or a value of the wrong size from the wire.
    InvalidArgument,
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        match error {
            codec::Error::InsufficientSpace => Self::Corrupt,
            codec::Error::InvalidValue => Self::Corrupt,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corrupt => write!(f, "corrupt record"),
            Error::StorageFull => write!(f, "storage full"),
            Error::Io => write!(f, "storage i/o failure"),
            Error::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}
