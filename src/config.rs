//! Compile-time configuration.
//!
//! `bondkeep` has some configuration settings that are set at compile time. They can be
//! set through environment variables at build time: set the variable named
//! `BONDKEEP_<value>`, for example `BONDKEEP_MAX_BONDINGS=8 cargo build`. You can also
//! set them in the `[env]` section of `.cargo/config.toml`.
//!
//! ## Compatibility warning
//!
//! Lowering `MAX_BONDINGS` on a device that already holds bondings with higher ids makes
//! those bondings unreachable. They are still erased by
//! [`delete_all_pairings`](crate::store::BondingStore::delete_all_pairings).

mod raw {
    #![allow(unused)]
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

/// Size of the bonding id space of the full database.
///
/// Ids are allocated from `0` up to `MAX_BONDINGS - 1`. The settings file capacity
/// usually runs out first.
///
/// Default: 16.
pub const MAX_BONDINGS: usize = raw::MAX_BONDINGS;

/// Maximum number of simultaneous LE connections tracked by the connection manager.
///
/// Default: 4.
pub const MAX_CONNECTIONS: usize = raw::MAX_CONNECTIONS;

/// Number of remote devices for which a heart rate sharing permission is remembered.
///
/// Default: 8.
pub const HRM_MAX_DEVICES: usize = raw::HRM_MAX_DEVICES;

/// Number of distinct consumers that may request connection parameters per connection.
///
/// Default: 4.
pub const CONN_PARAMS_MAX_CONSUMERS: usize = raw::CONN_PARAMS_MAX_CONSUMERS;

/// Interval of the heart rate sharing reminder, in seconds.
///
/// Default: 2700 (45 minutes).
pub const HRM_REMINDER_INTERVAL_SECS: usize = raw::HRM_REMINDER_INTERVAL_SECS;
