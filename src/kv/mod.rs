//! Settings file interface.
//!
//! The bonding store persists everything through a [`SettingsFile`], a bounded key/value
//! file with a fixed capacity. The engine behind it is provided by the platform;
//! [`RamSettingsFile`] is an in-RAM engine for hosts and tests.

mod ram;

pub use ram::RamSettingsFile;

use crate::Error;

/// A bounded key/value settings file.
pub trait SettingsFile {
    /// Read the value of `key` into `buf`, returning the stored length.
    ///
    /// If the value is longer than `buf` only `buf.len()` bytes are copied.
    /// Absent keys fail with [`Error::NotFound`].
    fn get(&mut self, key: &[u8], buf: &mut [u8]) -> Result<usize, Error>;

    /// Length of the value stored for `key`.
    fn get_len(&mut self, key: &[u8]) -> Result<usize, Error>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// A rejected write leaves the previous value in place.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<(), Error>;

    /// Visit every stored key/value pair.
    fn each(&mut self, f: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), Error>;

    /// Rewrite the file keeping only the pairs for which `keep` returns true.
    fn rewrite(&mut self, keep: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), Error>;
}
