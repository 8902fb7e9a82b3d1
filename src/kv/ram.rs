use heapless::Vec;

use super::SettingsFile;
use crate::Error;

const MAX_KEY_LEN: usize = 24;
const MAX_VALUE_LEN: usize = 160;
const MAX_ENTRIES: usize = 48;
/// Per entry bookkeeping charged against the capacity, like a record header on flash.
const ENTRY_OVERHEAD: usize = 4;

struct Entry {
    key: Vec<u8, MAX_KEY_LEN>,
    value: Vec<u8, MAX_VALUE_LEN>,
}

impl Entry {
    fn footprint(&self) -> usize {
        ENTRY_OVERHEAD + self.key.len() + self.value.len()
    }
}

/// Settings file kept in RAM, limited to `CAPACITY` bytes of keys, values and per entry
/// overhead.
pub struct RamSettingsFile<const CAPACITY: usize> {
    entries: Vec<Entry, MAX_ENTRIES>,
    fail_io: bool,
}

impl<const CAPACITY: usize> Default for RamSettingsFile<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> RamSettingsFile<CAPACITY> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            fail_io: false,
        }
    }

    /// Make every following operation fail with [`Error::Io`], as if the file could
    /// not be opened.
    pub fn set_fail_io(&mut self, fail: bool) {
        self.fail_io = fail;
    }

    /// Bytes currently charged against the capacity.
    pub fn used(&self) -> usize {
        self.entries.iter().map(Entry::footprint).sum()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_io(&self) -> Result<(), Error> {
        if self.fail_io {
            Err(Error::Io)
        } else {
            Ok(())
        }
    }

    fn position(&self, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.key.as_slice() == key)
    }
}

impl<const CAPACITY: usize> SettingsFile for RamSettingsFile<CAPACITY> {
    fn get(&mut self, key: &[u8], buf: &mut [u8]) -> Result<usize, Error> {
        self.check_io()?;
        let entry = &self.entries[self.position(key).ok_or(Error::NotFound)?];
        let len = entry.value.len().min(buf.len());
        buf[..len].copy_from_slice(&entry.value[..len]);
        Ok(entry.value.len())
    }

    fn get_len(&mut self, key: &[u8]) -> Result<usize, Error> {
        self.check_io()?;
        let index = self.position(key).ok_or(Error::NotFound)?;
        Ok(self.entries[index].value.len())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_io()?;
        let entry = Entry {
            key: Vec::from_slice(key).map_err(|_| Error::InvalidArgument)?,
            value: Vec::from_slice(value).map_err(|_| Error::StorageFull)?,
        };
        let existing = self.position(key);
        let released = existing.map(|i| self.entries[i].footprint()).unwrap_or(0);
        if self.used() - released + entry.footprint() > CAPACITY {
            return Err(Error::StorageFull);
        }
        match existing {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry).map_err(|_| Error::StorageFull)?,
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.check_io()?;
        if let Some(index) = self.position(key) {
            self.entries.swap_remove(index);
        }
        Ok(())
    }

    fn each(&mut self, f: &mut dyn FnMut(&[u8], &[u8])) -> Result<(), Error> {
        self.check_io()?;
        for entry in self.entries.iter() {
            f(&entry.key, &entry.value);
        }
        Ok(())
    }

    fn rewrite(&mut self, keep: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), Error> {
        self.check_io()?;
        self.entries.retain(|e| keep(&e.key, &e.value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mut file: RamSettingsFile<32> = RamSettingsFile::new();
        file.set(b"a", &[0; 10]).unwrap();
        assert_eq!(file.used(), 15);
        // Replacing releases the old value first
        file.set(b"a", &[1; 20]).unwrap();
        assert_eq!(file.set(b"b", &[0; 10]), Err(Error::StorageFull));
        let mut buf = [0u8; 32];
        assert_eq!(file.get(b"a", &mut buf), Ok(20));
        assert_eq!(buf[19], 1);
        assert_eq!(file.get(b"b", &mut buf), Err(Error::NotFound));
    }

    #[test]
    fn rewrite_filters() {
        let mut file: RamSettingsFile<256> = RamSettingsFile::new();
        file.set(b"keep", &[1]).unwrap();
        file.set(&[3], &[2]).unwrap();
        file.rewrite(&mut |key, _| key.len() > 1).unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file.get_len(b"keep"), Ok(1));
    }

    #[test]
    fn io_failure() {
        let mut file: RamSettingsFile<256> = RamSettingsFile::new();
        file.set(b"k", &[1]).unwrap();
        file.set_fail_io(true);
        assert_eq!(file.set(b"k", &[2]), Err(Error::Io));
        file.set_fail_io(false);
        let mut buf = [0u8; 1];
        file.get(b"k", &mut buf).unwrap();
        assert_eq!(buf, [1]);
    }
}
