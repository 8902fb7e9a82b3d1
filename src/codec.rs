//! Opinionated settings value codec
//!
//! Assumes little endian for all types. Values stored under the fixed local state keys
//! implement [`Encode`] and [`Decode`]; a stored value whose length differs from
//! [`Type::size`] is rejected.

pub trait FixedSize: Sized {
    const SIZE: usize;
}

pub trait Type: Sized {
    fn size(&self) -> usize;
}

pub trait Encode: Type {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error>;
}

pub trait Decode<'d>: Type {
    fn decode(src: &'d [u8]) -> Result<Self, Error>;
}

impl<T: FixedSize> Type for T {
    fn size(&self) -> usize {
        Self::SIZE
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InsufficientSpace,
    InvalidValue,
}

/// Checks that `src` holds exactly one `T`.
pub(crate) fn exact<T: FixedSize>(src: &[u8]) -> Result<(), Error> {
    if src.len() != T::SIZE {
        Err(Error::InvalidValue)
    } else {
        Ok(())
    }
}

/// Checks that `dest` can hold one `T`.
pub(crate) fn room<T: FixedSize>(dest: &[u8]) -> Result<(), Error> {
    if dest.len() < T::SIZE {
        Err(Error::InsufficientSpace)
    } else {
        Ok(())
    }
}

impl FixedSize for bool {
    const SIZE: usize = 1;
}

impl Encode for bool {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        room::<Self>(dest)?;
        dest[0] = u8::from(*self);
        Ok(())
    }
}

impl Decode<'_> for bool {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        exact::<Self>(src)?;
        match src[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue),
        }
    }
}

impl FixedSize for u64 {
    const SIZE: usize = 8;
}

impl Encode for u64 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        room::<Self>(dest)?;
        dest[..8].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode<'_> for u64 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        exact::<Self>(src)?;
        let mut bytes = [0; 8];
        bytes.copy_from_slice(src);
        Ok(u64::from_le_bytes(bytes))
    }
}
