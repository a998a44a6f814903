//! Typed little-endian fields written into bundles and read back from
//! message payloads. Strings and blobs carry a `u32` length prefix.

use crate::bundle::Bundle;
use crate::message::FrameError;

pub trait Field: Sized {
    fn write_to(&self, bundle: &mut Bundle);
    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, FrameError>;
}

macro_rules! impl_numeric_field {
    ($($ty:ty),*) => {
        $(
            impl Field for $ty {
                fn write_to(&self, bundle: &mut Bundle) {
                    bundle.write_bytes(&self.to_le_bytes());
                }

                fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, FrameError> {
                    let bytes = reader.take(std::mem::size_of::<$ty>())?;
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_numeric_field!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl Field for bool {
    fn write_to(&self, bundle: &mut Bundle) {
        bundle.write_bytes(&[*self as u8]);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, FrameError> {
        Ok(u8::read_from(reader)? != 0)
    }
}

impl Field for String {
    fn write_to(&self, bundle: &mut Bundle) {
        (self.len() as u32).write_to(bundle);
        bundle.write_bytes(self.as_bytes());
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, FrameError> {
        let bytes = reader.read_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)
    }
}

impl Field for Vec<u8> {
    fn write_to(&self, bundle: &mut Bundle) {
        (self.len() as u32).write_to(bundle);
        bundle.write_bytes(self);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, FrameError> {
        Ok(reader.read_blob()?.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read<T: Field>(&mut self) -> Result<T, FrameError> {
        T::read_from(self)
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], FrameError> {
        let len = u32::read_from(self)? as usize;
        self.take(len)
    }

    /// Everything not yet consumed, without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}
