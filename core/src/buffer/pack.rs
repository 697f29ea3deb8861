//! Typed packing of state values
//!
//! There is no type tag on the wire: values must be read back in exactly the
//! order, and with exactly the [`Precision`], they were written with.

use byteorder::{ByteOrder, LittleEndian};
use glam::{Quat, Vec2, Vec3, Vec4};
use half::f16;

use crate::error::BufferError;
use crate::identity::{IdentityWidth, ObjectId};

type Result<T> = std::result::Result<T, BufferError>;

/// Precision selector for floating point values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Native width (4 bytes per `f32`, 8 per `f64`)
    #[default]
    Full,
    /// IEEE binary16, 2 bytes per component
    Half,
}

/// Sink for packed state values
pub trait StateWrite {
    /// Append raw bytes
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Write a value at full precision
    fn write<T: Packable>(&mut self, value: &T) -> Result<()> {
        value.pack(self, Precision::Full)
    }

    /// Write a value at half precision (lossy for floats)
    fn write_half<T: Packable>(&mut self, value: &T) -> Result<()> {
        value.pack(self, Precision::Half)
    }

    /// Write a value with an explicit precision
    fn write_with<T: Packable>(&mut self, value: &T, precision: Precision) -> Result<()> {
        value.pack(self, precision)
    }

    /// Write an identity at the given width
    fn write_identity(&mut self, id: ObjectId, width: IdentityWidth) -> Result<()> {
        if !width.fits(id) {
            return Err(BufferError::IdentityOverflow {
                id: id.raw(),
                width: width.bytes(),
            });
        }
        match width {
            IdentityWidth::U16 => self.write(&(id.raw() as u16)),
            IdentityWidth::U32 => self.write(&id.raw()),
        }
    }

    /// Write a presence flag followed by the identity, if any
    fn write_optional_identity(
        &mut self,
        id: Option<ObjectId>,
        width: IdentityWidth,
    ) -> Result<()> {
        self.write(&id.is_some())?;
        match id {
            Some(id) => self.write_identity(id, width),
            None => Ok(()),
        }
    }
}

/// Source of packed state values
pub trait StateRead {
    /// Consume exactly `len` bytes
    fn take_bytes(&mut self, len: usize) -> Result<&[u8]>;

    /// Bytes left before the end of the data
    fn remaining(&self) -> usize;

    /// Read a value written at full precision
    fn read<T: Packable>(&mut self) -> Result<T> {
        T::unpack(self, Precision::Full)
    }

    /// Read a value written at half precision
    fn read_half<T: Packable>(&mut self) -> Result<T> {
        T::unpack(self, Precision::Half)
    }

    /// Read a value with an explicit precision
    fn read_with<T: Packable>(&mut self, precision: Precision) -> Result<T> {
        T::unpack(self, precision)
    }

    /// Read an identity at the given width
    fn read_identity(&mut self, width: IdentityWidth) -> Result<ObjectId> {
        Ok(match width {
            IdentityWidth::U16 => ObjectId::new(self.read::<u16>()? as u32),
            IdentityWidth::U32 => ObjectId::new(self.read::<u32>()?),
        })
    }

    /// Read a value written by [`StateWrite::write_optional_identity`]
    fn read_optional_identity(&mut self, width: IdentityWidth) -> Result<Option<ObjectId>> {
        if self.read::<bool>()? {
            self.read_identity(width).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// A value with a fixed binary layout
pub trait Packable: Sized {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, precision: Precision) -> Result<()>;
    fn unpack<R: StateRead + ?Sized>(r: &mut R, precision: Precision) -> Result<Self>;
}

impl Packable for u8 {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, _: Precision) -> Result<()> {
        w.put_bytes(&[*self])
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, _: Precision) -> Result<Self> {
        Ok(r.take_bytes(1)?[0])
    }
}

impl Packable for i8 {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, _: Precision) -> Result<()> {
        w.put_bytes(&[*self as u8])
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, _: Precision) -> Result<Self> {
        Ok(r.take_bytes(1)?[0] as i8)
    }
}

impl Packable for bool {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, _: Precision) -> Result<()> {
        w.put_bytes(&[*self as u8])
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, _: Precision) -> Result<Self> {
        Ok(r.take_bytes(1)?[0] != 0)
    }
}

// Integers are always written at their native width; the precision selector
// only affects floating point values.
macro_rules! pack_int {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Packable for $ty {
                fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, _: Precision) -> Result<()> {
                    let mut bytes = [0u8; size_of::<$ty>()];
                    LittleEndian::$write(&mut bytes, *self);
                    w.put_bytes(&bytes)
                }

                fn unpack<R: StateRead + ?Sized>(r: &mut R, _: Precision) -> Result<Self> {
                    Ok(LittleEndian::$read(r.take_bytes(size_of::<$ty>())?))
                }
            }
        )*
    };
}

pack_int! {
    u16 => write_u16, read_u16;
    i16 => write_i16, read_i16;
    u32 => write_u32, read_u32;
    i32 => write_i32, read_i32;
    u64 => write_u64, read_u64;
    i64 => write_i64, read_i64;
}

fn pack_half<W: StateWrite + ?Sized>(w: &mut W, value: f32) -> Result<()> {
    let mut bytes = [0u8; 2];
    LittleEndian::write_u16(&mut bytes, f16::from_f32(value).to_bits());
    w.put_bytes(&bytes)
}

fn unpack_half<R: StateRead + ?Sized>(r: &mut R) -> Result<f32> {
    Ok(f16::from_bits(LittleEndian::read_u16(r.take_bytes(2)?)).to_f32())
}

impl Packable for f32 {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, precision: Precision) -> Result<()> {
        match precision {
            Precision::Full => {
                let mut bytes = [0u8; 4];
                LittleEndian::write_f32(&mut bytes, *self);
                w.put_bytes(&bytes)
            }
            Precision::Half => pack_half(w, *self),
        }
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, precision: Precision) -> Result<Self> {
        match precision {
            Precision::Full => Ok(LittleEndian::read_f32(r.take_bytes(4)?)),
            Precision::Half => unpack_half(r),
        }
    }
}

impl Packable for f64 {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, precision: Precision) -> Result<()> {
        match precision {
            Precision::Full => {
                let mut bytes = [0u8; 8];
                LittleEndian::write_f64(&mut bytes, *self);
                w.put_bytes(&bytes)
            }
            Precision::Half => pack_half(w, *self as f32),
        }
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, precision: Precision) -> Result<Self> {
        match precision {
            Precision::Full => Ok(LittleEndian::read_f64(r.take_bytes(8)?)),
            Precision::Half => unpack_half(r).map(f64::from),
        }
    }
}

/// u16 length prefix followed by UTF-8 bytes
impl Packable for String {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, _: Precision) -> Result<()> {
        let len = u16::try_from(self.len())
            .map_err(|_| BufferError::StringTooLong { len: self.len() })?;
        w.write(&len)?;
        w.put_bytes(self.as_bytes())
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, _: Precision) -> Result<Self> {
        let len = r.read::<u16>()? as usize;
        let bytes = r.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::InvalidString)
    }
}

macro_rules! pack_vector {
    ($($ty:ty => [$($field:ident),+];)*) => {
        $(
            impl Packable for $ty {
                fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, precision: Precision) -> Result<()> {
                    $( self.$field.pack(w, precision)?; )+
                    Ok(())
                }

                fn unpack<R: StateRead + ?Sized>(r: &mut R, precision: Precision) -> Result<Self> {
                    $( let $field = f32::unpack(r, precision)?; )+
                    Ok(Self::new($($field),+))
                }
            }
        )*
    };
}

pack_vector! {
    Vec2 => [x, y];
    Vec3 => [x, y, z];
    Vec4 => [x, y, z, w];
}

/// Quaternions are stored as raw `x, y, z, w`; half precision does not
/// renormalize on read.
impl Packable for Quat {
    fn pack<W: StateWrite + ?Sized>(&self, w: &mut W, precision: Precision) -> Result<()> {
        for component in self.to_array() {
            component.pack(w, precision)?;
        }
        Ok(())
    }

    fn unpack<R: StateRead + ?Sized>(r: &mut R, precision: Precision) -> Result<Self> {
        let x = f32::unpack(r, precision)?;
        let y = f32::unpack(r, precision)?;
        let z = f32::unpack(r, precision)?;
        let w = f32::unpack(r, precision)?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }
}
