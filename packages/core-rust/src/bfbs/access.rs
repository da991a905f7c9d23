//! Typed reads over a FlatBuffer binary, each one checked by
//! [`flatbuffers::Verifier`] (bounds, alignment, offsets, UTF-8 and string
//! terminators) before any byte is decoded.

use flatbuffers::{field_index_to_field_offset, Vector, Verifiable, Verifier, VerifierOptions};

use crate::error::{SchemaError, SchemaResult};

pub const SIZE_PREFIX_LEN: usize = 4;
const UOFFSET_LEN: usize = 4;

/// Little-endian scalars that can be read at a verified position.
pub trait Scalar: Sized + Copy {
    fn read_le(data: &[u8], pos: usize) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(impl Scalar for $ty {
            fn read_le(data: &[u8], pos: usize) -> Option<Self> {
                let end = pos.checked_add(std::mem::size_of::<$ty>())?;
                data.get(pos..end)?.try_into().ok().map(<$ty>::from_le_bytes)
            }
        })*
    };
}

impl_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Vtable offset of the field with the given id.
#[must_use]
pub fn slot(id: u16) -> u16 {
    field_index_to_field_offset(id)
}

/// A verifier paired with the bytes it checks.
pub struct Access<'o, 'b> {
    data: &'b [u8],
    verifier: Verifier<'o, 'b>,
}

impl<'o, 'b> Access<'o, 'b> {
    pub fn new(opts: &'o VerifierOptions, data: &'b [u8]) -> Self {
        Self {
            data,
            verifier: Verifier::new(opts, data),
        }
    }

    pub fn verifier(&mut self) -> &mut Verifier<'o, 'b> {
        &mut self.verifier
    }

    /// Position of the root table of a size-prefixed buffer whose prefix
    /// must equal the remaining length.
    pub fn size_prefixed_root(&mut self) -> SchemaResult<usize> {
        let declared = self.scalar::<u32>(0)?;
        let remaining = self.data.len().saturating_sub(SIZE_PREFIX_LEN);
        if usize::try_from(declared).ok() != Some(remaining) {
            return Err(SchemaError::FlatBufferVerifyFail(format!(
                "size prefix {declared} does not match {remaining} bytes"
            )));
        }
        self.follow(SIZE_PREFIX_LEN)
    }

    pub fn scalar<T: Scalar>(&mut self, pos: usize) -> SchemaResult<T> {
        self.verifier.in_buffer::<T>(pos)?;
        T::read_le(self.data, pos)
            .ok_or_else(|| SchemaError::FlatBufferVerifyFail(format!("no scalar at byte {pos}")))
    }

    /// Follows the unsigned offset stored at `pos`.
    pub fn follow(&mut self, pos: usize) -> SchemaResult<usize> {
        let offset = self.verifier.get_uoffset(pos)?;
        usize::try_from(offset)
            .ok()
            .and_then(|o| pos.checked_add(o))
            .filter(|target| *target < self.data.len())
            .ok_or_else(|| {
                SchemaError::FlatBufferVerifyFail(format!("offset at byte {pos} points outside"))
            })
    }

    /// Verifies and decodes the string stored at `pos`.
    pub fn string(&mut self, pos: usize) -> SchemaResult<&'b str> {
        <&str as Verifiable>::run_verifier(&mut self.verifier, pos)?;
        let len = usize::try_from(self.verifier.get_uoffset(pos)?).map_err(SchemaError::internal)?;
        let start = pos + UOFFSET_LEN;
        self.data
            .get(start..start + len)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .ok_or_else(|| SchemaError::FlatBufferVerifyFail(format!("bad string at byte {pos}")))
    }

    /// Positions of the elements of a vector of offsets stored at `pos`,
    /// each element already followed.
    pub fn offset_vector(&mut self, pos: usize) -> SchemaResult<Vec<usize>> {
        <Vector<'_, u32> as Verifiable>::run_verifier(&mut self.verifier, pos)?;
        let len = usize::try_from(self.verifier.get_uoffset(pos)?).map_err(SchemaError::internal)?;
        (0..len)
            .map(|i| self.follow(pos + UOFFSET_LEN + i * UOFFSET_LEN))
            .collect()
    }

    /// Verifies the table header at `pos` and returns the positions of its
    /// first `slots` fields, `None` where a field is absent.
    pub fn table(&mut self, pos: usize, slots: u16) -> SchemaResult<Fields> {
        let mut table = self.verifier.visit_table(pos)?;
        let positions = (0..slots)
            .map(|id| table.deref(slot(id)))
            .collect::<Result<Vec<_>, _>>()?;
        table.finish();
        Ok(Fields(positions))
    }

    /// Position of the field at vtable offset `voffset` of the table at
    /// `pos`, `None` when absent.
    pub fn field(&mut self, pos: usize, voffset: u16) -> SchemaResult<Option<usize>> {
        let mut table = self.verifier.visit_table(pos)?;
        let field = table.deref(voffset)?;
        table.finish();
        Ok(field)
    }
}

/// Field positions of one verified table, indexed by field id.
#[derive(Debug, Clone)]
pub struct Fields(Vec<Option<usize>>);

impl Fields {
    #[must_use]
    pub fn get(&self, id: u16) -> Option<usize> {
        self.0.get(usize::from(id)).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_access<R>(data: &[u8], f: impl FnOnce(&mut Access<'_, '_>) -> R) -> R {
        let opts = VerifierOptions::default();
        let mut access = Access::new(&opts, data);
        f(&mut access)
    }

    #[test]
    fn scalar_reads_check_bounds_and_alignment() {
        let data = [1, 0, 0, 0, 0xff, 0, 0, 0];
        with_access(&data, |a| {
            assert_eq!(a.scalar::<u32>(0).unwrap(), 1);
            assert_eq!(a.scalar::<i8>(4).unwrap(), -1);
            assert!(a.scalar::<u32>(2).is_err());
            assert!(a.scalar::<u64>(4).is_err());
        });
    }

    #[test]
    fn follow_rejects_targets_outside() {
        with_access(&[100, 0, 0, 0], |a| assert!(a.follow(0).is_err()));
    }

    #[test]
    fn string_requires_terminator() {
        with_access(&[2, 0, 0, 0, b'h', b'i', 0, 0], |a| {
            assert_eq!(a.string(0).unwrap(), "hi");
        });
        with_access(&[2, 0, 0, 0, b'h', b'i', 1, 0], |a| assert!(a.string(0).is_err()));
        with_access(&[9, 0, 0, 0, b'h', 0, 0, 0], |a| assert!(a.string(0).is_err()));
    }

    #[test]
    fn size_prefix_must_match_length() {
        with_access(&[8, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0], |a| {
            assert!(a.size_prefixed_root().is_ok());
        });
        with_access(&[9, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0], |a| {
            assert!(a.size_prefixed_root().is_err());
        });
    }

    #[test]
    fn table_with_bad_vtable_is_rejected() {
        // soffset points far before the start of the buffer
        with_access(&[0x10, 0, 0, 0], |a| assert!(a.table(0, 1).is_err()));
    }

    #[test]
    fn slot_numbering() {
        assert_eq!(slot(0), 4);
        assert_eq!(slot(9), 22);
    }
}
