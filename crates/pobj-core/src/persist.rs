//! Persistent value encoding and durable pointers
//!
//! Objects are stored as fixed-size little-endian byte images. A type opts in
//! by implementing [`Persist`]; the pool never stores Rust memory layouts or
//! virtual addresses, so a pool remains valid wherever it is mapped next.
//!
//! Type ids below `0x0001_0000` and ids with the top bit set are reserved for
//! this crate.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{PoolError, PoolResult};
use crate::format::{get_u64, put_u64};
use crate::heap::Heap;
use crate::tx::Transaction;

/// Tag folded into the type id of `PPtr<T>`
const PPTR_TYPE_TAG: u32 = 0x8000_0000;

/// A value that can live in a pool.
///
/// `encode` receives a buffer of exactly `SIZE` bytes; `decode` receives the
/// same. `release` runs when an object of this type is freed and is where a
/// type frees the objects it owns.
pub trait Persist: Sized {
    const TYPE_ID: u32;
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> PoolResult<Self>;

    fn release(&self, _tx: &mut Transaction<'_>) -> PoolResult<()> {
        Ok(())
    }
}

/// Read access to pool objects, shared by `Pool` and `Transaction`.
pub trait ReadAccess {
    #[doc(hidden)]
    fn heap(&self) -> &Heap;

    /// Copy an object out of the pool.
    fn load<T: Persist>(&self, ptr: PPtr<T>) -> PoolResult<T> {
        self.heap().read_object(ptr)
    }
}

/// Error for a `decode` buffer shorter than the type needs.
pub fn short_buffer(type_id: u32, needed: usize, got: usize) -> PoolError {
    PoolError::Decode {
        type_id,
        reason: format!("need {} bytes, got {}", needed, got),
    }
}

macro_rules! persist_primitive {
    ($($ty:ty => $id:expr),* $(,)?) => {
        $(
            impl Persist for $ty {
                const TYPE_ID: u32 = $id;
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, buf: &mut [u8]) {
                    buf[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn decode(buf: &[u8]) -> PoolResult<Self> {
                    let bytes: [u8; std::mem::size_of::<$ty>()] = buf
                        .get(..Self::SIZE)
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(|| short_buffer(Self::TYPE_ID, Self::SIZE, buf.len()))?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }
            }
        )*
    };
}

persist_primitive! {
    u32 => 0x0000_0101,
    i32 => 0x0000_0102,
    u64 => 0x0000_0103,
    i64 => 0x0000_0104,
    f64 => 0x0000_0105,
}

/// Durable pointer to a `T` inside a pool.
///
/// Holds the object's byte offset from the start of the pool file; zero is
/// null. Copying a `PPtr` does not copy the object.
pub struct PPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PPtr<T> {
    pub const fn null() -> Self {
        Self { offset: 0, _marker: PhantomData }
    }

    pub(crate) fn from_offset(offset: u64) -> Self {
        Self { offset, _marker: PhantomData }
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    /// Byte offset of the object inside the pool.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T> Clone for PPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PPtr<T> {}

impl<T> PartialEq for PPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for PPtr<T> {}

impl<T> Hash for PPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl<T> Default for PPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for PPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PPtr(null)")
        } else {
            write!(f, "PPtr(0x{:x})", self.offset)
        }
    }
}

impl<T: Persist> Persist for PPtr<T> {
    const TYPE_ID: u32 = PPTR_TYPE_TAG ^ T::TYPE_ID;
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.offset);
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::TYPE_ID, Self::SIZE, buf.len()));
        }
        Ok(Self::from_offset(get_u64(buf, 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T: Persist>(value: &T) -> Vec<u8> {
        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        buf
    }

    #[test]
    fn test_primitive_encoding_is_little_endian() {
        assert_eq!(encode(&0x0102_0304u32), vec![4, 3, 2, 1]);
        assert_eq!(i64::decode(&encode(&-5i64)).unwrap(), -5);
        assert_eq!(f64::decode(&encode(&2.5f64)).unwrap(), 2.5);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(u64::decode(&[1, 2, 3]), Err(PoolError::Decode { type_id, .. }) if type_id == u64::TYPE_ID));
        assert!(PPtr::<u32>::decode(&[0; 4]).is_err());
    }

    #[test]
    fn test_pptr_type_ids_differ_by_target() {
        assert_ne!(PPtr::<u32>::TYPE_ID, PPtr::<u64>::TYPE_ID);
        assert_ne!(PPtr::<u32>::TYPE_ID, u32::TYPE_ID);
    }

    #[test]
    fn test_pptr_null_and_debug() {
        let null: PPtr<u64> = PPtr::default();
        assert!(null.is_null());
        assert_eq!(format!("{:?}", null), "PPtr(null)");

        let ptr: PPtr<u64> = PPtr::from_offset(0x4000);
        assert!(!ptr.is_null());
        assert_eq!(format!("{:?}", ptr), "PPtr(0x4000)");
        assert_eq!(PPtr::<u64>::decode(&encode(&ptr)).unwrap(), ptr);
    }
}
