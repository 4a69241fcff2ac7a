//! Growable persistent vector
//!
//! A `PVec<T>` is a handle to a small header object that records the length,
//! the capacity and the offset of a separately allocated element array.
//! Elements are stored back to back in their `Persist` encoding. The array
//! doubles when full and is replaced, never resized in place, so every
//! mutation is an ordinary undo-logged write.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{PoolError, PoolResult};
use crate::format::{get_u32, get_u64, put_u32, put_u64};
use crate::persist::{short_buffer, PPtr, Persist, ReadAccess};
use crate::tx::Transaction;

const PVEC_TYPE_TAG: u32 = 0x4000_0000;
const ARRAY_TYPE_ID: u32 = 0x0000_0202;
const MIN_CAPACITY: u64 = 4;

/// On-pool header of a vector:
///
///   [0..8]   len
///   [8..16]  cap
///   [16..24] data:      offset of the element array, 0 while cap is 0
///   [24..28] elem_type
///   [28..32] elem_size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VecHeader {
    len: u64,
    cap: u64,
    data: u64,
    elem_type: u32,
    elem_size: u32,
}

impl Persist for VecHeader {
    const TYPE_ID: u32 = 0x0000_0201;
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.len);
        put_u64(buf, 8, self.cap);
        put_u64(buf, 16, self.data);
        put_u32(buf, 24, self.elem_type);
        put_u32(buf, 28, self.elem_size);
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(short_buffer(Self::TYPE_ID, Self::SIZE, buf.len()));
        }
        let header = Self {
            len: get_u64(buf, 0),
            cap: get_u64(buf, 8),
            data: get_u64(buf, 16),
            elem_type: get_u32(buf, 24),
            elem_size: get_u32(buf, 28),
        };
        if header.len > header.cap || (header.cap > 0 && header.data == 0) {
            return Err(PoolError::Decode {
                type_id: Self::TYPE_ID,
                reason: format!("len {} cap {} data 0x{:x} is inconsistent", header.len, header.cap, header.data),
            });
        }
        Ok(header)
    }

    fn release(&self, tx: &mut Transaction<'_>) -> PoolResult<()> {
        if self.data != 0 {
            tx.free_raw(self.data, ARRAY_TYPE_ID)?;
        }
        Ok(())
    }
}

/// Persistent vector of `T`, stored as a handle inside another object.
///
/// Freeing a vector releases its header and element array. Elements are
/// dropped as plain bytes; a vector of `PPtr`s does not free the pointees.
pub struct PVec<T> {
    header: PPtr<VecHeader>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persist> PVec<T> {
    /// Allocate an empty vector. The element array is allocated on first push.
    pub fn new(tx: &mut Transaction<'_>) -> PoolResult<Self> {
        let header = tx.alloc(&VecHeader {
            len: 0,
            cap: 0,
            data: 0,
            elem_type: T::TYPE_ID,
            elem_size: T::SIZE as u32,
        })?;
        Ok(Self { header, _marker: PhantomData })
    }

    fn header_of<A: ReadAccess + ?Sized>(&self, access: &A) -> PoolResult<VecHeader> {
        let header = access.load(self.header)?;
        if header.elem_type != T::TYPE_ID || header.elem_size as usize != T::SIZE {
            return Err(PoolError::TypeMismatch {
                offset: self.header.offset(),
                expected: T::TYPE_ID,
                found: header.elem_type,
            });
        }
        Ok(header)
    }

    fn elements<'h, A: ReadAccess + ?Sized>(&self, access: &'h A, header: &VecHeader) -> PoolResult<&'h [u8]> {
        if header.cap == 0 {
            return Ok(&[]);
        }
        let payload = access.heap().payload(header.data, ARRAY_TYPE_ID)?;
        let used = header.len as usize * T::SIZE;
        payload.get(..used).ok_or_else(|| PoolError::Decode {
            type_id: ARRAY_TYPE_ID,
            reason: format!("array of {} bytes holds fewer than {} elements", payload.len(), header.len),
        })
    }

    pub fn len<A: ReadAccess + ?Sized>(&self, access: &A) -> PoolResult<usize> {
        Ok(self.header_of(access)?.len as usize)
    }

    pub fn is_empty<A: ReadAccess + ?Sized>(&self, access: &A) -> PoolResult<bool> {
        Ok(self.len(access)? == 0)
    }

    pub fn capacity<A: ReadAccess + ?Sized>(&self, access: &A) -> PoolResult<usize> {
        Ok(self.header_of(access)?.cap as usize)
    }

    pub fn get<A: ReadAccess + ?Sized>(&self, access: &A, index: usize) -> PoolResult<T> {
        let header = self.header_of(access)?;
        if index as u64 >= header.len {
            return Err(PoolError::IndexOutOfBounds { index, len: header.len as usize });
        }
        let bytes = self.elements(access, &header)?;
        T::decode(&bytes[index * T::SIZE..(index + 1) * T::SIZE])
    }

    /// Copy every element out, first to last.
    pub fn to_vec<A: ReadAccess + ?Sized>(&self, access: &A) -> PoolResult<Vec<T>> {
        let header = self.header_of(access)?;
        self.elements(access, &header)?
            .chunks_exact(T::SIZE)
            .map(T::decode)
            .collect()
    }

    /// Append an element, doubling the array when it is full.
    pub fn push(&self, tx: &mut Transaction<'_>, value: &T) -> PoolResult<()> {
        let mut header = self.header_of(&*tx)?;
        if header.len == header.cap {
            self.grow(tx, &mut header)?;
        }

        let mut buf = vec![0u8; T::SIZE];
        value.encode(&mut buf);
        tx.write_payload(header.data, ARRAY_TYPE_ID, header.len as usize * T::SIZE, &buf)?;

        header.len += 1;
        tx.write(self.header, &header)
    }

    fn grow(&self, tx: &mut Transaction<'_>, header: &mut VecHeader) -> PoolResult<()> {
        let cap = (header.cap * 2).max(MIN_CAPACITY);
        let old = self.elements(&*tx, header)?.to_vec();

        let data = tx.alloc_raw(ARRAY_TYPE_ID, cap as usize * T::SIZE)?;
        tx.write_payload(data, ARRAY_TYPE_ID, 0, &old)?;
        if header.data != 0 {
            tx.free_raw(header.data, ARRAY_TYPE_ID)?;
        }

        log::trace!("[pool] Grew vector 0x{:x} from {} to {} elements", self.header.offset(), header.cap, cap);
        header.cap = cap;
        header.data = data;
        Ok(())
    }

    /// Remove the element at `index`, shifting later elements down.
    pub fn remove(&self, tx: &mut Transaction<'_>, index: usize) -> PoolResult<T> {
        let mut header = self.header_of(&*tx)?;
        if index as u64 >= header.len {
            return Err(PoolError::IndexOutOfBounds { index, len: header.len as usize });
        }

        let (removed, tail) = {
            let bytes = self.elements(&*tx, &header)?;
            let at = index * T::SIZE;
            (T::decode(&bytes[at..at + T::SIZE])?, bytes[at + T::SIZE..].to_vec())
        };
        tx.write_payload(header.data, ARRAY_TYPE_ID, index * T::SIZE, &tail)?;

        header.len -= 1;
        tx.write(self.header, &header)?;
        Ok(removed)
    }

    /// Set the length to zero, keeping the array.
    pub fn clear(&self, tx: &mut Transaction<'_>) -> PoolResult<()> {
        let mut header = self.header_of(&*tx)?;
        header.len = 0;
        tx.write(self.header, &header)
    }

    /// Free the header and the element array.
    pub fn free(self, tx: &mut Transaction<'_>) -> PoolResult<()> {
        tx.free(self.header)
    }
}

impl<T> Clone for PVec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PVec<T> {}

impl<T> PartialEq for PVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<T> Eq for PVec<T> {}

impl<T> fmt::Debug for PVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PVec(0x{:x})", self.header.offset())
    }
}

impl<T: Persist> Persist for PVec<T> {
    const TYPE_ID: u32 = PVEC_TYPE_TAG ^ T::TYPE_ID;
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        self.header.encode(buf);
    }

    fn decode(buf: &[u8]) -> PoolResult<Self> {
        Ok(Self { header: PPtr::decode(buf)?, _marker: PhantomData })
    }

    fn release(&self, tx: &mut Transaction<'_>) -> PoolResult<()> {
        tx.free(self.header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use tempfile::TempDir;

    fn test_pool() -> (Pool<PVec<u64>>, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = Pool::create(dir.path().join("vec.pool"), "pvec-test", &PoolConfig::compact(), |tx| {
            PVec::new(tx)
        })
        .unwrap();
        (pool, dir)
    }

    #[test]
    fn test_new_vector_is_empty() {
        let (pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();
        assert!(vec.is_empty(&pool).unwrap());
        assert_eq!(vec.capacity(&pool).unwrap(), 0);
        assert_eq!(vec.to_vec(&pool).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_push_grows_by_doubling() {
        let (mut pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();

        pool.run(|tx| {
            for i in 0..9u64 {
                vec.push(tx, &(i * 10))?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(vec.len(&pool).unwrap(), 9);
        assert_eq!(vec.capacity(&pool).unwrap(), 16);
        assert_eq!(vec.get(&pool, 8).unwrap(), 80);
        assert_eq!(vec.to_vec(&pool).unwrap(), (0..9).map(|i| i * 10).collect::<Vec<u64>>());

        // Old arrays were given back: root + vector header + one array.
        assert_eq!(pool.stats().objects, 3);
    }

    #[test]
    fn test_remove_shifts_tail() {
        let (mut pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();
        pool.run(|tx| {
            for i in 1..=5u64 {
                vec.push(tx, &i)?;
            }
            Ok(())
        })
        .unwrap();

        let removed = pool.run(|tx| vec.remove(tx, 0)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(vec.to_vec(&pool).unwrap(), vec![2, 3, 4, 5]);

        let removed = pool.run(|tx| vec.remove(tx, 3)).unwrap();
        assert_eq!(removed, 5);
        assert_eq!(vec.to_vec(&pool).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds() {
        let (mut pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();

        assert!(matches!(vec.get(&pool, 0), Err(PoolError::IndexOutOfBounds { index: 0, len: 0 })));
        let result = pool.run(|tx| vec.remove(tx, 2));
        assert!(matches!(result, Err(PoolError::IndexOutOfBounds { index: 2, len: 0 })));
    }

    #[test]
    fn test_aborted_push_leaves_vector_unchanged() {
        let (mut pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();
        pool.run(|tx| vec.push(tx, &1)).unwrap();
        let before = pool.stats();

        let result: PoolResult<()> = pool.run(|tx| {
            for i in 0..10u64 {
                vec.push(tx, &i)?;
            }
            Err(PoolError::aborted("test"))
        });
        assert!(result.is_err());
        assert_eq!(vec.to_vec(&pool).unwrap(), vec![1]);
        assert_eq!(vec.capacity(&pool).unwrap(), 4);
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let (mut pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();
        pool.run(|tx| {
            vec.push(tx, &1)?;
            vec.push(tx, &2)?;
            vec.clear(tx)
        })
        .unwrap();

        assert!(vec.is_empty(&pool).unwrap());
        assert_eq!(vec.capacity(&pool).unwrap(), 4);
    }

    #[test]
    fn test_free_releases_storage() {
        let (mut pool, _dir) = test_pool();
        let before = pool.stats();

        let other = pool
            .run(|tx| {
                let other = PVec::<u32>::new(tx)?;
                other.push(tx, &7)?;
                Ok(other)
            })
            .unwrap();
        assert_eq!(pool.stats().objects, before.objects + 2);

        pool.run(|tx| other.free(tx)).unwrap();
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_element_type_is_checked() {
        let (pool, _dir) = test_pool();
        let vec = pool.root_value().unwrap();
        let wrong: PVec<i64> = PVec { header: vec.header, _marker: PhantomData };
        assert!(matches!(wrong.len(&pool), Err(PoolError::TypeMismatch { .. })));
    }
}
