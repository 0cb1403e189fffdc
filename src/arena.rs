//! Pre-sized bump allocator over a memory mapping.
//!
//! An [`Arena`] owns a single contiguous mapping, either backed by a file
//! (shared with any process that maps the same file) or anonymous. Records
//! are carved out of it sequentially and are never freed individually; the
//! mapping lives until the last [`Allocation`] referencing it is dropped.
//!
//! # Layout
//!
//! Each call to [`Arena::allocate`] places one header value at the next
//! address satisfying the header's alignment, followed by `count` zeroed
//! elements at the next address satisfying the element's alignment:
//!
//! ```text
//! cursor
//!   |  pad   +---------+ pad +----------------------+
//!   +------->| header  |---->| elements[count]      |--> new cursor
//!            +---------+     +----------------------+
//! ```

use crate::error::{ProfilerError, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Types that can be placed into an arena.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), have no drop glue, and
/// be valid for the all-zero bit pattern. Shared access must be sound while
/// another process writes the same memory, so any field mutated after
/// construction has to be atomic.
pub unsafe trait Plain: Sync + Send + 'static {}

unsafe impl Plain for u64 {}
unsafe impl Plain for AtomicU64 {}
unsafe impl Plain for crate::layout::HistogramHeader {}
unsafe impl Plain for crate::layout::RateCounterHeader {}

/// A memory mapping handed out in aligned, sequential pieces.
pub struct Arena {
    /// Base of the mapping. Taken from `map` at construction so that writes
    /// never go through a shared borrow of the map.
    base: NonNull<u8>,
    /// Mapping length in bytes.
    len: usize,
    /// Offset of the first unreserved byte.
    cursor: Mutex<usize>,
    /// Keeps the mapping alive. Unmapped on drop.
    map: MmapMut,
    /// Backing file, if any. Closed on drop after the final flush.
    file: Option<File>,
    path: Option<PathBuf>,
}

// SAFETY: the mapping is allocated once and never moves until Drop. All
// writes after construction go through `Plain` types, whose mutable state
// is atomic. The cursor is guarded by a mutex.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `size` bytes, backed by the file at `path` or anonymous memory.
    ///
    /// An existing file at `path` is replaced. Fails with
    /// [`ProfilerError::Io`] if the file cannot be opened, sized or mapped.
    pub fn create(path: Option<&Path>, size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map zero bytes").into());
        }

        let (mut map, file) = match path {
            Some(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    std::fs::create_dir_all(parent)?;
                }

                // Unlink first: a mapping of the old file that is still alive
                // keeps its own inode instead of faulting past a shorter EOF.
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = ?path, "replaced existing arena file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }

                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                file.set_len(size as u64)?;

                let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
                (map, Some(file))
            }
            None => (MmapOptions::new().len(size).map_anon()?, None),
        };

        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io::Error::other("mapping returned a null address"))?;

        tracing::debug!(
            path = ?path,
            size,
            address = ?base,
            "mapped arena"
        );

        Ok(Arc::new(Self {
            base,
            len: size,
            cursor: Mutex::new(0),
            map,
            file,
            path: path.map(Path::to_path_buf),
        }))
    }

    /// Worst-case bytes needed by one `allocate::<H, E>(count)` call,
    /// including alignment padding. Summing this over every planned
    /// allocation gives a capacity that cannot run out.
    ///
    /// `None` if the size is not representable as a `usize`.
    pub fn reservation<H, E>(count: usize) -> Option<usize> {
        count
            .checked_mul(size_of::<E>())?
            .checked_add(align_of::<E>())?
            .checked_add(size_of::<H>())?
            .checked_add(align_of::<H>())
    }

    /// Reserve and construct one header followed by `count` zeroed elements.
    ///
    /// Fails with [`ProfilerError::OutOfSpace`] if either piece would extend
    /// past the end of the arena; nothing is written in that case.
    pub fn allocate<H: Plain, E: Plain>(
        self: &Arc<Self>,
        header: H,
        count: usize,
    ) -> Result<Allocation<H, E>> {
        let mut cursor = self.cursor.lock();
        let start = *cursor;

        let out_of_space = |requested: usize| ProfilerError::OutOfSpace {
            requested,
            available: self.len - start,
        };

        let header_at = self.align_offset(start, align_of::<H>());
        let header_end = header_at.checked_add(size_of::<H>());
        let elements_at = header_end.map(|end| self.align_offset(end, align_of::<E>()));
        let end = elements_at.and_then(|at| {
            count
                .checked_mul(size_of::<E>())
                .and_then(|bytes| at.checked_add(bytes))
        });

        let (elements_at, end) = match (elements_at, end) {
            (Some(at), Some(end)) if end <= self.len => (at, end),
            (_, Some(end)) => return Err(out_of_space(end - start)),
            _ => return Err(out_of_space(usize::MAX)),
        };

        // SAFETY: both ranges were checked against `len` above and lie past
        // the cursor, so no other allocation overlaps them. `Plain` types
        // are valid when zeroed.
        let (header_ptr, elements_ptr) = unsafe {
            let header_ptr = self.base.as_ptr().add(header_at).cast::<H>();
            header_ptr.write(header);

            let elements_ptr = self.base.as_ptr().add(elements_at);
            elements_ptr.write_bytes(0, end - elements_at);

            (
                NonNull::new_unchecked(header_ptr),
                NonNull::new_unchecked(elements_ptr.cast::<E>()),
            )
        };

        *cursor = end;

        tracing::trace!(
            offset = header_at,
            count,
            used = end,
            capacity = self.len,
            "arena allocation"
        );

        Ok(Allocation {
            arena: Arc::clone(self),
            header: header_ptr,
            elements: elements_ptr,
            count,
            offset: header_at,
            _marker: PhantomData,
        })
    }

    /// Offset of the next address at or after `offset` aligned to `align`.
    fn align_offset(&self, offset: usize, align: usize) -> usize {
        let addr = self.base.as_ptr() as usize + offset;
        let aligned = (addr + align - 1) & !(align - 1);
        aligned - self.base.as_ptr() as usize
    }

    /// Ask the OS to write dirty pages back to the file without waiting.
    ///
    /// Failures are logged; the data is still valid in memory.
    pub fn sync(&self) {
        if self.file.is_none() {
            return;
        }
        if let Err(e) = self.map.flush_async() {
            tracing::warn!(path = ?self.path, error = %e, "failed to schedule arena flush");
        }
    }

    /// Total mapping size in bytes.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Bytes reserved so far.
    pub fn used(&self) -> usize {
        *self.cursor.lock()
    }

    /// The backing file, if this arena is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("path", &self.path)
            .field("address", &self.base)
            .field("capacity", &self.len)
            .field("used", &self.used())
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.file.is_some()
            && let Err(e) = self.map.flush()
        {
            tracing::error!(path = ?self.path, error = %e, "failed to flush arena");
        }
        tracing::debug!(path = ?self.path, capacity = self.len, "unmapping arena");
        // MmapMut unmaps and File closes as the fields drop.
    }
}

/// A header and its trailing element array, borrowed from an arena.
///
/// Holds a reference to the arena, so the mapping cannot be unmapped while
/// any allocation is alive.
pub struct Allocation<H, E> {
    arena: Arc<Arena>,
    header: NonNull<H>,
    elements: NonNull<E>,
    count: usize,
    offset: usize,
    _marker: PhantomData<(H, E)>,
}

// SAFETY: the pointed-to memory is owned by the arena, which is Send + Sync,
// and `Plain` requires H and E to be Sync.
unsafe impl<H: Plain, E: Plain> Send for Allocation<H, E> {}
unsafe impl<H: Plain, E: Plain> Sync for Allocation<H, E> {}

impl<H: Plain, E: Plain> Allocation<H, E> {
    /// The constructed header.
    #[inline]
    pub fn header(&self) -> &H {
        // SAFETY: written in `Arena::allocate`, alive while `arena` is.
        unsafe { self.header.as_ref() }
    }

    /// The element array.
    #[inline]
    pub fn elements(&self) -> &[E] {
        // SAFETY: `count` zeroed elements were reserved in `Arena::allocate`.
        unsafe { std::slice::from_raw_parts(self.elements.as_ptr(), self.count) }
    }

    /// Byte offset of the header from the start of the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The arena this allocation was carved from.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{HistogramHeader, PAGE_SIZE};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[repr(C)]
    struct Small {
        a: u64,
    }
    unsafe impl Plain for Small {}

    #[test]
    fn test_zero_size_fails() {
        assert!(matches!(
            Arena::create(None, 0),
            Err(ProfilerError::Io(_))
        ));
    }

    #[test]
    fn test_sequential_allocations() {
        let arena = Arena::create(None, 4096).unwrap();

        let first: Allocation<Small, u64> = arena.allocate(Small { a: 7 }, 4).unwrap();
        assert_eq!(first.offset(), 0);
        assert_eq!(first.header().a, 7);
        assert_eq!(first.elements(), &[0, 0, 0, 0]);
        assert_eq!(arena.used(), 8 + 4 * 8);

        let second: Allocation<Small, u64> = arena.allocate(Small { a: 9 }, 1).unwrap();
        assert_eq!(second.offset(), 40);
        assert_eq!(second.header().a, 9);
        assert_eq!(arena.used(), 56);
    }

    #[test]
    fn test_page_aligned_header() {
        let arena = Arena::create(None, 4 * PAGE_SIZE).unwrap();
        let _small: Allocation<Small, u64> = arena.allocate(Small { a: 1 }, 1).unwrap();

        let hist: Allocation<HistogramHeader, AtomicU64> = arena
            .allocate(HistogramHeader::new(1, 8, 0, "x"), 8)
            .unwrap();
        assert_eq!(hist.offset(), PAGE_SIZE);
        let elements_addr = hist.elements().as_ptr() as usize;
        let header_addr = hist.header() as *const HistogramHeader as usize;
        assert_eq!(elements_addr - header_addr, PAGE_SIZE);
        assert_eq!(arena.used(), 2 * PAGE_SIZE + 64);
    }

    #[test]
    fn test_out_of_space() {
        let arena = Arena::create(None, 64).unwrap();
        let result: Result<Allocation<Small, u64>> = arena.allocate(Small { a: 1 }, 8);
        match result {
            Err(ProfilerError::OutOfSpace {
                requested,
                available,
            }) => {
                assert_eq!(requested, 72);
                assert_eq!(available, 64);
            }
            _ => panic!("expected OutOfSpace"),
        }
        // nothing was reserved
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_reservation_is_enough() {
        let count = 100;
        let size = Arena::reservation::<HistogramHeader, AtomicU64>(count).unwrap() * 3;
        let arena = Arena::create(None, size).unwrap();
        for _ in 0..3 {
            let _: Allocation<HistogramHeader, AtomicU64> = arena
                .allocate(HistogramHeader::new(1, count as u64, 0, "x"), count)
                .unwrap();
        }
    }

    #[test]
    fn test_file_backed_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("arena.shm");

        {
            let arena = Arena::create(Some(&path), 4096).unwrap();
            assert_eq!(arena.path(), Some(path.as_path()));
            let alloc: Allocation<Small, AtomicU64> =
                arena.allocate(Small { a: 0xabcd }, 2).unwrap();
            alloc.elements()[1].store(42, Ordering::Relaxed);
            arena.sync();
        }

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 0xabcd);
        assert_eq!(u64::from_ne_bytes(bytes[16..24].try_into().unwrap()), 42);
    }

    #[test]
    fn test_allocation_keeps_arena_alive() {
        let arena = Arena::create(None, 4096).unwrap();
        let alloc: Allocation<Small, u64> = arena.allocate(Small { a: 5 }, 1).unwrap();
        drop(arena);
        assert_eq!(alloc.header().a, 5);
        assert_eq!(alloc.arena().capacity(), 4096);
    }

    #[test]
    fn test_replaced_file_keeps_old_mapping_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.shm");

        let old = Arena::create(Some(&path), 4 * PAGE_SIZE).unwrap();
        let alloc: Allocation<Small, AtomicU64> = old.allocate(Small { a: 1 }, 400).unwrap();

        let _new = Arena::create(Some(&path), PAGE_SIZE).unwrap();
        // past the end of the new file, still mapped through the old inode
        alloc.elements()[399].store(3, Ordering::Relaxed);
        assert_eq!(alloc.elements()[399].load(Ordering::Relaxed), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE_SIZE as u64);
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        std::fs::write(&path, vec![0xffu8; 10_000]).unwrap();

        let arena = Arena::create(Some(&path), 4096).unwrap();
        drop(arena);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4096);
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
