use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Alignment of pool chunks. Any smaller alignment request starting at a
/// chunk boundary is satisfied without padding.
const CHUNK_ALIGN: usize = 16;

/// A manually allocated buffer. Used for both pool chunks and dedicated
/// large blocks so the pool controls alignment and never zero-initializes.
struct RawBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawBuf {
    fn new(size: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(size, align).expect("invalid allocation layout");
        // SAFETY: layout has non-zero size; callers never request zero bytes here.
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            // Memory exhaustion is fatal to the operation in progress.
            handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in RawBuf::new.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct PoolInner {
    /// Owned chunks, retained across clear() for reuse.
    chunks: Vec<RawBuf>,
    /// Dedicated buffers for oversized requests, released on clear().
    large_blocks: Vec<RawBuf>,
    /// Index of the chunk the bump cursor currently points into.
    current_chunk: usize,
    current: *mut u8,
    end: *mut u8,
    size: usize,
    capacity: usize,
}

/// Bump-pointer memory pool.
///
/// Hands out byte ranges carved from large pre-allocated chunks. Requests at
/// or above the configured small-block threshold bypass the bump cursor and
/// get a dedicated buffer of exactly the requested size. There is no
/// per-allocation free: `clear()` rewinds the cursor over the retained
/// chunks and drops the large blocks, and every outstanding range is
/// statically pinned to the pool borrow until then.
///
/// The pool is intended for one single-threaded processing context (one
/// read or write operation) and is neither `Send` nor `Sync`.
pub struct ChunkedPool {
    chunk_size: usize,
    max_small_block_size: usize,
    tag: &'static str,
    inner: UnsafeCell<PoolInner>,
}

impl ChunkedPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_small_block_size: config.max_small_block_size(),
            tag: config.tag,
            inner: UnsafeCell::new(PoolInner {
                chunks: Vec::new(),
                large_blocks: Vec::new(),
                current_chunk: 0,
                current: std::ptr::null_mut(),
                end: std::ptr::null_mut(),
                size: 0,
                capacity: 0,
            }),
        }
    }

    /// Allocates exactly `size` bytes with no alignment guarantee.
    ///
    /// The range is valid (and exclusively owned by the caller) until
    /// `clear()` or the pool is dropped.
    pub fn allocate_unaligned(&self, size: usize) -> &mut [u8] {
        if size == 0 {
            return &mut [];
        }
        let inner = self.inner_mut();
        let ptr = if size >= self.max_small_block_size {
            self.allocate_large(inner, size, 1)
        } else {
            self.allocate_small(inner, size, 1)
        };
        inner.size += size;
        // SAFETY: ptr points at `size` freshly reserved bytes that no other
        // outstanding range overlaps; the lifetime is tied to &self, and
        // clear() requires &mut self.
        unsafe { std::slice::from_raw_parts_mut(ptr, size) }
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<&mut [u8]> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }
        if size == 0 {
            return Ok(&mut []);
        }
        let inner = self.inner_mut();
        // Worst-case padding counts toward the small/large decision so a
        // fresh chunk is always guaranteed to fit the aligned request.
        let ptr = if size + align - 1 >= self.max_small_block_size {
            self.allocate_large(inner, size, align)
        } else {
            self.allocate_small(inner, size, align)
        };
        inner.size += size;
        // SAFETY: as in allocate_unaligned; the returned address was rounded
        // up to `align` by the bump path or allocated with that alignment.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }

    /// Allocates storage for `n` instances of `T` without initializing them.
    pub fn allocate_uninitialized<T>(&self, n: usize) -> &mut [MaybeUninit<T>] {
        let bytes = n * std::mem::size_of::<T>();
        if bytes == 0 {
            // Covers n == 0 and zero-sized types.
            return &mut [];
        }
        let inner = self.inner_mut();
        let align = std::mem::align_of::<T>();
        let ptr = if bytes + align - 1 >= self.max_small_block_size {
            self.allocate_large(inner, bytes, align)
        } else {
            self.allocate_small(inner, bytes, align)
        };
        inner.size += bytes;
        // SAFETY: ptr is aligned for T and covers n * size_of::<T>() bytes.
        unsafe { std::slice::from_raw_parts_mut(ptr.cast::<MaybeUninit<T>>(), n) }
    }

    /// Rewinds the bump cursor to the start of the first owned chunk so the
    /// reserved space can be reused, and drops all large blocks.
    pub fn clear(&mut self) {
        let inner = self.inner.get_mut();
        inner.large_blocks.clear();
        inner.current_chunk = 0;
        inner.size = 0;
        inner.capacity = inner.chunks.iter().map(|c| c.layout.size()).sum();
        match inner.chunks.first() {
            Some(chunk) => {
                inner.current = chunk.ptr.as_ptr();
                // SAFETY: offset stays within the chunk's allocation.
                inner.end = unsafe { chunk.ptr.as_ptr().add(chunk.layout.size()) };
            }
            None => {
                inner.current = std::ptr::null_mut();
                inner.end = std::ptr::null_mut();
            }
        }
    }

    /// Returns the number of bytes handed out since the last clear().
    pub fn size(&self) -> usize {
        self.inner_ref().size
    }

    /// Returns the number of bytes currently reserved by the pool.
    pub fn capacity(&self) -> usize {
        self.inner_ref().capacity
    }

    /// Returns the accounting tag this pool was created with.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    #[allow(clippy::mut_from_ref)]
    fn inner_mut(&self) -> &mut PoolInner {
        // SAFETY: the pool is !Sync, so calls are serialized on one thread,
        // and the reference never outlives the call. Ranges handed to
        // callers point into chunk buffers, never into PoolInner itself.
        unsafe { &mut *self.inner.get() }
    }

    fn inner_ref(&self) -> &PoolInner {
        // SAFETY: see inner_mut; shared read on the owning thread.
        unsafe { &*self.inner.get() }
    }

    fn allocate_small(&self, inner: &mut PoolInner, size: usize, align: usize) -> *mut u8 {
        loop {
            if !inner.current.is_null() {
                let padding = inner.current.align_offset(align);
                let remaining = inner.end as usize - inner.current as usize;
                if padding + size <= remaining {
                    // SAFETY: padding + size fits the current chunk.
                    let ptr = unsafe { inner.current.add(padding) };
                    inner.current = unsafe { ptr.add(size) };
                    return ptr;
                }
            }
            self.switch_chunk(inner);
        }
    }

    /// Advances the cursor to the next retained chunk, allocating a new one
    /// when the chain is exhausted.
    fn switch_chunk(&self, inner: &mut PoolInner) {
        let next = if inner.chunks.is_empty() {
            0
        } else {
            inner.current_chunk + 1
        };
        if next == inner.chunks.len() {
            inner.chunks.push(RawBuf::new(self.chunk_size, CHUNK_ALIGN));
            inner.capacity += self.chunk_size;
            tracing::debug!(
                tag = self.tag,
                chunk_size = self.chunk_size,
                chunks = inner.chunks.len(),
                "Allocated pool chunk"
            );
        }
        inner.current_chunk = next;
        let chunk = &inner.chunks[next];
        inner.current = chunk.ptr.as_ptr();
        // SAFETY: offset stays within the chunk's allocation.
        inner.end = unsafe { chunk.ptr.as_ptr().add(chunk.layout.size()) };
    }

    fn allocate_large(&self, inner: &mut PoolInner, size: usize, align: usize) -> *mut u8 {
        let buf = RawBuf::new(size, align.max(1));
        let ptr = buf.ptr.as_ptr();
        inner.capacity += size;
        inner.large_blocks.push(buf);
        ptr
    }
}
