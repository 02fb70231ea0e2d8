//! Message buffer management.
//!
//! A `MsgBuffer` is a contiguous, cache-line-aligned byte region registered
//! with the transport for zero-copy TX/RX. Buffers are handed out by a
//! [`MsgAllocator`], which is safe to share with background worker threads.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::transport::{MemDeregFn, MemRegFn, MemRegHandle};

/// Alignment for message buffers.
pub const MSG_BUFFER_ALIGN: usize = 64;

/// A message buffer registered with the transport.
///
/// The buffer owns its memory; dropping it deregisters and frees it.
pub struct MsgBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    mr: MemRegHandle,
    dereg: MemDeregFn,
    outstanding: Arc<AtomicUsize>,
}

impl MsgBuffer {
    fn alloc_raw(capacity: usize) -> Result<NonNull<u8>> {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, MSG_BUFFER_ALIGN, capacity) };
        if ret != 0 || ptr.is_null() {
            return Err(Error::NoMem("message buffer"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
    }

    /// Get the memory-registration handle.
    #[inline]
    pub fn mr(&self) -> MemRegHandle {
        self.mr
    }

    /// Get the total capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current data size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink or grow the data size within the allocated capacity.
    ///
    /// The capacity is fixed at allocation time; growing past it fails.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity {
            return Err(Error::MsgTooLarge {
                size: new_len,
                max: self.capacity,
            });
        }
        self.len = new_len;
        Ok(())
    }

    /// Get the buffer contents as a byte slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer contents as a mutable byte slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `data` into the buffer and set the data size to its length.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(Error::MsgTooLarge {
                size: data.len(),
                max: self.capacity,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        (self.dereg)(self.mr);
        unsafe {
            libc::free(self.ptr.as_ptr() as *mut libc::c_void);
        }
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

// MsgBuffer owns its memory and registration.
unsafe impl Send for MsgBuffer {}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

/// Allocator for message buffers.
///
/// Holds the transport's registration hooks and tracks the number of live
/// buffers. Callable from background worker threads.
pub struct MsgAllocator {
    reg: MemRegFn,
    dereg: MemDeregFn,
    outstanding: Arc<AtomicUsize>,
}

impl MsgAllocator {
    /// Create an allocator from the transport's registration hooks.
    pub fn new(reg: MemRegFn, dereg: MemDeregFn) -> Self {
        Self {
            reg,
            dereg,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a buffer of the given capacity, registered with the transport.
    ///
    /// The data size is initialized to the full capacity.
    pub fn alloc(&self, max_size: usize) -> Result<MsgBuffer> {
        if max_size == 0 {
            return Err(Error::NoMem("zero-sized buffer"));
        }
        let ptr = MsgBuffer::alloc_raw(max_size)?;
        let mr = (self.reg)(ptr.as_ptr(), max_size);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(MsgBuffer {
            ptr,
            capacity: max_size,
            len: max_size,
            mr,
            dereg: self.dereg.clone(),
            outstanding: self.outstanding.clone(),
        })
    }

    /// Free a buffer.
    pub fn free(&self, buf: MsgBuffer) {
        drop(buf);
    }

    /// Number of live buffers handed out by this allocator.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_allocator() -> MsgAllocator {
        MsgAllocator::new(Arc::new(|_, _| 0), Arc::new(|_| {}))
    }

    #[test]
    fn test_alloc_free_accounting() {
        let alloc = test_allocator();
        let a = alloc.alloc(1024).unwrap();
        let b = alloc.alloc(64).unwrap();
        assert_eq!(alloc.outstanding(), 2);
        alloc.free(a);
        assert_eq!(alloc.outstanding(), 1);
        drop(b);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_buffer_alignment_and_len() {
        let alloc = test_allocator();
        let mut buf = alloc.alloc(1024).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % MSG_BUFFER_ALIGN, 0);
        assert_eq!(buf.len(), 1024);
        buf.resize(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.resize(2048).is_err());
    }

    #[test]
    fn test_copy_from() {
        let alloc = test_allocator();
        let mut buf = alloc.alloc(64).unwrap();
        buf.copy_from(b"hello").unwrap();
        assert_eq!(buf.as_slice(), b"hello");
        assert!(buf.copy_from(&[0u8; 128]).is_err());
    }
}
