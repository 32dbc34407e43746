// This module owns the executable memory that compiled functions live in. An ExecutableBuffer is
// an anonymous private mapping obtained with libc::mmap as read-write; the engine copies a
// function's code into it, patches its call slots while it is still writable and then flips the
// whole mapping to read-execute with mprotect before anything runs (W^X: a page is never
// writable and executable at the same time). The mapping is released with munmap on drop, so
// dropping a CompiledArtifact is all it takes to free a function's code.

//! Executable memory for JIT code.

use std::ptr::{self, NonNull};

use crate::core::error::{EngineError, EngineResult};

pub const PAGE_SIZE: usize = 4096;

/// A page-aligned block of memory that becomes executable once finalized.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    is_executable: bool,
}

impl ExecutableBuffer {
    /// Map a writable buffer holding a copy of `code`.
    pub fn with_code(code: &[u8]) -> EngineResult<Self> {
        let mut buffer = Self::new(code.len())?;
        buffer.emit_bytes(code)?;
        Ok(buffer)
    }

    /// Map a writable buffer of at least `min_capacity` bytes.
    pub fn new(min_capacity: usize) -> EngineResult<Self> {
        let capacity = align_to_page(min_capacity.max(PAGE_SIZE));
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(memory_error("mmap", capacity));
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| memory_error("mmap", capacity))?;
        Ok(Self { ptr, capacity, len: 0, is_executable: false })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of the byte at `offset`.
    #[inline]
    pub fn address_of(&self, offset: usize) -> usize {
        self.ptr.as_ptr() as usize + offset
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append `bytes` to the written region.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> EngineResult<()> {
        self.check_writable(self.len, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Overwrite an already written 8-byte slot with `value`.
    pub fn patch_u64(&mut self, offset: usize, value: u64) -> EngineResult<()> {
        self.check_writable(offset, 8)?;
        if offset + 8 > self.len {
            return Err(EngineError::ExecutableMemory {
                reason: format!("patch at {offset:#x} is outside the {} written bytes", self.len),
            });
        }
        let bytes = value.to_le_bytes();
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Switch the mapping to read-execute. Further writes fail.
    pub fn make_executable(&mut self) -> EngineResult<()> {
        if self.is_executable {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(memory_error("mprotect", self.capacity));
        }
        self.is_executable = true;
        Ok(())
    }

    fn check_writable(&self, offset: usize, count: usize) -> EngineResult<()> {
        if self.is_executable {
            return Err(EngineError::ExecutableMemory {
                reason: "buffer is already executable".to_string(),
            });
        }
        if offset + count > self.capacity {
            return Err(EngineError::ExecutableMemory {
                reason: format!(
                    "{count} bytes at {offset:#x} overflow a {} byte buffer",
                    self.capacity
                ),
            });
        }
        Ok(())
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

impl std::fmt::Debug for ExecutableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("is_executable", &self.is_executable)
            .finish()
    }
}

const fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn memory_error(call: &str, size: usize) -> EngineError {
    EngineError::ExecutableMemory {
        reason: format!("{call} of {size} bytes failed: {}", std::io::Error::last_os_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_page_aligned() {
        let buf = ExecutableBuffer::new(1).unwrap();
        assert_eq!(buf.capacity(), PAGE_SIZE);
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(align_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn patching_respects_bounds() {
        let mut buf = ExecutableBuffer::with_code(&[0xC3; 16]).unwrap();
        buf.patch_u64(8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(&buf.as_slice()[8..], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert!(buf.patch_u64(9, 0).is_err());
    }

    #[test]
    fn executable_buffers_reject_writes() {
        let mut buf = ExecutableBuffer::with_code(&[0xC3]).unwrap();
        buf.make_executable().unwrap();
        assert!(buf.is_executable());
        assert!(matches!(buf.emit_bytes(&[0x90]), Err(EngineError::ExecutableMemory { .. })));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn runs_copied_code() {
        // mov eax, 42; ret
        let mut buf = ExecutableBuffer::with_code(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
        buf.make_executable().unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(buf.as_ptr()) };
        assert_eq!(f(), 42);
    }
}
