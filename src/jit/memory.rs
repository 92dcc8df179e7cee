//! Executable memory arena using mmap.
//!
//! One contiguous region holds the prelude and every emitted block.
//! Protection is toggled for the whole region at once: emission and
//! patching are rare compared to execution, so per-page bookkeeping buys
//! nothing.

use std::ptr::NonNull;

use super::CodePtr;

/// Error type for arena operations.
#[derive(Debug)]
pub enum ArenaError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaError::AllocationFailed => write!(f, "memory allocation failed"),
            ArenaError::ProtectionFailed => write!(f, "memory protection change failed"),
            ArenaError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for ArenaError {}

/// A region of host memory that alternates between writable (during
/// emission and patching) and executable (during guest execution).
///
/// The region starts writable. Invariant: it is never writable and
/// executable at the same time.
pub struct ExecutableArena {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableArena {
    /// Reserve a region of `size` bytes, rounded up to the page size.
    /// The region is initially writable and not executable.
    pub fn new(size: usize) -> Result<Self, ArenaError> {
        if size == 0 {
            return Err(ArenaError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Get the page size for the current system.
    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, ArenaError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(ArenaError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, ArenaError> {
        // Fallback for non-Unix systems: use regular allocation.
        // Note: this won't actually be executable on most systems.
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| ArenaError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(ArenaError::AllocationFailed)
    }

    /// Base address of the region.
    pub fn ptr(&self) -> CodePtr {
        CodePtr::new(self.ptr.as_ptr() as usize)
    }

    /// Size of the region in bytes (after page rounding).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Make the whole region writable and non-executable.
    ///
    /// A failing `mprotect` on a mapping we own means the process is in an
    /// unknown state; that is treated as fatal rather than recoverable.
    pub fn unprotect(&mut self) {
        if !self.executable {
            return;
        }
        self.set_protection(false);
        self.executable = false;
    }

    /// Make the whole region executable and read-only.
    pub fn protect(&mut self) {
        if self.executable {
            return;
        }
        self.set_protection(true);
        self.executable = true;
    }

    #[cfg(unix)]
    fn set_protection(&self, executable: bool) {
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let result = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if result != 0 {
            panic!("mprotect failed on the code arena at {}", self.ptr());
        }
    }

    #[cfg(not(unix))]
    fn set_protection(&self, _executable: bool) {
        // No protection changes available; the memory stays as allocated.
    }

    /// Flush host instruction and data caches over `[ptr, ptr + len)`.
    ///
    /// Required after writing instructions that another (or the same) core
    /// will execute. On hosts with coherent instruction caches this is a
    /// no-op.
    pub fn invalidate(&self, ptr: CodePtr, len: usize) {
        debug_assert!(ptr >= self.ptr());
        debug_assert!(ptr.add(len) <= self.ptr().add(self.size));

        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        unsafe {
            __clear_cache(
                ptr.as_mut_ptr::<libc::c_char>(),
                ptr.add(len).as_mut_ptr::<libc::c_char>(),
            );
        }
        #[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
        {
            let _ = (ptr, len);
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

impl Drop for ExecutableArena {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.size, Self::page_size())
                .expect("invalid layout");
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

// The arena owns its mapping outright; sending it to another thread is fine.
unsafe impl Send for ExecutableArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_arena() {
        let arena = ExecutableArena::new(64 * 1024).unwrap();
        assert!(arena.size() >= 64 * 1024);
        assert!(!arena.is_executable());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableArena::new(0),
            Err(ArenaError::InvalidSize)
        ));
    }

    #[test]
    fn test_protection_round_trip() {
        let mut arena = ExecutableArena::new(4096).unwrap();
        arena.protect();
        assert!(arena.is_executable());
        arena.unprotect();
        assert!(!arena.is_executable());

        // Idempotent in both directions.
        arena.unprotect();
        assert!(!arena.is_executable());
    }

    #[test]
    fn test_write_while_unprotected() {
        let arena = ExecutableArena::new(4096).unwrap();
        unsafe {
            arena.ptr().as_mut_ptr::<u32>().write(0xD503201F);
        }
        arena.invalidate(arena.ptr(), 4);
        assert_eq!(unsafe { arena.ptr().as_ptr::<u32>().read() }, 0xD503201F);
    }
}
