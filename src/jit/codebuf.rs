//! Write cursor over the executable arena.
//!
//! Emission writes instructions straight into the arena while it is
//! unprotected; there is no intermediate buffer to copy out of. The writer
//! is the single monotonic cursor of a cache generation: `ClearCache`
//! rewinds it to the end of the prelude, nothing else ever moves it
//! backwards.

use std::ptr::NonNull;

use super::memory::ExecutableArena;
use super::CodePtr;

/// A bump cursor over a fixed-capacity region of code memory.
pub struct CodeWriter {
    base: NonNull<u8>,
    capacity: usize,
    offset: usize,
}

impl CodeWriter {
    /// A writer covering the whole arena.
    ///
    /// The writer copies the base address; it does not borrow the arena.
    /// All writes require the arena to be unprotected.
    pub fn new(arena: &ExecutableArena) -> Self {
        // ptr() of a live arena is never null.
        let base = NonNull::new(arena.ptr().as_mut_ptr()).expect("arena base is non-null");
        Self {
            base,
            capacity: arena.size(),
            offset: 0,
        }
    }

    /// A writer over an arbitrary code range, used for patching slots in
    /// already-emitted blocks.
    ///
    /// # Safety
    /// `ptr` must point at `capacity` bytes of writable code memory.
    pub(crate) unsafe fn at(ptr: CodePtr, capacity: usize) -> Self {
        let base = NonNull::new(ptr.as_mut_ptr()).expect("patch target is non-null");
        Self {
            base,
            capacity,
            offset: 0,
        }
    }

    /// Address of the first byte covered by this writer.
    pub fn base(&self) -> CodePtr {
        CodePtr::new(self.base.as_ptr() as usize)
    }

    /// Current write position.
    pub fn ptr(&self) -> CodePtr {
        self.base().add(self.offset)
    }

    /// Current offset from the base.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left before the capacity is exhausted.
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    /// Move the cursor to an absolute position inside the covered range.
    pub fn set_ptr(&mut self, ptr: CodePtr) {
        let offset = ptr.offset_from(self.base());
        assert!(offset <= self.capacity, "cursor moved past the arena end");
        self.offset = offset;
    }

    /// Emit one 32-bit instruction word at the cursor.
    ///
    /// Exceeding capacity is a bug in the caller: the cache guarantees
    /// headroom before compiling.
    pub fn emit_u32(&mut self, word: u32) {
        assert!(self.remaining() >= 4, "code arena exhausted mid-emission");
        debug_assert!(self.offset % 4 == 0);
        unsafe {
            self.base
                .as_ptr()
                .add(self.offset)
                .cast::<u32>()
                .write(word);
        }
        self.offset += 4;
    }

    /// Emit a 64-bit literal (two instruction words wide).
    pub fn emit_u64(&mut self, value: u64) {
        self.emit_u32(value as u32);
        self.emit_u32((value >> 32) as u32);
    }
}
