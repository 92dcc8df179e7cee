//! Guest execution state handed to emitted code.
//!
//! x28 points at a `JitState` while guest code runs. The baseline register
//! allocator homes every IR value in the `values` bank, so its offsets are
//! part of the emitted-code ABI.

/// Number of value slots available to a single block.
pub const VALUE_BANK_SLOTS: usize = 64;

/// Per-run guest context.
#[repr(C)]
pub struct JitState {
    /// Guest general-purpose registers (A32 view).
    pub regs: [u64; 16],
    /// Sticky halt request bits, checked by the tick helpers.
    pub halt_reason: u32,
    _pad: u32,
    /// Spill bank for IR values; slot index = `Inst::id`.
    pub values: [u64; VALUE_BANK_SLOTS],
}

impl JitState {
    pub fn new() -> Self {
        JitState {
            regs: [0; 16],
            halt_reason: 0,
            _pad: 0,
            values: [0; VALUE_BANK_SLOTS],
        }
    }

    /// Byte offset of a value slot from the state base.
    pub fn value_offset(id: usize) -> usize {
        assert!(id < VALUE_BANK_SLOTS, "value slot out of range: {id}");
        std::mem::offset_of!(JitState, values) + id * 8
    }
}

impl Default for JitState {
    fn default() -> Self {
        Self::new()
    }
}
