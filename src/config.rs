//! Runtime configuration types.

use std::sync::Arc;

use crate::jit::coprocessor::Coprocessor;

/// Configuration handed to the emitter and the code cache.
#[derive(Clone)]
pub struct EmitConfig {
    /// Greedily compile a block's direct successors in the same round
    /// instead of waiting for the dispatcher to miss on them.
    pub multi_block_compilation: bool,
    /// Allow inline guest memory accesses backed by fault recovery.
    pub enable_fastmem: bool,
    /// Guest coprocessors by index; an absent entry makes every access to
    /// that coprocessor raise an undefined-instruction exception.
    pub coprocessors: [Option<Arc<dyn Coprocessor>>; 16],
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            multi_block_compilation: false,
            enable_fastmem: true,
            coprocessors: std::array::from_fn(|_| None),
        }
    }
}
