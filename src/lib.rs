//! tarmac - a dynamic recompiler core for ARM guests on AArch64 hosts.
//!
//! The crate owns the hard middle of a dynamic binary translator: the
//! executable code arena, the block cache keyed by guest location, the
//! link engine that patches branches between blocks and into the prelude,
//! fault-driven fastmem recovery, and the coprocessor dispatch lowering.
//! Instruction decoding, the IR producer and the block emitter are
//! collaborators injected by the hosting runtime.
//!
//! Threading contract: one emitter thread per [`AddressSpace`]. The arena
//! is writable only during emission and patching; a host that executes
//! guest code on another thread must stop that thread around those
//! windows (stop-the-world around emission).

pub mod config;
pub mod ir;
pub mod jit;

// Re-export commonly used types
pub use config::EmitConfig;
pub use jit::address_space::{AddressSpace, BlockEmitter, IrProducer, NewBlockHook};
pub use jit::coprocessor::{Coprocessor, CoprocessorAction, CoprocessorCallback};
pub use jit::exception::FakeCall;
pub use jit::fastmem::{DoNotFastmemMarker, FastmemManager};
pub use jit::link::{
    BlockRelocation, BlockRelocationKind, EmittedBlockInfo, FastmemPatchInfo, LinkTarget,
    PreludeInfo, Relocation,
};
pub use jit::prelude::{HostCallback, RuntimeCallbacks};
pub use jit::state::JitState;
pub use jit::CodePtr;
