//! Relocation records and the block-link engine.
//!
//! Emitted blocks leave fixed-width instruction slots behind: slots that
//! must branch or call into prelude helpers, and slots that must branch to
//! other guest blocks. The linker overwrites those slots in place once the
//! targets are known, and re-overwrites them whenever a target block is
//! created or invalidated. No instruction-cache maintenance happens here;
//! the cache batches flushes per compilation or relink round.

use std::collections::HashMap;

use crate::ir::LocationDescriptor;

use super::aarch64::A64Assembler;
use super::codebuf::CodeWriter;
use super::exception::FakeCall;
use super::fastmem::DoNotFastmemMarker;
use super::{regs, CodePtr};

/// Prelude helpers a block may branch or call into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LinkTarget {
    ReturnToDispatcher,
    ReturnFromRunCode,
    ReadMemory8,
    ReadMemory16,
    ReadMemory32,
    ReadMemory64,
    ReadMemory128,
    WrappedReadMemory8,
    WrappedReadMemory16,
    WrappedReadMemory32,
    WrappedReadMemory64,
    WrappedReadMemory128,
    ExclusiveReadMemory8,
    ExclusiveReadMemory16,
    ExclusiveReadMemory32,
    ExclusiveReadMemory64,
    ExclusiveReadMemory128,
    WriteMemory8,
    WriteMemory16,
    WriteMemory32,
    WriteMemory64,
    WriteMemory128,
    WrappedWriteMemory8,
    WrappedWriteMemory16,
    WrappedWriteMemory32,
    WrappedWriteMemory64,
    WrappedWriteMemory128,
    ExclusiveWriteMemory8,
    ExclusiveWriteMemory16,
    ExclusiveWriteMemory32,
    ExclusiveWriteMemory64,
    ExclusiveWriteMemory128,
    CallSvc,
    ExceptionRaised,
    InstructionSynchronizationBarrierRaised,
    InstructionCacheOperationRaised,
    DataCacheOperationRaised,
    GetCntpct,
    AddTicks,
    GetTicksRemaining,
}

/// How a relocation slot reaches its helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Unconditional branch; control does not come back.
    Branch,
    /// Call; the helper returns to the block.
    Call,
}

pub const LINK_TARGET_COUNT: usize = 40;

impl LinkTarget {
    pub const ALL: [LinkTarget; LINK_TARGET_COUNT] = [
        LinkTarget::ReturnToDispatcher,
        LinkTarget::ReturnFromRunCode,
        LinkTarget::ReadMemory8,
        LinkTarget::ReadMemory16,
        LinkTarget::ReadMemory32,
        LinkTarget::ReadMemory64,
        LinkTarget::ReadMemory128,
        LinkTarget::WrappedReadMemory8,
        LinkTarget::WrappedReadMemory16,
        LinkTarget::WrappedReadMemory32,
        LinkTarget::WrappedReadMemory64,
        LinkTarget::WrappedReadMemory128,
        LinkTarget::ExclusiveReadMemory8,
        LinkTarget::ExclusiveReadMemory16,
        LinkTarget::ExclusiveReadMemory32,
        LinkTarget::ExclusiveReadMemory64,
        LinkTarget::ExclusiveReadMemory128,
        LinkTarget::WriteMemory8,
        LinkTarget::WriteMemory16,
        LinkTarget::WriteMemory32,
        LinkTarget::WriteMemory64,
        LinkTarget::WriteMemory128,
        LinkTarget::WrappedWriteMemory8,
        LinkTarget::WrappedWriteMemory16,
        LinkTarget::WrappedWriteMemory32,
        LinkTarget::WrappedWriteMemory64,
        LinkTarget::WrappedWriteMemory128,
        LinkTarget::ExclusiveWriteMemory8,
        LinkTarget::ExclusiveWriteMemory16,
        LinkTarget::ExclusiveWriteMemory32,
        LinkTarget::ExclusiveWriteMemory64,
        LinkTarget::ExclusiveWriteMemory128,
        LinkTarget::CallSvc,
        LinkTarget::ExceptionRaised,
        LinkTarget::InstructionSynchronizationBarrierRaised,
        LinkTarget::InstructionCacheOperationRaised,
        LinkTarget::DataCacheOperationRaised,
        LinkTarget::GetCntpct,
        LinkTarget::AddTicks,
        LinkTarget::GetTicksRemaining,
    ];

    /// Dispatcher returns never come back to the block; everything else is
    /// a call that does.
    pub fn kind(self) -> LinkKind {
        match self {
            LinkTarget::ReturnToDispatcher | LinkTarget::ReturnFromRunCode => LinkKind::Branch,
            _ => LinkKind::Call,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A slot that must be patched to reach a prelude helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the slot from the block's entry point.
    pub offset: usize,
    pub target: LinkTarget,
}

/// How an inter-block slot is patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRelocationKind {
    /// Direct branch to the target block; NOP while the target is absent
    /// (control falls through to a slot that returns to the dispatcher).
    Branch,
    /// Materialise the target's entry point into scratch1; materialises the
    /// dispatcher entry while the target is absent.
    MoveToScratch1,
}

/// A slot that must be patched to reach another guest block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRelocation {
    /// Byte offset of the slot from the block's entry point.
    pub offset: usize,
    pub kind: BlockRelocationKind,
}

/// Slot widths guaranteed by the emitter.
pub const BRANCH_RELOCATION_SIZE: usize = 4;
pub const MOVE_TO_SCRATCH1_RELOCATION_SIZE: usize = 8;

/// A fault-recovery site inside a block.
#[derive(Debug, Clone, Copy)]
pub struct FastmemPatchInfo {
    pub fake_call: FakeCall,
    /// Recompile the block with this site on the slow path after a fault.
    pub recompile: bool,
    pub marker: DoNotFastmemMarker,
}

/// Everything the cache needs to know about an emitted block.
#[derive(Debug, Clone)]
pub struct EmittedBlockInfo {
    pub entry_point: CodePtr,
    /// Bytes occupied by the block.
    pub size: usize,
    /// Slots that reach prelude helpers.
    pub relocations: Vec<Relocation>,
    /// Slots that reach other guest blocks, grouped by target.
    pub block_relocations: HashMap<LocationDescriptor, Vec<BlockRelocation>>,
    /// Fault-recovery sites, keyed by offset from the entry point.
    pub fastmem_patch_info: HashMap<usize, FastmemPatchInfo>,
}

impl EmittedBlockInfo {
    pub fn new(entry_point: CodePtr) -> Self {
        EmittedBlockInfo {
            entry_point,
            size: 0,
            relocations: Vec::new(),
            block_relocations: HashMap::new(),
            fastmem_patch_info: HashMap::new(),
        }
    }
}

/// Addresses of the prelude helpers, fixed at startup.
pub struct PreludeInfo {
    helpers: [CodePtr; LINK_TARGET_COUNT],
    /// Host-callable entry that transfers control into a block.
    pub run_code: CodePtr,
    /// First byte available for block emission.
    pub end_of_prelude: CodePtr,
}

impl PreludeInfo {
    pub(crate) fn new(
        helpers: [CodePtr; LINK_TARGET_COUNT],
        run_code: CodePtr,
        end_of_prelude: CodePtr,
    ) -> Self {
        PreludeInfo {
            helpers,
            run_code,
            end_of_prelude,
        }
    }

    pub fn helper(&self, target: LinkTarget) -> CodePtr {
        self.helpers[target.index()]
    }
}

/// Patch one prelude relocation slot in place. The arena must be
/// unprotected.
pub(crate) fn patch_relocation(entry_point: CodePtr, reloc: &Relocation, prelude: &PreludeInfo) {
    let slot = entry_point.add(reloc.offset);
    let helper = prelude.helper(reloc.target);
    let mut w = unsafe { CodeWriter::at(slot, BRANCH_RELOCATION_SIZE) };
    let mut asm = A64Assembler::new(&mut w);
    match reloc.target.kind() {
        LinkKind::Branch => asm.b_to(helper),
        LinkKind::Call => asm.bl_to(helper),
    }
}

/// Patch every inter-block slot in `list` to reach `target`, or to route
/// through the dispatcher when the target is not resident. The arena must
/// be unprotected.
pub(crate) fn link_block_links(
    entry_point: CodePtr,
    target: Option<CodePtr>,
    list: &[BlockRelocation],
    dispatcher: CodePtr,
) {
    for relocation in list {
        let slot = entry_point.add(relocation.offset);
        match relocation.kind {
            BlockRelocationKind::Branch => {
                let mut w = unsafe { CodeWriter::at(slot, BRANCH_RELOCATION_SIZE) };
                let mut asm = A64Assembler::new(&mut w);
                match target {
                    Some(target) => asm.b_to(target),
                    None => asm.nop(),
                }
            }
            BlockRelocationKind::MoveToScratch1 => {
                let mut w = unsafe { CodeWriter::at(slot, MOVE_TO_SCRATCH1_RELOCATION_SIZE) };
                let mut asm = A64Assembler::new(&mut w);
                asm.adrl(regs::SCRATCH1, target.unwrap_or(dispatcher));
            }
        }
    }
}
