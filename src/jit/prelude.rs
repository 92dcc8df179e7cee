//! Prelude generation.
//!
//! The prelude is the fixed trampoline code emitted once at the bottom of
//! the arena, before any guest block. It owns the host<->guest boundary:
//! `run_code` enters guest execution, `ReturnFromRunCode` leaves it, the
//! dispatcher performs dynamic block lookup, and every other helper is a
//! tail trampoline into a host callback supplied by the hosting runtime.
//!
//! Helper ABI: a block reaches a call-kind helper via `BL` with its
//! operands in x1/x2; the trampoline loads the callback's user argument
//! into x0 and tail-branches into the host function, which returns
//! straight to the block.

use super::aarch64::A64Assembler;
use super::codebuf::CodeWriter;
use super::link::{LinkKind, LinkTarget, PreludeInfo, LINK_TARGET_COUNT};
use super::state::JitState;
use super::{regs, CodePtr};
use crate::jit::aarch64::Reg;

/// A host function plus its baked-in first argument.
///
/// The hosting runtime guarantees that whatever `user_arg` points at
/// outlives the prelude.
#[derive(Debug, Clone, Copy)]
pub struct HostCallback {
    pub function: usize,
    pub user_arg: usize,
}

impl HostCallback {
    pub fn new(function: usize, user_arg: usize) -> Self {
        HostCallback { function, user_arg }
    }
}

/// Host entries for every prelude helper.
pub struct RuntimeCallbacks {
    /// Dynamic block lookup used by the dispatcher. Receives its
    /// `user_arg`, returns the host entry point for the current guest
    /// state.
    pub lookup_block: HostCallback,
    handlers: [HostCallback; LINK_TARGET_COUNT],
}

impl RuntimeCallbacks {
    /// All helpers initially route to `default_handler`; override the ones
    /// that matter with [`set`](Self::set).
    pub fn new(default_handler: HostCallback, lookup_block: HostCallback) -> Self {
        RuntimeCallbacks {
            lookup_block,
            handlers: [default_handler; LINK_TARGET_COUNT],
        }
    }

    pub fn set(&mut self, target: LinkTarget, callback: HostCallback) {
        self.handlers[target.index()] = callback;
    }

    fn handler(&self, target: LinkTarget) -> HostCallback {
        self.handlers[target.index()]
    }
}

/// Signature of the generated `run_code` entry.
pub type RunCodeFn = unsafe extern "C" fn(*mut JitState, *const u8) -> u64;

impl PreludeInfo {
    /// The generated guest-entry function.
    ///
    /// # Safety
    /// The arena must be protected (executable) and `JitState` must outlive
    /// the call.
    pub unsafe fn run_code_fn(&self) -> RunCodeFn {
        std::mem::transmute::<usize, RunCodeFn>(self.run_code.addr())
    }
}

/// Emit the prelude at the writer's cursor. The arena must be unprotected;
/// the caller flushes and protects afterwards.
pub(crate) fn build_prelude(code: &mut CodeWriter, callbacks: &RuntimeCallbacks) -> PreludeInfo {
    let mut helpers = [CodePtr::new(0); LINK_TARGET_COUNT];

    // run_code(state, entry): save callee-saved registers, install the
    // state register, jump into the block.
    let run_code = code.ptr();
    {
        let mut asm = A64Assembler::new(code);
        asm.stp_pre(Reg::Fp, Reg::Lr, -16);
        asm.stp_pre(Reg::X27, Reg::X28, -16);
        asm.stp_pre(Reg::X25, Reg::X26, -16);
        asm.stp_pre(Reg::X23, Reg::X24, -16);
        asm.stp_pre(Reg::X21, Reg::X22, -16);
        asm.stp_pre(Reg::X19, Reg::X20, -16);
        asm.add_imm(Reg::Fp, Reg::Sp, 0);
        asm.mov(regs::STATE, Reg::X0);
        asm.br(Reg::X1);
    }

    // ReturnFromRunCode: blocks arrive here via B with the status word in
    // x0; unwind the run_code frame and return to the host caller.
    helpers[LinkTarget::ReturnFromRunCode.index()] = code.ptr();
    {
        let mut asm = A64Assembler::new(code);
        asm.ldp_post(Reg::X19, Reg::X20, 16);
        asm.ldp_post(Reg::X21, Reg::X22, 16);
        asm.ldp_post(Reg::X23, Reg::X24, 16);
        asm.ldp_post(Reg::X25, Reg::X26, 16);
        asm.ldp_post(Reg::X27, Reg::X28, 16);
        asm.ldp_post(Reg::Fp, Reg::Lr, 16);
        asm.ret();
    }

    // ReturnToDispatcher: ask the host for the next entry point, then jump
    // to it. Volatile registers are dead here; blocks arrive via B.
    helpers[LinkTarget::ReturnToDispatcher.index()] = code.ptr();
    {
        let mut asm = A64Assembler::new(code);
        asm.mov_imm64(Reg::X0, callbacks.lookup_block.user_arg as u64);
        asm.mov_imm64(regs::SCRATCH0, callbacks.lookup_block.function as u64);
        asm.blr(regs::SCRATCH0);
        asm.br(Reg::X0);
    }

    // Every call-kind helper: tail trampoline into the host callback.
    for target in LinkTarget::ALL {
        if target.kind() != LinkKind::Call {
            continue;
        }
        let callback = callbacks.handler(target);
        helpers[target.index()] = code.ptr();
        let mut asm = A64Assembler::new(code);
        asm.mov_imm64(Reg::X0, callback.user_arg as u64);
        asm.mov_imm64(regs::SCRATCH0, callback.function as u64);
        asm.br(regs::SCRATCH0);
    }

    PreludeInfo::new(helpers, run_code, code.ptr())
}
