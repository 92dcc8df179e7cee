//! Coprocessor dispatch lowering.
//!
//! Guest coprocessor instructions are compiled against a user-supplied
//! `Coprocessor` object. The object decides per-operation whether the
//! access is a host callback or a direct load/store against a 32-bit cell;
//! anything it declines (and any access to an unconfigured coprocessor)
//! raises an undefined-instruction exception through the prelude.

use crate::config::EmitConfig;
use crate::ir::{CoprocReg, GuestException, Inst, LocationDescriptor, Type};

use super::aarch64::{A64Assembler, Reg};
use super::codebuf::CodeWriter;
use super::link::{LinkTarget, Relocation};
use super::reg_alloc::{Argument, RegAlloc};
use super::{regs, CodePtr};

/// Host function invoked for callback-style coprocessor operations.
///
/// `user_arg` is the callback's baked-in first argument; `arg0`/`arg1`
/// carry the guest values (or the transfer address for load/store words).
/// Get-style operations return their result.
pub type CoprocessorCallbackFn = unsafe extern "C" fn(user_arg: u64, arg0: u32, arg1: u32) -> u64;

#[derive(Clone, Copy)]
pub struct CoprocessorCallback {
    pub function: CoprocessorCallbackFn,
    pub user_arg: Option<u64>,
}

/// How a coprocessor operation is carried out. `Option::None` from a
/// compile method means the operation is undefined and takes the
/// exception path.
#[derive(Clone, Copy)]
pub enum CoprocessorAction {
    Callback(CoprocessorCallback),
    /// Direct access to one 32-bit cell.
    WordCell(*mut u32),
    /// Direct access to two 32-bit cells.
    WordPair(*mut u32, *mut u32),
}

/// A guest coprocessor. The pointers inside returned actions must stay
/// valid for the lifetime of the configuration.
pub trait Coprocessor {
    fn compile_internal_operation(
        &self,
        two: bool,
        opc1: u32,
        crd: CoprocReg,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocessorCallback>;

    fn compile_send_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocessorAction>;

    fn compile_send_two_words(&self, two: bool, opc: u32, crm: CoprocReg)
        -> Option<CoprocessorAction>;

    fn compile_get_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocessorAction>;

    fn compile_get_two_words(&self, two: bool, opc: u32, crm: CoprocReg)
        -> Option<CoprocessorAction>;

    fn compile_load_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocessorCallback>;

    fn compile_store_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocessorCallback>;
}

/// Per-block emission context shared by the lowering functions.
pub struct EmitContext<'a> {
    pub reg_alloc: &'a mut RegAlloc,
    pub config: &'a EmitConfig,
    /// Entry point of the block being emitted; relocation offsets are
    /// relative to it.
    pub block_entry: CodePtr,
    pub relocations: &'a mut Vec<Relocation>,
}

impl EmitContext<'_> {
    /// Record a relocation at the cursor and emit its placeholder word.
    pub fn emit_relocation(&mut self, code: &mut CodeWriter, target: LinkTarget) {
        let offset = code.ptr().offset_from(self.block_entry);
        self.relocations.push(Relocation { offset, target });
        code.emit_u32(super::aarch64::encode::nop());
    }
}

fn emit_coprocessor_exception(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    ctx.reg_alloc.prepare_for_call(code, [None, None]);

    let current_location = LocationDescriptor::new(args[0].imm());
    {
        let mut asm = A64Assembler::new(code);
        asm.mov_imm32(Reg::X1, current_location.pc());
        asm.mov_imm32(Reg::X2, GuestException::InvalidCoprocessorInstruction as u32);
    }
    ctx.emit_relocation(code, LinkTarget::ExceptionRaised);

    if inst.opcode.result_type() != Type::Void {
        // Fake value.
        ctx.reg_alloc.define_as_register(code, inst, Reg::X0);
    }
}

fn call_coproc_callback(
    code: &mut CodeWriter,
    ctx: &mut EmitContext<'_>,
    callback: CoprocessorCallback,
    inst: Option<&Inst>,
    arg0: Option<&Argument>,
    arg1: Option<&Argument>,
) {
    ctx.reg_alloc.prepare_for_call(code, [arg0, arg1]);

    {
        let mut asm = A64Assembler::new(code);
        if let Some(user_arg) = callback.user_arg {
            asm.mov_imm64(Reg::X0, user_arg);
        }
        asm.mov_imm64(regs::SCRATCH0, callback.function as usize as u64);
        asm.blr(regs::SCRATCH0);
    }

    if let Some(inst) = inst {
        ctx.reg_alloc.define_as_register(code, inst, Reg::X0);
    }
}

pub fn emit_coproc_internal_operation(
    code: &mut CodeWriter,
    ctx: &mut EmitContext<'_>,
    inst: &Inst,
) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let opc1 = coproc_info[2] as u32;
    let crd = CoprocReg::from_u8(coproc_info[3]);
    let crn = CoprocReg::from_u8(coproc_info[4]);
    let crm = CoprocReg::from_u8(coproc_info[5]);
    let opc2 = coproc_info[6] as u32;

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    let Some(action) = coproc.compile_internal_operation(two, opc1, crd, crn, crm, opc2) else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    call_coproc_callback(code, ctx, action, None, None, None);
}

pub fn emit_coproc_send_one_word(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let opc1 = coproc_info[2] as u32;
    let crn = CoprocReg::from_u8(coproc_info[3]);
    let crm = CoprocReg::from_u8(coproc_info[4]);
    let opc2 = coproc_info[5] as u32;

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    match coproc.compile_send_one_word(two, opc1, crn, crm, opc2) {
        None => emit_coprocessor_exception(code, ctx, inst),
        Some(CoprocessorAction::Callback(callback)) => {
            call_coproc_callback(code, ctx, callback, None, Some(&args[2]), None);
        }
        Some(CoprocessorAction::WordCell(destination)) => {
            let value = ctx.reg_alloc.read_w(code, &args[2]);
            let mut asm = A64Assembler::new(code);
            asm.mov_imm64(regs::SCRATCH0, destination as usize as u64);
            asm.str_w(value, regs::SCRATCH0, 0);
            drop(asm);
            ctx.reg_alloc.realize(code);
        }
        Some(CoprocessorAction::WordPair(..)) => {
            unreachable!("one-word send compiled to a word pair")
        }
    }
}

pub fn emit_coproc_send_two_words(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let opc = coproc_info[2] as u32;
    let crm = CoprocReg::from_u8(coproc_info[3]);

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    match coproc.compile_send_two_words(two, opc, crm) {
        None => emit_coprocessor_exception(code, ctx, inst),
        Some(CoprocessorAction::Callback(callback)) => {
            call_coproc_callback(code, ctx, callback, None, Some(&args[2]), Some(&args[3]));
        }
        Some(CoprocessorAction::WordPair(first, second)) => {
            let value1 = ctx.reg_alloc.read_w(code, &args[2]);
            let value2 = ctx.reg_alloc.read_w(code, &args[3]);
            let mut asm = A64Assembler::new(code);
            asm.mov_imm64(regs::SCRATCH0, first as usize as u64);
            asm.mov_imm64(regs::SCRATCH1, second as usize as u64);
            asm.str_w(value1, regs::SCRATCH0, 0);
            asm.str_w(value2, regs::SCRATCH1, 0);
            drop(asm);
            ctx.reg_alloc.realize(code);
        }
        Some(CoprocessorAction::WordCell(..)) => {
            unreachable!("two-word send compiled to a single cell")
        }
    }
}

pub fn emit_coproc_get_one_word(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let opc1 = coproc_info[2] as u32;
    let crn = CoprocReg::from_u8(coproc_info[3]);
    let crm = CoprocReg::from_u8(coproc_info[4]);
    let opc2 = coproc_info[5] as u32;

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    match coproc.compile_get_one_word(two, opc1, crn, crm, opc2) {
        None => emit_coprocessor_exception(code, ctx, inst),
        Some(CoprocessorAction::Callback(callback)) => {
            call_coproc_callback(code, ctx, callback, Some(inst), None, None);
        }
        Some(CoprocessorAction::WordCell(source)) => {
            let value = ctx.reg_alloc.write_w(inst);
            let mut asm = A64Assembler::new(code);
            asm.mov_imm64(regs::SCRATCH0, source as usize as u64);
            asm.ldr_w(value, regs::SCRATCH0, 0);
            drop(asm);
            ctx.reg_alloc.realize(code);
        }
        Some(CoprocessorAction::WordPair(..)) => {
            unreachable!("one-word get compiled to a word pair")
        }
    }
}

pub fn emit_coproc_get_two_words(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let opc = coproc_info[2] as u32;
    let crm = CoprocReg::from_u8(coproc_info[3]);

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    match coproc.compile_get_two_words(two, opc, crm) {
        None => emit_coprocessor_exception(code, ctx, inst),
        Some(CoprocessorAction::Callback(callback)) => {
            call_coproc_callback(code, ctx, callback, Some(inst), None, None);
        }
        Some(CoprocessorAction::WordPair(first, second)) => {
            // Low half from the first cell, high half from the second.
            let value = ctx.reg_alloc.write_x(inst);
            let mut asm = A64Assembler::new(code);
            asm.mov_imm64(regs::SCRATCH0, first as usize as u64);
            asm.mov_imm64(regs::SCRATCH1, second as usize as u64);
            asm.ldr_w(value, regs::SCRATCH0, 0);
            asm.ldr_w(regs::SCRATCH1, regs::SCRATCH1, 0);
            asm.bfi(value, regs::SCRATCH1, 32, 32);
            drop(asm);
            ctx.reg_alloc.realize(code);
        }
        Some(CoprocessorAction::WordCell(..)) => {
            unreachable!("two-word get compiled to a single cell")
        }
    }
}

pub fn emit_coproc_load_words(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let long_transfer = coproc_info[2] != 0;
    let crd = CoprocReg::from_u8(coproc_info[3]);
    let has_option = coproc_info[4] != 0;
    let option = has_option.then_some(coproc_info[5]);

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    let Some(callback) = coproc.compile_load_words(two, long_transfer, crd, option) else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    call_coproc_callback(code, ctx, callback, None, Some(&args[2]), None);
}

pub fn emit_coproc_store_words(code: &mut CodeWriter, ctx: &mut EmitContext<'_>, inst: &Inst) {
    let args = ctx.reg_alloc.get_argument_info(inst);
    let coproc_info = args[1].coproc_info();
    let coproc_num = coproc_info[0] as usize;
    let two = coproc_info[1] != 0;
    let long_transfer = coproc_info[2] != 0;
    let crd = CoprocReg::from_u8(coproc_info[3]);
    let has_option = coproc_info[4] != 0;
    let option = has_option.then_some(coproc_info[5]);

    let Some(coproc) = ctx.config.coprocessors[coproc_num].clone() else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    let Some(callback) = coproc.compile_store_words(two, long_transfer, crd, option) else {
        emit_coprocessor_exception(code, ctx, inst);
        return;
    };

    call_coproc_callback(code, ctx, callback, None, Some(&args[2]), None);
}
