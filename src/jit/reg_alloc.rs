//! Baseline register allocation for backend-lowered instructions.
//!
//! Values are memory-homed: every IR value lives in the `JitState` value
//! bank between instructions, and scratch host registers (x9-x15) carry
//! them only inside a single lowering. Reads load from the bank, writes
//! are flushed back by `realize`. Host calls get their arguments placed in
//! x1/x2 directly (x0 is reserved for the callback user argument).

use crate::ir::{Inst, Value};

use super::aarch64::{A64Assembler, Reg};
use super::codebuf::CodeWriter;
use super::regs;
use super::state::JitState;

/// An instruction operand as seen by the allocator.
#[derive(Debug, Clone, Copy)]
pub enum Argument {
    Imm(u64),
    CoprocInfo([u8; 8]),
    Value(usize),
}

impl Argument {
    /// The immediate carried by this argument. Calling this on a
    /// non-immediate is a frontend contract violation.
    pub fn imm(&self) -> u64 {
        match self {
            Argument::Imm(value) => *value,
            _ => panic!("argument is not an immediate"),
        }
    }

    pub fn coproc_info(&self) -> [u8; 8] {
        match self {
            Argument::CoprocInfo(info) => *info,
            _ => panic!("argument is not a coprocessor descriptor"),
        }
    }
}

/// Argument registers used for host calls; x0 carries the user argument.
const CALL_ARG_REGS: [Reg; 2] = [Reg::X1, Reg::X2];

/// One pending definition: flushed to the bank by `realize`.
struct PendingDef {
    slot: usize,
    reg: Reg,
    is_64: bool,
}

pub struct RegAlloc {
    free: Vec<Reg>,
    pending: Vec<PendingDef>,
}

impl RegAlloc {
    pub fn new() -> Self {
        RegAlloc {
            // Popped back-to-front: x9 is handed out first.
            free: vec![
                Reg::X15,
                Reg::X14,
                Reg::X13,
                Reg::X12,
                Reg::X11,
                Reg::X10,
                Reg::X9,
            ],
            pending: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Reg {
        self.free.pop().expect("scratch register pool exhausted")
    }

    fn reset_pool(&mut self) {
        *self = RegAlloc::new();
    }

    /// Operand view of an instruction.
    pub fn get_argument_info(&self, inst: &Inst) -> Vec<Argument> {
        inst.args
            .iter()
            .map(|value| match value {
                Value::Imm(imm) => Argument::Imm(*imm),
                Value::CoprocInfo(info) => Argument::CoprocInfo(*info),
                Value::Inst(id) => Argument::Value(*id),
            })
            .collect()
    }

    /// Load an argument into a scratch register as a 32-bit value.
    pub fn read_w(&mut self, code: &mut CodeWriter, arg: &Argument) -> Reg {
        let reg = self.alloc();
        let mut asm = A64Assembler::new(code);
        match arg {
            Argument::Imm(imm) => asm.mov_imm32(reg, *imm as u32),
            Argument::Value(id) => {
                asm.ldr_w(reg, regs::STATE, JitState::value_offset(*id) as u32)
            }
            Argument::CoprocInfo(_) => panic!("coprocessor descriptor is not a runtime value"),
        }
        reg
    }

    /// Load an argument into a scratch register as a 64-bit value.
    pub fn read_x(&mut self, code: &mut CodeWriter, arg: &Argument) -> Reg {
        let reg = self.alloc();
        let mut asm = A64Assembler::new(code);
        match arg {
            Argument::Imm(imm) => asm.mov_imm64(reg, *imm),
            Argument::Value(id) => {
                asm.ldr_x(reg, regs::STATE, JitState::value_offset(*id) as u32)
            }
            Argument::CoprocInfo(_) => panic!("coprocessor descriptor is not a runtime value"),
        }
        reg
    }

    /// Allocate the 32-bit result register of `inst`; the definition is
    /// written back to the bank by `realize`.
    pub fn write_w(&mut self, inst: &Inst) -> Reg {
        let reg = self.alloc();
        self.pending.push(PendingDef {
            slot: inst.id,
            reg,
            is_64: false,
        });
        reg
    }

    /// Allocate the 64-bit result register of `inst`.
    pub fn write_x(&mut self, inst: &Inst) -> Reg {
        let reg = self.alloc();
        self.pending.push(PendingDef {
            slot: inst.id,
            reg,
            is_64: true,
        });
        reg
    }

    /// Store an already-live register as the result of `inst`.
    pub fn define_as_register(&mut self, code: &mut CodeWriter, inst: &Inst, reg: Reg) {
        let mut asm = A64Assembler::new(code);
        asm.str_x(reg, regs::STATE, JitState::value_offset(inst.id) as u32);
    }

    /// Place up to two optional arguments into the call argument registers.
    ///
    /// Values are memory-homed, so there is nothing to spill; the scratch
    /// pool is simply considered clobbered by the call.
    pub fn prepare_for_call(
        &mut self,
        code: &mut CodeWriter,
        args: [Option<&Argument>; 2],
    ) {
        assert!(
            self.pending.is_empty(),
            "call emitted while definitions are pending"
        );
        self.reset_pool();

        let mut asm = A64Assembler::new(code);
        for (i, arg) in args.iter().enumerate() {
            let Some(arg) = arg else { continue };
            let target = CALL_ARG_REGS[i];
            match arg {
                Argument::Imm(imm) => asm.mov_imm64(target, *imm),
                Argument::Value(id) => {
                    asm.ldr_w(target, regs::STATE, JitState::value_offset(*id) as u32)
                }
                Argument::CoprocInfo(_) => {
                    panic!("coprocessor descriptor is not a runtime value")
                }
            }
        }
    }

    /// Flush pending definitions to the bank and release every scratch
    /// register.
    pub fn realize(&mut self, code: &mut CodeWriter) {
        let pending = std::mem::take(&mut self.pending);
        let mut asm = A64Assembler::new(code);
        for def in pending {
            let offset = JitState::value_offset(def.slot) as u32;
            if def.is_64 {
                asm.str_x(def.reg, regs::STATE, offset);
            } else {
                asm.str_w(def.reg, regs::STATE, offset);
            }
        }
        self.reset_pool();
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Opcode;
    use crate::jit::aarch64::encode;
    use crate::jit::memory::ExecutableArena;

    fn words(arena: &ExecutableArena, n: usize) -> Vec<u32> {
        unsafe { std::slice::from_raw_parts(arena.ptr().as_ptr::<u32>(), n) }.to_vec()
    }

    #[test]
    fn test_read_value_loads_from_bank() {
        let arena = ExecutableArena::new(4096).unwrap();
        let mut code = CodeWriter::new(&arena);
        let mut ra = RegAlloc::new();

        let reg = ra.read_w(&mut code, &Argument::Value(3));
        assert_eq!(reg, Reg::X9);
        assert_eq!(
            words(&arena, 1)[0],
            encode::ldr_w(Reg::X9, regs::STATE, JitState::value_offset(3) as u32)
        );
    }

    #[test]
    fn test_write_then_realize_stores() {
        let arena = ExecutableArena::new(4096).unwrap();
        let mut code = CodeWriter::new(&arena);
        let mut ra = RegAlloc::new();
        let inst = Inst {
            opcode: Opcode::CoprocGetTwoWords,
            id: 5,
            args: vec![],
        };

        let reg = ra.write_x(&inst);
        ra.realize(&mut code);
        assert_eq!(
            words(&arena, 1)[0],
            encode::str_x(reg, regs::STATE, JitState::value_offset(5) as u32)
        );
    }

    #[test]
    fn test_prepare_for_call_fills_arg_regs() {
        let arena = ExecutableArena::new(4096).unwrap();
        let mut code = CodeWriter::new(&arena);
        let mut ra = RegAlloc::new();

        ra.prepare_for_call(&mut code, [Some(&Argument::Value(0)), Some(&Argument::Value(1))]);
        let emitted = words(&arena, 2);
        assert_eq!(
            emitted[0],
            encode::ldr_w(Reg::X1, regs::STATE, JitState::value_offset(0) as u32)
        );
        assert_eq!(
            emitted[1],
            encode::ldr_w(Reg::X2, regs::STATE, JitState::value_offset(1) as u32)
        );
    }

    #[test]
    fn test_scratch_regs_are_deterministic() {
        let arena = ExecutableArena::new(4096).unwrap();
        let mut code = CodeWriter::new(&arena);
        let mut ra = RegAlloc::new();
        let a = ra.read_w(&mut code, &Argument::Value(0));
        let b = ra.read_w(&mut code, &Argument::Value(1));
        assert_eq!((a, b), (Reg::X9, Reg::X10));
        ra.realize(&mut code);
        assert_eq!(ra.read_w(&mut code, &Argument::Value(2)), Reg::X9);
    }
}
