//! The slice of the IR that the backend consumes.
//!
//! The frontends (decoders and optimisation passes) live elsewhere; the
//! backend only needs block identity, the control-flow terminal, and the
//! handful of instruction shapes it lowers itself.

use std::fmt;

/// Identifies a guest execution state: the guest PC plus mode bits, packed
/// into 64 bits. Equality is bitwise; this is the key of the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocationDescriptor(u64);

impl LocationDescriptor {
    pub const fn new(value: u64) -> Self {
        LocationDescriptor(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The guest program counter. For A32 guests the PC occupies the low
    /// 32 bits of the descriptor; the upper half carries mode/flag state.
    pub const fn pc(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Guest condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
    Al = 0b1110,
}

/// How a block hands control back: the recursive control-flow terminal.
///
/// Every variant must be handled by the successor enumeration in the code
/// cache; this is a closed set, extended only together with that match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Produced only by broken frontends; the backend aborts on it.
    Invalid,
    /// Return to the dispatcher for a dynamic lookup.
    ReturnToDispatch,
    /// Direct branch to a known successor, with tick accounting.
    LinkBlock(LocationDescriptor),
    /// Direct branch to a known successor, skipping tick checks.
    LinkBlockFast(LocationDescriptor),
    /// Return-stack-buffer assisted return.
    PopRsbHint,
    /// Hash-table assisted dispatch.
    FastDispatchHint,
    /// Conditional split on a guest condition code.
    If {
        cond: Cond,
        then_: Box<Terminal>,
        else_: Box<Terminal>,
    },
    /// Conditional split on a stored check bit.
    CheckBit {
        then_: Box<Terminal>,
        else_: Box<Terminal>,
    },
    /// Exit if the guest has been halted, otherwise continue with `else_`.
    CheckHalt(Box<Terminal>),
}

/// Guest-observable exceptions raised through the `ExceptionRaised` helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GuestException {
    UnpredictableInstruction = 0,
    InvalidCoprocessorInstruction = 1,
}

/// Coprocessor register names CRd/CRn/CRm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoprocReg {
    C0 = 0,
    C1 = 1,
    C2 = 2,
    C3 = 3,
    C4 = 4,
    C5 = 5,
    C6 = 6,
    C7 = 7,
    C8 = 8,
    C9 = 9,
    C10 = 10,
    C11 = 11,
    C12 = 12,
    C13 = 13,
    C14 = 14,
    C15 = 15,
}

impl CoprocReg {
    pub fn from_u8(value: u8) -> Self {
        match value & 0xF {
            0 => CoprocReg::C0,
            1 => CoprocReg::C1,
            2 => CoprocReg::C2,
            3 => CoprocReg::C3,
            4 => CoprocReg::C4,
            5 => CoprocReg::C5,
            6 => CoprocReg::C6,
            7 => CoprocReg::C7,
            8 => CoprocReg::C8,
            9 => CoprocReg::C9,
            10 => CoprocReg::C10,
            11 => CoprocReg::C11,
            12 => CoprocReg::C12,
            13 => CoprocReg::C13,
            14 => CoprocReg::C14,
            _ => CoprocReg::C15,
        }
    }
}

/// The result type of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Void,
    U32,
    U64,
}

/// Opcodes the backend lowers itself (coprocessor dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    CoprocInternalOperation,
    CoprocSendOneWord,
    CoprocSendTwoWords,
    CoprocGetOneWord,
    CoprocGetTwoWords,
    CoprocLoadWords,
    CoprocStoreWords,
}

impl Opcode {
    pub fn result_type(self) -> Type {
        match self {
            Opcode::CoprocGetOneWord => Type::U32,
            Opcode::CoprocGetTwoWords => Type::U64,
            Opcode::CoprocInternalOperation
            | Opcode::CoprocSendOneWord
            | Opcode::CoprocSendTwoWords
            | Opcode::CoprocLoadWords
            | Opcode::CoprocStoreWords => Type::Void,
        }
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// An immediate known at compile time.
    Imm(u64),
    /// Packed coprocessor operand descriptor; layout depends on the opcode.
    CoprocInfo([u8; 8]),
    /// The result of another instruction, named by its value slot.
    Inst(usize),
}

/// A single IR instruction.
///
/// `id` names the value slot the instruction's result lives in; slots are
/// assigned densely by the frontend.
#[derive(Debug, Clone)]
pub struct Inst {
    pub opcode: Opcode,
    pub id: usize,
    pub args: Vec<Value>,
}

/// A basic block handed to the emitter: its identity, body and terminal.
#[derive(Debug, Clone)]
pub struct Block {
    location: LocationDescriptor,
    instructions: Vec<Inst>,
    terminal: Terminal,
}

impl Block {
    pub fn new(location: LocationDescriptor, instructions: Vec<Inst>, terminal: Terminal) -> Self {
        Block {
            location,
            instructions,
            terminal,
        }
    }

    pub fn location(&self) -> LocationDescriptor {
        self.location
    }

    pub fn instructions(&self) -> &[Inst] {
        &self.instructions
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }
}
