//! Wire form of a compiled unit.
//!
//! Every instruction is two bytes: the opcode and an 8-bit operand. Wider operands are built
//! from [`Opcode::ExtendedArg`] prefixes, each contributing the next 8 high bits of the operand
//! of the instruction that follows the chain.

use serde::{Deserialize, Serialize};

macro_rules! opcodes {
    ($($name:ident = $byte:literal,)*) => {
        /// Operation codes understood by the interpreter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            /// Decodes an opcode byte.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            /// Mnemonic, for disassembly.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    DupTopTwo = 5,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    BinaryAdd = 20,
    BinarySubtract = 21,
    BinaryMultiply = 22,
    BinaryTrueDivide = 23,
    BinaryFloorDivide = 24,
    BinaryModulo = 25,
    BinaryPower = 26,
    InplaceAdd = 30,
    InplaceSubtract = 31,
    InplaceMultiply = 32,
    InplaceTrueDivide = 33,
    InplaceFloorDivide = 34,
    InplaceModulo = 35,
    InplacePower = 36,
    BinarySubscr = 40,
    StoreSubscr = 41,
    GetIter = 42,
    ReturnValue = 43,
    PopBlock = 44,
    PopExcept = 45,
    // opcodes below carry an operand
    ExtendedArg = 90,
    LoadConst = 100,
    LoadFast = 101,
    StoreFast = 102,
    LoadGlobal = 103,
    StoreGlobal = 104,
    LoadDeref = 105,
    StoreDeref = 106,
    LoadClosure = 107,
    LoadAttr = 108,
    StoreAttr = 109,
    BuildTuple = 110,
    BuildList = 111,
    BuildMap = 112,
    BuildSlice = 113,
    UnpackSequence = 114,
    ListAppend = 115,
    CompareOp = 116,
    CallFunction = 117,
    CallFunctionKw = 118,
    MakeFunction = 119,
    RaiseVarargs = 120,
    ImportName = 121,
    ImportFrom = 122,
    JumpForward = 130,
    ForIter = 131,
    SetupExcept = 132,
    JumpAbsolute = 140,
    PopJumpIfFalse = 141,
    PopJumpIfTrue = 142,
    JumpIfFalseOrPop = 143,
    JumpIfTrueOrPop = 144,
}

impl Opcode {
    /// Operand is the absolute byte offset of the target.
    pub fn is_jump_absolute(self) -> bool {
        matches!(
            self,
            Opcode::JumpAbsolute
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
        )
    }

    /// Operand is the forward distance from the end of the instruction to the target.
    pub fn is_jump_relative(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward | Opcode::ForIter | Opcode::SetupExcept
        )
    }

    pub fn is_jump(self) -> bool {
        self.is_jump_absolute() || self.is_jump_relative()
    }

    pub fn has_arg(self) -> bool {
        self as u8 >= Opcode::ExtendedArg as u8
    }

    /// Stack shuffles that must directly follow the instruction producing their operands.
    pub fn unsafe_to_precede(self) -> bool {
        matches!(
            self,
            Opcode::DupTop | Opcode::DupTopTwo | Opcode::RotTwo | Opcode::RotThree
        )
    }
}

/// Operand of [`Opcode::CompareOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Comparison {
    Lt = 0,
    LtE = 1,
    Eq = 2,
    NotEq = 3,
    Gt = 4,
    GtE = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    /// `except Class:` test; leaves the exception below the boolean.
    ExceptionMatch = 10,
}

impl Comparison {
    pub fn from_arg(arg: u32) -> Option<Comparison> {
        Some(match arg {
            0 => Comparison::Lt,
            1 => Comparison::LtE,
            2 => Comparison::Eq,
            3 => Comparison::NotEq,
            4 => Comparison::Gt,
            5 => Comparison::GtE,
            6 => Comparison::In,
            7 => Comparison::NotIn,
            8 => Comparison::Is,
            9 => Comparison::IsNot,
            10 => Comparison::ExceptionMatch,
            _ => return None,
        })
    }
}

/// [`Opcode::MakeFunction`] flag: a tuple of default values is on the stack.
pub const MAKE_DEFAULTS: u32 = 0x01;
/// [`Opcode::MakeFunction`] flag: a tuple of closure cells is on the stack.
pub const MAKE_CLOSURE: u32 = 0x08;

/// Literal values stored in a unit's constant table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Constant>),
    Code(Box<CodeUnit>),
}

/// One compiled function, lambda, comprehension or module body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    /// Number of positional parameters, stored first in `varnames`.
    pub argcount: u32,
    pub varnames: Vec<String>,
    /// Locals captured by nested units.
    pub cellvars: Vec<String>,
    /// Variables captured from enclosing units.
    pub freevars: Vec<String>,
    /// Global, attribute and module names referenced by the code.
    pub names: Vec<String>,
    pub consts: Vec<Constant>,
    pub code: Vec<u8>,
    /// Sorted `(offset, line)` pairs: from `offset` on, the source line is `line`.
    pub lines: Vec<(u32, u32)>,
    #[serde(default)]
    pub instrumented: bool,
}

impl CodeUnit {
    /// Source line of the instruction at `offset`.
    pub fn line_for(&self, offset: usize) -> u32 {
        let idx = self
            .lines
            .partition_point(|&(start, _)| start as usize <= offset);
        if idx == 0 {
            self.first_line
        } else {
            self.lines[idx - 1].1
        }
    }

    /// Units stored as constants of this one.
    pub fn nested(&self) -> impl Iterator<Item = &CodeUnit> {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(unit) => Some(unit.as_ref()),
            _ => None,
        })
    }

    /// Whether this unit and every unit nested in it went through instrumentation.
    pub fn fully_instrumented(&self) -> bool {
        self.instrumented && self.nested().all(CodeUnit::fully_instrumented)
    }

    /// Human readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut ext = 0u32;
        for (i, pair) in self.code.chunks(2).enumerate() {
            let offset = i * 2;
            let (byte, raw) = (pair[0], pair.get(1).copied().unwrap_or(0));
            let name = Opcode::from_byte(byte).map_or("<invalid>", Opcode::name);
            let arg = ext | raw as u32;
            ext = if byte == Opcode::ExtendedArg as u8 {
                arg << 8
            } else {
                0
            };
            out.push_str(&format!(
                "{:>4} {:>5} {:<18} {}\n",
                self.line_for(offset),
                offset,
                name,
                arg
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_roundtrip() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(0), None);
    }

    #[test]
    fn jump_classes_are_disjoint() {
        for byte in 0..=255u8 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert!(!(op.is_jump_absolute() && op.is_jump_relative()));
                if op.is_jump() {
                    assert!(op.has_arg());
                }
            }
        }
        assert!(!Opcode::PopTop.has_arg());
        assert!(Opcode::ExtendedArg.has_arg());
    }

    #[test]
    fn line_lookup_uses_last_entry_before_offset() {
        let unit = CodeUnit {
            name: "<module>".into(),
            filename: "bot".into(),
            first_line: 1,
            argcount: 0,
            varnames: vec![],
            cellvars: vec![],
            freevars: vec![],
            names: vec![],
            consts: vec![],
            code: vec![0; 12],
            lines: vec![(0, 1), (4, 3), (10, 7)],
            instrumented: false,
        };
        assert_eq!(unit.line_for(0), 1);
        assert_eq!(unit.line_for(2), 1);
        assert_eq!(unit.line_for(4), 3);
        assert_eq!(unit.line_for(8), 3);
        assert_eq!(unit.line_for(10), 7);
    }
}
