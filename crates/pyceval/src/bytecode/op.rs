//! Opcode definitions.
//!
//! Instructions are two-byte words: an opcode followed by an 8-bit argument.
//! Opcodes below [`HAVE_ARGUMENT`] ignore their argument byte. Arguments wider than
//! eight bits are built by prefixing `EXTENDED_ARG` words.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

/// First opcode number whose argument byte is meaningful.
pub const HAVE_ARGUMENT: u8 = 90;

/// Every instruction understood by the evaluation loop, numbered as the
/// wordcode format defines them.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    DupTopTwo = 5,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,
    BinaryMatrixMultiply = 16,
    InplaceMatrixMultiply = 17,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    GetAiter = 50,
    GetAnext = 51,
    BeforeAsyncWith = 52,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    GetYieldFromIter = 69,
    PrintExpr = 70,
    LoadBuildClass = 71,
    YieldFrom = 72,
    GetAwaitable = 73,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,
    BreakLoop = 80,
    WithCleanupStart = 81,
    WithCleanupFinish = 82,
    ReturnValue = 83,
    ImportStar = 84,
    SetupAnnotations = 85,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    PopExcept = 89,
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    UnpackEx = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildSet = 104,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    StoreAnnotation = 127,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    DeleteDeref = 138,
    CallFunctionKw = 141,
    CallFunctionEx = 142,
    SetupWith = 143,
    ExtendedArg = 144,
    ListAppend = 145,
    SetAdd = 146,
    MapAdd = 147,
    LoadClassderef = 148,
    BuildListUnpack = 149,
    BuildMapUnpack = 150,
    BuildMapUnpackWithCall = 151,
    BuildTupleUnpack = 152,
    BuildSetUnpack = 153,
    SetupAsyncWith = 154,
    FormatValue = 155,
    BuildConstKeyMap = 156,
    BuildString = 157,
    BuildTupleUnpackWithCall = 158,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(byte)
    }
}

impl Opcode {
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Jumps whose argument is an offset from the next instruction.
    #[must_use]
    pub fn is_relative_jump(self) -> bool {
        matches!(
            self,
            Self::JumpForward
                | Self::ForIter
                | Self::SetupLoop
                | Self::SetupExcept
                | Self::SetupFinally
                | Self::SetupWith
                | Self::SetupAsyncWith
        )
    }

    /// Jumps whose argument is an absolute byte offset.
    #[must_use]
    pub fn is_absolute_jump(self) -> bool {
        matches!(
            self,
            Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
                | Self::JumpAbsolute
                | Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::ContinueLoop
        )
    }

    /// Net stack effect of the instruction.
    ///
    /// `jump` selects the effect when the branch is taken; for non-jumping
    /// instructions it is ignored. Block-pushing instructions report the depth
    /// the handler starts at when `jump` is true.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        let n = i32::try_from(arg).unwrap_or(i32::MAX);
        match self {
            Self::Nop | Self::ExtendedArg => 0,
            Self::PopTop => -1,
            Self::RotTwo | Self::RotThree => 0,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,

            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryNot | Self::UnaryInvert => 0,

            Self::SetAdd | Self::ListAppend => -1,
            Self::MapAdd => -2,

            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryMatrixMultiply
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinarySubscr
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceMultiply
            | Self::InplaceMatrixMultiply
            | Self::InplaceModulo
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryXor
            | Self::BinaryOr
            | Self::InplacePower
            | Self::InplaceLshift
            | Self::InplaceRshift
            | Self::InplaceAnd
            | Self::InplaceXor
            | Self::InplaceOr => -1,

            Self::StoreSubscr => -3,
            Self::StoreAnnotation => -1,
            Self::DeleteSubscr => -2,

            Self::PrintExpr => -1,
            Self::LoadBuildClass => 1,

            Self::ReturnValue => -1,
            Self::ImportStar => -1,
            Self::SetupAnnotations => 0,
            Self::YieldValue => 0,
            Self::YieldFrom => -1,
            Self::PopBlock => 0,
            Self::PopExcept => -3,
            Self::EndFinally => -1,

            Self::StoreName => -1,
            Self::DeleteName => 0,
            Self::UnpackSequence => n - 1,
            Self::UnpackEx => (n & 0xFF) + (n >> 8),
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }

            Self::StoreAttr => -2,
            Self::DeleteAttr => -1,
            Self::StoreGlobal => -1,
            Self::DeleteGlobal => 0,
            Self::LoadConst => 1,
            Self::LoadName => 1,
            Self::BuildTuple | Self::BuildList | Self::BuildSet | Self::BuildString => 1 - n,
            Self::BuildListUnpack
            | Self::BuildTupleUnpack
            | Self::BuildTupleUnpackWithCall
            | Self::BuildSetUnpack
            | Self::BuildMapUnpack
            | Self::BuildMapUnpackWithCall => 1 - n,
            Self::BuildMap => 1 - 2 * n,
            Self::BuildConstKeyMap => -n,
            Self::LoadAttr => 0,
            Self::CompareOp => -1,
            Self::ImportName => -1,
            Self::ImportFrom => 1,

            Self::JumpForward | Self::ContinueLoop | Self::JumpAbsolute => 0,
            Self::JumpIfTrueOrPop | Self::JumpIfFalseOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,

            Self::LoadGlobal => 1,
            Self::BreakLoop => 0,
            Self::SetupLoop => 0,
            // The handler runs with the exception triple plus the saved triple pushed.
            Self::SetupExcept | Self::SetupFinally => {
                if jump {
                    6
                } else {
                    0
                }
            }
            Self::SetupWith => {
                if jump {
                    6
                } else {
                    1
                }
            }
            Self::WithCleanupStart => 1,
            Self::WithCleanupFinish => -1,
            Self::BeforeAsyncWith => 1,
            Self::SetupAsyncWith => {
                if jump {
                    5
                } else {
                    0
                }
            }

            Self::LoadFast => 1,
            Self::StoreFast => -1,
            Self::DeleteFast => 0,

            Self::RaiseVarargs => -n,
            Self::CallFunction => -n,
            Self::CallFunctionKw => -n - 1,
            Self::CallFunctionEx => -1 - (n & 1),
            Self::MakeFunction => {
                -1 - i32::from(n & 0x01 != 0)
                    - i32::from(n & 0x02 != 0)
                    - i32::from(n & 0x04 != 0)
                    - i32::from(n & 0x08 != 0)
            }
            Self::BuildSlice => {
                if n == 3 {
                    -2
                } else {
                    -1
                }
            }

            Self::LoadClosure | Self::LoadDeref | Self::LoadClassderef => 1,
            Self::StoreDeref => -1,
            Self::DeleteDeref => 0,
            Self::GetAwaitable => 0,
            Self::GetAiter => 0,
            Self::GetAnext => 1,
            Self::GetIter | Self::GetYieldFromIter => 0,
            Self::FormatValue => {
                if n & 0x04 == 0x04 {
                    -1
                } else {
                    0
                }
            }
        }
    }
}

/// Comparison selector carried by `COMPARE_OP`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExceptionMatch = 10,
}

impl CompareOp {
    /// The operator as written in source, used in error messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::ExceptionMatch => "exception match",
        }
    }
}

/// `FORMAT_VALUE` argument flags.
pub mod format_flags {
    pub const CONVERSION_MASK: u32 = 0x03;
    pub const STR: u32 = 0x01;
    pub const REPR: u32 = 0x02;
    pub const ASCII: u32 = 0x03;
    pub const HAVE_SPEC: u32 = 0x04;
}

/// `MAKE_FUNCTION` argument flags.
pub mod make_function_flags {
    pub const DEFAULTS: u32 = 0x01;
    pub const KWDEFAULTS: u32 = 0x02;
    pub const ANNOTATIONS: u32 = 0x04;
    pub const CLOSURE: u32 = 0x08;
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn opcode_numbers_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::try_from(op as u8), Ok(op));
        }
        assert_eq!(Opcode::try_from(0), Err(0));
        assert_eq!(Opcode::BinaryAdd as u8, 23);
        assert_eq!(Opcode::BuildTupleUnpackWithCall as u8, 158);
    }

    #[test]
    fn display_uses_wordcode_names() {
        assert_eq!(Opcode::SetupFinally.to_string(), "SETUP_FINALLY");
        assert_eq!(Opcode::LoadClassderef.to_string(), "LOAD_CLASSDEREF");
        assert!(!Opcode::PopTop.has_arg());
        assert!(Opcode::StoreName.has_arg());
    }
}
