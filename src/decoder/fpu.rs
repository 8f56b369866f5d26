//! x87 coprocessor escape maps (`D8`..`DF`), 8087/80287 subset.
//!
//! Memory forms are selected by escape byte and ModR/M reg. Register forms
//! (mod == 3) additionally use the rm field, either as the stack index or
//! as a sub-opcode for the no-operand instructions.

use crate::instruction::{OperandSize, Operation};

/// Register operands of a register-form x87 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FpuOperands {
    None,
    /// `st(0), st(i)`
    St0Sti,
    /// `st(i), st(0)`
    StiSt0,
    /// `st(i)`
    Sti,
    /// `ax`
    Ax,
}

/// Memory form: the operation and the size of its memory operand.
pub(crate) fn memory_form(escape: u8, reg: u8) -> Option<(Operation, Option<OperandSize>)> {
    use OperandSize::*;
    use Operation::*;

    const ARITH: [Operation; 8] = [Fadd, Fmul, Fcom, Fcomp, Fsub, Fsubr, Fdiv, Fdivr];
    const INT_ARITH: [Operation; 8] = [Fiadd, Fimul, Ficom, Ficomp, Fisub, Fisubr, Fidiv, Fidivr];

    let reg = reg & 7;
    let form = match escape {
        0xD8 => (ARITH[reg as usize], Some(Dword)),
        0xD9 => match reg {
            0 => (Fld, Some(Dword)),
            2 => (Fst, Some(Dword)),
            3 => (Fstp, Some(Dword)),
            4 => (Fldenv, None),
            5 => (Fldcw, Some(Word)),
            6 => (Fnstenv, None),
            7 => (Fnstcw, Some(Word)),
            _ => return None,
        },
        0xDA => (INT_ARITH[reg as usize], Some(Dword)),
        0xDB => match reg {
            0 => (Fild, Some(Dword)),
            2 => (Fist, Some(Dword)),
            3 => (Fistp, Some(Dword)),
            5 => (Fld, Some(Tbyte)),
            7 => (Fstp, Some(Tbyte)),
            _ => return None,
        },
        0xDC => (ARITH[reg as usize], Some(Qword)),
        0xDD => match reg {
            0 => (Fld, Some(Qword)),
            2 => (Fst, Some(Qword)),
            3 => (Fstp, Some(Qword)),
            4 => (Frstor, None),
            6 => (Fnsave, None),
            7 => (Fnstsw, Some(Word)),
            _ => return None,
        },
        0xDE => (INT_ARITH[reg as usize], Some(Word)),
        0xDF => match reg {
            0 => (Fild, Some(Word)),
            2 => (Fist, Some(Word)),
            3 => (Fistp, Some(Word)),
            4 => (Fbld, Some(Tbyte)),
            5 => (Fild, Some(Qword)),
            6 => (Fbstp, Some(Tbyte)),
            7 => (Fistp, Some(Qword)),
            _ => return None,
        },
        _ => return None,
    };
    Some(form)
}

/// Register form (mod == 3).
pub(crate) fn register_form(escape: u8, reg: u8, rm: u8) -> Option<(Operation, FpuOperands)> {
    // `Sti` is the operand form, not the mnemonic
    use FpuOperands::{Ax, None, St0Sti, Sti, StiSt0};
    use Operation::*;

    let (reg, rm) = (reg & 7, rm & 7);
    let form = match (escape, reg) {
        (0xD8, 0) => (Fadd, St0Sti),
        (0xD8, 1) => (Fmul, St0Sti),
        (0xD8, 2) => (Fcom, Sti),
        (0xD8, 3) => (Fcomp, Sti),
        (0xD8, 4) => (Fsub, St0Sti),
        (0xD8, 5) => (Fsubr, St0Sti),
        (0xD8, 6) => (Fdiv, St0Sti),
        (0xD8, 7) => (Fdivr, St0Sti),

        (0xD9, 0) => (Fld, Sti),
        (0xD9, 1) => (Fxch, Sti),
        (0xD9, 2) if rm == 0 => (Fnop, None),
        (0xD9, 4) => match rm {
            0 => (Fchs, None),
            1 => (Fabs, None),
            4 => (Ftst, None),
            5 => (Fxam, None),
            _ => return Option::None,
        },
        (0xD9, 5) => match rm {
            0 => (Fld1, None),
            1 => (Fldl2t, None),
            2 => (Fldl2e, None),
            3 => (Fldpi, None),
            4 => (Fldlg2, None),
            5 => (Fldln2, None),
            6 => (Fldz, None),
            _ => return Option::None,
        },
        (0xD9, 6) => match rm {
            0 => (F2xm1, None),
            1 => (Fyl2x, None),
            2 => (Fptan, None),
            3 => (Fpatan, None),
            4 => (Fxtract, None),
            6 => (Fdecstp, None),
            7 => (Fincstp, None),
            _ => return Option::None,
        },
        (0xD9, 7) => match rm {
            0 => (Fprem, None),
            1 => (Fyl2xp1, None),
            2 => (Fsqrt, None),
            4 => (Frndint, None),
            5 => (Fscale, None),
            _ => return Option::None,
        },

        (0xDB, 4) => match rm {
            0 => (Fneni, None),
            1 => (Fndisi, None),
            2 => (Fnclex, None),
            3 => (Fninit, None),
            4 => (Fsetpm, None),
            _ => return Option::None,
        },

        // Intel operand order: the DC/DE subtract and divide forms are reversed
        (0xDC, 0) => (Fadd, StiSt0),
        (0xDC, 1) => (Fmul, StiSt0),
        (0xDC, 4) => (Fsubr, StiSt0),
        (0xDC, 5) => (Fsub, StiSt0),
        (0xDC, 6) => (Fdivr, StiSt0),
        (0xDC, 7) => (Fdiv, StiSt0),

        (0xDD, 0) => (Ffree, Sti),
        (0xDD, 2) => (Fst, Sti),
        (0xDD, 3) => (Fstp, Sti),

        (0xDE, 0) => (Faddp, StiSt0),
        (0xDE, 1) => (Fmulp, StiSt0),
        (0xDE, 3) if rm == 1 => (Fcompp, None),
        (0xDE, 4) => (Fsubrp, StiSt0),
        (0xDE, 5) => (Fsubp, StiSt0),
        (0xDE, 6) => (Fdivrp, StiSt0),
        (0xDE, 7) => (Fdivp, StiSt0),

        (0xDF, 4) if rm == 0 => (Fnstsw, Ax),

        _ => return Option::None,
    };
    Some(form)
}
