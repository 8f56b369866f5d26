//! Opcode maps for the one-byte, `0F` two-byte and ModR/M group encodings.
//!
//! Operand templates follow the usual Intel manual notation: `E` is a
//! ModR/M r/m operand, `G` the ModR/M reg field, `I` an immediate, `J` a
//! relative branch, `O` a direct memory offset, `A` a far pointer and `M` a
//! memory-only r/m operand. The size suffix is `b` byte, `w` word and `v`
//! word or dword depending on the operand-size prefix.

use crate::instruction::{Operation, Register};

/// Operand template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arg {
    Absent,
    Eb,
    Ew,
    Ev,
    Gb,
    Gw,
    Gv,
    /// Segment register from the reg field
    Sw,
    /// Unsized memory operand (LEA, BOUND, descriptor tables)
    M,
    /// Far pointer in memory (LES, LDS, indirect far branches)
    Mp,
    Ib,
    Iw,
    Iv,
    /// Byte immediate sign-extended to the operand size
    Ibs,
    Jb,
    Jv,
    Ap,
    Ob,
    Ov,
    /// Fixed register
    Reg(Register),
    /// Fixed 16-bit register widened by the operand-size prefix
    RegV(Register),
    /// Implicit constant with no encoding bytes
    Const(i32),
}

impl Arg {
    pub(crate) fn uses_modrm(self) -> bool {
        matches!(
            self,
            Arg::Eb | Arg::Ew | Arg::Ev | Arg::Gb | Arg::Gw | Arg::Gv | Arg::Sw | Arg::M | Arg::Mp
        )
    }
}

/// ModR/M reg-field groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Group {
    Grp1EbIb,
    Grp1EvIv,
    Grp1EvIbs,
    Grp1a,
    Grp2Eb1,
    Grp2Ev1,
    Grp2EbCl,
    Grp2EvCl,
    Grp2EbIb,
    Grp2EvIb,
    Grp3Eb,
    Grp3Ev,
    Grp4,
    Grp5,
    Grp11Eb,
    Grp11Ev,
    Grp6,
    Grp7,
}

impl Group {
    pub(crate) fn members(self) -> &'static [OpcodeEntry; 8] {
        match self {
            Group::Grp1EbIb => &GRP1_EB_IB,
            Group::Grp1EvIv => &GRP1_EV_IV,
            Group::Grp1EvIbs => &GRP1_EV_IBS,
            Group::Grp1a => &GRP1A,
            Group::Grp2Eb1 => &GRP2_EB_1,
            Group::Grp2Ev1 => &GRP2_EV_1,
            Group::Grp2EbCl => &GRP2_EB_CL,
            Group::Grp2EvCl => &GRP2_EV_CL,
            Group::Grp2EbIb => &GRP2_EB_IB,
            Group::Grp2EvIb => &GRP2_EV_IB,
            Group::Grp3Eb => &GRP3_EB,
            Group::Grp3Ev => &GRP3_EV,
            Group::Grp4 => &GRP4,
            Group::Grp5 => &GRP5,
            Group::Grp11Eb => &GRP11_EB,
            Group::Grp11Ev => &GRP11_EV,
            Group::Grp6 => &GRP6,
            Group::Grp7 => &GRP7,
        }
    }
}

/// One slot of an opcode map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpcodeEntry {
    Invalid,
    /// Legacy prefix byte, consumed before the opcode
    Prefix,
    /// `0F` escape into the two-byte map
    TwoByte,
    /// `D8`..`DF` coprocessor escape
    Fpu,
    Op(Operation, [Arg; 3]),
    /// Re-dispatch on the ModR/M reg field
    Extension(Group),
}

impl OpcodeEntry {
    pub(crate) fn needs_modrm(&self) -> bool {
        match self {
            OpcodeEntry::Op(_, args) => args.iter().any(|a| a.uses_modrm()),
            OpcodeEntry::Extension(_) | OpcodeEntry::Fpu => true,
            _ => false,
        }
    }
}

use Arg::*;
use Operation as O;

const fn op0(operation: Operation) -> OpcodeEntry {
    OpcodeEntry::Op(operation, [Absent, Absent, Absent])
}

const fn op1(operation: Operation, a: Arg) -> OpcodeEntry {
    OpcodeEntry::Op(operation, [a, Absent, Absent])
}

const fn op2(operation: Operation, a: Arg, b: Arg) -> OpcodeEntry {
    OpcodeEntry::Op(operation, [a, b, Absent])
}

const fn op3(operation: Operation, a: Arg, b: Arg, c: Arg) -> OpcodeEntry {
    OpcodeEntry::Op(operation, [a, b, c])
}

const INVALID: OpcodeEntry = OpcodeEntry::Invalid;

macro_rules! alu_group {
    ($dst:expr, $src:expr) => {
        [
            op2(O::Add, $dst, $src),
            op2(O::Or, $dst, $src),
            op2(O::Adc, $dst, $src),
            op2(O::Sbb, $dst, $src),
            op2(O::And, $dst, $src),
            op2(O::Sub, $dst, $src),
            op2(O::Xor, $dst, $src),
            op2(O::Cmp, $dst, $src),
        ]
    };
}

macro_rules! shift_group {
    ($dst:expr, $count:expr) => {
        [
            op2(O::Rol, $dst, $count),
            op2(O::Ror, $dst, $count),
            op2(O::Rcl, $dst, $count),
            op2(O::Rcr, $dst, $count),
            op2(O::Shl, $dst, $count),
            op2(O::Shr, $dst, $count),
            INVALID,
            op2(O::Sar, $dst, $count),
        ]
    };
}

static GRP1_EB_IB: [OpcodeEntry; 8] = alu_group!(Eb, Ib);
static GRP1_EV_IV: [OpcodeEntry; 8] = alu_group!(Ev, Iv);
static GRP1_EV_IBS: [OpcodeEntry; 8] = alu_group!(Ev, Ibs);

static GRP1A: [OpcodeEntry; 8] = [
    op1(O::Pop, Ev), INVALID, INVALID, INVALID, INVALID, INVALID, INVALID, INVALID,
];

static GRP2_EB_1: [OpcodeEntry; 8] = shift_group!(Eb, Const(1));
static GRP2_EV_1: [OpcodeEntry; 8] = shift_group!(Ev, Const(1));
static GRP2_EB_CL: [OpcodeEntry; 8] = shift_group!(Eb, Reg(Register::Cl));
static GRP2_EV_CL: [OpcodeEntry; 8] = shift_group!(Ev, Reg(Register::Cl));
static GRP2_EB_IB: [OpcodeEntry; 8] = shift_group!(Eb, Ib);
static GRP2_EV_IB: [OpcodeEntry; 8] = shift_group!(Ev, Ib);

static GRP3_EB: [OpcodeEntry; 8] = [
    op2(O::Test, Eb, Ib),
    INVALID,
    op1(O::Not, Eb),
    op1(O::Neg, Eb),
    op1(O::Mul, Eb),
    op1(O::Imul, Eb),
    op1(O::Div, Eb),
    op1(O::Idiv, Eb),
];

static GRP3_EV: [OpcodeEntry; 8] = [
    op2(O::Test, Ev, Iv),
    INVALID,
    op1(O::Not, Ev),
    op1(O::Neg, Ev),
    op1(O::Mul, Ev),
    op1(O::Imul, Ev),
    op1(O::Div, Ev),
    op1(O::Idiv, Ev),
];

static GRP4: [OpcodeEntry; 8] = [
    op1(O::Inc, Eb), op1(O::Dec, Eb), INVALID, INVALID, INVALID, INVALID, INVALID, INVALID,
];

static GRP5: [OpcodeEntry; 8] = [
    op1(O::Inc, Ev),
    op1(O::Dec, Ev),
    op1(O::Call, Ev),
    op1(O::Callf, Mp),
    op1(O::Jmp, Ev),
    op1(O::Jmpf, Mp),
    op1(O::Push, Ev),
    INVALID,
];

static GRP11_EB: [OpcodeEntry; 8] = [
    op2(O::Mov, Eb, Ib), INVALID, INVALID, INVALID, INVALID, INVALID, INVALID, INVALID,
];

static GRP11_EV: [OpcodeEntry; 8] = [
    op2(O::Mov, Ev, Iv), INVALID, INVALID, INVALID, INVALID, INVALID, INVALID, INVALID,
];

static GRP6: [OpcodeEntry; 8] = [
    op1(O::Sldt, Ew),
    op1(O::Str, Ew),
    op1(O::Lldt, Ew),
    op1(O::Ltr, Ew),
    op1(O::Verr, Ew),
    op1(O::Verw, Ew),
    INVALID,
    INVALID,
];

static GRP7: [OpcodeEntry; 8] = [
    op1(O::Sgdt, M),
    op1(O::Sidt, M),
    op1(O::Lgdt, M),
    op1(O::Lidt, M),
    op1(O::Smsw, Ew),
    INVALID,
    op1(O::Lmsw, Ew),
    INVALID,
];

const fn one_byte_map() -> [OpcodeEntry; 256] {
    let mut t = [INVALID; 256];

    // 00..3F: eight ALU rows, each followed by two misc slots
    let alu = [O::Add, O::Or, O::Adc, O::Sbb, O::And, O::Sub, O::Xor, O::Cmp];
    let mut i = 0;
    while i < 8 {
        let base = i * 8;
        t[base] = op2(alu[i], Eb, Gb);
        t[base + 1] = op2(alu[i], Ev, Gv);
        t[base + 2] = op2(alu[i], Gb, Eb);
        t[base + 3] = op2(alu[i], Gv, Ev);
        t[base + 4] = op2(alu[i], Reg(Register::Al), Ib);
        t[base + 5] = op2(alu[i], RegV(Register::Ax), Iv);
        i += 1;
    }
    t[0x06] = op1(O::Push, Reg(Register::Es));
    t[0x07] = op1(O::Pop, Reg(Register::Es));
    t[0x0E] = op1(O::Push, Reg(Register::Cs));
    t[0x0F] = OpcodeEntry::TwoByte;
    t[0x16] = op1(O::Push, Reg(Register::Ss));
    t[0x17] = op1(O::Pop, Reg(Register::Ss));
    t[0x1E] = op1(O::Push, Reg(Register::Ds));
    t[0x1F] = op1(O::Pop, Reg(Register::Ds));
    t[0x26] = OpcodeEntry::Prefix;
    t[0x27] = op0(O::Daa);
    t[0x2E] = OpcodeEntry::Prefix;
    t[0x2F] = op0(O::Das);
    t[0x36] = OpcodeEntry::Prefix;
    t[0x37] = op0(O::Aaa);
    t[0x3E] = OpcodeEntry::Prefix;
    t[0x3F] = op0(O::Aas);

    // 40..5F: register-coded INC/DEC/PUSH/POP
    let mut r = 0;
    while r < 8 {
        let reg = RegV(Register::WORD[r]);
        t[0x40 + r] = op1(O::Inc, reg);
        t[0x48 + r] = op1(O::Dec, reg);
        t[0x50 + r] = op1(O::Push, reg);
        t[0x58 + r] = op1(O::Pop, reg);
        r += 1;
    }

    t[0x60] = op0(O::Pusha);
    t[0x61] = op0(O::Popa);
    t[0x62] = op2(O::Bound, Gv, M);
    t[0x63] = op2(O::Arpl, Ew, Gw);
    t[0x66] = OpcodeEntry::Prefix;
    t[0x67] = OpcodeEntry::Prefix;
    t[0x68] = op1(O::Push, Iv);
    t[0x69] = op3(O::Imul, Gv, Ev, Iv);
    t[0x6A] = op1(O::Push, Ibs);
    t[0x6B] = op3(O::Imul, Gv, Ev, Ibs);
    t[0x6C] = op0(O::Insb);
    t[0x6D] = op0(O::Insw);
    t[0x6E] = op0(O::Outsb);
    t[0x6F] = op0(O::Outsw);

    let jcc = [
        O::Jo, O::Jno, O::Jb, O::Jae, O::Je, O::Jne, O::Jbe, O::Ja,
        O::Js, O::Jns, O::Jp, O::Jnp, O::Jl, O::Jge, O::Jle, O::Jg,
    ];
    let mut c = 0;
    while c < 16 {
        t[0x70 + c] = op1(jcc[c], Jb);
        c += 1;
    }

    t[0x80] = OpcodeEntry::Extension(Group::Grp1EbIb);
    t[0x81] = OpcodeEntry::Extension(Group::Grp1EvIv);
    t[0x82] = OpcodeEntry::Extension(Group::Grp1EbIb);
    t[0x83] = OpcodeEntry::Extension(Group::Grp1EvIbs);
    t[0x84] = op2(O::Test, Eb, Gb);
    t[0x85] = op2(O::Test, Ev, Gv);
    t[0x86] = op2(O::Xchg, Eb, Gb);
    t[0x87] = op2(O::Xchg, Ev, Gv);
    t[0x88] = op2(O::Mov, Eb, Gb);
    t[0x89] = op2(O::Mov, Ev, Gv);
    t[0x8A] = op2(O::Mov, Gb, Eb);
    t[0x8B] = op2(O::Mov, Gv, Ev);
    t[0x8C] = op2(O::Mov, Ew, Sw);
    t[0x8D] = op2(O::Lea, Gv, M);
    t[0x8E] = op2(O::Mov, Sw, Ew);
    t[0x8F] = OpcodeEntry::Extension(Group::Grp1a);

    t[0x90] = op0(O::Nop);
    let mut x = 1;
    while x < 8 {
        t[0x90 + x] = op2(O::Xchg, RegV(Register::WORD[x]), RegV(Register::Ax));
        x += 1;
    }
    t[0x98] = op0(O::Cbw);
    t[0x99] = op0(O::Cwd);
    t[0x9A] = op1(O::Callf, Ap);
    t[0x9B] = op0(O::Wait);
    t[0x9C] = op0(O::Pushf);
    t[0x9D] = op0(O::Popf);
    t[0x9E] = op0(O::Sahf);
    t[0x9F] = op0(O::Lahf);

    t[0xA0] = op2(O::Mov, Reg(Register::Al), Ob);
    t[0xA1] = op2(O::Mov, RegV(Register::Ax), Ov);
    t[0xA2] = op2(O::Mov, Ob, Reg(Register::Al));
    t[0xA3] = op2(O::Mov, Ov, RegV(Register::Ax));
    t[0xA4] = op0(O::Movsb);
    t[0xA5] = op0(O::Movsw);
    t[0xA6] = op0(O::Cmpsb);
    t[0xA7] = op0(O::Cmpsw);
    t[0xA8] = op2(O::Test, Reg(Register::Al), Ib);
    t[0xA9] = op2(O::Test, RegV(Register::Ax), Iv);
    t[0xAA] = op0(O::Stosb);
    t[0xAB] = op0(O::Stosw);
    t[0xAC] = op0(O::Lodsb);
    t[0xAD] = op0(O::Lodsw);
    t[0xAE] = op0(O::Scasb);
    t[0xAF] = op0(O::Scasw);

    let mut m = 0;
    while m < 8 {
        t[0xB0 + m] = op2(O::Mov, Reg(Register::BYTE[m]), Ib);
        t[0xB8 + m] = op2(O::Mov, RegV(Register::WORD[m]), Iv);
        m += 1;
    }

    t[0xC0] = OpcodeEntry::Extension(Group::Grp2EbIb);
    t[0xC1] = OpcodeEntry::Extension(Group::Grp2EvIb);
    t[0xC2] = op1(O::Ret, Iw);
    t[0xC3] = op0(O::Ret);
    t[0xC4] = op2(O::Les, Gv, Mp);
    t[0xC5] = op2(O::Lds, Gv, Mp);
    t[0xC6] = OpcodeEntry::Extension(Group::Grp11Eb);
    t[0xC7] = OpcodeEntry::Extension(Group::Grp11Ev);
    t[0xC8] = op2(O::Enter, Iw, Ib);
    t[0xC9] = op0(O::Leave);
    t[0xCA] = op1(O::Retf, Iw);
    t[0xCB] = op0(O::Retf);
    t[0xCC] = op1(O::Int, Const(3));
    t[0xCD] = op1(O::Int, Ib);
    t[0xCE] = op0(O::Into);
    t[0xCF] = op0(O::Iret);

    t[0xD0] = OpcodeEntry::Extension(Group::Grp2Eb1);
    t[0xD1] = OpcodeEntry::Extension(Group::Grp2Ev1);
    t[0xD2] = OpcodeEntry::Extension(Group::Grp2EbCl);
    t[0xD3] = OpcodeEntry::Extension(Group::Grp2EvCl);
    t[0xD4] = op1(O::Aam, Ib);
    t[0xD5] = op1(O::Aad, Ib);
    t[0xD7] = op0(O::Xlat);
    let mut e = 0xD8;
    while e <= 0xDF {
        t[e] = OpcodeEntry::Fpu;
        e += 1;
    }

    t[0xE0] = op1(O::Loopne, Jb);
    t[0xE1] = op1(O::Loope, Jb);
    t[0xE2] = op1(O::Loop, Jb);
    t[0xE3] = op1(O::Jcxz, Jb);
    t[0xE4] = op2(O::In, Reg(Register::Al), Ib);
    t[0xE5] = op2(O::In, RegV(Register::Ax), Ib);
    t[0xE6] = op2(O::Out, Ib, Reg(Register::Al));
    t[0xE7] = op2(O::Out, Ib, RegV(Register::Ax));
    t[0xE8] = op1(O::Call, Jv);
    t[0xE9] = op1(O::Jmp, Jv);
    t[0xEA] = op1(O::Jmpf, Ap);
    t[0xEB] = op1(O::Jmp, Jb);
    t[0xEC] = op2(O::In, Reg(Register::Al), Reg(Register::Dx));
    t[0xED] = op2(O::In, RegV(Register::Ax), Reg(Register::Dx));
    t[0xEE] = op2(O::Out, Reg(Register::Dx), Reg(Register::Al));
    t[0xEF] = op2(O::Out, Reg(Register::Dx), RegV(Register::Ax));

    t[0xF0] = OpcodeEntry::Prefix;
    t[0xF2] = OpcodeEntry::Prefix;
    t[0xF3] = OpcodeEntry::Prefix;
    t[0xF4] = op0(O::Hlt);
    t[0xF5] = op0(O::Cmc);
    t[0xF6] = OpcodeEntry::Extension(Group::Grp3Eb);
    t[0xF7] = OpcodeEntry::Extension(Group::Grp3Ev);
    t[0xF8] = op0(O::Clc);
    t[0xF9] = op0(O::Stc);
    t[0xFA] = op0(O::Cli);
    t[0xFB] = op0(O::Sti);
    t[0xFC] = op0(O::Cld);
    t[0xFD] = op0(O::Std);
    t[0xFE] = OpcodeEntry::Extension(Group::Grp4);
    t[0xFF] = OpcodeEntry::Extension(Group::Grp5);

    t
}

/// The one-byte opcode map.
pub(crate) static ONE_BYTE: [OpcodeEntry; 256] = one_byte_map();

/// The `0F xx` map. Only the 80286 system instructions are defined.
pub(crate) fn two_byte(opcode: u8) -> OpcodeEntry {
    match opcode {
        0x00 => OpcodeEntry::Extension(Group::Grp6),
        0x01 => OpcodeEntry::Extension(Group::Grp7),
        0x02 => op2(O::Lar, Gv, Ew),
        0x03 => op2(O::Lsl, Gv, Ew),
        0x06 => op0(O::Clts),
        _ => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_slots() {
        for byte in [0x26, 0x2E, 0x36, 0x3E, 0x66, 0x67, 0xF0, 0xF2, 0xF3] {
            assert_eq!(ONE_BYTE[byte], OpcodeEntry::Prefix, "{:#04x}", byte);
        }
        assert_eq!(ONE_BYTE[0x64], OpcodeEntry::Invalid);
        assert_eq!(ONE_BYTE[0x65], OpcodeEntry::Invalid);
    }

    #[test]
    fn test_alu_rows() {
        assert_eq!(ONE_BYTE[0x28], op2(O::Sub, Eb, Gb));
        assert_eq!(ONE_BYTE[0x3D], op2(O::Cmp, RegV(Register::Ax), Iv));
        assert_eq!(ONE_BYTE[0x5F], op1(O::Pop, RegV(Register::Di)));
    }

    #[test]
    fn test_group_members() {
        assert_eq!(Group::Grp2Ev1.members()[6], OpcodeEntry::Invalid);
        assert_eq!(Group::Grp5.members()[3], op1(O::Callf, Mp));
        assert!(ONE_BYTE[0xF7].needs_modrm());
        assert!(!ONE_BYTE[0xC3].needs_modrm());
    }
}
