//! Decoded instruction model for 16-bit real-mode x86 (8086/80186/80286/x87).

use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use strum::{Display, IntoStaticStr};

use crate::{Address, SymbolResolver, MAX_INSTRUCTION_SIZE};

/// Instruction operation (mnemonic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    // 8086
    Aaa, Aad, Aam, Aas, Adc, Add, And,
    Call, Callf, Cbw, Clc, Cld, Cli, Cmc, Cmp, Cmpsb, Cmpsw, Cwd,
    Daa, Das, Dec, Div,
    Hlt,
    Idiv, Imul, In, Inc, Int, Into, Iret,
    Ja, Jae, Jb, Jbe, Jcxz, Je, Jg, Jge, Jl, Jle, Jmp, Jmpf, Jne, Jno, Jnp, Jns, Jo, Jp, Js,
    Lahf, Lds, Lea, Les, Lodsb, Lodsw, Loop, Loope, Loopne,
    Mov, Movsb, Movsw, Mul,
    Neg, Nop, Not,
    Or, Out,
    Pop, Popf, Push, Pushf,
    Rcl, Rcr, Ret, Retf, Rol, Ror,
    Sahf, Sar, Sbb, Scasb, Scasw, Shl, Shr, Stc, Std, Sti, Stosb, Stosw, Sub,
    Test,
    Wait,
    Xchg, Xlat, Xor,
    // 80186
    Bound, Enter, Insb, Insw, Leave, Outsb, Outsw, Popa, Pusha,
    // 80286
    Arpl, Clts, Lar, Lgdt, Lidt, Lldt, Lmsw, Lsl, Ltr, Sgdt, Sidt, Sldt, Smsw, Str, Verr, Verw,
    // x87
    F2xm1, Fabs, Fadd, Faddp, Fbld, Fbstp, Fchs, Fcom, Fcomp, Fcompp,
    Fdecstp, Fdiv, Fdivp, Fdivr, Fdivrp, Ffree,
    Fiadd, Ficom, Ficomp, Fidiv, Fidivr, Fild, Fimul, Fincstp, Fist, Fistp, Fisub, Fisubr,
    Fld, Fld1, Fldcw, Fldenv, Fldl2e, Fldl2t, Fldlg2, Fldln2, Fldpi, Fldz,
    Fmul, Fmulp,
    Fnclex, Fndisi, Fneni, Fninit, Fnop, Fnsave, Fnstcw, Fnstenv, Fnstsw,
    Fpatan, Fprem, Fptan, Frndint, Frstor,
    Fscale, Fsetpm, Fsqrt, Fst, Fstp, Fsub, Fsubp, Fsubr, Fsubrp,
    Ftst, Fxam, Fxch, Fxtract, Fyl2x, Fyl2xp1,
}

impl Operation {
    /// Lower-case mnemonic text
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// How this operation affects control flow.
    pub fn flow_type(self) -> FlowType {
        use Operation::*;

        match self {
            Ja | Jae | Jb | Jbe | Jcxz | Je | Jg | Jge | Jl | Jle | Jne | Jno | Jnp | Jns | Jo
            | Jp | Js | Loop | Loope | Loopne => FlowType::ConditionalJump,
            Jmp => FlowType::NearJump,
            Jmpf => FlowType::FarJump,
            Call => FlowType::NearCall,
            Callf => FlowType::FarCall,
            Int | Into => FlowType::Interrupt,
            Iret => FlowType::InterruptReturn,
            Ret => FlowType::NearReturn,
            Retf => FlowType::FarReturn,
            Hlt => FlowType::Halt,
            _ => FlowType::None,
        }
    }
}

/// Control-flow behaviour of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowType {
    /// Execution continues with the next instruction
    None,
    /// Jcc, LOOPxx, JCXZ
    ConditionalJump,
    /// Unconditional jump within the segment
    NearJump,
    /// Unconditional jump to another segment
    FarJump,
    /// Call within the segment
    NearCall,
    /// Call to another segment
    FarCall,
    /// Software interrupt
    Interrupt,
    /// IRET
    InterruptReturn,
    /// RET
    NearReturn,
    /// RETF
    FarReturn,
    /// HLT
    Halt,
}

impl FlowType {
    /// Whether this instruction ends a basic block
    pub fn is_flow_affecting(self) -> bool {
        self != FlowType::None
    }

    /// Whether control may continue with the next sequential instruction
    pub fn falls_through(self) -> bool {
        !matches!(
            self,
            FlowType::NearJump
                | FlowType::FarJump
                | FlowType::NearReturn
                | FlowType::FarReturn
                | FlowType::InterruptReturn
                | FlowType::Halt
        )
    }
}

/// Register class; AH..BH are distinct from AL..BL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    ByteLow,
    ByteHigh,
    Word,
    Dword,
    Segment,
    Fpu,
}

/// CPU register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    Al, Cl, Dl, Bl, Ah, Ch, Dh, Bh,
    Ax, Cx, Dx, Bx, Sp, Bp, Si, Di,
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    Es, Cs, Ss, Ds,
    #[strum(serialize = "st(0)")]
    St0,
    #[strum(serialize = "st(1)")]
    St1,
    #[strum(serialize = "st(2)")]
    St2,
    #[strum(serialize = "st(3)")]
    St3,
    #[strum(serialize = "st(4)")]
    St4,
    #[strum(serialize = "st(5)")]
    St5,
    #[strum(serialize = "st(6)")]
    St6,
    #[strum(serialize = "st(7)")]
    St7,
}

impl Register {
    pub(crate) const BYTE: [Register; 8] = [
        Register::Al, Register::Cl, Register::Dl, Register::Bl,
        Register::Ah, Register::Ch, Register::Dh, Register::Bh,
    ];
    pub(crate) const WORD: [Register; 8] = [
        Register::Ax, Register::Cx, Register::Dx, Register::Bx,
        Register::Sp, Register::Bp, Register::Si, Register::Di,
    ];
    pub(crate) const DWORD: [Register; 8] = [
        Register::Eax, Register::Ecx, Register::Edx, Register::Ebx,
        Register::Esp, Register::Ebp, Register::Esi, Register::Edi,
    ];
    const FPU: [Register; 8] = [
        Register::St0, Register::St1, Register::St2, Register::St3,
        Register::St4, Register::St5, Register::St6, Register::St7,
    ];

    /// General purpose register selected by a 3-bit field at `size`.
    pub fn general(size: OperandSize, number: u8) -> Register {
        let n = (number & 7) as usize;
        match size {
            OperandSize::Byte => Self::BYTE[n],
            OperandSize::Dword => Self::DWORD[n],
            _ => Self::WORD[n],
        }
    }

    /// Segment register selected by a 3-bit field; FS/GS do not exist here.
    pub fn segment(number: u8) -> Option<Register> {
        match number {
            0 => Some(Register::Es),
            1 => Some(Register::Cs),
            2 => Some(Register::Ss),
            3 => Some(Register::Ds),
            _ => None,
        }
    }

    /// FPU stack register ST(i)
    pub fn fpu(number: u8) -> Register {
        Self::FPU[(number & 7) as usize]
    }

    /// Widen a 16-bit general register to the given operand size.
    pub fn widen(self, size: OperandSize) -> Register {
        match (self.class(), size) {
            (RegisterClass::Word, OperandSize::Dword) => {
                let n = Self::WORD.iter().position(|r| *r == self).unwrap_or(0);
                Self::DWORD[n]
            }
            _ => self,
        }
    }

    /// Register class
    pub fn class(self) -> RegisterClass {
        use Register::*;

        match self {
            Al | Cl | Dl | Bl => RegisterClass::ByteLow,
            Ah | Ch | Dh | Bh => RegisterClass::ByteHigh,
            Ax | Cx | Dx | Bx | Sp | Bp | Si | Di => RegisterClass::Word,
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi => RegisterClass::Dword,
            Es | Cs | Ss | Ds => RegisterClass::Segment,
            St0 | St1 | St2 | St3 | St4 | St5 | St6 | St7 => RegisterClass::Fpu,
        }
    }
}

/// Width of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
    Qword,
    Tbyte,
}

impl OperandSize {
    fn ptr_keyword(self) -> &'static str {
        match self {
            OperandSize::Byte => "byte",
            OperandSize::Word => "word",
            OperandSize::Dword => "dword",
            OperandSize::Qword => "qword",
            OperandSize::Tbyte => "tbyte",
        }
    }

    fn mask(self) -> u32 {
        match self {
            OperandSize::Byte => 0xFF,
            OperandSize::Word => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }
}

bitflags! {
    /// Legacy prefixes present on an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Prefixes: u16 {
        const LOCK = 0x0001;
        const REPNE = 0x0002;
        const REP = 0x0004;
        const ES = 0x0010;
        const CS = 0x0020;
        const SS = 0x0040;
        const DS = 0x0080;
        const OPERAND_SIZE = 0x0100;
        const ADDRESS_SIZE = 0x0200;
    }
}

/// Byte sub-range of an instruction holding an operand's encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRange {
    /// Offset from the first byte of the instruction
    pub start: u8,
    /// Length in bytes
    pub len: u8,
}

impl FieldRange {
    pub(crate) fn new(start: usize, len: usize) -> Self {
        Self { start: start as u8, len: len as u8 }
    }

    /// As a byte range into the instruction encoding
    pub fn range(&self) -> Range<usize> {
        self.start as usize..(self.start + self.len) as usize
    }
}

/// Immediate operand, sign-extended to 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImmediateOperand {
    pub value: i32,
    pub size: OperandSize,
    /// `None` for implicit constants (`shl ax, 1`, `int 3`)
    pub field: Option<FieldRange>,
}

/// `segment:[base+index*scale+displacement]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    /// `None` for unsized operands (LEA, FLDENV, ...)
    pub size: Option<OperandSize>,
    /// Explicit segment override, if any
    pub segment_override: Option<Register>,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub displacement: i32,
    pub field: Option<FieldRange>,
}

impl MemoryOperand {
    /// Segment register the access goes through.
    pub fn effective_segment(&self) -> Register {
        match (self.segment_override, self.base) {
            (Some(segment), _) => segment,
            (None, Some(Register::Bp)) => Register::Ss,
            _ => Register::Ds,
        }
    }

    /// A direct `[disp16]` reference with no base or index register.
    pub fn is_direct(&self) -> bool {
        self.base.is_none() && self.index.is_none()
    }
}

/// Branch displacement, relative to the end of the instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeOperand {
    pub displacement: i32,
    pub size: OperandSize,
    pub field: FieldRange,
}

impl RelativeOperand {
    /// Absolute target given the address just past the instruction.
    pub fn target(&self, instruction_end: Address) -> Address {
        instruction_end.offset_by(self.displacement)
    }
}

/// Far `segment:offset` literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointerOperand {
    pub segment: u16,
    pub offset: u32,
    pub field: FieldRange,
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Immediate(ImmediateOperand),
    Register(Register),
    Memory(MemoryOperand),
    Relative(RelativeOperand),
    Pointer(PointerOperand),
}

impl Operand {
    /// Bytes of the instruction a relocation fix-up could apply to.
    pub fn fixup_range(&self) -> Option<Range<usize>> {
        match self {
            Operand::Immediate(imm) => imm.field.map(|f| f.range()),
            Operand::Register(_) => None,
            Operand::Memory(mem) => mem.field.map(|f| f.range()),
            Operand::Relative(rel) => Some(rel.field.range()),
            Operand::Pointer(ptr) => Some(ptr.field.range()),
        }
    }
}

/// One decoded instruction. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    operation: Operation,
    prefixes: Prefixes,
    length: u8,
    operands: Vec<Operand>,
    bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Instruction {
    pub(crate) fn new(
        operation: Operation,
        prefixes: Prefixes,
        encoding: &[u8],
        operands: Vec<Operand>,
    ) -> Self {
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        let length = encoding.len().min(MAX_INSTRUCTION_SIZE);
        bytes[..length].copy_from_slice(&encoding[..length]);

        Self {
            operation,
            prefixes,
            length: length as u8,
            operands,
            bytes,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn prefixes(&self) -> Prefixes {
        self.prefixes
    }

    /// Number of bytes consumed by the encoding
    pub fn encoded_length(&self) -> usize {
        self.length as usize
    }

    /// The raw encoding
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn flow_type(&self) -> FlowType {
        self.operation.flow_type()
    }

    /// Target of a relative branch located at `location`.
    pub fn branch_target(&self, location: Address) -> Option<Address> {
        let end = location.offset_by(self.length as i32);
        self.operands.iter().find_map(|op| match op {
            Operand::Relative(rel) => Some(rel.target(end)),
            _ => None,
        })
    }

    /// Byte ranges of all operands eligible for relocation fix-ups.
    pub fn fixup_ranges(&self) -> Vec<Range<usize>> {
        self.operands.iter().filter_map(Operand::fixup_range).collect()
    }

    /// Format with relative targets resolved against `location`.
    pub fn display_at<'a>(
        &'a self,
        location: Address,
        symbols: Option<&'a dyn SymbolResolver>,
    ) -> impl fmt::Display + 'a {
        InstructionDisplay {
            instruction: self,
            location: Some(location),
            symbols,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        InstructionDisplay {
            instruction: self,
            location: None,
            symbols: None,
        }
        .fmt(f)
    }
}

struct InstructionDisplay<'a> {
    instruction: &'a Instruction,
    location: Option<Address>,
    symbols: Option<&'a dyn SymbolResolver>,
}

impl fmt::Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let insn = self.instruction;
        let prefixes = insn.prefixes;

        if prefixes.contains(Prefixes::LOCK) {
            f.write_str("lock ")?;
        }
        if prefixes.contains(Prefixes::REP) {
            f.write_str("rep ")?;
        }
        if prefixes.contains(Prefixes::REPNE) {
            f.write_str("repne ")?;
        }

        // Segment overrides print inside memory operands; show them here
        // only when there is no memory operand to carry them.
        let has_memory = insn.operands.iter().any(|op| matches!(op, Operand::Memory(_)));
        if !has_memory {
            for (flag, name) in [
                (Prefixes::ES, "es"),
                (Prefixes::CS, "cs"),
                (Prefixes::SS, "ss"),
                (Prefixes::DS, "ds"),
            ] {
                if prefixes.contains(flag) {
                    write!(f, "{}: ", name)?;
                }
            }
        }

        f.write_str(insn.operation.mnemonic())?;

        for (i, operand) in insn.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            self.write_operand(f, operand)?;
        }
        Ok(())
    }
}

impl InstructionDisplay<'_> {
    fn write_operand(&self, f: &mut fmt::Formatter<'_>, operand: &Operand) -> fmt::Result {
        match operand {
            Operand::Immediate(imm) => write!(f, "{:#x}", imm.value as u32 & imm.size.mask()),
            Operand::Register(reg) => write!(f, "{}", reg),
            Operand::Memory(mem) => {
                if let Some(size) = mem.size {
                    write!(f, "{} ptr ", size.ptr_keyword())?;
                }
                if let Some(segment) = mem.segment_override {
                    write!(f, "{}:", segment)?;
                }
                if mem.is_direct() {
                    return write!(f, "[{:#x}]", mem.displacement as u32 & 0xFFFF);
                }
                f.write_str("[")?;
                let registers: Vec<String> = mem
                    .base
                    .iter()
                    .chain(mem.index.iter())
                    .map(|r| r.to_string())
                    .collect();
                f.write_str(&registers.join("+"))?;
                if mem.scale > 1 {
                    write!(f, "*{}", mem.scale)?;
                }
                match mem.displacement {
                    0 => {}
                    d if d < 0 => write!(f, "-{:#x}", d.unsigned_abs())?,
                    d => write!(f, "+{:#x}", d)?,
                }
                f.write_str("]")
            }
            Operand::Relative(rel) => match self.location {
                Some(location) => {
                    let target = rel.target(location.offset_by(self.instruction.length as i32));
                    match self.symbols.and_then(|s| s.resolve(target)) {
                        Some(label) => f.write_str(label),
                        None => write!(f, "{:#06x}", target.offset),
                    }
                }
                None => {
                    let delta = rel.displacement + self.instruction.length as i32;
                    if delta < 0 {
                        write!(f, "$-{:#x}", delta.unsigned_abs())
                    } else {
                        write!(f, "$+{:#x}", delta)
                    }
                }
            },
            Operand::Pointer(ptr) => write!(f, "{:#06x}:{:#06x}", ptr.segment, ptr.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mov_ax_1() -> Instruction {
        Instruction::new(
            Operation::Mov,
            Prefixes::empty(),
            &[0xb8, 0x01, 0x00],
            vec![
                Operand::Register(Register::Ax),
                Operand::Immediate(ImmediateOperand {
                    value: 1,
                    size: OperandSize::Word,
                    field: Some(FieldRange::new(1, 2)),
                }),
            ],
        )
    }

    #[test]
    fn test_instruction_bytes() {
        let insn = mov_ax_1();
        assert_eq!(insn.bytes(), &[0xb8, 0x01, 0x00]);
        assert_eq!(insn.encoded_length(), 3);
        assert_eq!(insn.to_string(), "mov ax, 0x1");
    }

    #[test]
    fn test_fixup_ranges() {
        let insn = mov_ax_1();
        assert_eq!(insn.fixup_ranges(), vec![1..3]);
    }

    #[test]
    fn test_flow_classification() {
        assert_eq!(Operation::Jcxz.flow_type(), FlowType::ConditionalJump);
        assert_eq!(Operation::Callf.flow_type(), FlowType::FarCall);
        assert_eq!(Operation::Mov.flow_type(), FlowType::None);

        assert!(FlowType::ConditionalJump.falls_through());
        assert!(FlowType::NearCall.falls_through());
        assert!(FlowType::Interrupt.falls_through());
        assert!(!FlowType::NearJump.falls_through());
        assert!(!FlowType::Halt.falls_through());
        assert!(!FlowType::FarReturn.falls_through());
    }

    #[test]
    fn test_register_classes() {
        assert_eq!(Register::general(OperandSize::Byte, 4), Register::Ah);
        assert_eq!(Register::Ah.class(), RegisterClass::ByteHigh);
        assert_eq!(Register::Bl.class(), RegisterClass::ByteLow);
        assert_eq!(Register::Si.widen(OperandSize::Dword), Register::Esi);
        assert_eq!(Register::Es.widen(OperandSize::Dword), Register::Es);
        assert_eq!(Register::segment(4), None);
        assert_eq!(Register::St3.to_string(), "st(3)");
    }

    #[test]
    fn test_relative_display() {
        let jmp = Instruction::new(
            Operation::Jmp,
            Prefixes::empty(),
            &[0xeb, 0xfe],
            vec![Operand::Relative(RelativeOperand {
                displacement: -2,
                size: OperandSize::Byte,
                field: FieldRange::new(1, 1),
            })],
        );
        assert_eq!(jmp.to_string(), "jmp $+0x0");
        assert_eq!(jmp.branch_target(Address::new(0, 0x10)), Some(Address::new(0, 0x10)));
        assert_eq!(jmp.display_at(Address::new(0, 0x10), None).to_string(), "jmp 0x0010");
    }

    #[test]
    fn test_memory_segment_defaults() {
        let mem = MemoryOperand {
            size: Some(OperandSize::Word),
            segment_override: None,
            base: Some(Register::Bp),
            index: Some(Register::Si),
            scale: 1,
            displacement: -4,
            field: Some(FieldRange::new(2, 1)),
        };
        assert_eq!(mem.effective_segment(), Register::Ss);

        let insn = Instruction::new(
            Operation::Mov,
            Prefixes::empty(),
            &[0x8b, 0x42, 0xfc],
            vec![Operand::Register(Register::Ax), Operand::Memory(mem)],
        );
        assert_eq!(insn.to_string(), "mov ax, word ptr [bp+si-0x4]");
    }
}
