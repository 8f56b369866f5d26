//! Table-driven 16-bit x86 instruction decoder.
//!
//! Decoding is pure: each call copies the caller's [`DecoderContext`] into
//! a fresh per-call state, so no mutable state survives between calls and a
//! single [`X86Decoder`] can be shared across threads.

mod fpu;
pub(crate) mod tables;

use crate::instruction::{
    FieldRange, ImmediateOperand, Instruction, MemoryOperand, Operand, OperandSize, Operation,
    PointerOperand, Prefixes, Register, RelativeOperand,
};
use crate::Decoder;

use fpu::FpuOperands;
use tables::{Arg, OpcodeEntry, ONE_BYTE};

/// Errors that can occur while decoding one instruction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The byte window ended mid-instruction
    #[error("Instruction runs past the end of the byte window")]
    Truncated,

    /// No instruction is mapped to this opcode byte
    #[error("Invalid opcode {0:#04x}")]
    InvalidOpcode(u8),

    /// Two prefixes from the same prefix group
    #[error("Conflicting prefix {0:#04x}")]
    ConflictingPrefix(u8),

    /// The ModR/M byte selects an operand the opcode does not allow
    #[error("Invalid operand encoding for opcode {0:#04x}")]
    InvalidOperand(u8),

    /// A memory operand under the address-size prefix (32-bit addressing)
    #[error("32-bit addressing is not supported")]
    UnsupportedAddressSize,
}

/// Caller-supplied decode context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderContext {
    /// Size of `v` operands before any operand-size prefix
    pub operand_size: OperandSize,
    /// Address size before any address-size prefix
    pub address_size: OperandSize,
    /// Segment override applied to memory operands without an explicit prefix
    pub segment_override: Option<Register>,
}

impl Default for DecoderContext {
    fn default() -> Self {
        Self {
            operand_size: OperandSize::Word,
            address_size: OperandSize::Word,
            segment_override: None,
        }
    }
}

/// Real-mode x86 decoder.
#[derive(Debug, Clone, Default)]
pub struct X86Decoder {
    context: DecoderContext,
}

impl X86Decoder {
    /// Create a decoder with the default 16-bit context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder with an explicit context
    pub fn with_context(context: DecoderContext) -> Self {
        Self { context }
    }
}

impl Decoder for X86Decoder {
    fn decode(&self, code: &[u8]) -> Result<Instruction, DecodeError> {
        decode(code, &self.context)
    }
}

/// Decode a single instruction from the start of `code`.
///
/// `code` bounds the decode window; reading past its end fails with
/// [`DecodeError::Truncated`].
pub fn decode(code: &[u8], context: &DecoderContext) -> Result<Instruction, DecodeError> {
    let mut state = DecodeState::new(code, context);
    state.read_prefixes()?;

    let opcode = state.read_u8()?;
    state.opcode = opcode;

    let (operation, operands) = match ONE_BYTE[opcode as usize] {
        OpcodeEntry::Invalid | OpcodeEntry::Prefix => return Err(DecodeError::InvalidOpcode(opcode)),
        OpcodeEntry::TwoByte => {
            let second = state.read_u8()?;
            state.decode_entry(tables::two_byte(second), second)?
        }
        OpcodeEntry::Fpu => state.decode_fpu()?,
        entry => state.decode_entry(entry, opcode)?,
    };

    Ok(Instruction::new(operation, state.prefixes, &code[..state.pos], operands))
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl ModRm {
    fn from_byte(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }
}

struct DecodeState<'a> {
    code: &'a [u8],
    pos: usize,
    prefixes: Prefixes,
    operand_size: OperandSize,
    address_size: OperandSize,
    segment_override: Option<Register>,
    opcode: u8,
    modrm: Option<ModRm>,
}

impl<'a> DecodeState<'a> {
    fn new(code: &'a [u8], context: &DecoderContext) -> Self {
        Self {
            code,
            pos: 0,
            prefixes: Prefixes::empty(),
            operand_size: context.operand_size,
            address_size: context.address_size,
            segment_override: context.segment_override,
            opcode: 0,
            modrm: None,
        }
    }

    fn peek_u8(&self) -> Option<u8> {
        self.code.get(self.pos).copied()
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek_u8().ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.read_u16()?;
        let hi = self.read_u16()?;
        Ok(lo as u32 | (hi as u32) << 16)
    }

    /// Read a little-endian value of `size` bytes, sign-extended to 32 bits.
    fn read_signed(&mut self, size: OperandSize) -> Result<(i32, FieldRange), DecodeError> {
        let start = self.pos;
        let value = match size {
            OperandSize::Byte => self.read_u8()? as i8 as i32,
            OperandSize::Word => self.read_u16()? as i16 as i32,
            _ => self.read_u32()? as i32,
        };
        Ok((value, FieldRange::new(start, self.pos - start)))
    }

    fn read_prefixes(&mut self) -> Result<(), DecodeError> {
        let mut groups = [false; 4];

        while let Some(byte) = self.peek_u8() {
            let (group, flag) = match byte {
                0xF0 => (0, Prefixes::LOCK),
                0xF2 => (0, Prefixes::REPNE),
                0xF3 => (0, Prefixes::REP),
                0x26 => (1, Prefixes::ES),
                0x2E => (1, Prefixes::CS),
                0x36 => (1, Prefixes::SS),
                0x3E => (1, Prefixes::DS),
                0x66 => (2, Prefixes::OPERAND_SIZE),
                0x67 => (3, Prefixes::ADDRESS_SIZE),
                _ => break,
            };
            if groups[group] {
                return Err(DecodeError::ConflictingPrefix(byte));
            }
            groups[group] = true;
            self.pos += 1;
            self.prefixes |= flag;

            match byte {
                0x26 => self.segment_override = Some(Register::Es),
                0x2E => self.segment_override = Some(Register::Cs),
                0x36 => self.segment_override = Some(Register::Ss),
                0x3E => self.segment_override = Some(Register::Ds),
                0x66 => self.operand_size = toggle(self.operand_size),
                0x67 => self.address_size = toggle(self.address_size),
                _ => {}
            }
        }
        Ok(())
    }

    fn read_modrm(&mut self) -> Result<ModRm, DecodeError> {
        if let Some(modrm) = self.modrm {
            return Ok(modrm);
        }
        let modrm = ModRm::from_byte(self.read_u8()?);
        self.modrm = Some(modrm);
        Ok(modrm)
    }

    fn decode_entry(
        &mut self,
        entry: OpcodeEntry,
        opcode: u8,
    ) -> Result<(Operation, Vec<Operand>), DecodeError> {
        let entry = match entry {
            OpcodeEntry::Extension(group) => {
                let modrm = self.read_modrm()?;
                group.members()[modrm.reg as usize]
            }
            other => {
                if other.needs_modrm() {
                    self.read_modrm()?;
                }
                other
            }
        };

        let OpcodeEntry::Op(operation, args) = entry else {
            return Err(DecodeError::InvalidOpcode(opcode));
        };

        let mut operands = Vec::with_capacity(3);
        for arg in args.into_iter().take_while(|a| *a != Arg::Absent) {
            operands.push(self.decode_operand(arg)?);
        }
        Ok((operation, operands))
    }

    fn decode_operand(&mut self, arg: Arg) -> Result<Operand, DecodeError> {
        let vsize = self.operand_size;

        let operand = match arg {
            Arg::Absent => return Err(DecodeError::InvalidOperand(self.opcode)),
            Arg::Eb => self.decode_rm(Some(OperandSize::Byte), false)?,
            Arg::Ew => self.decode_rm(Some(OperandSize::Word), false)?,
            Arg::Ev => self.decode_rm(Some(vsize), false)?,
            Arg::M => self.decode_rm(None, true)?,
            Arg::Mp => self.decode_rm(Some(OperandSize::Dword), true)?,
            Arg::Gb => Operand::Register(Register::general(OperandSize::Byte, self.read_modrm()?.reg)),
            Arg::Gw => Operand::Register(Register::general(OperandSize::Word, self.read_modrm()?.reg)),
            Arg::Gv => Operand::Register(Register::general(vsize, self.read_modrm()?.reg)),
            Arg::Sw => {
                let reg = self.read_modrm()?.reg;
                let segment = Register::segment(reg).ok_or(DecodeError::InvalidOperand(self.opcode))?;
                Operand::Register(segment)
            }
            Arg::Ib => self.immediate(OperandSize::Byte, OperandSize::Byte)?,
            Arg::Iw => self.immediate(OperandSize::Word, OperandSize::Word)?,
            Arg::Iv => self.immediate(vsize, vsize)?,
            Arg::Ibs => self.immediate(OperandSize::Byte, vsize)?,
            Arg::Jb => self.relative(OperandSize::Byte)?,
            Arg::Jv => self.relative(vsize)?,
            Arg::Ap => {
                let start = self.pos;
                let offset = match vsize {
                    OperandSize::Dword => self.read_u32()?,
                    _ => self.read_u16()? as u32,
                };
                let segment = self.read_u16()?;
                Operand::Pointer(PointerOperand {
                    segment,
                    offset,
                    field: FieldRange::new(start, self.pos - start),
                })
            }
            Arg::Ob => self.direct(OperandSize::Byte)?,
            Arg::Ov => self.direct(vsize)?,
            Arg::Reg(register) => Operand::Register(register),
            Arg::RegV(register) => Operand::Register(register.widen(vsize)),
            Arg::Const(value) => Operand::Immediate(ImmediateOperand {
                value,
                size: OperandSize::Byte,
                field: None,
            }),
        };
        Ok(operand)
    }

    fn immediate(&mut self, encoded: OperandSize, size: OperandSize) -> Result<Operand, DecodeError> {
        let (value, field) = self.read_signed(encoded)?;
        Ok(Operand::Immediate(ImmediateOperand {
            value,
            size,
            field: Some(field),
        }))
    }

    fn relative(&mut self, size: OperandSize) -> Result<Operand, DecodeError> {
        let (displacement, field) = self.read_signed(size)?;
        Ok(Operand::Relative(RelativeOperand {
            displacement,
            size,
            field,
        }))
    }

    /// `moffs` operand: a bare 16-bit offset with no ModR/M byte.
    fn direct(&mut self, size: OperandSize) -> Result<Operand, DecodeError> {
        if self.address_size != OperandSize::Word {
            return Err(DecodeError::UnsupportedAddressSize);
        }
        let (displacement, field) = self.read_signed(OperandSize::Word)?;
        Ok(Operand::Memory(MemoryOperand {
            size: Some(size),
            segment_override: self.segment_override,
            base: None,
            index: None,
            scale: 1,
            displacement,
            field: Some(field),
        }))
    }

    /// ModR/M r/m operand. With `memory_only`, a register encoding is rejected.
    fn decode_rm(&mut self, size: Option<OperandSize>, memory_only: bool) -> Result<Operand, DecodeError> {
        let modrm = self.read_modrm()?;
        if modrm.mode == 3 {
            if memory_only {
                return Err(DecodeError::InvalidOperand(self.opcode));
            }
            let size = size.unwrap_or(self.operand_size);
            return Ok(Operand::Register(Register::general(size, modrm.rm)));
        }
        self.memory(modrm, size)
    }

    fn memory(&mut self, modrm: ModRm, size: Option<OperandSize>) -> Result<Operand, DecodeError> {
        if self.address_size != OperandSize::Word {
            return Err(DecodeError::UnsupportedAddressSize);
        }

        let (base, index) = match modrm.rm {
            0 => (Some(Register::Bx), Some(Register::Si)),
            1 => (Some(Register::Bx), Some(Register::Di)),
            2 => (Some(Register::Bp), Some(Register::Si)),
            3 => (Some(Register::Bp), Some(Register::Di)),
            4 => (Some(Register::Si), None),
            5 => (Some(Register::Di), None),
            6 if modrm.mode == 0 => (None, None),
            6 => (Some(Register::Bp), None),
            _ => (Some(Register::Bx), None),
        };

        let (displacement, field) = match (modrm.mode, base) {
            (0, None) => {
                let (value, field) = self.read_signed(OperandSize::Word)?;
                (value, Some(field))
            }
            (1, _) => {
                let (value, field) = self.read_signed(OperandSize::Byte)?;
                (value, Some(field))
            }
            (2, _) => {
                let (value, field) = self.read_signed(OperandSize::Word)?;
                (value, Some(field))
            }
            _ => (0, None),
        };

        Ok(Operand::Memory(MemoryOperand {
            size,
            segment_override: self.segment_override,
            base,
            index,
            scale: 1,
            displacement,
            field,
        }))
    }

    fn decode_fpu(&mut self) -> Result<(Operation, Vec<Operand>), DecodeError> {
        let escape = self.opcode;
        let modrm = self.read_modrm()?;

        if modrm.mode != 3 {
            let (operation, size) =
                fpu::memory_form(escape, modrm.reg).ok_or(DecodeError::InvalidOpcode(escape))?;
            let operand = self.memory(modrm, size)?;
            return Ok((operation, vec![operand]));
        }

        let (operation, form) =
            fpu::register_form(escape, modrm.reg, modrm.rm).ok_or(DecodeError::InvalidOpcode(escape))?;
        let sti = Operand::Register(Register::fpu(modrm.rm));
        let st0 = Operand::Register(Register::St0);
        let operands = match form {
            FpuOperands::None => Vec::new(),
            FpuOperands::St0Sti => vec![st0, sti],
            FpuOperands::StiSt0 => vec![sti, st0],
            FpuOperands::Sti => vec![sti],
            FpuOperands::Ax => vec![Operand::Register(Register::Ax)],
        };
        Ok((operation, operands))
    }
}

fn toggle(size: OperandSize) -> OperandSize {
    match size {
        OperandSize::Dword => OperandSize::Word,
        _ => OperandSize::Dword,
    }
}
