//! Worklist-driven flow analysis.
//!
//! A [`FlowAnalyzer`] pulls cross-references off the session's priority
//! worklist, decodes basic blocks at their targets and pushes the
//! references those blocks produce. Everything it learns is written into an
//! [`AnalysisSession`], which owns all mutable analysis state for one run.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::instruction::{FlowType, Instruction, Operand, OperandSize, Operation, Register};
use crate::{Address, Decoder, ImageProvider};

use super::block::{BasicBlock, BasicBlockStore, BasicBlockType};
use super::bytes::{ByteStore, ByteType};
use super::diagnostics::{ErrorCode, ErrorCollection};
use super::worklist::Worklist;
use super::xref::{XRef, XRefCollection, XRefType};
use super::AnalysisError;

/// Highest offset a real-mode segment can address.
const MAX_OFFSET: i32 = 0xFFFF;

/// Tuning knobs for a flow analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Stop probing a jump table after this many entries
    pub max_jump_table_entries: usize,
    /// Close a block as `FallThrough` after this many instructions
    pub max_block_instructions: usize,
    /// Derive procedures and the call graph after the worklist drains
    pub build_procedures: bool,
    /// Polled between worklist items; setting it aborts the run
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_jump_table_entries: 256,
            max_block_instructions: 4096,
            build_procedures: true,
            cancel_flag: None,
        }
    }
}

/// Decoded instructions by address.
#[derive(Debug, Clone, Default)]
pub struct InstructionIndex {
    instructions: BTreeMap<Address, Instruction>,
}

impl InstructionIndex {
    pub fn insert(&mut self, address: Address, instruction: Instruction) {
        self.instructions.insert(address, instruction);
    }

    pub fn get(&self, address: Address) -> Option<&Instruction> {
        self.instructions.get(&address)
    }

    /// Instructions starting in `[start, end)`
    pub fn in_range(&self, start: Address, end: Address) -> impl Iterator<Item = (Address, &Instruction)> {
        self.instructions.range(start..end).map(|(a, i)| (*a, i))
    }

    /// The instruction starting closest before `address` in the same segment.
    pub fn last_before(&self, address: Address) -> Option<(Address, &Instruction)> {
        self.instructions
            .range((Bound::Unbounded, Bound::Excluded(address)))
            .next_back()
            .filter(|(a, _)| a.segment == address.segment)
            .map(|(a, i)| (*a, i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, &Instruction)> {
        self.instructions.iter().map(|(a, i)| (*a, i))
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// All mutable state of one analysis run.
#[derive(Debug, Default)]
pub struct AnalysisSession {
    pub bytes: ByteStore,
    pub blocks: BasicBlockStore,
    pub xrefs: XRefCollection,
    pub errors: ErrorCollection,
    pub instructions: InstructionIndex,
    pub(crate) worklist: Worklist,
    jump_tables: HashMap<Address, usize>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a cross-reference without running the analysis.
    pub fn enqueue(&mut self, xref: XRef) {
        self.worklist.push(xref);
    }

    /// Number of queued cross-references
    pub fn pending(&self) -> usize {
        self.worklist.len()
    }

    fn add_xref(&mut self, xref: XRef) {
        if let Err(err) = self.xrefs.add(xref) {
            log::warn!("Dropping {} reference at {}: {}", xref.xref_type, xref.source, err);
        }
    }
}

enum Target {
    Resolved(Address),
    Dynamic,
    Wrapped,
}

/// Flow analysis engine over one image.
pub struct FlowAnalyzer<'a> {
    image: &'a dyn ImageProvider,
    decoder: &'a dyn Decoder,
    options: AnalysisOptions,
}

impl<'a> FlowAnalyzer<'a> {
    pub fn new(image: &'a dyn ImageProvider, decoder: &'a dyn Decoder, options: AnalysisOptions) -> Self {
        Self {
            image,
            decoder,
            options,
        }
    }

    /// Seed the worklist with `entry` and run it to exhaustion.
    pub fn analyze(
        &self,
        session: &mut AnalysisSession,
        entry: Address,
        entry_type: XRefType,
    ) -> Result<(), AnalysisError> {
        if !entry.is_valid() {
            return Err(AnalysisError::UnanchoredXRef);
        }
        session.enqueue(XRef::new(entry_type, Address::INVALID, entry));
        self.run(session)
    }

    /// Drain the worklist.
    ///
    /// On cancellation the session keeps whatever was built so far and the
    /// remaining items stay queued.
    pub fn run(&self, session: &mut AnalysisSession) -> Result<(), AnalysisError> {
        while !session.worklist.is_empty() {
            if self.cancelled() {
                log::info!("Analysis cancelled with {} item(s) pending", session.worklist.len());
                return Err(AnalysisError::Cancelled);
            }
            if let Some(xref) = session.worklist.pop() {
                self.process(session, xref);
            }
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn process(&self, session: &mut AnalysisSession, xref: XRef) {
        log::debug!("{} {} -> {}", xref.xref_type, xref.source, xref.target);

        if xref.xref_type == XRefType::NearIndexedJump && !xref.target.is_valid() {
            self.resolve_jump_table_slot(session, xref);
            return;
        }

        if !xref.target.is_valid() {
            session.errors.push(
                xref.source,
                ErrorCode::DynamicTarget,
                format!("{} target is computed at run time", xref.xref_type),
            );
        } else {
            self.analyze_target(session, xref);
        }
        session.add_xref(xref);
    }

    fn analyze_target(&self, session: &mut AnalysisSession, xref: XRef) {
        let target = xref.target;
        if !self.image.is_address_valid(target) {
            session.errors.push(
                target,
                ErrorCode::OutOfImage,
                format!("{} from {} leaves the image", xref.xref_type, xref.source),
            );
            return;
        }

        let attribute = session.bytes.get(target);
        match attribute.byte_type() {
            ByteType::Data | ByteType::Padding => {
                session.errors.push(
                    target,
                    ErrorCode::RanIntoData,
                    format!("{} from {} lands in data", xref.xref_type, xref.source),
                );
            }
            ByteType::Code if session.blocks.starting_at(target).is_some() => {}
            ByteType::Code if !attribute.is_lead() => {
                session.errors.push(
                    target,
                    ErrorCode::RanIntoCode,
                    format!("{} from {} lands inside an instruction", xref.xref_type, xref.source),
                );
            }
            ByteType::Code => self.split_block(session, target),
            ByteType::Unknown => self.decode_block(session, target),
        }
    }

    /// Split the block containing `cutoff` and link the halves.
    fn split_block(&self, session: &mut AnalysisSession, cutoff: Address) {
        match session.blocks.split(cutoff) {
            Ok((head, tail)) => {
                log::debug!("Split block {} at {} (new block {})", head, cutoff, tail);
                if let Some((previous, _)) = session.instructions.last_before(cutoff) {
                    session.add_xref(XRef::new(XRefType::FallThrough, previous, cutoff));
                }
            }
            Err(err) => log::warn!("Cannot split at {}: {}", cutoff, err),
        }
    }

    /// Decode straight-line code from `start` until a flow instruction or
    /// an obstacle ends the block.
    fn decode_block(&self, session: &mut AnalysisSession, start: Address) {
        let mut at = start;
        let mut count = 0usize;

        let block_type = loop {
            if count >= self.options.max_block_instructions {
                session.enqueue(XRef::new(XRefType::FallThrough, self.previous(session, at), at));
                break BasicBlockType::FallThrough;
            }

            let Some(window) = self.image.segment_tail(at) else {
                session.errors.push(at, ErrorCode::OutOfImage, "Execution runs past the end of the segment");
                break BasicBlockType::Broken;
            };

            let instruction = match self.decoder.decode(window) {
                Ok(instruction) => instruction,
                Err(err) => {
                    session.errors.push(at, ErrorCode::InvalidInstruction, err.to_string());
                    break BasicBlockType::Broken;
                }
            };

            let end = at.offset_by(instruction.encoded_length() as i32);
            if !session.bytes.is_range_unknown(at, end) {
                session.errors.push(
                    at,
                    ErrorCode::OverlappingInstruction,
                    format!("{} overlaps already classified bytes", instruction),
                );
                break BasicBlockType::Broken;
            }
            if let Err(err) = session.bytes.mark_range(at, end, ByteType::Code) {
                log::warn!("Cannot classify {} as code: {}", at, err);
                break BasicBlockType::Broken;
            }
            log::trace!("{}  {}", at, instruction.display_at(at, None));

            let flow = instruction.flow_type();
            if flow.is_flow_affecting() {
                self.flow_references(session, at, &instruction);
                session.instructions.insert(at, instruction);
                at = end;
                break block_type_for(flow);
            }

            session.instructions.insert(at, instruction);
            let previous = at;
            at = end;
            count += 1;

            match session.bytes.get(at).byte_type() {
                ByteType::Unknown => {}
                ByteType::Code => {
                    session.enqueue(XRef::new(XRefType::FallThrough, previous, at));
                    break BasicBlockType::FallThrough;
                }
                ByteType::Data | ByteType::Padding => {
                    session.errors.push(at, ErrorCode::RanIntoData, "Execution runs into data");
                    break BasicBlockType::Broken;
                }
            }
        };

        if at == start {
            return;
        }
        if block_type == BasicBlockType::Broken {
            session.errors.push(
                start,
                ErrorCode::BrokenBasicBlock,
                format!("Block ends abnormally at {}", at),
            );
        }

        match BasicBlock::from_range(start, at, block_type).and_then(|b| session.blocks.add(b)) {
            Ok(id) => log::debug!("Block {} [{}, {:04X}) {}", id, start, at.offset, block_type),
            Err(err) => log::warn!("Cannot record block at {}: {}", start, err),
        }
    }

    fn previous(&self, session: &AnalysisSession, at: Address) -> Address {
        session
            .instructions
            .last_before(at)
            .map(|(address, _)| address)
            .unwrap_or(Address::INVALID)
    }

    /// Emit the references of a flow instruction at `at`.
    fn flow_references(&self, session: &mut AnalysisSession, at: Address, instruction: &Instruction) {
        let flow = instruction.flow_type();
        let end = at.offset_by(instruction.encoded_length() as i32);

        let xref_type = match flow {
            FlowType::None => return,
            FlowType::ConditionalJump => XRefType::ConditionalJump,
            FlowType::NearJump => XRefType::NearJump,
            FlowType::FarJump => XRefType::FarJump,
            FlowType::NearCall => XRefType::NearCall,
            FlowType::FarCall => XRefType::FarCall,
            FlowType::Interrupt => XRefType::Interrupt,
            FlowType::InterruptReturn => XRefType::InterruptReturn,
            FlowType::NearReturn => XRefType::NearReturn,
            FlowType::FarReturn => XRefType::FarReturn,
            FlowType::Halt => XRefType::Halt,
        };

        match flow {
            FlowType::Interrupt
            | FlowType::InterruptReturn
            | FlowType::NearReturn
            | FlowType::FarReturn
            | FlowType::Halt => {
                session.add_xref(XRef::new(xref_type, at, Address::INVALID));
            }
            _ => {
                if let Some(slot) = jump_table_slot(at, instruction) {
                    log::debug!("Jump table candidate at {} for {}", slot, at);
                    session.enqueue(XRef::indexed(at, slot));
                }
                match self.resolve_target(session, at, instruction) {
                    Target::Resolved(target) => session.enqueue(XRef::new(xref_type, at, target)),
                    Target::Dynamic => session.enqueue(XRef::new(xref_type, at, Address::INVALID)),
                    // Recorded for listings but never followed
                    Target::Wrapped => session.add_xref(XRef::new(xref_type, at, Address::INVALID)),
                }
            }
        }

        if flow.falls_through() {
            session.enqueue(XRef::new(XRefType::FallThrough, at, end));
        }
    }

    /// Static target of a jump or call. Memory and far pointer operands are
    /// never resolved.
    fn resolve_target(&self, session: &mut AnalysisSession, at: Address, instruction: &Instruction) -> Target {
        let Some(target) = instruction.branch_target(at) else {
            return Target::Dynamic;
        };
        if !(0..=MAX_OFFSET).contains(&target.offset) {
            session.errors.push(
                at,
                ErrorCode::AddressWrapped,
                format!("Branch target {:#x} wraps around the segment", target.offset),
            );
            return Target::Wrapped;
        }
        Target::Resolved(target)
    }

    /// Resolve one jump-table slot and queue the next one.
    fn resolve_jump_table_slot(&self, session: &mut AnalysisSession, pending: XRef) {
        let slot = pending.data_location;
        let entries = session.jump_tables.entry(pending.source).or_default();
        if *entries >= self.options.max_jump_table_entries {
            log::debug!("Jump table at {} reached the entry limit", pending.source);
            return;
        }

        let Some(bytes) = self.image.get_bytes(slot, 2) else {
            return;
        };
        let target = Address::new(pending.source.segment, u16::from_le_bytes([bytes[0], bytes[1]]) as i32);

        let slot_end = slot.offset_by(2);
        if !session.bytes.is_range_unknown(slot, slot_end) || !self.image.is_address_valid(target) {
            log::debug!("Jump table for {} ends at {}", pending.source, slot);
            return;
        }
        let landing = session.bytes.get(target);
        let plausible = landing.is_unknown() || (landing.byte_type() == ByteType::Code && landing.is_lead());
        if !plausible || target.distance_from(slot) == Some(0) {
            log::debug!("Jump table for {} ends at {}", pending.source, slot);
            return;
        }

        *entries += 1;
        if let Err(err) = session.bytes.mark_range(slot, slot_end, ByteType::Data) {
            log::warn!("Cannot classify jump table slot {}: {}", slot, err);
            return;
        }
        session.enqueue(XRef {
            xref_type: XRefType::NearIndexedJump,
            source: pending.source,
            target,
            data_location: slot,
        });
        session.enqueue(XRef::indexed(pending.source, slot_end));
    }
}

fn block_type_for(flow: FlowType) -> BasicBlockType {
    match flow {
        FlowType::None => BasicBlockType::FallThrough,
        FlowType::ConditionalJump => BasicBlockType::Branch,
        FlowType::NearJump | FlowType::FarJump => BasicBlockType::Jump,
        FlowType::NearCall | FlowType::FarCall | FlowType::Interrupt => BasicBlockType::Call,
        FlowType::InterruptReturn | FlowType::NearReturn | FlowType::FarReturn => BasicBlockType::Return,
        FlowType::Halt => BasicBlockType::Halt,
    }
}

/// `jmp word ptr cs:[reg+disp16]`: the displacement names a table of near
/// targets in the code segment.
fn jump_table_slot(at: Address, instruction: &Instruction) -> Option<Address> {
    if instruction.operation() != Operation::Jmp {
        return None;
    }
    match instruction.operands() {
        [Operand::Memory(memory)]
            if memory.segment_override == Some(Register::Cs)
                && memory.size == Some(OperandSize::Word)
                && !memory.is_direct() =>
        {
            Some(Address::new(at.segment, memory.displacement & MAX_OFFSET))
        }
        _ => None,
    }
}
