//! Procedure detection and return-type inference.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;

use crate::instruction::Operation;
use crate::Address;

use super::block::{BasicBlockStore, BlockId};
use super::cfg::ControlFlowGraph;
use super::diagnostics::{ErrorCode, ErrorCollection};
use super::engine::InstructionIndex;
use super::xref::{XRef, XRefCollection, XRefType};

bitflags! {
    /// Ways a procedure returns to its caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReturnType: u8 {
        const NEAR = 0b001;
        const FAR = 0b010;
        const INTERRUPT = 0b100;
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = [
            (ReturnType::NEAR, "near"),
            (ReturnType::FAR, "far"),
            (ReturnType::INTERRUPT, "interrupt"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        f.write_str(&names.join("|"))
    }
}

/// Stable index of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcedureId(pub usize);

/// A procedure: an entry point plus every block reachable from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Procedure {
    pub entry_point: Address,
    pub entry_block: BlockId,
    /// Reachable blocks. A block may belong to several procedures.
    pub blocks: BTreeSet<BlockId>,
    pub return_type: ReturnType,
}

/// All detected procedures, keyed by entry point.
#[derive(Debug, Clone, Default)]
pub struct ProcedureCollection {
    procedures: Vec<Procedure>,
    by_entry: BTreeMap<Address, ProcedureId>,
}

impl ProcedureCollection {
    /// Create procedures at call targets and user entry points.
    ///
    /// Each call is checked against the callee's inferred return type;
    /// mismatches and missing or mixed returns are `InconsistentCall`
    /// warnings.
    pub fn detect(
        blocks: &BasicBlockStore,
        xrefs: &XRefCollection,
        instructions: &InstructionIndex,
        cfg: &ControlFlowGraph,
        errors: &mut ErrorCollection,
    ) -> Self {
        let mut collection = Self::default();

        for xref in xrefs.iter() {
            let roots_procedure = xref.xref_type.is_call() || xref.xref_type == XRefType::UserSpecified;
            if !roots_procedure || !xref.target.is_valid() {
                continue;
            }
            let Some(id) = collection.find_or_create(xref.target, blocks, instructions, cfg, errors) else {
                continue;
            };
            if xref.xref_type.is_call() {
                collection.check_call(xref, id, errors);
            }
        }

        log::debug!("Detected {} procedure(s)", collection.procedures.len());
        collection
    }

    fn find_or_create(
        &mut self,
        entry_point: Address,
        blocks: &BasicBlockStore,
        instructions: &InstructionIndex,
        cfg: &ControlFlowGraph,
        errors: &mut ErrorCollection,
    ) -> Option<ProcedureId> {
        if let Some(&id) = self.by_entry.get(&entry_point) {
            return Some(id);
        }
        let entry_block = blocks.starting_at(entry_point)?;

        let members = reachable_blocks(entry_block, cfg);
        let return_type = infer_return_type(&members, blocks, instructions);
        match return_type.bits().count_ones() {
            0 => errors.push(
                entry_point,
                ErrorCode::InconsistentCall,
                "Procedure never returns via a direct return",
            ),
            1 => {}
            _ => errors.push(
                entry_point,
                ErrorCode::InconsistentCall,
                format!("Procedure has mixed return types ({})", return_type),
            ),
        }

        let id = ProcedureId(self.procedures.len());
        self.procedures.push(Procedure {
            entry_point,
            entry_block,
            blocks: members,
            return_type,
        });
        self.by_entry.insert(entry_point, id);
        Some(id)
    }

    fn check_call(&self, xref: &XRef, callee: ProcedureId, errors: &mut ErrorCollection) {
        let procedure = &self.procedures[callee.0];
        let expected = match xref.xref_type {
            XRefType::NearCall => ReturnType::NEAR,
            _ => ReturnType::FAR,
        };
        if !procedure.return_type.is_empty() && !procedure.return_type.contains(expected) {
            errors.push(
                xref.source,
                ErrorCode::InconsistentCall,
                format!(
                    "{} to {} which returns {}",
                    xref.xref_type, procedure.entry_point, procedure.return_type
                ),
            );
        }
    }

    pub fn get(&self, id: ProcedureId) -> Option<&Procedure> {
        self.procedures.get(id.0)
    }

    pub fn id_at(&self, entry_point: Address) -> Option<ProcedureId> {
        self.by_entry.get(&entry_point).copied()
    }

    /// Procedure whose entry point is `entry_point`
    pub fn at_entry(&self, entry_point: Address) -> Option<&Procedure> {
        self.id_at(entry_point).and_then(|id| self.get(id))
    }

    /// Procedures that own `block`
    pub fn containing(&self, block: BlockId) -> impl Iterator<Item = ProcedureId> + '_ {
        self.procedures
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.blocks.contains(&block))
            .map(|(i, _)| ProcedureId(i))
    }

    /// Procedures in entry-point order
    pub fn iter(&self) -> impl Iterator<Item = (ProcedureId, &Procedure)> {
        self.by_entry.values().map(move |&id| (id, &self.procedures[id.0]))
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// Blocks reachable from `entry` over control-flow edges. Uses an explicit
/// stack so deep graphs cannot exhaust the call stack.
fn reachable_blocks(entry: BlockId, cfg: &ControlFlowGraph) -> BTreeSet<BlockId> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![entry];

    while let Some(block) = stack.pop() {
        if !seen.insert(block) {
            continue;
        }
        stack.extend(cfg.successors(block).filter(|b| !seen.contains(b)));
    }
    seen
}

fn infer_return_type(
    members: &BTreeSet<BlockId>,
    blocks: &BasicBlockStore,
    instructions: &InstructionIndex,
) -> ReturnType {
    let mut return_type = ReturnType::empty();
    for block in members.iter().filter_map(|&id| blocks.get(id)) {
        for (_, instruction) in instructions.in_range(block.location, block.end_address()) {
            match instruction.operation() {
                Operation::Ret => return_type |= ReturnType::NEAR,
                Operation::Retf => return_type |= ReturnType::FAR,
                Operation::Iret => return_type |= ReturnType::INTERRUPT,
                _ => {}
            }
        }
    }
    return_type
}
