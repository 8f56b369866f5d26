//! Block-level control-flow graph derived from cross-references.

use std::collections::HashMap;

use super::block::{BasicBlockStore, BlockId};
use super::diagnostics::{ErrorCode, ErrorCollection};
use super::xref::{XRef, XRefCollection};

/// One control-flow edge between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub xref: XRef,
}

/// Directed graph over basic blocks. Calls are not edges here.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    edges: Vec<CfgEdge>,
    successors: HashMap<BlockId, Vec<usize>>,
    predecessors: HashMap<BlockId, Vec<usize>>,
}

impl ControlFlowGraph {
    /// Map every anchored, non-call cross-reference onto the blocks owning
    /// its two ends. References whose ends have no block are reported as
    /// `UnresolvedTarget` and skipped.
    pub fn build(blocks: &BasicBlockStore, xrefs: &XRefCollection, errors: &mut ErrorCollection) -> Self {
        let mut cfg = Self::default();

        for xref in xrefs.iter() {
            if !xref.source.is_valid() || !xref.target.is_valid() || xref.xref_type.is_call() {
                continue;
            }
            match (blocks.find(xref.source), blocks.find(xref.target)) {
                (Some(from), Some(to)) => cfg.add(from, to, *xref),
                (from, _) => {
                    let missing = if from.is_none() { xref.source } else { xref.target };
                    errors.push(
                        missing,
                        ErrorCode::UnresolvedTarget,
                        format!("No block at {} for {} {} -> {}", missing, xref.xref_type, xref.source, xref.target),
                    );
                }
            }
        }

        log::debug!("Control-flow graph has {} edge(s)", cfg.edges.len());
        cfg
    }

    fn add(&mut self, from: BlockId, to: BlockId, xref: XRef) {
        let index = self.edges.len();
        self.edges.push(CfgEdge { from, to, xref });
        self.successors.entry(from).or_default().push(index);
        self.predecessors.entry(to).or_default().push(index);
    }

    /// Successor blocks of `block` in edge order; may repeat.
    pub fn successors(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.successors
            .get(&block)
            .into_iter()
            .flatten()
            .map(move |&i| self.edges[i].to)
    }

    pub fn predecessors(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.predecessors
            .get(&block)
            .into_iter()
            .flatten()
            .map(move |&i| self.edges[i].from)
    }

    pub fn edges(&self) -> &[CfgEdge] {
        &self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::block::{BasicBlock, BasicBlockType};
    use crate::analysis::xref::XRefType;
    use crate::Address;

    fn at(offset: i32) -> Address {
        Address::new(0, offset)
    }

    #[test]
    fn test_build_skips_calls_and_unanchored() {
        let mut blocks = BasicBlockStore::new();
        let a = blocks.add(BasicBlock::new(at(0), 3, BasicBlockType::Call)).unwrap();
        let b = blocks.add(BasicBlock::new(at(3), 1, BasicBlockType::Return)).unwrap();
        let c = blocks.add(BasicBlock::new(at(8), 1, BasicBlockType::Return)).unwrap();

        let mut xrefs = XRefCollection::new();
        xrefs.add(XRef::new(XRefType::UserSpecified, Address::INVALID, at(0))).unwrap();
        xrefs.add(XRef::new(XRefType::NearCall, at(0), at(8))).unwrap();
        xrefs.add(XRef::new(XRefType::FallThrough, at(0), at(3))).unwrap();
        xrefs.add(XRef::new(XRefType::NearReturn, at(3), Address::INVALID)).unwrap();

        let mut errors = ErrorCollection::new();
        let cfg = ControlFlowGraph::build(&blocks, &xrefs, &mut errors);

        assert_eq!(cfg.edges().len(), 1);
        assert_eq!(cfg.successors(a).collect::<Vec<_>>(), vec![b]);
        assert_eq!(cfg.predecessors(b).collect::<Vec<_>>(), vec![a]);
        assert_eq!(cfg.successors(c).count(), 0);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_missing_block_is_reported() {
        let mut blocks = BasicBlockStore::new();
        blocks.add(BasicBlock::new(at(0), 2, BasicBlockType::Jump)).unwrap();

        let mut xrefs = XRefCollection::new();
        xrefs.add(XRef::new(XRefType::NearJump, at(0), at(0x40))).unwrap();

        let mut errors = ErrorCollection::new();
        let cfg = ControlFlowGraph::build(&blocks, &xrefs, &mut errors);

        assert!(cfg.edges().is_empty());
        assert_eq!(errors.count_code(ErrorCode::UnresolvedTarget), 1);
        assert_eq!(errors.iter().next().unwrap().location, at(0x40));
    }
}
