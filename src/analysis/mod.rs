//! Flow analysis: byte classification, cross-references, basic blocks,
//! control-flow graph, procedures and call graph.

pub mod block;
pub mod bytes;
pub mod callgraph;
pub mod cfg;
pub mod diagnostics;
pub mod engine;
pub mod procedure;
pub mod worklist;
pub mod xref;

pub use block::{BasicBlock, BasicBlockStore, BasicBlockType, BlockId};
pub use bytes::{ByteAttribute, ByteStore, ByteType};
pub use callgraph::{CallEdge, CallGraph};
pub use cfg::ControlFlowGraph;
pub use diagnostics::{Diagnostic, ErrorCategory, ErrorCode, ErrorCollection};
pub use engine::{AnalysisOptions, AnalysisSession, FlowAnalyzer, InstructionIndex};
pub use procedure::{Procedure, ProcedureCollection, ProcedureId, ReturnType};
pub use xref::{XRef, XRefCollection, XRefType};

use crate::Address;

/// Precondition failures on the core data structures.
///
/// These signal a caller or engine bug. Problems with the analyzed binary
/// are recorded as [`Diagnostic`]s instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("Range {0} .. {1} spans two segments")]
    SegmentMismatch(Address, Address),

    #[error("Range {0} .. {1} is empty")]
    EmptyRange(Address, Address),

    #[error("Byte at {0} is already classified")]
    BytesAlreadyTyped(Address),

    #[error("Block overlaps the block at {0}")]
    BlockOverlap(Address),

    #[error("No block to split at {0}")]
    SplitOutsideBlock(Address),

    #[error("Cross-reference has neither a source nor a target")]
    UnanchoredXRef,

    #[error("Address {0} is outside the image")]
    AddressOutOfImage(Address),

    #[error("Analysis was cancelled")]
    Cancelled,
}

/// Result of a completed flow analysis.
#[derive(Debug, Default)]
pub struct Analysis {
    pub instructions: InstructionIndex,
    pub bytes: ByteStore,
    pub blocks: BasicBlockStore,
    pub xrefs: XRefCollection,
    pub cfg: ControlFlowGraph,
    pub procedures: ProcedureCollection,
    pub call_graph: CallGraph,
    pub errors: ErrorCollection,
}

impl Analysis {
    /// Derive the control-flow graph and, if requested, procedures and the
    /// call graph from a drained session.
    pub fn from_session(session: AnalysisSession, build_procedures: bool) -> Self {
        let AnalysisSession {
            bytes,
            blocks,
            xrefs,
            mut errors,
            instructions,
            ..
        } = session;

        let cfg = ControlFlowGraph::build(&blocks, &xrefs, &mut errors);
        let (procedures, call_graph) = if build_procedures {
            let procedures = ProcedureCollection::detect(&blocks, &xrefs, &instructions, &cfg, &mut errors);
            let call_graph = CallGraph::build(&procedures, &blocks, &xrefs);
            (procedures, call_graph)
        } else {
            Default::default()
        };

        Self {
            instructions,
            bytes,
            blocks,
            xrefs,
            cfg,
            procedures,
            call_graph,
            errors,
        }
    }

    /// Instructions belonging to `block`, in address order
    pub fn block_instructions(&self, block: &BasicBlock) -> impl Iterator<Item = (Address, &crate::Instruction)> {
        self.instructions.in_range(block.location, block.end_address())
    }
}
