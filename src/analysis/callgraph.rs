//! Call graph between procedures.

use super::block::BasicBlockStore;
use super::procedure::{ProcedureCollection, ProcedureId};
use super::xref::{XRef, XRefCollection};

/// A call from a block owned by `caller` to the entry of `callee`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: ProcedureId,
    pub callee: ProcedureId,
    pub xref: XRef,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    edges: Vec<CallEdge>,
}

impl CallGraph {
    /// One edge per call reference and per procedure owning the call site.
    pub fn build(procedures: &ProcedureCollection, blocks: &BasicBlockStore, xrefs: &XRefCollection) -> Self {
        let mut edges = Vec::new();

        for xref in xrefs.iter().filter(|x| x.xref_type.is_call()) {
            let Some(callee) = procedures.id_at(xref.target) else {
                continue;
            };
            let Some(site) = blocks.find(xref.source) else {
                continue;
            };
            for caller in procedures.containing(site) {
                edges.push(CallEdge {
                    caller,
                    callee,
                    xref: *xref,
                });
            }
        }

        log::debug!("Call graph has {} edge(s)", edges.len());
        Self { edges }
    }

    pub fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    /// Distinct callers of `procedure`, in first-seen order
    pub fn callers(&self, procedure: ProcedureId) -> Vec<ProcedureId> {
        dedup(self.edges.iter().filter(|e| e.callee == procedure).map(|e| e.caller))
    }

    /// Distinct callees of `procedure`, in first-seen order
    pub fn callees(&self, procedure: ProcedureId) -> Vec<ProcedureId> {
        dedup(self.edges.iter().filter(|e| e.caller == procedure).map(|e| e.callee))
    }
}

fn dedup(ids: impl Iterator<Item = ProcedureId>) -> Vec<ProcedureId> {
    let mut seen = Vec::new();
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}
