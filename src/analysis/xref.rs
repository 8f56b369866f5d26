//! Typed cross-references between addresses.

use std::collections::HashMap;

use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::Address;

use super::AnalysisError;

/// Why one location refers to another.
///
/// Declaration order is processing priority: lower variants are taken from
/// the worklist first, so direct flow is settled before jump-table guesses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, IntoStaticStr, Serialize,
)]
pub enum XRefType {
    UserSpecified,
    NearJump,
    FarJump,
    NearCall,
    FarCall,
    ConditionalJump,
    FallThrough,
    NearIndexedJump,
    Interrupt,
    InterruptReturn,
    NearReturn,
    FarReturn,
    Halt,
}

impl XRefType {
    pub fn is_call(self) -> bool {
        matches!(self, XRefType::NearCall | XRefType::FarCall)
    }
}

/// A directed reference. Either end may be [`Address::INVALID`], not both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XRef {
    pub xref_type: XRefType,
    pub source: Address,
    pub target: Address,
    /// Jump-table slot, only meaningful for `NearIndexedJump`
    pub data_location: Address,
}

impl XRef {
    pub fn new(xref_type: XRefType, source: Address, target: Address) -> Self {
        Self {
            xref_type,
            source,
            target,
            data_location: Address::INVALID,
        }
    }

    /// Unresolved jump-table entry reading its target from `slot`.
    pub fn indexed(source: Address, slot: Address) -> Self {
        Self {
            xref_type: XRefType::NearIndexedJump,
            source,
            target: Address::INVALID,
            data_location: slot,
        }
    }
}

/// Directed multigraph of cross-references, indexed by both endpoints.
#[derive(Debug, Clone, Default)]
pub struct XRefCollection {
    xrefs: Vec<XRef>,
    by_source: HashMap<Address, Vec<usize>>,
    by_target: HashMap<Address, Vec<usize>>,
}

impl XRefCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Duplicates are kept.
    pub fn add(&mut self, xref: XRef) -> Result<(), AnalysisError> {
        if !xref.source.is_valid() && !xref.target.is_valid() {
            return Err(AnalysisError::UnanchoredXRef);
        }
        let index = self.xrefs.len();
        self.xrefs.push(xref);
        if xref.source.is_valid() {
            self.by_source.entry(xref.source).or_default().push(index);
        }
        if xref.target.is_valid() {
            self.by_target.entry(xref.target).or_default().push(index);
        }
        Ok(())
    }

    /// Edges leaving `source`, in insertion order
    pub fn edges_from(&self, source: Address) -> impl Iterator<Item = &XRef> {
        self.lookup(&self.by_source, source)
    }

    /// Edges arriving at `target`, in insertion order
    pub fn edges_to(&self, target: Address) -> impl Iterator<Item = &XRef> {
        self.lookup(&self.by_target, target)
    }

    fn lookup<'a>(
        &'a self,
        index: &'a HashMap<Address, Vec<usize>>,
        address: Address,
    ) -> impl Iterator<Item = &'a XRef> {
        index
            .get(&address)
            .into_iter()
            .flatten()
            .map(move |&i| &self.xrefs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &XRef> {
        self.xrefs.iter()
    }

    pub fn len(&self) -> usize {
        self.xrefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xrefs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(XRefType::UserSpecified < XRefType::NearJump);
        assert!(XRefType::NearJump < XRefType::NearIndexedJump);
        assert!(XRefType::FallThrough < XRefType::NearIndexedJump);
        assert!(XRefType::FarReturn < XRefType::Halt);
    }

    #[test]
    fn test_rejects_unanchored() {
        let mut xrefs = XRefCollection::new();
        let err = xrefs
            .add(XRef::new(XRefType::NearJump, Address::INVALID, Address::INVALID))
            .unwrap_err();
        assert_eq!(err, AnalysisError::UnanchoredXRef);
        assert!(xrefs.is_empty());
    }

    #[test]
    fn test_multigraph_keeps_duplicates() {
        let mut xrefs = XRefCollection::new();
        let site = Address::new(0, 0x10);
        let callee = Address::new(0, 0x40);

        xrefs.add(XRef::new(XRefType::NearCall, site, callee)).unwrap();
        xrefs.add(XRef::new(XRefType::NearCall, site, callee)).unwrap();
        xrefs.add(XRef::new(XRefType::FallThrough, site, Address::new(0, 0x13))).unwrap();
        xrefs.add(XRef::new(XRefType::UserSpecified, Address::INVALID, callee)).unwrap();

        let from: Vec<XRefType> = xrefs.edges_from(site).map(|x| x.xref_type).collect();
        assert_eq!(from, vec![XRefType::NearCall, XRefType::NearCall, XRefType::FallThrough]);
        assert_eq!(xrefs.edges_to(callee).count(), 3);
        assert_eq!(xrefs.edges_from(Address::INVALID).count(), 0);
        assert_eq!(xrefs.len(), 4);
    }
}
