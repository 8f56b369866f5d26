//! Basic blocks and the per-segment block index.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::Address;

use super::AnalysisError;

/// Stable index of a block. Indices are append-only and survive splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize)]
pub enum BasicBlockType {
    /// Ran into the next block
    FallThrough,
    /// Unconditional jump
    Jump,
    /// Conditional branch
    Branch,
    /// Call or software interrupt
    Call,
    /// RET, RETF or IRET
    Return,
    Halt,
    /// Analysis stopped on an error inside the block
    Broken,
}

/// Straight-line run of instructions inside one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasicBlock {
    pub location: Address,
    pub length: i32,
    pub block_type: BasicBlockType,
}

impl BasicBlock {
    pub fn new(location: Address, length: i32, block_type: BasicBlockType) -> Self {
        Self {
            location,
            length,
            block_type,
        }
    }

    /// Block covering `[start, end)`; both ends must share a segment.
    pub fn from_range(start: Address, end: Address, block_type: BasicBlockType) -> Result<Self, AnalysisError> {
        match end.distance_from(start) {
            Some(length) if length > 0 => Ok(Self::new(start, length, block_type)),
            Some(_) => Err(AnalysisError::EmptyRange(start, end)),
            None => Err(AnalysisError::SegmentMismatch(start, end)),
        }
    }

    /// Exclusive end address
    pub fn end_address(&self) -> Address {
        self.location.offset_by(self.length)
    }

    pub fn contains(&self, address: Address) -> bool {
        address.segment == self.location.segment
            && address.offset >= self.location.offset
            && address.offset < self.location.offset + self.length
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {:04X}) {}",
            self.location,
            self.location.offset + self.length,
            self.block_type
        )
    }
}

/// Arena of blocks plus an ordered start-offset index per segment.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockStore {
    blocks: Vec<BasicBlock>,
    index: HashMap<i32, BTreeMap<i32, BlockId>>,
}

impl BasicBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block that must not overlap any existing one.
    pub fn add(&mut self, block: BasicBlock) -> Result<BlockId, AnalysisError> {
        if block.length <= 0 {
            return Err(AnalysisError::EmptyRange(block.location, block.end_address()));
        }
        let segment = self.index.entry(block.location.segment).or_default();

        if let Some((_, &id)) = segment.range(..block.location.offset + block.length).next_back() {
            let existing = &self.blocks[id.0];
            if existing.end_address().offset > block.location.offset {
                return Err(AnalysisError::BlockOverlap(existing.location));
            }
        }

        let id = BlockId(self.blocks.len());
        self.blocks.push(block);
        segment.insert(block.location.offset, id);
        Ok(id)
    }

    /// Block covering `address`, if any.
    pub fn find(&self, address: Address) -> Option<BlockId> {
        let (_, &id) = self
            .index
            .get(&address.segment)?
            .range(..=address.offset)
            .next_back()?;
        self.blocks[id.0].contains(address).then_some(id)
    }

    /// Block starting exactly at `address`.
    pub fn starting_at(&self, address: Address) -> Option<BlockId> {
        self.index.get(&address.segment)?.get(&address.offset).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    /// Split the block covering `cutoff` into `[start, cutoff)` and
    /// `[cutoff, end)`.
    ///
    /// The head keeps its id and becomes a `FallThrough` block; the tail is
    /// appended with the original block type. Returns `(head, tail)`.
    pub fn split(&mut self, cutoff: Address) -> Result<(BlockId, BlockId), AnalysisError> {
        let head = self.find(cutoff).ok_or(AnalysisError::SplitOutsideBlock(cutoff))?;
        let original = self.blocks[head.0];
        if original.location == cutoff {
            return Err(AnalysisError::SplitOutsideBlock(cutoff));
        }

        let head_length = cutoff.offset - original.location.offset;
        let tail = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock::new(
            cutoff,
            original.length - head_length,
            original.block_type,
        ));
        self.blocks[head.0] = BasicBlock::new(original.location, head_length, BasicBlockType::FallThrough);
        self.index
            .entry(cutoff.segment)
            .or_default()
            .insert(cutoff.offset, tail);
        Ok((head, tail))
    }

    /// Blocks in address order
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        let mut segments: Vec<_> = self.index.iter().collect();
        segments.sort_by_key(|(segment, _)| **segment);
        segments
            .into_iter()
            .flat_map(|(_, starts)| starts.values())
            .map(move |&id| (id, &self.blocks[id.0]))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(offset: i32) -> Address {
        Address::new(0, offset)
    }

    #[test]
    fn test_from_range_single_segment() {
        assert!(matches!(
            BasicBlock::from_range(at(0), Address::new(1, 4), BasicBlockType::Jump),
            Err(AnalysisError::SegmentMismatch(..))
        ));
        let block = BasicBlock::from_range(at(2), at(6), BasicBlockType::Jump).unwrap();
        assert_eq!(block.length, 4);
        assert!(block.contains(at(5)));
        assert!(!block.contains(at(6)));
    }

    #[test]
    fn test_partition_lookup() {
        let mut store = BasicBlockStore::new();
        let a = store.add(BasicBlock::new(at(0), 5, BasicBlockType::Jump)).unwrap();
        let b = store.add(BasicBlock::new(at(8), 2, BasicBlockType::Return)).unwrap();

        assert_eq!(store.find(at(0)), Some(a));
        assert_eq!(store.find(at(4)), Some(a));
        assert_eq!(store.find(at(5)), None);
        assert_eq!(store.find(at(9)), Some(b));
        assert_eq!(store.find(Address::new(1, 0)), None);
        assert_eq!(store.starting_at(at(8)), Some(b));
        assert_eq!(store.starting_at(at(9)), None);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut store = BasicBlockStore::new();
        store.add(BasicBlock::new(at(4), 4, BasicBlockType::Jump)).unwrap();

        assert_eq!(
            store.add(BasicBlock::new(at(6), 4, BasicBlockType::Jump)),
            Err(AnalysisError::BlockOverlap(at(4)))
        );
        assert_eq!(
            store.add(BasicBlock::new(at(0), 5, BasicBlockType::Jump)),
            Err(AnalysisError::BlockOverlap(at(4)))
        );
        assert!(store.add(BasicBlock::new(at(0), 4, BasicBlockType::Jump)).is_ok());
        assert!(store.add(BasicBlock::new(at(8), 1, BasicBlockType::Halt)).is_ok());
    }

    #[test]
    fn test_split() {
        let mut store = BasicBlockStore::new();
        let id = store.add(BasicBlock::new(at(0x10), 8, BasicBlockType::Return)).unwrap();

        let (head, tail) = store.split(at(0x14)).unwrap();
        assert_eq!(head, id);
        assert_eq!(store.get(head), Some(&BasicBlock::new(at(0x10), 4, BasicBlockType::FallThrough)));
        assert_eq!(store.get(tail), Some(&BasicBlock::new(at(0x14), 4, BasicBlockType::Return)));
        assert_eq!(store.find(at(0x13)), Some(head));
        assert_eq!(store.find(at(0x17)), Some(tail));

        assert_eq!(store.split(at(0x14)), Err(AnalysisError::SplitOutsideBlock(at(0x14))));
        assert_eq!(store.split(at(0x30)), Err(AnalysisError::SplitOutsideBlock(at(0x30))));

        let order: Vec<BlockId> = store.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![head, tail]);
    }
}
