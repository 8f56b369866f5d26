//! Per-byte classification of the image.

use std::collections::HashMap;

use crate::Address;

use super::AnalysisError;

/// What a byte has been classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ByteType {
    Unknown = 0,
    Padding = 1,
    Code = 2,
    Data = 3,
}

/// Packed per-byte attribute: two type bits and a lead-byte flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteAttribute(u8);

impl ByteAttribute {
    const TYPE_MASK: u8 = 0b011;
    const LEAD: u8 = 0b100;

    pub fn new(byte_type: ByteType, lead: bool) -> Self {
        Self(byte_type as u8 | if lead { Self::LEAD } else { 0 })
    }

    pub fn byte_type(self) -> ByteType {
        match self.0 & Self::TYPE_MASK {
            1 => ByteType::Padding,
            2 => ByteType::Code,
            3 => ByteType::Data,
            _ => ByteType::Unknown,
        }
    }

    /// First byte of an instruction or data item
    pub fn is_lead(self) -> bool {
        self.0 & Self::LEAD != 0
    }

    pub fn is_unknown(self) -> bool {
        self.byte_type() == ByteType::Unknown
    }
}

/// Classification store. Segments are allocated lazily on first write.
#[derive(Debug, Clone, Default)]
pub struct ByteStore {
    segments: HashMap<i32, Vec<ByteAttribute>>,
}

impl ByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute of one byte; unexplored bytes are `Unknown`.
    pub fn get(&self, address: Address) -> ByteAttribute {
        usize::try_from(address.offset)
            .ok()
            .and_then(|offset| self.segments.get(&address.segment)?.get(offset).copied())
            .unwrap_or_default()
    }

    /// Whether every byte of `[start, end)` is still `Unknown`.
    pub fn is_range_unknown(&self, start: Address, end: Address) -> bool {
        (start.offset..end.offset).all(|offset| self.get(Address::new(start.segment, offset)).is_unknown())
    }

    /// Classify `[start, end)` as `byte_type`, flagging `start` as the lead byte.
    ///
    /// All-or-nothing: if any byte in the range is already typed, nothing is
    /// written and the first offending address is reported.
    pub fn mark_range(&mut self, start: Address, end: Address, byte_type: ByteType) -> Result<(), AnalysisError> {
        if start.segment != end.segment {
            return Err(AnalysisError::SegmentMismatch(start, end));
        }
        if end.offset <= start.offset || start.offset < 0 || byte_type == ByteType::Unknown {
            return Err(AnalysisError::EmptyRange(start, end));
        }
        if let Some(offset) =
            (start.offset..end.offset).find(|&o| !self.get(Address::new(start.segment, o)).is_unknown())
        {
            return Err(AnalysisError::BytesAlreadyTyped(Address::new(start.segment, offset)));
        }

        let (from, to) = (start.offset as usize, end.offset as usize);
        let bytes = self.segments.entry(start.segment).or_default();
        if bytes.len() < to {
            bytes.resize(to, ByteAttribute::default());
        }
        bytes[from] = ByteAttribute::new(byte_type, true);
        for attribute in &mut bytes[from + 1..to] {
            *attribute = ByteAttribute::new(byte_type, false);
        }
        Ok(())
    }

    /// Number of bytes of the given type across all segments
    pub fn count(&self, byte_type: ByteType) -> usize {
        self.segments
            .values()
            .flat_map(|bytes| bytes.iter())
            .filter(|a| a.byte_type() == byte_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(offset: i32) -> Address {
        Address::new(0, offset)
    }

    #[test]
    fn test_unexplored_is_unknown() {
        let store = ByteStore::new();
        assert!(store.get(Address::new(7, 0x1234)).is_unknown());
        assert!(store.get(Address::INVALID).is_unknown());
    }

    #[test]
    fn test_mark_sets_one_lead_byte() {
        let mut store = ByteStore::new();
        store.mark_range(at(4), at(7), ByteType::Code).unwrap();

        assert!(store.get(at(3)).is_unknown());
        assert!(store.get(at(4)).is_lead());
        assert!(!store.get(at(5)).is_lead());
        assert!(!store.get(at(6)).is_lead());
        assert_eq!(store.get(at(6)).byte_type(), ByteType::Code);
        assert!(store.get(at(7)).is_unknown());
        assert_eq!(store.count(ByteType::Code), 3);
    }

    #[test]
    fn test_mark_is_all_or_nothing() {
        let mut store = ByteStore::new();
        store.mark_range(at(4), at(6), ByteType::Data).unwrap();

        let err = store.mark_range(at(0), at(5), ByteType::Code).unwrap_err();
        assert_eq!(err, AnalysisError::BytesAlreadyTyped(at(4)));
        assert!(store.is_range_unknown(at(0), at(4)));
        assert_eq!(store.count(ByteType::Code), 0);
        assert_eq!(store.get(at(4)).byte_type(), ByteType::Data);
    }

    #[test]
    fn test_mark_preconditions() {
        let mut store = ByteStore::new();
        assert!(matches!(
            store.mark_range(at(0), Address::new(1, 4), ByteType::Code),
            Err(AnalysisError::SegmentMismatch(..))
        ));
        assert!(matches!(
            store.mark_range(at(4), at(4), ByteType::Code),
            Err(AnalysisError::EmptyRange(..))
        ));
        assert!(matches!(
            store.mark_range(at(0), at(4), ByteType::Unknown),
            Err(AnalysisError::EmptyRange(..))
        ));
    }
}
