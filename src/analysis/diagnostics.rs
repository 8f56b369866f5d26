//! Diagnostics collected during analysis.
//!
//! Properties of the input (bad opcodes, overlapping code, mismatched
//! calls) never abort a run; they are recorded here with their location.

use std::fmt;

use serde::Serialize;
use strum::{Display, EnumIter, IntoStaticStr};

use crate::Address;

/// Severity class of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, Serialize)]
pub enum ErrorCategory {
    /// The region cannot be trusted
    Error,
    /// Analysis continued but a guarantee was violated
    Warning,
    /// Informational, expected in normal analysis
    Message,
}

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize)]
pub enum ErrorCode {
    RanIntoData,
    RanIntoCode,
    OverlappingInstruction,
    AddressWrapped,
    OutOfImage,
    BrokenBasicBlock,
    InvalidInstruction,
    InconsistentCall,
    FixupDiscarded,
    DynamicTarget,
    UnresolvedTarget,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        use ErrorCode::*;

        match self {
            RanIntoData | RanIntoCode | OverlappingInstruction | AddressWrapped | OutOfImage
            | BrokenBasicBlock | InvalidInstruction => ErrorCategory::Error,
            InconsistentCall | FixupDiscarded => ErrorCategory::Warning,
            DynamicTarget | UnresolvedTarget => ErrorCategory::Message,
        }
    }
}

/// A single recorded problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub location: Address,
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}: {}", self.location, self.category, self.code, self.message)
    }
}

/// All diagnostics of one analysis run, in the order they were raised.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollection {
    entries: Vec<Diagnostic>,
}

impl ErrorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic; its category follows from `code`.
    pub fn push(&mut self, location: Address, code: ErrorCode, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            location,
            code,
            category: code.category(),
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Diagnostics ordered by location; ties keep insertion order.
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut sorted: Vec<&Diagnostic> = self.entries.iter().collect();
        sorted.sort_by_key(|d| d.location);
        sorted
    }

    pub fn by_category(&self, category: ErrorCategory) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.category == category)
    }

    pub fn count(&self, category: ErrorCategory) -> usize {
        self.by_category(category).count()
    }

    pub fn count_code(&self, code: ErrorCode) -> usize {
        self.entries.iter().filter(|d| d.code == code).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::OutOfImage.category(), ErrorCategory::Error);
        assert_eq!(ErrorCode::InconsistentCall.category(), ErrorCategory::Warning);
        assert_eq!(ErrorCode::DynamicTarget.category(), ErrorCategory::Message);
    }

    #[test]
    fn test_sorted_and_filtered() {
        let mut errors = ErrorCollection::new();
        errors.push(Address::new(0, 0x20), ErrorCode::DynamicTarget, "indirect jump");
        errors.push(Address::new(0, 0x10), ErrorCode::RanIntoData, "data");
        errors.push(Address::new(0, 0x10), ErrorCode::InconsistentCall, "mixed");

        let sorted = errors.sorted();
        assert_eq!(sorted[0].code, ErrorCode::RanIntoData);
        assert_eq!(sorted[1].code, ErrorCode::InconsistentCall);
        assert_eq!(sorted[2].location, Address::new(0, 0x20));

        assert_eq!(errors.count(ErrorCategory::Error), 1);
        assert_eq!(errors.count(ErrorCategory::Message), 1);
        assert_eq!(errors.count_code(ErrorCode::InconsistentCall), 1);
        assert_eq!(errors.sorted()[0].to_string(), "0000:0010 Error RanIntoData: data");
    }
}
