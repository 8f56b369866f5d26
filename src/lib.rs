//! Core IR, traits, and dispatch for the realflow 16-bit x86 flow analyzer.
//!
//! This library turns raw real-mode x86 machine code into a stream of decoded
//! instructions, a partition of the image into basic blocks, a control-flow
//! graph, a set of procedures and a call graph. Problems found in the input
//! (invalid opcodes, overlapping instructions, inconsistent calls) are collected
//! as diagnostics instead of aborting the analysis.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use realflow::{
//!     analysis::AnalysisOptions,
//!     decoder::X86Decoder,
//!     format::OutputFormat,
//!     image::BinaryImage,
//!     strategy::Strategy,
//!     Address,
//! };
//!
//! // Load a COM-style image at offset 0x100 of segment 0
//! let image = BinaryImage::from_file("path/to/program.com", 0x100).unwrap();
//! let decoder = X86Decoder::new();
//!
//! // Follow control flow from the entry point
//! let entry = Address::new(0, 0x100);
//! let disassembly = Strategy::Recursive
//!     .run(&image, &decoder, &[entry], AnalysisOptions::default())
//!     .unwrap();
//!
//! let listing = OutputFormat::Text.get_formatter().format(&disassembly).unwrap();
//! println!("{}", listing);
//! ```

pub mod analysis;
pub mod decoder;
pub mod format;
pub mod image;
pub mod instruction;
pub mod strategy;
mod large_tests;
#[cfg(feature = "extension-module")]
pub mod python;

use std::fmt;
use std::str::FromStr;

pub use analysis::{Analysis, AnalysisError};
pub use decoder::DecodeError;
pub use instruction::Instruction;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// A `segment:offset` location inside a segmented image.
///
/// Segments are independent index spaces identified by a small integer; they
/// are not real-mode paragraph numbers. Ordering is by segment first, then by
/// offset. Offsets may go negative or past the nominal segment width during
/// arithmetic; wrap-around is left to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    /// Segment index
    pub segment: i32,
    /// Offset within the segment
    pub offset: i32,
}

impl Address {
    /// Sentinel for unknown or dynamic locations.
    pub const INVALID: Address = Address { segment: -1, offset: -1 };

    /// Create a new address
    pub const fn new(segment: i32, offset: i32) -> Self {
        Self { segment, offset }
    }

    /// Returns false only for the `INVALID` sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Address `delta` bytes further in the same segment.
    pub fn offset_by(self, delta: i32) -> Address {
        Address::new(self.segment, self.offset.wrapping_add(delta))
    }

    /// Signed distance from `origin` to `self`, if both share a segment.
    pub fn distance_from(self, origin: Address) -> Option<i32> {
        if self.segment == origin.segment {
            Some(self.offset - origin.offset)
        } else {
            None
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:04X}:{:04X}", self.segment, self.offset)
        } else {
            write!(f, "????:????")
        }
    }
}

impl FromStr for Address {
    type Err = String;

    /// Parse `SEG:OFFSET` or a bare `OFFSET` (segment 0). Both parts are
    /// hexadecimal, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn hex(part: &str) -> Result<i32, String> {
            let digits = part
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            i32::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value '{}': {}", part, e))
        }

        match s.split_once(':') {
            Some((segment, offset)) => Ok(Address::new(hex(segment)?, hex(offset)?)),
            None => Ok(Address::new(0, hex(s)?)),
        }
    }
}

/// Image provider: the segmented byte source the analysis runs over.
///
/// Segmentation is entirely defined by the implementor; the core treats
/// segments as opaque numbered regions.
pub trait ImageProvider: Send + Sync {
    /// Number of segments in the image
    fn segment_count(&self) -> usize;

    /// Valid offset range `[start, end)` of a segment
    fn segment_bounds(&self, segment: i32) -> Option<(i32, i32)>;

    /// Whether `address` names a byte inside the image
    fn is_address_valid(&self, address: Address) -> bool;

    /// Read `count` bytes at `address`. Never crosses a segment boundary.
    fn get_bytes(&self, address: Address, count: usize) -> Option<&[u8]>;

    /// Bytes from `address` to the end of its segment; the decode window.
    fn segment_tail(&self, address: Address) -> Option<&[u8]> {
        let (_, end) = self.segment_bounds(address.segment)?;
        if !self.is_address_valid(address) {
            return None;
        }
        self.get_bytes(address, (end - address.offset) as usize)
    }
}

/// Decoder trait: turns a byte window into one instruction.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction from the start of `code`.
    ///
    /// # Arguments
    /// * `code` - Bytes from the instruction start to the end of its segment
    ///
    /// # Returns
    /// The decoded instruction, or why the bytes do not form one
    fn decode(&self, code: &[u8]) -> Result<Instruction, DecodeError>;
}

/// Resolves display names for addresses. Only consulted when formatting.
pub trait SymbolResolver {
    /// Label for `address`, if one is known
    fn resolve(&self, address: Address) -> Option<&str>;
}

/// Unified disassembly output.
#[derive(Debug)]
pub enum Disassembly {
    /// Linear stream of instructions
    Stream(Vec<(Address, Instruction)>),
    /// Full flow analysis: blocks, graph, procedures and diagnostics
    Flow(Box<Analysis>),
}

impl Disassembly {
    /// Get the total number of instructions
    pub fn instruction_count(&self) -> usize {
        match self {
            Disassembly::Stream(insns) => insns.len(),
            Disassembly::Flow(analysis) => analysis.instructions.len(),
        }
    }

    /// Get all instructions in address order
    pub fn all_instructions(&self) -> Vec<(Address, &Instruction)> {
        match self {
            Disassembly::Stream(insns) => insns.iter().map(|(a, i)| (*a, i)).collect(),
            Disassembly::Flow(analysis) => analysis.instructions.iter().collect(),
        }
    }
}

/// Error type for disassembly operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Precondition failure inside the analysis core
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Decoder error
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV serialization error
    #[error("CSV serialization error: {0}")]
    Csv(#[from] csv::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
