//! Disassembly strategies

use std::fmt;

use clap::ValueEnum;

use crate::analysis::AnalysisOptions;
use crate::{Address, Decoder, Disassembly, DisassemblyError, ImageProvider};

/// Available disassembly strategies.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Linear sweep over every segment
    Linear,
    /// Flow analysis from the entry points
    #[default]
    Recursive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Linear => write!(f, "Linear sweep"),
            Strategy::Recursive => write!(f, "Recursive flow analysis"),
        }
    }
}

impl Strategy {
    /// Run the selected strategy on `image` using `decoder`.
    ///
    /// `entries` and `options` only matter for the recursive strategy; with
    /// no entries it starts at the first byte of segment 0.
    pub fn run(
        &self,
        image: &dyn ImageProvider,
        decoder: &dyn Decoder,
        entries: &[Address],
        options: AnalysisOptions,
    ) -> Result<Disassembly, DisassemblyError> {
        match self {
            Strategy::Linear => linear::run(image, decoder),
            Strategy::Recursive => recursive::run(image, decoder, entries, options),
        }
    }

    /// Return all available strategies
    pub fn all() -> &'static [Strategy] {
        &[Strategy::Linear, Strategy::Recursive]
    }
}

pub mod linear;
pub mod recursive;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::image::BinaryImage;

    #[test]
    fn test_strategy_display() {
        assert_eq!(Strategy::Linear.to_string(), "Linear sweep");
        assert_eq!(Strategy::Recursive.to_string(), "Recursive flow analysis");
        assert_eq!(Strategy::default(), Strategy::Recursive);
    }

    #[test]
    fn test_linear_strategy() {
        let image = BinaryImage::from_bytes(&[0x90, 0x90], 0x100);
        let decoder = X86Decoder::new();
        let result = Strategy::Linear
            .run(&image, &decoder, &[], AnalysisOptions::default())
            .unwrap();

        if let Disassembly::Stream(insns) = result {
            assert_eq!(insns.len(), 2);
            assert_eq!(insns[0].0, Address::new(0, 0x100));
            assert_eq!(insns[1].1.to_string(), "nop");
        } else {
            panic!("Expected Stream disassembly");
        }
    }

    #[test]
    fn test_recursive_strategy_default_entry() {
        let image = BinaryImage::from_bytes(&[0x90, 0xc3, 0xcc], 0x100);
        let decoder = X86Decoder::new();
        let result = Strategy::Recursive
            .run(&image, &decoder, &[], AnalysisOptions::default())
            .unwrap();

        // The trailing int3 is never reached
        assert_eq!(result.instruction_count(), 2);
        assert!(matches!(result, Disassembly::Flow(_)));
    }
}
