//! Automatic labels for listings

use std::collections::BTreeMap;

use crate::analysis::Analysis;
use crate::{Address, SymbolResolver};

/// Label table built from a finished analysis.
///
/// Procedure entries are named `proc_SSSS_OOOO`, every other block start
/// `loc_SSSS_OOOO`.
#[derive(Debug, Clone, Default)]
pub struct Labels {
    names: BTreeMap<Address, String>,
}

impl Labels {
    pub fn from_analysis(analysis: &Analysis) -> Self {
        let mut labels = Self::default();
        for (_, procedure) in analysis.procedures.iter() {
            labels.insert(procedure.entry_point, "proc");
        }
        for (_, block) in analysis.blocks.iter() {
            labels.insert(block.location, "loc");
        }
        labels
    }

    fn insert(&mut self, address: Address, kind: &str) {
        self.names
            .entry(address)
            .or_insert_with(|| format!("{}_{:04X}_{:04X}", kind, address.segment, address.offset));
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl SymbolResolver for Labels {
    fn resolve(&self, address: Address) -> Option<&str> {
        self.names.get(&address).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisOptions;
    use crate::decoder::X86Decoder;
    use crate::image::BinaryImage;
    use crate::strategy::recursive;

    #[test]
    fn test_procedure_labels_win_over_block_labels() {
        // 100: call 104 / 103: ret / 104: ret
        let image = BinaryImage::from_bytes(&[0xe8, 0x01, 0x00, 0xc3, 0xc3], 0x100);
        let analysis =
            recursive::analyze(&image, &X86Decoder::new(), &[Address::new(0, 0x100)], AnalysisOptions::default())
                .unwrap();

        let labels = Labels::from_analysis(&analysis);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.resolve(Address::new(0, 0x100)), Some("proc_0000_0100"));
        assert_eq!(labels.resolve(Address::new(0, 0x103)), Some("loc_0000_0103"));
        assert_eq!(labels.resolve(Address::new(0, 0x104)), Some("proc_0000_0104"));
        assert_eq!(labels.resolve(Address::new(0, 0x101)), None);
    }
}
