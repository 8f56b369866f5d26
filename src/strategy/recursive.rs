//! Recursive flow-analysis strategy

use std::time::Instant;

use crate::analysis::{Analysis, AnalysisError, AnalysisOptions, AnalysisSession, FlowAnalyzer, XRef, XRefType};
use crate::{Address, Decoder, Disassembly, DisassemblyError, ImageProvider};

/// Flow analysis from `entries` into a full [`Analysis`].
///
/// Every entry is seeded as a `UserSpecified` reference before the worklist
/// runs, so all entries are processed in one priority-ordered pass. With no
/// entries the analysis starts at the first byte of segment 0.
///
/// # Arguments
/// * `image` - The segmented image to analyze
/// * `decoder` - The decoder to use for disassembly
/// * `entries` - Entry points
/// * `options` - Analysis tuning
///
/// # Returns
/// Blocks, control-flow graph, procedures, call graph and diagnostics
pub fn analyze(
    image: &dyn ImageProvider,
    decoder: &dyn Decoder,
    entries: &[Address],
    options: AnalysisOptions,
) -> Result<Analysis, DisassemblyError> {
    let start_time = Instant::now();
    let entries = if entries.is_empty() {
        default_entry(image).into_iter().collect()
    } else {
        entries.to_vec()
    };
    log::info!("Starting flow analysis from {} entry point(s)", entries.len());

    let mut session = AnalysisSession::new();
    for &entry in &entries {
        if !entry.is_valid() {
            return Err(AnalysisError::UnanchoredXRef.into());
        }
        if !image.is_address_valid(entry) {
            return Err(AnalysisError::AddressOutOfImage(entry).into());
        }
        session.enqueue(XRef::new(XRefType::UserSpecified, Address::INVALID, entry));
    }

    let build_procedures = options.build_procedures;
    FlowAnalyzer::new(image, decoder, options).run(&mut session)?;
    let analysis = Analysis::from_session(session, build_procedures);

    log::info!(
        "Flow analysis complete in {:?}: {} instructions, {} blocks, {} procedures, {} diagnostics",
        start_time.elapsed(),
        analysis.instructions.len(),
        analysis.blocks.len(),
        analysis.procedures.len(),
        analysis.errors.len()
    );
    Ok(analysis)
}

/// Run flow analysis and wrap the result as a [`Disassembly`]
pub fn run(
    image: &dyn ImageProvider,
    decoder: &dyn Decoder,
    entries: &[Address],
    options: AnalysisOptions,
) -> Result<Disassembly, DisassemblyError> {
    Ok(Disassembly::Flow(Box::new(analyze(image, decoder, entries, options)?)))
}

fn default_entry(image: &dyn ImageProvider) -> Option<Address> {
    image.segment_bounds(0).map(|(start, _)| Address::new(0, start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BasicBlockType, ErrorCode, ReturnType};
    use crate::decoder::X86Decoder;
    use crate::image::BinaryImage;

    #[test]
    fn test_call_creates_procedure_and_edge() {
        // 100: call 104 / 103: ret / 104: ret
        let image = BinaryImage::from_bytes(&[0xe8, 0x01, 0x00, 0xc3, 0xc3], 0x100);
        let decoder = X86Decoder::new();
        let analysis = analyze(&image, &decoder, &[Address::new(0, 0x100)], AnalysisOptions::default()).unwrap();

        assert_eq!(analysis.blocks.len(), 3);
        assert_eq!(analysis.procedures.len(), 2);

        let main = analysis.procedures.id_at(Address::new(0, 0x100)).unwrap();
        let callee = analysis.procedures.id_at(Address::new(0, 0x104)).unwrap();
        assert_eq!(analysis.call_graph.callees(main), vec![callee]);
        assert_eq!(analysis.call_graph.callers(callee), vec![main]);
        assert_eq!(analysis.procedures.get(callee).unwrap().return_type, ReturnType::NEAR);

        let first = analysis.blocks.starting_at(Address::new(0, 0x100)).unwrap();
        assert_eq!(analysis.blocks.get(first).unwrap().block_type, BasicBlockType::Call);
        assert!(analysis.errors.is_empty());
    }

    #[test]
    fn test_far_call_to_near_procedure_warns() {
        // 0: push cs / 1: call 5 / 4: ret / 5: ret, reached as a far callee below
        let image = BinaryImage::from_bytes(&[0x0e, 0xe8, 0x01, 0x00, 0xc3, 0xc3], 0);
        let decoder = X86Decoder::new();
        let mut session = AnalysisSession::new();
        session.enqueue(XRef::new(XRefType::UserSpecified, Address::INVALID, Address::new(0, 0)));
        session.enqueue(XRef::new(XRefType::FarCall, Address::new(0, 4), Address::new(0, 5)));
        FlowAnalyzer::new(&image, &decoder, AnalysisOptions::default())
            .run(&mut session)
            .unwrap();

        let analysis = Analysis::from_session(session, true);
        assert_eq!(analysis.errors.count_code(ErrorCode::InconsistentCall), 1);
        let warning = analysis.errors.by_category(crate::analysis::ErrorCategory::Warning).next().unwrap();
        assert_eq!(warning.location, Address::new(0, 4));
    }

    #[test]
    fn test_invalid_entry_is_rejected() {
        let image = BinaryImage::from_bytes(&[0xc3], 0);
        let decoder = X86Decoder::new();
        let result = analyze(&image, &decoder, &[Address::INVALID], AnalysisOptions::default());
        assert!(matches!(result, Err(DisassemblyError::Analysis(AnalysisError::UnanchoredXRef))));
    }

    #[test]
    fn test_entry_outside_image_is_rejected() {
        let image = BinaryImage::from_bytes(&[0xc3], 0x100);
        let decoder = X86Decoder::new();
        let outside = Address::new(0, 0x50);
        let result = analyze(&image, &decoder, &[Address::new(0, 0x100), outside], AnalysisOptions::default());
        match result {
            Err(DisassemblyError::Analysis(AnalysisError::AddressOutOfImage(address))) => assert_eq!(address, outside),
            other => panic!("unexpected result: {:?}", other.map(|a| a.blocks.len())),
        }
    }

    #[test]
    fn test_skip_procedures() {
        let image = BinaryImage::from_bytes(&[0xe8, 0x01, 0x00, 0xc3, 0xc3], 0);
        let decoder = X86Decoder::new();
        let options = AnalysisOptions {
            build_procedures: false,
            ..AnalysisOptions::default()
        };
        let analysis = analyze(&image, &decoder, &[], options).unwrap();
        assert!(analysis.procedures.is_empty());
        assert!(analysis.call_graph.edges().is_empty());
        assert_eq!(analysis.cfg.edges().len(), 1);
    }
}
