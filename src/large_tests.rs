#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    use rstest::rstest;

    use crate::{
        analysis::{
            worklist::Worklist, AnalysisError, AnalysisOptions, AnalysisSession, BasicBlockType, ByteType,
            ErrorCategory, ErrorCode, FlowAnalyzer, ReturnType, XRef, XRefType,
        },
        decoder::{tables::{OpcodeEntry, ONE_BYTE}, DecodeError, X86Decoder},
        format::OutputFormat,
        image::BinaryImage,
        strategy::{recursive, Strategy},
        Address, Analysis, Decoder, Disassembly, DisassemblyError,
    };

    fn analyze_at_zero(code: &[u8]) -> Analysis {
        let image = BinaryImage::from_bytes(code, 0);
        recursive::analyze(&image, &X86Decoder::new(), &[Address::new(0, 0)], AnalysisOptions::default())
            .expect("Analysis failed")
    }

    fn block_types(analysis: &Analysis) -> Vec<(i32, i32, BasicBlockType)> {
        analysis
            .blocks
            .iter()
            .map(|(_, b)| (b.location.offset, b.end_address().offset, b.block_type))
            .collect()
    }

    #[test]
    fn test_mov_jmp_ret() {
        // 0: mov ax, 1 / 3: jmp 5 / 5: ret
        let analysis = analyze_at_zero(&[0xb8, 0x01, 0x00, 0xeb, 0x00, 0xc3]);

        assert_eq!(
            block_types(&analysis),
            vec![(0, 5, BasicBlockType::Jump), (5, 6, BasicBlockType::Return)]
        );

        let edges = analysis.cfg.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].xref.xref_type, XRefType::NearJump);

        assert_eq!(analysis.procedures.len(), 1);
        let main = analysis.procedures.at_entry(Address::new(0, 0)).unwrap();
        assert_eq!(main.return_type, ReturnType::NEAR);
        assert_eq!(main.blocks.len(), 2);
        assert!(analysis.errors.is_empty(), "{:?}", analysis.errors);
    }

    #[test]
    fn test_worklist_prefers_direct_flow_over_table_slots() {
        let mut worklist = Worklist::new();
        worklist.push(XRef::indexed(Address::new(0, 0), Address::new(0, 0x20)));
        worklist.push(XRef::new(XRefType::FallThrough, Address::new(0, 1), Address::new(0, 2)));
        worklist.push(XRef::new(XRefType::NearJump, Address::new(0, 3), Address::new(0, 4)));
        worklist.push(XRef::new(XRefType::NearJump, Address::new(0, 5), Address::new(0, 6)));

        let order: Vec<(XRefType, i32)> = std::iter::from_fn(|| worklist.pop())
            .map(|x| (x.xref_type, x.source.offset))
            .collect();
        assert_eq!(
            order,
            vec![
                (XRefType::NearJump, 3),
                (XRefType::NearJump, 5),
                (XRefType::FallThrough, 1),
                (XRefType::NearIndexedJump, 0),
            ]
        );
    }

    #[test]
    fn test_direct_jump_block_created_before_table_slot_block() {
        // 0: jmp word ptr cs:[bx+0xa] / 5: jmp 8 / 7: ret / 8: ret / 9: nop / a: dw 7
        let code = [0x2e, 0xff, 0xa7, 0x0a, 0x00, 0xeb, 0x01, 0xc3, 0xc3, 0x90, 0x07, 0x00];
        let image = BinaryImage::from_bytes(&code, 0);
        let entries = [Address::new(0, 0), Address::new(0, 5)];
        let analysis = recursive::analyze(&image, &X86Decoder::new(), &entries, AnalysisOptions::default()).unwrap();

        // The table slot is queued before `jmp 8` is even decoded
        let direct = analysis.blocks.starting_at(Address::new(0, 8)).unwrap();
        let from_table = analysis.blocks.starting_at(Address::new(0, 7)).unwrap();
        assert!(direct < from_table, "{:?} vs {:?}", direct, from_table);
        assert_eq!((direct.0, from_table.0), (2, 3));

        assert_eq!(analysis.blocks.get(from_table).unwrap().block_type, BasicBlockType::Return);
        assert_eq!(analysis.bytes.get(Address::new(0, 10)).byte_type(), ByteType::Data);
        assert!(analysis.bytes.get(Address::new(0, 9)).is_unknown());
    }

    #[test]
    fn test_backward_jump_splits_block() {
        // 0: nop / 1: nop / 2: jmp 1
        let analysis = analyze_at_zero(&[0x90, 0x90, 0xeb, 0xfd]);

        assert_eq!(
            block_types(&analysis),
            vec![(0, 1, BasicBlockType::FallThrough), (1, 4, BasicBlockType::Jump)]
        );

        let fall_through: Vec<_> = analysis
            .cfg
            .edges()
            .iter()
            .filter(|e| e.xref.xref_type == XRefType::FallThrough)
            .collect();
        assert_eq!(fall_through.len(), 1);
        assert_eq!(fall_through[0].xref.source, Address::new(0, 0));
        assert_eq!(fall_through[0].xref.target, Address::new(0, 1));

        // The loop never returns, which is a warning but not an error
        assert_eq!(analysis.errors.count(ErrorCategory::Error), 0);
        assert_eq!(analysis.errors.count_code(ErrorCode::InconsistentCall), 1);
    }

    #[test]
    fn test_mixed_returns_warn_once() {
        // 0: call 5 / 3: ret / 4: nop / 5: jz 8 / 7: ret / 8: retf
        let analysis = analyze_at_zero(&[0xe8, 0x02, 0x00, 0xc3, 0x90, 0x74, 0x01, 0xc3, 0xcb]);

        let callee = analysis.procedures.at_entry(Address::new(0, 5)).unwrap();
        assert_eq!(callee.return_type, ReturnType::NEAR | ReturnType::FAR);
        assert_eq!(callee.blocks.len(), 3);

        assert_eq!(analysis.errors.count_code(ErrorCode::InconsistentCall), 1);
        let warning = analysis.errors.by_category(ErrorCategory::Warning).next().unwrap();
        assert_eq!(warning.location, Address::new(0, 5));

        // The never-reached nop stays unclassified
        assert!(analysis.bytes.get(Address::new(0, 4)).is_unknown());
    }

    #[test]
    fn test_jump_table() {
        // 0: jmp word ptr cs:[bx+8] / 5: ret / 6: ret / 7: nop / 8: dw 5, 6
        let code = [0x2e, 0xff, 0xa7, 0x08, 0x00, 0xc3, 0xc3, 0x90, 0x05, 0x00, 0x06, 0x00];
        let analysis = analyze_at_zero(&code);

        assert_eq!(
            block_types(&analysis),
            vec![
                (0, 5, BasicBlockType::Jump),
                (5, 6, BasicBlockType::Return),
                (6, 7, BasicBlockType::Return),
            ]
        );

        for offset in 8..12 {
            assert_eq!(analysis.bytes.get(Address::new(0, offset)).byte_type(), ByteType::Data);
        }
        assert!(analysis.bytes.get(Address::new(0, 7)).is_unknown());

        let table_edges: Vec<Address> = analysis
            .xrefs
            .iter()
            .filter(|x| x.xref_type == XRefType::NearIndexedJump)
            .map(|x| x.data_location)
            .collect();
        assert_eq!(table_edges, vec![Address::new(0, 8), Address::new(0, 10)]);
        assert_eq!(analysis.cfg.edges().len(), 2);

        // The memory operand itself is only a message
        assert_eq!(analysis.errors.len(), 1);
        assert_eq!(analysis.errors.count_code(ErrorCode::DynamicTarget), 1);
    }

    #[test]
    fn test_jump_table_entry_limit() {
        let code = [0x2e, 0xff, 0xa7, 0x08, 0x00, 0xc3, 0xc3, 0x90, 0x05, 0x00, 0x06, 0x00];
        let image = BinaryImage::from_bytes(&code, 0);
        let options = AnalysisOptions {
            max_jump_table_entries: 1,
            ..AnalysisOptions::default()
        };
        let analysis = recursive::analyze(&image, &X86Decoder::new(), &[Address::new(0, 0)], options).unwrap();

        assert_eq!(analysis.blocks.len(), 2);
        assert!(analysis.bytes.get(Address::new(0, 10)).is_unknown());
    }

    #[rstest]
    #[case::fall_off_segment(&[0x90, 0x90], ErrorCode::OutOfImage)]
    #[case::invalid_opcode(&[0x90, 0x64], ErrorCode::InvalidInstruction)]
    #[case::wrapped_branch(&[0xeb, 0x80], ErrorCode::AddressWrapped)]
    fn test_input_problems_become_diagnostics(#[case] code: &[u8], #[case] expected: ErrorCode) {
        let analysis = analyze_at_zero(code);
        assert!(
            analysis.errors.count_code(expected) >= 1,
            "expected {} in {:?}",
            expected,
            analysis.errors
        );
    }

    #[test]
    fn test_one_byte_opcodes_consume_exact_length() {
        let decoder = X86Decoder::new();
        let mut checked = 0;

        for opcode in 0..=255u8 {
            if !matches!(ONE_BYTE[opcode as usize], OpcodeEntry::Op(..)) {
                continue;
            }
            let mut buffer = [0u8; 8];
            buffer[0] = opcode;

            let insn = decoder
                .decode(&buffer)
                .unwrap_or_else(|e| panic!("{:#04x} failed to decode: {}", opcode, e));
            let length = insn.encoded_length();

            let exact = decoder.decode(&buffer[..length]).unwrap();
            assert_eq!(exact, insn, "{:#04x}", opcode);
            assert_eq!(
                decoder.decode(&buffer[..length - 1]),
                Err(DecodeError::Truncated),
                "{:#04x} decoded from {} bytes",
                opcode,
                length - 1
            );
            checked += 1;
        }
        assert!(checked > 150, "only {} opcodes checked", checked);
    }

    #[test]
    fn test_byte_classification_is_monotonic() {
        // 0: jz 5 / 2: nop / 3: jmp 6 / 5: ret / 6: inc ax / 7: ret
        let code = [0x74, 0x03, 0x90, 0xeb, 0x01, 0xc3, 0x40, 0xc3];
        let image = BinaryImage::from_bytes(&code, 0);
        let decoder = X86Decoder::new();
        let analyzer = FlowAnalyzer::new(&image, &decoder, AnalysisOptions::default());
        let mut session = AnalysisSession::new();

        let snapshot = |session: &AnalysisSession| -> Vec<ByteType> {
            (0..code.len() as i32)
                .map(|o| session.bytes.get(Address::new(0, o)).byte_type())
                .collect()
        };

        analyzer
            .analyze(&mut session, Address::new(0, 6), XRefType::UserSpecified)
            .unwrap();
        let first = snapshot(&session);

        analyzer
            .analyze(&mut session, Address::new(0, 0), XRefType::UserSpecified)
            .unwrap();
        let second = snapshot(&session);

        for (offset, (before, after)) in first.iter().zip(&second).enumerate() {
            if *before != ByteType::Unknown {
                assert_eq!(before, after, "byte {} changed type", offset);
            }
        }
        assert!(second.iter().all(|t| *t == ByteType::Code));
        assert_eq!(session.blocks.len(), 4);
    }

    #[test]
    fn test_cancelled_analysis() {
        let image = BinaryImage::from_bytes(&[0x90, 0xc3], 0);
        let options = AnalysisOptions {
            cancel_flag: Some(Arc::new(AtomicBool::new(true))),
            ..AnalysisOptions::default()
        };

        let result = recursive::analyze(&image, &X86Decoder::new(), &[], options);
        assert!(matches!(
            result,
            Err(DisassemblyError::Analysis(AnalysisError::Cancelled))
        ));
    }

    #[test]
    fn test_file_to_every_format() {
        // COM layout: call 0x104 / ret / ret
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("program.com");
        fs::write(&path, [0xe8, 0x01, 0x00, 0xc3, 0xc3]).unwrap();

        let image = BinaryImage::from_file(&path, 0x100).unwrap();
        let decoder = X86Decoder::new();

        for strategy in Strategy::all() {
            let start = Instant::now();
            let disassembly = strategy
                .run(&image, &decoder, &[], AnalysisOptions::default())
                .unwrap_or_else(|e| panic!("{} failed: {}", strategy, e));
            println!("{} completed in {:?}", strategy, start.elapsed());

            match (&disassembly, strategy) {
                (Disassembly::Stream(insns), Strategy::Linear) => assert_eq!(insns.len(), 3),
                (Disassembly::Flow(analysis), Strategy::Recursive) => {
                    assert_eq!(analysis.procedures.len(), 2);
                    assert_eq!(analysis.call_graph.edges().len(), 1);
                }
                _ => panic!("{} produced the wrong kind of result", strategy),
            }

            for format in OutputFormat::available_formats() {
                let output = format
                    .get_formatter()
                    .format(&disassembly)
                    .unwrap_or_else(|e| panic!("Formatting failed for {}: {}", format, e));
                assert!(!output.is_empty(), "Empty {} output for {}", format, strategy);
            }
        }
    }
}
