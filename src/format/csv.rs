//! CSV output formatter

use serde::Serialize;

use crate::analysis::Analysis;
use crate::instruction::Instruction;
use crate::{Address, Disassembly, DisassemblyError, SymbolResolver};

use super::{hex_bytes, DisassemblyFormatter, Labels};

/// One CSV row per instruction
#[derive(Serialize)]
struct InstructionRow<'a> {
    address: String,
    block: Option<String>,
    block_type: Option<&'static str>,
    procedure: Option<&'a str>,
    size: usize,
    bytes: String,
    instruction: String,
}

impl DisassemblyFormatter for super::CsvFormatter {
    fn format(&self, disassembly: &Disassembly) -> Result<String, DisassemblyError> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        match disassembly {
            Disassembly::Stream(insns) => {
                for (address, insn) in insns {
                    writer.serialize(row(*address, insn, None))?;
                }
            }
            Disassembly::Flow(analysis) => write_flow(&mut writer, analysis)?,
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| DisassemblyError::Generic(format!("CSV flush error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| DisassemblyError::Generic(format!("CSV encoding error: {}", e)))
    }
}

fn write_flow(writer: &mut csv::Writer<Vec<u8>>, analysis: &Analysis) -> Result<(), DisassemblyError> {
    let labels = Labels::from_analysis(analysis);

    for (id, block) in analysis.blocks.iter() {
        // A shared block is listed under the first procedure that owns it
        let owner = analysis
            .procedures
            .containing(id)
            .next()
            .and_then(|p| analysis.procedures.get(p))
            .and_then(|p| labels.resolve(p.entry_point));

        for (address, insn) in analysis.block_instructions(block) {
            let mut record = row(address, insn, Some(&labels));
            record.block = Some(block.location.to_string());
            record.block_type = Some(block.block_type.into());
            record.procedure = owner;
            writer.serialize(record)?;
        }
    }
    Ok(())
}

fn row<'a>(address: Address, insn: &Instruction, symbols: Option<&dyn SymbolResolver>) -> InstructionRow<'a> {
    InstructionRow {
        address: address.to_string(),
        block: None,
        block_type: None,
        procedure: None,
        size: insn.encoded_length(),
        bytes: hex_bytes(insn.bytes()),
        instruction: insn.display_at(address, symbols).to_string(),
    }
}
