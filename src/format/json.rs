//! JSON output formatter

use serde::Serialize;

use crate::analysis::{Analysis, BasicBlockType, BlockId, ErrorCategory, ErrorCode, ProcedureId, XRefType};
use crate::instruction::Instruction;
use crate::{Address, Disassembly, DisassemblyError, SymbolResolver};

use super::{hex_bytes, DisassemblyFormatter, Labels};

/// Serializable instruction for JSON output
#[derive(Serialize)]
struct InstructionJson {
    address: String,
    size: usize,
    mnemonic: &'static str,
    /// Full Intel-syntax text
    text: String,
    bytes: String,
}

#[derive(Serialize)]
struct BlockJson {
    id: BlockId,
    label: Option<String>,
    start: String,
    end: String,
    #[serde(rename = "type")]
    block_type: BasicBlockType,
    instructions: Vec<InstructionJson>,
    successors: Vec<BlockId>,
}

#[derive(Serialize)]
struct XRefJson {
    #[serde(rename = "type")]
    xref_type: XRefType,
    source: Option<String>,
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_location: Option<String>,
}

#[derive(Serialize)]
struct ProcedureJson {
    label: String,
    entry_point: String,
    return_type: String,
    blocks: Vec<BlockId>,
    callers: Vec<String>,
    callees: Vec<String>,
}

#[derive(Serialize)]
struct DiagnosticJson {
    location: Option<String>,
    category: ErrorCategory,
    code: ErrorCode,
    message: String,
}

/// Serializable disassembly result for JSON output
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DisassemblyJson {
    Stream {
        instructions: Vec<InstructionJson>,
    },
    Flow {
        blocks: Vec<BlockJson>,
        xrefs: Vec<XRefJson>,
        procedures: Vec<ProcedureJson>,
        errors: Vec<DiagnosticJson>,
    },
}

impl DisassemblyFormatter for super::JsonFormatter {
    fn format(&self, disassembly: &Disassembly) -> Result<String, DisassemblyError> {
        let result = match disassembly {
            Disassembly::Stream(insns) => DisassemblyJson::Stream {
                instructions: insns
                    .iter()
                    .map(|(address, insn)| instruction_to_json(*address, insn, None))
                    .collect(),
            },
            Disassembly::Flow(analysis) => flow_to_json(analysis),
        };

        Ok(serde_json::to_string_pretty(&result)?)
    }
}

fn flow_to_json(analysis: &Analysis) -> DisassemblyJson {
    let labels = Labels::from_analysis(analysis);
    let name = |address: Address| -> String {
        labels
            .resolve(address)
            .map(str::to_string)
            .unwrap_or_else(|| address.to_string())
    };

    let blocks = analysis
        .blocks
        .iter()
        .map(|(id, block)| BlockJson {
            id,
            label: labels.resolve(block.location).map(str::to_string),
            start: block.location.to_string(),
            end: block.end_address().to_string(),
            block_type: block.block_type,
            instructions: analysis
                .block_instructions(block)
                .map(|(address, insn)| instruction_to_json(address, insn, Some(&labels)))
                .collect(),
            successors: analysis.cfg.successors(id).collect(),
        })
        .collect();

    let xrefs = analysis
        .xrefs
        .iter()
        .map(|xref| XRefJson {
            xref_type: xref.xref_type,
            source: address_json(xref.source),
            target: address_json(xref.target),
            data_location: address_json(xref.data_location),
        })
        .collect();

    let entry_names = |ids: Vec<ProcedureId>| -> Vec<String> {
        ids.into_iter()
            .filter_map(|id| analysis.procedures.get(id))
            .map(|p| name(p.entry_point))
            .collect()
    };
    let procedures = analysis
        .procedures
        .iter()
        .map(|(id, procedure)| ProcedureJson {
            label: name(procedure.entry_point),
            entry_point: procedure.entry_point.to_string(),
            return_type: procedure.return_type.to_string(),
            blocks: procedure.blocks.iter().copied().collect(),
            callers: entry_names(analysis.call_graph.callers(id)),
            callees: entry_names(analysis.call_graph.callees(id)),
        })
        .collect();

    let errors = analysis
        .errors
        .sorted()
        .into_iter()
        .map(|d| DiagnosticJson {
            location: address_json(d.location),
            category: d.category,
            code: d.code,
            message: d.message.clone(),
        })
        .collect();

    DisassemblyJson::Flow {
        blocks,
        xrefs,
        procedures,
        errors,
    }
}

fn address_json(address: Address) -> Option<String> {
    address.is_valid().then(|| address.to_string())
}

/// Convert an instruction to JSON format
fn instruction_to_json(address: Address, insn: &Instruction, symbols: Option<&dyn SymbolResolver>) -> InstructionJson {
    InstructionJson {
        address: address.to_string(),
        size: insn.encoded_length(),
        mnemonic: insn.operation().mnemonic(),
        text: insn.display_at(address, symbols).to_string(),
        bytes: hex_bytes(insn.bytes()),
    }
}
