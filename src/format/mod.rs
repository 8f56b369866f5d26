//! Output format module implementation

mod csv;
mod json;
mod labels;

pub use self::labels::Labels;

use std::fmt::{self, Write as _};
use std::str::FromStr;

use clap::ValueEnum;
use strum::IntoEnumIterator;

use crate::analysis::{Analysis, ErrorCategory};
use crate::instruction::Instruction;
use crate::{Address, Disassembly, DisassemblyError, SymbolResolver};

/// Supported output formats for disassembly results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text listing (default)
    #[default]
    Text,
    /// JSON document
    Json,
    /// CSV, one row per instruction
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::Csv]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn DisassemblyFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for disassembly output
pub trait DisassemblyFormatter {
    /// Format a disassembly result
    fn format(&self, disassembly: &Disassembly) -> Result<String, DisassemblyError>;
}

/// Format disassembly as a plain text listing
pub struct TextFormatter;

/// Format disassembly in JSON
pub struct JsonFormatter;

/// Format disassembly in CSV
pub struct CsvFormatter;

/// Instruction bytes as space-separated lower-case hex
pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_instruction(
    out: &mut String,
    address: Address,
    insn: &Instruction,
    symbols: Option<&dyn SymbolResolver>,
) -> fmt::Result {
    writeln!(
        out,
        "  {}  {:<20} {}",
        address,
        hex_bytes(insn.bytes()),
        insn.display_at(address, symbols)
    )
}

impl DisassemblyFormatter for TextFormatter {
    fn format(&self, disassembly: &Disassembly) -> Result<String, DisassemblyError> {
        let mut output = String::new();

        let written = match disassembly {
            Disassembly::Stream(insns) => format_stream(&mut output, insns),
            Disassembly::Flow(analysis) => format_flow(&mut output, analysis),
        };
        written.map_err(|e| DisassemblyError::Generic(format!("Text formatting error: {}", e)))?;

        Ok(output)
    }
}

fn format_stream(out: &mut String, insns: &[(Address, Instruction)]) -> fmt::Result {
    writeln!(out, "; Linear sweep: {} instructions", insns.len())?;
    writeln!(out)?;
    for (address, insn) in insns {
        write_instruction(out, *address, insn, None)?;
    }
    Ok(())
}

fn format_flow(out: &mut String, analysis: &Analysis) -> fmt::Result {
    let labels = Labels::from_analysis(analysis);
    let name = |address: Address| -> String {
        labels
            .resolve(address)
            .map(str::to_string)
            .unwrap_or_else(|| address.to_string())
    };

    writeln!(
        out,
        "; Flow analysis: {} instructions, {} blocks, {} procedures",
        analysis.instructions.len(),
        analysis.blocks.len(),
        analysis.procedures.len()
    )?;

    for (id, block) in analysis.blocks.iter() {
        writeln!(out)?;
        if let Some(label) = labels.resolve(block.location) {
            writeln!(out, "{}:", label)?;
        }
        writeln!(out, "; block {} {}", id, block)?;
        for (address, insn) in analysis.block_instructions(block) {
            write_instruction(out, address, insn, Some(&labels))?;
        }
        let successors: Vec<String> = analysis
            .cfg
            .successors(id)
            .filter_map(|succ| analysis.blocks.get(succ))
            .map(|succ| name(succ.location))
            .collect();
        if !successors.is_empty() {
            writeln!(out, "; successors: {}", successors.join(", "))?;
        }
    }

    if !analysis.xrefs.is_empty() {
        writeln!(out)?;
        writeln!(out, "; Cross-references")?;
        for xref in analysis.xrefs.iter() {
            write!(out, ";   {:<16} {} -> {}", xref.xref_type, xref.source, xref.target)?;
            if xref.data_location.is_valid() {
                write!(out, " via {}", xref.data_location)?;
            }
            writeln!(out)?;
        }
    }

    if !analysis.procedures.is_empty() {
        writeln!(out)?;
        writeln!(out, "; Procedures")?;
        for (id, procedure) in analysis.procedures.iter() {
            let callees: Vec<String> = analysis
                .call_graph
                .callees(id)
                .into_iter()
                .filter_map(|callee| analysis.procedures.get(callee))
                .map(|callee| name(callee.entry_point))
                .collect();
            write!(
                out,
                ";   {} returns {}, {} block(s)",
                name(procedure.entry_point),
                procedure.return_type,
                procedure.blocks.len()
            )?;
            if !callees.is_empty() {
                write!(out, ", calls {}", callees.join(", "))?;
            }
            writeln!(out)?;
        }
    }

    if !analysis.errors.is_empty() {
        writeln!(out)?;
        let counts: Vec<String> = ErrorCategory::iter()
            .map(|category| format!("{} {}", analysis.errors.count(category), category))
            .collect();
        writeln!(out, "; Diagnostics: {}", counts.join(", "))?;
        for diagnostic in analysis.errors.sorted() {
            writeln!(out, ";   {}", diagnostic)?;
        }
    }
    Ok(())
}
