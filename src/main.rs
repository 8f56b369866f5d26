use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use realflow::analysis::AnalysisOptions;
use realflow::decoder::X86Decoder;
use realflow::format::OutputFormat;
use realflow::image::BinaryImage;
use realflow::strategy::Strategy;
use realflow::{Address, Disassembly};

/// Decode and flow-analyze raw 16-bit x86 images
#[derive(Parser, Debug)]
#[command(name = "realflow", version, about)]
struct Cli {
    /// Raw image to analyze
    file: PathBuf,

    /// Offset of the first byte in segment 0 (hex)
    #[arg(long, default_value = "100", value_parser = parse_base)]
    base: u16,

    /// Entry point as OFFSET or SEG:OFFSET (hex); repeatable
    #[arg(short, long = "entry")]
    entries: Vec<Address>,

    #[arg(short, long, value_enum, default_value_t = Strategy::Recursive)]
    strategy: Strategy,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write output here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum number of jump-table slots read per table
    #[arg(long, default_value_t = AnalysisOptions::default().max_jump_table_entries)]
    max_jump_table: usize,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_base(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid base '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("realflow", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let image = BinaryImage::from_file(&cli.file, cli.base)
        .with_context(|| format!("Failed to load {}", cli.file.display()))?;

    let options = AnalysisOptions {
        max_jump_table_entries: cli.max_jump_table,
        ..AnalysisOptions::default()
    };
    log::info!("{} over {}", cli.strategy, cli.file.display());
    let disassembly = cli
        .strategy
        .run(&image, &X86Decoder::new(), &cli.entries, options)
        .context("Analysis failed")?;

    if let Disassembly::Flow(analysis) = &disassembly {
        if !analysis.errors.is_empty() {
            log::warn!("Analysis recorded {} diagnostic(s)", analysis.errors.len());
        }
    }

    let rendered = cli
        .format
        .get_formatter()
        .format(&disassembly)
        .with_context(|| format!("Failed to render {} output", cli.format))?;

    match &cli.output {
        Some(path) => fs::write(path, rendered).with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", rendered),
    }
    Ok(())
}
