//! Python bindings for the realflow analyzer

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::analysis::AnalysisOptions;
use crate::decoder::X86Decoder;
use crate::format::OutputFormat;
use crate::image::BinaryImage;
use crate::strategy::Strategy;
use crate::Address;

fn parse_strategy(strategy: &str) -> PyResult<Strategy> {
    match strategy.to_lowercase().as_str() {
        "linear" => Ok(Strategy::Linear),
        "recursive" => Ok(Strategy::Recursive),
        _ => Err(PyValueError::new_err(format!("Unknown strategy: {}", strategy))),
    }
}

fn parse_entries(entries: Option<Vec<String>>) -> PyResult<Vec<Address>> {
    entries
        .unwrap_or_default()
        .iter()
        .map(|entry| entry.parse::<Address>().map_err(PyValueError::new_err))
        .collect()
}

fn run(image: &BinaryImage, entries: &[Address], strategy: &str, output_format: &str) -> PyResult<String> {
    let strategy = parse_strategy(strategy)?;
    let output_format = output_format.parse::<OutputFormat>().map_err(PyValueError::new_err)?;

    let disassembly = strategy
        .run(image, &X86Decoder::new(), entries, AnalysisOptions::default())
        .map_err(|e| PyValueError::new_err(format!("Analysis failed: {}", e)))?;

    output_format
        .get_formatter()
        .format(&disassembly)
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Analyze raw 16-bit code loaded at `base` in segment 0
///
/// `entries` are `OFFSET` or `SEG:OFFSET` hex strings; without them the
/// analysis starts at `base`.
#[pyfunction]
#[pyo3(signature = (
    data,
    base=0x100,
    entries=None,
    strategy="recursive",
    output_format="text"
))]
fn analyze(
    data: Vec<u8>,
    base: u16,
    entries: Option<Vec<String>>,
    strategy: &str,
    output_format: &str,
) -> PyResult<String> {
    let image = BinaryImage::from_bytes(&data, base);
    let entries = parse_entries(entries)?;
    run(&image, &entries, strategy, output_format)
}

/// Analyze a raw image file
#[pyfunction]
#[pyo3(signature = (
    file_path,
    base=0x100,
    entries=None,
    strategy="recursive",
    output_format="text"
))]
fn analyze_file(
    file_path: &str,
    base: u16,
    entries: Option<Vec<String>>,
    strategy: &str,
    output_format: &str,
) -> PyResult<String> {
    let image = BinaryImage::from_file(file_path, base)
        .map_err(|e| PyIOError::new_err(format!("Failed to load {}: {}", file_path, e)))?;
    let entries = parse_entries(entries)?;
    log::debug!("Analyzing file from Python: {}", file_path);
    run(&image, &entries, strategy, output_format)
}

/// Python module initialization
#[pymodule]
fn realflow(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(analyze, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_file, m)?)?;

    let py = m.py();
    let output_format = PyDict::new(py);
    for format in OutputFormat::available_formats() {
        output_format.set_item(format.to_string().to_uppercase(), format.to_string())?;
    }
    m.setattr("OutputFormat", output_format)?;

    let strategy = PyDict::new(py);
    strategy.set_item("LINEAR", "linear")?;
    strategy.set_item("RECURSIVE", "recursive")?;
    m.setattr("Strategy", strategy)?;

    Ok(())
}
