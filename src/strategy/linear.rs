//! Linear-sweep disassembly with parallel decoding
//!
//! Each segment is cut into fixed-size chunks that are swept concurrently.
//! A chunk sweep that started out of step with the true instruction stream
//! is corrected while stitching: decoding continues sequentially from the
//! previous chunk's end until it meets an address the chunk also decoded,
//! after which the rest of the chunk is identical to a sequential sweep.

use std::collections::BTreeMap;
use std::time::Instant;

use rayon::prelude::*;

use crate::instruction::Instruction;
use crate::{Address, Decoder, Disassembly, DisassemblyError, ImageProvider};

/// Maximum chunk size for parallel processing
const CHUNK_SIZE: i32 = 4096;

/// Linear sweep over every segment of `image`.
///
/// Undecodable bytes are skipped one at a time.
pub fn run(image: &dyn ImageProvider, decoder: &dyn Decoder) -> Result<Disassembly, DisassemblyError> {
    let start_time = Instant::now();

    let mut instructions = Vec::new();
    for segment in 0..image.segment_count() as i32 {
        let Some((start, end)) = image.segment_bounds(segment) else {
            continue;
        };
        log::debug!("Sweeping segment {} [{:04X}, {:04X})", segment, start, end);
        instructions.extend(sweep_segment(image, decoder, segment, start, end));
    }

    log::info!(
        "Linear sweep decoded {} instructions in {:?}",
        instructions.len(),
        start_time.elapsed()
    );
    Ok(Disassembly::Stream(instructions))
}

fn sweep_segment(
    image: &dyn ImageProvider,
    decoder: &dyn Decoder,
    segment: i32,
    start: i32,
    end: i32,
) -> Vec<(Address, Instruction)> {
    let chunks: Vec<(i32, i32)> = (start..end)
        .step_by(CHUNK_SIZE as usize)
        .map(|chunk_start| (chunk_start, (chunk_start + CHUNK_SIZE).min(end)))
        .collect();

    let swept: Vec<BTreeMap<i32, Instruction>> = chunks
        .par_iter()
        .map(|&(chunk_start, chunk_end)| sweep_range(image, decoder, segment, chunk_start, chunk_end))
        .collect();

    let mut out = Vec::new();
    let mut next = start;
    for (decoded, (_, chunk_end)) in swept.into_iter().zip(chunks) {
        // Resynchronise with the chunk's own stream
        while next < chunk_end && !decoded.contains_key(&next) {
            let address = Address::new(segment, next);
            next = match decode_at(image, decoder, address) {
                Some(instruction) => {
                    let following = next + instruction.encoded_length() as i32;
                    out.push((address, instruction));
                    following
                }
                None => next + 1,
            };
        }
        if next >= chunk_end {
            continue;
        }
        let from = next;
        for (offset, instruction) in decoded.into_iter().filter(|(offset, _)| *offset >= from) {
            next = offset + instruction.encoded_length() as i32;
            out.push((Address::new(segment, offset), instruction));
        }
    }
    out
}

/// Sequential sweep over instructions starting in `[start, end)`.
fn sweep_range(
    image: &dyn ImageProvider,
    decoder: &dyn Decoder,
    segment: i32,
    start: i32,
    end: i32,
) -> BTreeMap<i32, Instruction> {
    let mut decoded = BTreeMap::new();
    let mut at = start;
    while at < end {
        match decode_at(image, decoder, Address::new(segment, at)) {
            Some(instruction) => {
                let length = instruction.encoded_length() as i32;
                decoded.insert(at, instruction);
                at += length;
            }
            None => at += 1,
        }
    }
    decoded
}

fn decode_at(image: &dyn ImageProvider, decoder: &dyn Decoder, address: Address) -> Option<Instruction> {
    let window = image.segment_tail(address)?;
    decoder
        .decode(window)
        .ok()
        .filter(|instruction| instruction.encoded_length() > 0)
}
