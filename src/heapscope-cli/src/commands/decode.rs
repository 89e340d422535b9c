//! One-shot decode of a dumped buffer

use crate::sink::render_full;
use anyhow::{Context, Result};
use heapscope::MemorySnapshot;
use std::fs;
use std::path::Path;

pub fn handle(input: &Path, json: bool) -> Result<()> {
    let snapshot = decode_file(input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", render_full(&snapshot));
    }

    Ok(())
}

fn decode_file(input: &Path) -> Result<MemorySnapshot> {
    let bytes =
        fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;

    heapscope::decode(&bytes).with_context(|| format!("Failed to decode {}", input.display()))
}
