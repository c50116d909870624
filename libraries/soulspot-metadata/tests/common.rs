//! Audio fixtures generated on the fly

#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Write a silent 16-bit mono PCM WAV file of `millis` length
pub fn write_silent_wav(dir: &Path, name: &str, millis: u32) -> PathBuf {
    let sample_rate: u32 = 8000;
    let samples = sample_rate * millis / 1000;
    let data_len = samples * 2;

    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");

    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    bytes.extend_from_slice(&2u16.to_le_bytes()); // block align
    bytes.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(bytes.len() + data_len as usize, 0);

    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("Failed to write wav fixture");
    path
}
