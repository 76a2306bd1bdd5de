//! Dictionary Training and Shared-Dictionary Compression
//!
//! Wraps the zstd dictionary builder. Dictionaries are trained at a fixed
//! 4 KiB target from chunk samples; the trainer needs at least 7 samples,
//! so small sample sets are padded by replicating *every* chunk the same
//! number of times — replicating a single chunk would bias the dictionary
//! toward it.
//!
//! A trained dictionary is wrapped in [`TrainedDictionary`], which holds the
//! raw dictionary bytes plus a prepared `EncoderDictionary`. Prepared
//! dictionaries are `Sync`, so one instance is shared by every compression
//! worker without re-parsing per chunk.

use bytes::Bytes;
use zstd::dict::EncoderDictionary;

use crate::error::{Result, StorageError};

/// Target size for trained dictionaries (4 KiB).
pub const DICTIONARY_SIZE: usize = 1 << 12;

/// The zstd trainer rejects sample sets smaller than this.
pub const MIN_TRAINING_SAMPLES: usize = 7;

/// Compression level used everywhere in the archive engine.
pub const COMPRESSION_LEVEL: i32 = zstd::DEFAULT_COMPRESSION_LEVEL;

/// Train a dictionary from chunk samples, padding as needed.
pub fn train(samples: &[Bytes]) -> Result<TrainedDictionary> {
    if samples.is_empty() {
        return Err(StorageError::DictionaryTraining(
            "no samples to train from".to_string(),
        ));
    }

    // Replicate the whole sample set until the trainer's minimum is met, so
    // every chunk appears the same number of times.
    let mut padded: Vec<&[u8]> = Vec::with_capacity(samples.len().max(MIN_TRAINING_SAMPLES));
    while padded.len() < MIN_TRAINING_SAMPLES {
        for s in samples {
            padded.push(s.as_ref());
        }
    }

    // The trainer can reject sample sets it finds no structure in (random
    // or incompressible chunks). Zstd also accepts raw-content
    // dictionaries — arbitrary bytes used as a shared prefix — so fall
    // back to one cut from the samples; scoring decides whether it earns
    // its keep, exactly as with a trained dictionary.
    let raw = match zstd::dict::from_samples(&padded, DICTIONARY_SIZE) {
        Ok(dict) if !dict.is_empty() => dict,
        Ok(_) | Err(_) => raw_content_dictionary(samples),
    };
    Ok(TrainedDictionary::from_raw(raw))
}

fn raw_content_dictionary(samples: &[Bytes]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(DICTIONARY_SIZE);
    for sample in samples {
        let room = DICTIONARY_SIZE - raw.len();
        if room == 0 {
            break;
        }
        raw.extend_from_slice(&sample[..sample.len().min(room)]);
    }
    raw
}

/// A trained zstd dictionary, prepared for repeated compression.
pub struct TrainedDictionary {
    raw: Vec<u8>,
    encoder: EncoderDictionary<'static>,
}

impl TrainedDictionary {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        let encoder = EncoderDictionary::copy(&raw, COMPRESSION_LEVEL);
        Self { raw, encoder }
    }

    /// The raw dictionary bytes (what gets compressed into a byte span).
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Compress `data` with this dictionary.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressor = zstd::bulk::Compressor::with_prepared_dictionary(&self.encoder)?;
        Ok(compressor.compress(data)?)
    }

    /// The dictionary itself, zstd-compressed for storage as a byte span.
    pub fn compressed(&self) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(&self.raw, COMPRESSION_LEVEL)?)
    }
}

impl std::fmt::Debug for TrainedDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedDictionary")
            .field("raw_len", &self.raw.len())
            .finish()
    }
}
