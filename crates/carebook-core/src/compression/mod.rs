//! Compression engine for snapshot payloads.
//!
//! Payloads are compressed with one of the DEFLATE-family codecs provided by
//! `flate2`. Large payloads are split into chunks that are compressed and
//! checksummed independently.
//!
//! ## Envelope Format
//!
//! ```text
//! | magic "CBZ1" (4) | version (1) | algorithm (1) | flags (1) | original_size (8) | chunk_count (4) |
//! | chunk table: chunk_count * (original_len (4) | compressed_len (4) | sha256 (32)) |
//! | header digest: sha256 of everything above (32) |
//! | chunk data... |
//! ```
//!
//! All integers are little-endian. The header digest covers the header and
//! chunk table; chunk data is covered by the per-chunk digests, so a damaged
//! chunk is reported on its own.

mod envelope;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::{
    read::{DeflateDecoder, GzDecoder, ZlibDecoder},
    write::{DeflateEncoder, GzEncoder, ZlibEncoder},
    Compression,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, IntegrityErrorKind, Result};

/// Default size above which payloads are chunked (1 MiB).
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1024 * 1024;
/// Default chunk size (512 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
/// Default sample size for algorithm selection (64 KiB).
pub const DEFAULT_SAMPLE_SIZE: usize = 64 * 1024;

/// Supported codecs, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// No compression
    Stored,
    /// Raw DEFLATE stream
    Deflate,
    /// DEFLATE with zlib header and Adler-32
    Zlib,
    /// DEFLATE with gzip header and CRC-32
    Gzip,
}

impl CompressionAlgorithm {
    /// Every algorithm, ordered by known speed (tie-break order).
    pub const ALL: [Self; 4] = [Self::Stored, Self::Deflate, Self::Zlib, Self::Gzip];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Deflate => "deflate",
            Self::Zlib => "zlib",
            Self::Gzip => "gzip",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::Stored => 0,
            Self::Deflate => 1,
            Self::Zlib => 2,
            Self::Gzip => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Stored),
            1 => Ok(Self::Deflate),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Gzip),
            other => Err(Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("unknown compression algorithm tag {other}"),
            )),
        }
    }

    fn encode(self, data: &[u8], level: Compression) -> Result<Vec<u8>> {
        let capacity = data.len() / 2 + 64;
        let encoded = match self {
            Self::Stored => data.to_vec(),
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(capacity), level);
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(capacity), level);
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(capacity), level);
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };
        Ok(encoded)
    }

    /// Decode at most `expected_len + 1` bytes so a bad stream cannot balloon.
    fn decode(self, data: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
        let limit = expected_len as u64 + 1;
        let mut out = Vec::with_capacity(expected_len);
        match self {
            Self::Stored => out.extend_from_slice(data),
            Self::Deflate => {
                DeflateDecoder::new(data).take(limit).read_to_end(&mut out)?;
            }
            Self::Zlib => {
                ZlibDecoder::new(data).take(limit).read_to_end(&mut out)?;
            }
            Self::Gzip => {
                GzDecoder::new(data).take(limit).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidInput(format!("unknown compression algorithm '{s}'")))
    }
}

/// Tuning for the compression engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Payloads larger than this are chunked
    pub chunk_threshold: usize,
    /// Size of each chunk when chunking
    pub chunk_size: usize,
    /// Bytes used to pick an algorithm
    pub sample_size: usize,
    /// flate2 level (0-9)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            level: 6,
        }
    }
}

/// One independently compressed slice of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk {
    pub original_size: u32,
    /// SHA-256 of `data`
    pub checksum: [u8; 32],
    pub data: Vec<u8>,
}

impl CompressedChunk {
    fn is_intact(&self) -> bool {
        Sha256::digest(&self.data).as_slice() == self.checksum
    }
}

/// Result of `CompressionEngine::compress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    pub algorithm: CompressionAlgorithm,
    pub original_size: u64,
    pub compressed_size: u64,
    pub is_chunked: bool,
    pub chunks: Vec<CompressedChunk>,
}

impl CompressedPayload {
    /// Compressed bytes of every chunk, concatenated.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.data.iter().copied())
            .collect()
    }

    /// Compressed-to-original size ratio (1.0 for empty input).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }

    /// Indexes of chunks whose data no longer matches its checksum.
    #[must_use]
    pub fn corrupted_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| !chunk.is_intact())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        envelope::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        envelope::decode(bytes)
    }
}

/// Picks an algorithm, chunks, compresses, and restores payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionEngine {
    config: CompressionConfig,
}

impl CompressionEngine {
    #[must_use]
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config: CompressionConfig {
                chunk_size: config.chunk_size.max(1),
                level: config.level.min(9),
                ..config
            },
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Smallest algorithm on a sample of `data`; ties go to the faster one.
    #[must_use]
    pub fn select_algorithm(&self, data: &[u8]) -> CompressionAlgorithm {
        let sample = &data[..data.len().min(self.config.sample_size)];
        let level = Compression::new(self.config.level);

        let mut best = (CompressionAlgorithm::Stored, sample.len());
        for algorithm in CompressionAlgorithm::ALL {
            match algorithm.encode(sample, level) {
                Ok(encoded) if encoded.len() < best.1 => best = (algorithm, encoded.len()),
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!("Skipping {algorithm} during selection: {error}");
                }
            }
        }
        best.0
    }

    /// Compress `data`, choosing an algorithm when none is given.
    pub fn compress(
        &self,
        data: &[u8],
        algorithm: Option<CompressionAlgorithm>,
    ) -> Result<CompressedPayload> {
        let algorithm = algorithm.unwrap_or_else(|| self.select_algorithm(data));
        let level = Compression::new(self.config.level);
        let is_chunked = data.len() > self.config.chunk_threshold;

        let pieces: Vec<&[u8]> = if is_chunked {
            data.chunks(self.config.chunk_size).collect()
        } else {
            vec![data]
        };

        let chunks = pieces
            .into_iter()
            .map(|piece| {
                let original_size = u32::try_from(piece.len()).map_err(|_| {
                    Error::InvalidInput(format!(
                        "chunk of {} bytes exceeds the 4 GiB chunk limit",
                        piece.len()
                    ))
                })?;
                let encoded = algorithm.encode(piece, level)?;
                Ok(CompressedChunk {
                    original_size,
                    checksum: Sha256::digest(&encoded).into(),
                    data: encoded,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let compressed_size = chunks.iter().map(|chunk| chunk.data.len() as u64).sum();
        tracing::debug!(
            "Compressed {} bytes to {compressed_size} with {algorithm} ({} chunk(s))",
            data.len(),
            chunks.len()
        );

        Ok(CompressedPayload {
            algorithm,
            original_size: data.len() as u64,
            compressed_size,
            is_chunked,
            chunks,
        })
    }

    /// Restore the exact original bytes.
    pub fn decompress(&self, payload: &CompressedPayload) -> Result<Vec<u8>> {
        let capacity = usize::try_from(payload.original_size).map_err(|_| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                "payload is too large for this platform",
            )
        })?;
        let mut out = Vec::with_capacity(capacity);

        for (index, chunk) in payload.chunks.iter().enumerate() {
            if !chunk.is_intact() {
                return Err(corrupted_chunk(index, "checksum mismatch"));
            }
            let expected = chunk.original_size as usize;
            let decoded = payload
                .algorithm
                .decode(&chunk.data, expected)
                .map_err(|error| corrupted_chunk(index, &error.to_string()))?;
            if decoded.len() != expected {
                return Err(corrupted_chunk(
                    index,
                    &format!("expected {expected} bytes, decoded {}", decoded.len()),
                ));
            }
            out.extend_from_slice(&decoded);
        }

        if out.len() as u64 != payload.original_size {
            return Err(Error::integrity(
                IntegrityErrorKind::CorruptedData,
                format!(
                    "decompressed {} bytes, expected {}",
                    out.len(),
                    payload.original_size
                ),
            ));
        }
        Ok(out)
    }

    pub fn compress_json<T: Serialize>(
        &self,
        value: &T,
        algorithm: Option<CompressionAlgorithm>,
    ) -> Result<CompressedPayload> {
        self.compress(&serde_json::to_vec(value)?, algorithm)
    }

    pub fn decompress_json<T: DeserializeOwned>(&self, payload: &CompressedPayload) -> Result<T> {
        let bytes = self.decompress(payload)?;
        serde_json::from_slice(&bytes).map_err(|error| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("decompressed payload is not valid JSON: {error}"),
            )
        })
    }
}

fn corrupted_chunk(index: usize, detail: &str) -> Error {
    Error::integrity(
        IntegrityErrorKind::CorruptedData,
        format!("chunk {index} is corrupted: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn small_chunks() -> CompressionEngine {
        CompressionEngine::new(CompressionConfig {
            chunk_threshold: 1024,
            chunk_size: 256,
            sample_size: 512,
            level: 6,
        })
    }

    fn clinic_text(len: usize) -> Vec<u8> {
        "patient:Ada Lovelace;visit:checkup;notes:all good\n"
            .bytes()
            .cycle()
            .take(len)
            .collect()
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state.to_le_bytes()[0]
            })
            .collect()
    }

    #[test]
    fn every_algorithm_roundtrips() {
        let engine = CompressionEngine::default();
        let data = clinic_text(10_000);
        for algorithm in CompressionAlgorithm::ALL {
            let payload = engine.compress(&data, Some(algorithm)).unwrap();
            assert_eq!(payload.algorithm, algorithm);
            assert!(!payload.is_chunked);
            assert_eq!(engine.decompress(&payload).unwrap(), data);
        }
    }

    #[test]
    fn chunked_payload_roundtrips_through_envelope() {
        let engine = small_chunks();
        let data = clinic_text(5_000);

        let payload = engine.compress(&data, None).unwrap();
        assert!(payload.is_chunked);
        assert_eq!(payload.chunks.len(), 20);
        assert_eq!(payload.original_size, 5_000);

        let restored = CompressedPayload::from_bytes(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, payload);
        assert_eq!(engine.decompress(&restored).unwrap(), data);
    }

    #[test]
    fn empty_input_roundtrips() {
        let engine = CompressionEngine::default();
        let payload = engine.compress(&[], None).unwrap();
        assert_eq!(payload.original_size, 0);
        assert_eq!(engine.decompress(&payload).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn json_structure_roundtrips() {
        let engine = CompressionEngine::default();
        let value = json!({"tables": {"patients": [{"id": "p-1", "age": 41}]}, "version": 1});
        let payload = engine.compress_json(&value, None).unwrap();
        let restored: serde_json::Value = engine.decompress_json(&payload).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn selection_prefers_compression_for_repetitive_data() {
        let engine = CompressionEngine::default();
        let chosen = engine.select_algorithm(&clinic_text(20_000));
        assert_ne!(chosen, CompressionAlgorithm::Stored);
        // Raw deflate has the smallest framing of the family.
        assert_eq!(chosen, CompressionAlgorithm::Deflate);
    }

    #[test]
    fn selection_falls_back_to_stored_for_noise() {
        let engine = CompressionEngine::default();
        assert_eq!(
            engine.select_algorithm(&pseudo_random(4_096)),
            CompressionAlgorithm::Stored
        );
        assert_eq!(engine.select_algorithm(&[]), CompressionAlgorithm::Stored);
    }

    #[test]
    fn corrupt_chunk_is_reported_alone() {
        let engine = small_chunks();
        let data = clinic_text(3_000);
        let mut payload = engine.compress(&data, Some(CompressionAlgorithm::Zlib)).unwrap();
        payload.chunks[3].data[0] ^= 0xff;

        assert_eq!(payload.corrupted_chunks(), vec![3]);
        let error = engine.decompress(&payload).unwrap_err();
        assert!(error.to_string().contains("chunk 3"));
    }

    #[test]
    fn flipping_any_envelope_byte_is_detected() {
        let engine = small_chunks();
        let data = clinic_text(1_500);
        let payload = engine.compress(&data, None).unwrap();
        let bytes = payload.to_bytes().unwrap();

        for index in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[index] ^= 0x01;
            let result = CompressedPayload::from_bytes(&tampered)
                .and_then(|payload| engine.decompress(&payload));
            assert!(result.is_err(), "flip at byte {index} went unnoticed");
        }
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(
            "GZIP".parse::<CompressionAlgorithm>().unwrap(),
            CompressionAlgorithm::Gzip
        );
        assert!("lzma".parse::<CompressionAlgorithm>().is_err());
    }
}
