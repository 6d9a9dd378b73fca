//! Binary framing for `CompressedPayload`.

use sha2::{Digest, Sha256};

use super::{CompressedChunk, CompressedPayload, CompressionAlgorithm};
use crate::error::{Error, IntegrityErrorKind, Result};

const MAGIC: &[u8; 4] = b"CBZ1";
const VERSION: u8 = 1;
const FLAG_CHUNKED: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 8 + 4;
const TABLE_ENTRY_LEN: usize = 4 + 4 + 32;
const DIGEST_LEN: usize = 32;

pub(super) fn encode(payload: &CompressedPayload) -> Result<Vec<u8>> {
    let chunk_count = u32::try_from(payload.chunks.len())
        .map_err(|_| Error::InvalidInput("too many chunks for envelope".to_string()))?;
    let data_len: usize = payload.chunks.iter().map(|chunk| chunk.data.len()).sum();

    let mut out = Vec::with_capacity(
        HEADER_LEN + payload.chunks.len() * TABLE_ENTRY_LEN + DIGEST_LEN + data_len,
    );
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(payload.algorithm.tag());
    out.push(if payload.is_chunked { FLAG_CHUNKED } else { 0 });
    out.extend_from_slice(&payload.original_size.to_le_bytes());
    out.extend_from_slice(&chunk_count.to_le_bytes());

    for chunk in &payload.chunks {
        let compressed_len = u32::try_from(chunk.data.len())
            .map_err(|_| Error::InvalidInput("compressed chunk exceeds 4 GiB".to_string()))?;
        out.extend_from_slice(&chunk.original_size.to_le_bytes());
        out.extend_from_slice(&compressed_len.to_le_bytes());
        out.extend_from_slice(&chunk.checksum);
    }

    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);

    for chunk in &payload.chunks {
        out.extend_from_slice(&chunk.data);
    }
    Ok(out)
}

pub(super) fn decode(bytes: &[u8]) -> Result<CompressedPayload> {
    if bytes.len() < HEADER_LEN + DIGEST_LEN {
        return Err(invalid("envelope is truncated"));
    }
    if &bytes[..4] != MAGIC {
        return Err(invalid("envelope magic mismatch"));
    }
    if bytes[4] != VERSION {
        return Err(Error::integrity(
            IntegrityErrorKind::VersionMismatch,
            format!("unsupported envelope version {}", bytes[4]),
        ));
    }

    let chunk_count = read_u32(bytes, 15) as usize;
    let table_len = chunk_count
        .checked_mul(TABLE_ENTRY_LEN)
        .ok_or_else(|| invalid("chunk table overflows"))?;
    let digest_at = HEADER_LEN + table_len;
    let data_at = digest_at + DIGEST_LEN;
    if bytes.len() < data_at {
        return Err(invalid("chunk table is truncated"));
    }
    if Sha256::digest(&bytes[..digest_at]).as_slice() != &bytes[digest_at..data_at] {
        return Err(Error::integrity(
            IntegrityErrorKind::ChecksumMismatch,
            "envelope header digest mismatch",
        ));
    }

    let algorithm = CompressionAlgorithm::from_tag(bytes[5])?;
    let is_chunked = match bytes[6] {
        0 => false,
        FLAG_CHUNKED => true,
        other => return Err(invalid(&format!("unknown envelope flags {other:#04x}"))),
    };
    let original_size = read_u64(bytes, 7);
    if chunk_count == 0 {
        return Err(invalid("envelope has no chunks"));
    }

    let mut chunks = Vec::with_capacity(chunk_count);
    let mut cursor = data_at;
    let mut total_original = 0_u64;
    for index in 0..chunk_count {
        let entry = HEADER_LEN + index * TABLE_ENTRY_LEN;
        let chunk_original = read_u32(bytes, entry);
        let compressed_len = read_u32(bytes, entry + 4) as usize;
        let mut checksum = [0_u8; 32];
        checksum.copy_from_slice(&bytes[entry + 8..entry + TABLE_ENTRY_LEN]);

        let end = cursor
            .checked_add(compressed_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| invalid(&format!("chunk {index} data is truncated")))?;
        chunks.push(CompressedChunk {
            original_size: chunk_original,
            checksum,
            data: bytes[cursor..end].to_vec(),
        });
        total_original += u64::from(chunk_original);
        cursor = end;
    }

    if cursor != bytes.len() {
        return Err(invalid("trailing bytes after chunk data"));
    }
    if total_original != original_size {
        return Err(invalid("chunk sizes do not add up to the original size"));
    }

    let compressed_size = (bytes.len() - data_at) as u64;
    Ok(CompressedPayload {
        algorithm,
        original_size,
        compressed_size,
        is_chunked,
        chunks,
    })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn invalid(message: &str) -> Error {
    Error::integrity(IntegrityErrorKind::InvalidFormat, message.to_string())
}
