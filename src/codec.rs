//! Byte layout of collated blocks.
//!
//! A collated file is a sequence of blocks (more than one only when written in
//! append mode). Every block is:
//!
//! ```text
//! [MAGIC: 4 bytes]["B" | "A": 1 byte][CODEC_VERSION: 1 byte]
//! [header]
//! [segment 0][segment 1]...[segment n-1]
//! ```
//!
//! Binary header: `[length: 4 bytes LE][JSON][crc32: 4 bytes LE]`.
//! Binary segment: `[stored_len: 8 bytes LE][raw_len: 8 bytes LE][crc32: 4 bytes LE][stored bytes]`.
//!
//! ASCII header: one JSON line. ASCII segment: a line `stored_len raw_len crc32hex`,
//! the stored bytes, then a newline.
//!
//! The CRC always covers the raw (uncompressed) bytes. Compressed segments are
//! independent zlib streams so each one can be produced and checked alone.

use std::io::{BufRead, Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{de::DeserializeOwned, Serialize};

use crate::request::{Compression, StreamFormat};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes opening every collated block.
pub const MAGIC: [u8; 4] = *b"CLTD";

const FORMAT_BINARY: u8 = b'B';
const FORMAT_ASCII: u8 = b'A';

/// Headers are small; anything larger is treated as corruption.
const MAX_HEADER_SIZE: usize = 64 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Writes the block preamble (magic, format, version).
pub fn write_preamble(writer: &mut impl Write, format: StreamFormat) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    let tag = match format {
        StreamFormat::Binary => FORMAT_BINARY,
        StreamFormat::Ascii => FORMAT_ASCII,
    };
    writer.write_all(&[tag, CODEC_VERSION])?;
    Ok(())
}

/// Reads a block preamble. Returns `None` at a clean end of file.
pub fn read_preamble(reader: &mut impl BufRead) -> IoResult<Option<StreamFormat>> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}")));
    }

    let mut tail = [0u8; 2];
    reader.read_exact(&mut tail)?;
    let format = match tail[0] {
        FORMAT_BINARY => StreamFormat::Binary,
        FORMAT_ASCII => StreamFormat::Ascii,
        other => return Err(invalid(format!("unknown block format byte: {other:#04x}"))),
    };
    if tail[1] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            tail[1]
        )));
    }
    Ok(Some(format))
}

/// Serializes a header value in the given format.
pub fn encode_header<T: Serialize>(value: &T, format: StreamFormat) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;

    match format {
        StreamFormat::Binary => {
            let len = u32::try_from(data.len()).map_err(|_| invalid(format!("header of {} bytes", data.len())))?;
            let mut out = Vec::with_capacity(4 + data.len() + 4);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&data);
            out.extend_from_slice(&checksum(&data).to_le_bytes());
            Ok(out)
        }
        StreamFormat::Ascii => {
            let mut out = data;
            out.push(b'\n');
            Ok(out)
        }
    }
}

/// Deserializes a header value, verifying its checksum in binary format.
pub fn decode_header<T: DeserializeOwned>(reader: &mut impl BufRead, format: StreamFormat) -> IoResult<T> {
    let data = match format {
        StreamFormat::Binary => {
            let mut len_bytes = [0u8; 4];
            reader.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_HEADER_SIZE {
                return Err(invalid(format!("header size {len} exceeds maximum {MAX_HEADER_SIZE}")));
            }

            let mut data = vec![0u8; len];
            reader.read_exact(&mut data)?;

            let mut crc_bytes = [0u8; 4];
            reader.read_exact(&mut crc_bytes)?;
            let stored = u32::from_le_bytes(crc_bytes);
            let computed = checksum(&data);
            if stored != computed {
                return Err(invalid(format!(
                    "header CRC mismatch: stored={stored:08x}, computed={computed:08x}"
                )));
            }
            data
        }
        StreamFormat::Ascii => {
            let mut line = Vec::new();
            reader.by_ref().take(MAX_HEADER_SIZE as u64).read_until(b'\n', &mut line)?;
            if line.pop() != Some(b'\n') {
                return Err(invalid("unterminated ASCII header".to_string()));
            }
            line
        }
    };

    serde_json::from_slice(&data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes one rank's segment.
pub fn write_segment(
    writer: &mut impl Write,
    format: StreamFormat,
    compression: Compression,
    raw: &[u8],
) -> IoResult<()> {
    let crc = checksum(raw);
    let compressed;
    let stored: &[u8] = match compression {
        Compression::Uncompressed => raw,
        Compression::Compressed => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(raw)?;
            compressed = encoder.finish()?;
            &compressed
        }
    };

    match format {
        StreamFormat::Binary => {
            writer.write_all(&(stored.len() as u64).to_le_bytes())?;
            writer.write_all(&(raw.len() as u64).to_le_bytes())?;
            writer.write_all(&crc.to_le_bytes())?;
            writer.write_all(stored)?;
        }
        StreamFormat::Ascii => {
            writeln!(writer, "{} {} {crc:08x}", stored.len(), raw.len())?;
            writer.write_all(stored)?;
            writer.write_all(b"\n")?;
        }
    }
    Ok(())
}

/// Reads one segment and returns its raw bytes after checking length and CRC.
pub fn read_segment(reader: &mut impl BufRead, format: StreamFormat, compression: Compression) -> IoResult<Vec<u8>> {
    let (stored_len, raw_len, crc) = match format {
        StreamFormat::Binary => {
            let mut fixed = [0u8; 20];
            reader.read_exact(&mut fixed)?;
            let mut word = [0u8; 8];
            word.copy_from_slice(&fixed[0..8]);
            let stored_len = u64::from_le_bytes(word);
            word.copy_from_slice(&fixed[8..16]);
            let raw_len = u64::from_le_bytes(word);
            let mut crc = [0u8; 4];
            crc.copy_from_slice(&fixed[16..20]);
            (stored_len, raw_len, u32::from_le_bytes(crc))
        }
        StreamFormat::Ascii => {
            let mut line = String::new();
            reader.by_ref().take(128).read_line(&mut line)?;
            parse_ascii_segment_line(line.trim_end_matches('\n'))?
        }
    };

    // Lengths come from disk; grow the buffer as bytes actually arrive.
    let mut stored = Vec::new();
    reader.by_ref().take(stored_len).read_to_end(&mut stored)?;
    if stored.len() as u64 != stored_len {
        return Err(IoError::new(
            ErrorKind::UnexpectedEof,
            format!("segment truncated: declared {stored_len} bytes, found {}", stored.len()),
        ));
    }

    if format == StreamFormat::Ascii {
        let mut nl = [0u8; 1];
        reader.read_exact(&mut nl)?;
        if nl[0] != b'\n' {
            return Err(invalid("ASCII segment is not newline terminated".to_string()));
        }
    }

    let raw = match compression {
        Compression::Uncompressed => stored,
        Compression::Compressed => {
            let mut raw = Vec::new();
            ZlibDecoder::new(stored.as_slice()).read_to_end(&mut raw)?;
            raw
        }
    };

    if raw.len() as u64 != raw_len {
        return Err(invalid(format!("segment length mismatch: declared {raw_len}, got {}", raw.len())));
    }
    let computed = checksum(&raw);
    if computed != crc {
        return Err(invalid(format!(
            "segment CRC mismatch: stored={crc:08x}, computed={computed:08x} (data corrupted)"
        )));
    }
    Ok(raw)
}

fn parse_ascii_segment_line(line: &str) -> IoResult<(u64, u64, u32)> {
    let mut parts = line.split(' ');
    let (Some(stored), Some(raw), Some(crc), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return Err(invalid(format!("malformed ASCII segment line: {line:?}")));
    };
    let bad = |field: &str| invalid(format!("malformed {field} in ASCII segment line: {line:?}"));
    Ok((
        stored.parse().map_err(|_| bad("stored length"))?,
        raw.parse().map_err(|_| bad("raw length"))?,
        u32::from_str_radix(crc, 16).map_err(|_| bad("checksum"))?,
    ))
}
