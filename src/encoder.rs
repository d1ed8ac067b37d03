//! File encoder: turns a size list and per-rank payloads into a collated block.
//!
//! The collator only needs two things from an encoder: open a destination with
//! a set of [`WriteOptions`], then write a header followed by one segment per
//! rank. Segments are handed over one at a time so the scheduled path never
//! holds more than one rank's bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::request::{Compression, StreamFormat, VersionTag, WriteOptions};

/// Header stored at the start of every collated block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Logical record type of the payloads.
    pub type_tag: String,
    /// Record format version.
    pub version: VersionTag,
    /// Rendering of this block.
    pub format: StreamFormat,
    /// Segment compression.
    pub compression: Compression,
    /// Raw payload length of each rank, in rank order.
    pub sizes: Vec<u64>,
    /// When the block was started.
    pub created_at: DateTime<Utc>,
}

/// Capability to open collated artifacts.
pub trait FileEncoder: Send + Sync {
    /// Opens `path` for one collated block.
    fn open(&self, path: &Path, options: &WriteOptions) -> IoResult<Box<dyn BlockSink>>;
}

/// An open destination accepting exactly one block.
///
/// Nothing is visible at the target until `finish` succeeds. A sink dropped
/// before that leaves the target as it was when opened.
pub trait BlockSink: Send {
    /// Writes the block header announcing one segment per entry of `sizes`.
    fn write_header(&mut self, type_tag: &str, sizes: &[u64]) -> IoResult<()>;

    /// Writes the next rank's segment.
    fn write_segment(&mut self, payload: &[u8]) -> IoResult<()>;

    /// Flushes the block to storage.
    fn finish(self: Box<Self>) -> IoResult<()>;

    /// Writes a whole block in one go.
    fn write_header_and_segments(mut self: Box<Self>, type_tag: &str, sizes: &[u64], payloads: &[&[u8]]) -> IoResult<()> {
        self.write_header(type_tag, sizes)?;
        for payload in payloads {
            self.write_segment(payload)?;
        }
        self.finish()
    }
}

/// Default encoder writing the layout described in [`crate::codec`].
#[derive(Debug, Clone)]
pub struct BlockFileEncoder {
    sync_on_write: bool,
}

impl Default for BlockFileEncoder {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

impl BlockFileEncoder {
    /// Creates an encoder that fsyncs each finished block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to fsync each finished block (slower but safer).
    #[must_use]
    pub const fn with_sync(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }
}

impl FileEncoder for BlockFileEncoder {
    fn open(&self, path: &Path, options: &WriteOptions) -> IoResult<Box<dyn BlockSink>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // A truncating write goes to a staging file and replaces the target on
        // finish; an append remembers where the block starts.
        let (file, staging) = if options.append {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let start = file.metadata()?.len();
            (file, Staging::Append { start })
        } else {
            let temp = staging_path(path);
            let file = OpenOptions::new().write(true).create_new(true).open(&temp)?;
            (file, Staging::Temp(temp))
        };

        Ok(Box::new(BlockFileSink {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            staging,
            committed: false,
            options: *options,
            sizes: Vec::new(),
            header_written: false,
            segments_written: 0,
            sync_on_write: self.sync_on_write,
        }))
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "block".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

enum Staging {
    Temp(PathBuf),
    Append { start: u64 },
}

/// Sink for one block. Dropped without a successful `finish`, it rolls the
/// target back to what it held before `open`.
struct BlockFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    staging: Staging,
    committed: bool,
    options: WriteOptions,
    sizes: Vec<u64>,
    header_written: bool,
    segments_written: usize,
    sync_on_write: bool,
}

impl BlockFileSink {
    fn misuse(&self, message: String) -> IoError {
        IoError::new(ErrorKind::InvalidInput, format!("{}: {message}", self.path.display()))
    }

    fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("{}: block already finished", self.path.display()),
            )),
        }
    }

    fn roll_back(&mut self) -> IoResult<()> {
        if let Some(writer) = self.writer.take() {
            // Bytes still buffered belong to the abandoned block.
            let (file, _) = writer.into_parts();
            drop(file);
        }
        match &self.staging {
            Staging::Temp(temp) => match fs::remove_file(temp) {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
            Staging::Append { start } => OpenOptions::new().write(true).open(&self.path)?.set_len(*start),
        }
    }
}

impl Drop for BlockFileSink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.roll_back() {
            Ok(()) => tracing::debug!(path = %self.path.display(), "unfinished block rolled back"),
            Err(err) => tracing::warn!(path = %self.path.display(), error = %err, "failed to roll back unfinished block"),
        }
    }
}

impl BlockSink for BlockFileSink {
    fn write_header(&mut self, type_tag: &str, sizes: &[u64]) -> IoResult<()> {
        if self.header_written {
            return Err(self.misuse("block header written twice".to_string()));
        }
        let header = BlockHeader {
            type_tag: type_tag.to_string(),
            version: self.options.version,
            format: self.options.format,
            compression: self.options.compression,
            sizes: sizes.to_vec(),
            created_at: Utc::now(),
        };
        let encoded = codec::encode_header(&header, self.options.format)?;
        let format = self.options.format;
        let writer = self.writer()?;
        codec::write_preamble(&mut *writer, format)?;
        writer.write_all(&encoded)?;
        self.sizes = header.sizes;
        self.header_written = true;
        Ok(())
    }

    fn write_segment(&mut self, payload: &[u8]) -> IoResult<()> {
        if !self.header_written {
            return Err(self.misuse("segment written before header".to_string()));
        }
        let Some(&expected) = self.sizes.get(self.segments_written) else {
            return Err(self.misuse(format!("more than {} segments", self.sizes.len())));
        };
        if payload.len() as u64 != expected {
            return Err(self.misuse(format!(
                "segment {} is {} bytes, header announced {expected}",
                self.segments_written,
                payload.len()
            )));
        }
        let options = self.options;
        codec::write_segment(self.writer()?, options.format, options.compression, payload)?;
        self.segments_written += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> IoResult<()> {
        if !self.header_written || self.segments_written != self.sizes.len() {
            return Err(self.misuse(format!(
                "block finished with {} of {} segments",
                self.segments_written,
                self.sizes.len()
            )));
        }
        let sync_on_write = self.sync_on_write;
        let writer = self.writer()?;
        writer.flush()?;
        if sync_on_write {
            writer.get_ref().sync_all()?;
        }
        drop(self.writer.take());

        if let Staging::Temp(temp) = &self.staging {
            fs::rename(temp, &self.path)?;
        }
        self.committed = true;
        Ok(())
    }
}

/// One decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollatedBlock {
    /// Block header.
    pub header: BlockHeader,
    /// Raw segment bytes, in rank order.
    pub segments: Vec<Vec<u8>>,
}

impl CollatedBlock {
    /// Every segment concatenated in rank order.
    #[must_use]
    pub fn concatenated(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

/// Reads every block of a collated file, verifying sizes and checksums.
///
/// # Errors
/// Fails on I/O errors, truncated blocks, and corrupted headers or segments.
pub fn read_blocks(path: impl AsRef<Path>) -> IoResult<Vec<CollatedBlock>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut blocks = Vec::new();

    while let Some(format) = codec::read_preamble(&mut reader)? {
        let header: BlockHeader = codec::decode_header(&mut reader, format)?;
        if header.format != format {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("block preamble says {format:?}, header says {:?}", header.format),
            ));
        }
        let mut segments = Vec::with_capacity(header.sizes.len());
        for (rank, &size) in header.sizes.iter().enumerate() {
            let segment = codec::read_segment(&mut reader, format, header.compression)?;
            if segment.len() as u64 != size {
                return Err(IoError::new(
                    ErrorKind::InvalidData,
                    format!("segment {rank} holds {} bytes, header announced {size}", segment.len()),
                ));
            }
            segments.push(segment);
        }
        blocks.push(CollatedBlock { header, segments });
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_block(path: &Path, options: WriteOptions, payloads: &[&[u8]]) {
        let sizes: Vec<u64> = payloads.iter().map(|p| p.len() as u64).collect();
        let sink = BlockFileEncoder::new().with_sync(false).open(path, &options).unwrap();
        sink.write_header_and_segments("volScalarField", &sizes, payloads).unwrap();
    }

    #[test]
    fn binary_block_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p");
        write_block(&path, WriteOptions::binary(), &[b"rank0", b"rank-one", b""]);

        let blocks = read_blocks(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.header.type_tag, "volScalarField");
        assert_eq!(block.header.sizes, vec![5, 8, 0]);
        assert_eq!(block.segments, vec![b"rank0".to_vec(), b"rank-one".to_vec(), Vec::new()]);
        assert_eq!(block.concatenated(), b"rank0rank-one");
    }

    #[test]
    fn ascii_compressed_block_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/u");
        let options = WriteOptions::ascii()
            .with_compression(Compression::Compressed)
            .with_version(VersionTag::new(3, 1));
        let big = vec![b'x'; 4096];
        write_block(&path, options, &[&big, b"tail\nwith newline"]);

        let blocks = read_blocks(&path).unwrap();
        assert_eq!(blocks[0].header.format, StreamFormat::Ascii);
        assert_eq!(blocks[0].header.version, VersionTag::new(3, 1));
        assert_eq!(blocks[0].segments[0], big);
        assert_eq!(blocks[0].segments[1], b"tail\nwith newline");
    }

    #[test]
    fn append_adds_blocks_and_truncate_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        write_block(&path, WriteOptions::binary(), &[b"one"]);
        write_block(&path, WriteOptions::ascii().with_append(true), &[b"two"]);
        assert_eq!(read_blocks(&path).unwrap().len(), 2);

        write_block(&path, WriteOptions::binary(), &[b"three"]);
        let blocks = read_blocks(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].segments[0], b"three");
    }

    #[test]
    fn segment_size_must_match_header() {
        let dir = tempdir().unwrap();
        let mut sink = BlockFileEncoder::new().open(&dir.path().join("f"), &WriteOptions::binary()).unwrap();
        sink.write_header("t", &[3]).unwrap();
        let err = sink.write_segment(b"four").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn finish_rejects_missing_segments() {
        let dir = tempdir().unwrap();
        let mut sink = BlockFileEncoder::new().open(&dir.path().join("f"), &WriteOptions::binary()).unwrap();
        sink.write_header("t", &[1, 1]).unwrap();
        sink.write_segment(b"a").unwrap();
        let err = sink.finish().unwrap_err();
        assert!(err.to_string().contains("1 of 2 segments"));
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn unfinished_block_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_block(&path, WriteOptions::binary(), &[b"old"]);

        let mut sink = BlockFileEncoder::new().open(&path, &WriteOptions::binary()).unwrap();
        sink.write_header("t", &[3, 3]).unwrap();
        sink.write_segment(b"new").unwrap();
        drop(sink);

        let blocks = read_blocks(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].segments[0], b"old");
        assert_eq!(entries(dir.path()), ["f"]);
    }

    #[test]
    fn unfinished_append_is_cut_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_block(&path, WriteOptions::binary(), &[b"first"]);
        let len = fs::metadata(&path).unwrap().len();

        let mut sink = BlockFileEncoder::new()
            .open(&path, &WriteOptions::binary().with_append(true))
            .unwrap();
        sink.write_header("t", &[4, 4]).unwrap();
        sink.write_segment(&[0; 4]).unwrap();
        drop(sink);

        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        assert_eq!(read_blocks(&path).unwrap().len(), 1);
    }

    #[test]
    fn failed_replace_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("taken");
        fs::create_dir(&target).unwrap();

        let sink = BlockFileEncoder::new().open(&target, &WriteOptions::binary()).unwrap();
        assert!(sink.write_header_and_segments("t", &[1], &[b"x"]).is_err());
        assert_eq!(entries(dir.path()), ["taken"]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        write_block(&path, WriteOptions::binary(), &[b"0123456789"]);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        assert!(read_blocks(&path).is_err());
    }
}
