//! The write-request model.
//!
//! A [`WriteRequest`] is created inside a collective `write` call and is never
//! mutated afterwards. Its buffer charge lives next to it in the queue, not in
//! the request itself.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CollatorError, CollatorResult};
use crate::group::{GroupChannel, Rank, COORDINATOR};

/// Textual or binary rendering of a collated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamFormat {
    /// Human-readable header and length lines.
    Ascii,
    /// Length-prefixed little-endian framing.
    #[default]
    Binary,
}

/// Per-segment compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    /// Segments are stored as-is.
    #[default]
    Uncompressed,
    /// Each segment is deflated independently (zlib).
    Compressed,
}

/// Version of the record format the payloads were serialized with.
///
/// Opaque to the collator; it is recorded in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl VersionTag {
    /// Version 2.0, the default for newly written files.
    pub const CURRENT: Self = Self { major: 2, minor: 0 };

    /// Creates a version tag.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Encoding options passed through to the file encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Textual or binary rendering.
    pub format: StreamFormat,
    /// Record format version.
    pub version: VersionTag,
    /// Per-segment compression.
    pub compression: Compression,
    /// Append a block to an existing file instead of truncating it.
    pub append: bool,
}

impl WriteOptions {
    /// Binary, uncompressed, current version, truncating.
    #[must_use]
    pub fn binary() -> Self {
        Self::default()
    }

    /// ASCII, uncompressed, current version, truncating.
    #[must_use]
    pub fn ascii() -> Self {
        Self {
            format: StreamFormat::Ascii,
            ..Self::default()
        }
    }

    /// Sets compression.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the version tag.
    #[must_use]
    pub const fn with_version(mut self, version: VersionTag) -> Self {
        self.version = version;
        self
    }

    /// Sets append mode.
    #[must_use]
    pub const fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// One pending collated write.
pub struct WriteRequest {
    id: Uuid,
    group: Arc<dyn GroupChannel>,
    type_tag: String,
    path: PathBuf,
    local_payload: Vec<u8>,
    participant_sizes: Option<Vec<u64>>,
    have_pre_gathered_payload: bool,
    pre_gathered_payload: Vec<u8>,
    options: WriteOptions,
}

impl WriteRequest {
    /// Creates a request whose remote payloads have not been collected yet.
    ///
    /// `participant_sizes` must be present on the coordinator (one entry per
    /// rank) and absent elsewhere.
    pub fn new(
        group: Arc<dyn GroupChannel>,
        type_tag: impl Into<String>,
        path: impl Into<PathBuf>,
        local_payload: Vec<u8>,
        participant_sizes: Option<Vec<u64>>,
        options: WriteOptions,
    ) -> CollatorResult<Self> {
        let request = Self {
            id: Uuid::new_v4(),
            group,
            type_tag: type_tag.into(),
            path: path.into(),
            local_payload,
            participant_sizes,
            have_pre_gathered_payload: false,
            pre_gathered_payload: Vec::new(),
            options,
        };
        request.validate()?;
        Ok(request)
    }

    /// Creates a request that already carries every non-coordinator payload.
    ///
    /// Only the coordinator may hold gathered bytes; on other ranks
    /// `pre_gathered_payload` must be empty.
    pub fn with_pre_gathered(
        group: Arc<dyn GroupChannel>,
        type_tag: impl Into<String>,
        path: impl Into<PathBuf>,
        local_payload: Vec<u8>,
        participant_sizes: Option<Vec<u64>>,
        pre_gathered_payload: Vec<u8>,
        options: WriteOptions,
    ) -> CollatorResult<Self> {
        let request = Self {
            id: Uuid::new_v4(),
            group,
            type_tag: type_tag.into(),
            path: path.into(),
            local_payload,
            participant_sizes,
            have_pre_gathered_payload: true,
            pre_gathered_payload,
            options,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> CollatorResult<()> {
        validate_target(&self.type_tag, &self.path)?;

        let rank = self.group.rank();
        match (&self.participant_sizes, rank == COORDINATOR) {
            (Some(sizes), true) => {
                if sizes.len() != self.group.size() {
                    return Err(CollatorError::invalid_request(format!(
                        "{} participant sizes for a group of {}",
                        sizes.len(),
                        self.group.size()
                    )));
                }
                if sizes[COORDINATOR] != self.local_payload.len() as u64 {
                    return Err(CollatorError::invalid_request(format!(
                        "coordinator size entry {} does not match local payload of {} bytes",
                        sizes[COORDINATOR],
                        self.local_payload.len()
                    )));
                }
                if self.have_pre_gathered_payload {
                    let remote: u64 = sizes.iter().skip(1).sum();
                    if remote != self.pre_gathered_payload.len() as u64 {
                        return Err(CollatorError::invalid_request(format!(
                            "pre-gathered payload holds {} bytes, sizes announce {remote}",
                            self.pre_gathered_payload.len()
                        )));
                    }
                }
            }
            (None, true) => {
                return Err(CollatorError::invalid_request(
                    "coordinator request is missing participant sizes",
                ));
            }
            (Some(_), false) => {
                return Err(CollatorError::invalid_request(format!(
                    "rank {rank} must not carry participant sizes"
                )));
            }
            (None, false) => {
                if !self.pre_gathered_payload.is_empty() {
                    return Err(CollatorError::invalid_request(format!(
                        "rank {rank} must not carry gathered payload"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Unique id used to correlate log lines.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Group this request is collective over.
    #[must_use]
    pub fn group(&self) -> &Arc<dyn GroupChannel> {
        &self.group
    }

    /// Rank of the participant that created this request.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    /// Logical record type.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Destination of the collated artifact.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// This participant's bytes.
    #[must_use]
    pub fn local_payload(&self) -> &[u8] {
        &self.local_payload
    }

    /// Per-rank sizes, present on the coordinator only.
    #[must_use]
    pub fn participant_sizes(&self) -> Option<&[u64]> {
        self.participant_sizes.as_deref()
    }

    /// Whether every remote payload was collected before enqueue.
    #[must_use]
    pub const fn have_pre_gathered_payload(&self) -> bool {
        self.have_pre_gathered_payload
    }

    /// Consumes the request, keeping only this participant's bytes.
    pub(crate) fn into_local_payload(self) -> Vec<u8> {
        self.local_payload
    }

    /// Every non-coordinator payload, concatenated in rank order.
    #[must_use]
    pub fn pre_gathered_payload(&self) -> &[u8] {
        &self.pre_gathered_payload
    }

    /// Encoding options.
    #[must_use]
    pub const fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Memory charge this request holds against the buffer budget.
    #[must_use]
    pub fn size(&self) -> u64 {
        (self.local_payload.len() + self.pre_gathered_payload.len()) as u64
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("id", &self.id)
            .field("rank", &self.group.rank())
            .field("type_tag", &self.type_tag)
            .field("path", &self.path)
            .field("local_len", &self.local_payload.len())
            .field("participant_sizes", &self.participant_sizes)
            .field("have_pre_gathered_payload", &self.have_pre_gathered_payload)
            .field("pre_gathered_len", &self.pre_gathered_payload.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Rejects malformed targets before any collective traffic happens.
pub(crate) fn validate_target(type_tag: &str, path: &Path) -> CollatorResult<()> {
    if type_tag.trim().is_empty() {
        return Err(CollatorError::invalid_request("type tag cannot be empty"));
    }
    if path.as_os_str().is_empty() {
        return Err(CollatorError::invalid_request("path cannot be empty"));
    }
    Ok(())
}
