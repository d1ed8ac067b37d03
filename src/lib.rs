//! # collator
//!
//! Collated, backpressure-bounded file writing for distributed jobs.
//!
//! A group of participants each produce a byte payload for the same logical
//! output. The coordinator (rank 0) stores all of them in one collated block,
//! one segment per rank in rank order, while the callers get on with their
//! work: writes are queued behind a single background writer whose memory is
//! capped by a byte budget.
//!
//! ## Core Concepts
//!
//! - **Collator**: per-participant entry point; [`Collator::write`] is collective
//! - **GroupChannel**: the communicator (rank, size, point-to-point lanes)
//! - **BufferGate**: the byte budget callers block on when it is exhausted
//! - **FileEncoder**: turns a header and per-rank segments into file bytes
//!
//! Depending on the sizes involved a write is stored before the call returns
//! (scheduled), gathered by the worker (background gather), or gathered on the
//! spot and stored by the worker (local gather).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use collator::{Collator, LocalGroup, WriteOptions};
//!
//! let member = LocalGroup::new(1)?.remove(0);
//! let collator = Collator::new(Arc::new(member), 64 << 20)?;
//! collator.write("fieldData", "out/U", payload, WriteOptions::binary())?;
//! collator.flush();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod collator;
pub mod config;
pub mod encoder;
pub mod error;
pub mod gate;
pub mod group;
pub mod queue;
pub mod request;
pub mod worker;
pub mod writer;

pub use collator::Collator;
pub use config::{CollatorConfig, DEFAULT_MAX_BUFFER_SIZE, MAX_BUFFER_SIZE_ENV};
pub use encoder::{read_blocks, BlockFileEncoder, BlockHeader, BlockSink, CollatedBlock, FileEncoder};
pub use error::{CollatorError, CollatorResult, ConfigError, ProtocolError};
pub use gate::{BufferGate, Reservation};
pub use group::{GroupChannel, Lane, LocalGroup, LocalMember, Rank, SizeExtent, COORDINATOR};
pub use request::{Compression, StreamFormat, VersionTag, WriteOptions, WriteRequest};
pub use writer::{select_strategy, CollectiveWriter, WriteStrategy};
