//! # jidac
//!
//! A journaling, incremental, deduplicating archiver in the ZPAQ level-2
//! format.
//!
//! An archive is an append-mostly file holding successive snapshots of a
//! set of files. Each update compares modification dates against the
//! archive's index and stores only what changed; file contents are split
//! into content-defined fragments identified by SHA-1, so identical data
//! is stored once no matter how often (or where) it appears. Earlier
//! snapshots stay extractable; rolling back is a matter of stopping the
//! scan at a version number or date.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use jidac::ops::{self, Options};
//!
//! fn main() -> jidac::Result<()> {
//!     let mut opts = Options {
//!         archive: "backup".into(),
//!         files: vec!["docs".into()],
//!         ..Options::default()
//!     };
//!     ops::add(&opts, false)?; // create or update backup.zpaq
//!
//!     opts.to = vec!["restored/".into()];
//!     opts.files.clear();
//!     ops::extract(&opts)?; // restore the latest snapshot
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`fragment`] | content-defined splitting and block classification |
//! | [`index`] | the in-memory model: fragments, files, versions, dedup |
//! | [`format`] | journal block naming and payload encodings |
//! | [`method`] | compression recipes and ZPAQL configuration generation |
//! | [`filter`] | LZ77 / BWT / E8E9 preprocessors |
//! | [`zpaql`] | the ZPAQ backend: compiler, VM, coder, block framing |
//! | [`pipeline`] | the parallel compression ring |
//! | [`scan`] | index reconstruction and the recovery pass |
//! | [`ops`] | the commands: add, delete, extract, list, test |
//!
//! The archive format is self-describing: every block carries the
//! decoding program for its own data, so old archives remain readable as
//! methods evolve.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod attr;
pub mod date;
pub mod error;
pub mod filter;
pub mod format;
pub mod fragment;
pub mod index;
pub mod method;
pub mod ops;
pub mod path;
pub mod pipeline;
pub mod scan;
pub mod zpaql;

pub use error::{Error, Result};
pub use ops::Options;
