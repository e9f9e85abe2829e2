#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr
)]

//! Batch pacing for the read pipeline.
//!
//! A [`BatchSpec`] describes the desired shape of result batches for one
//! logical read; a [`Batcher`] is the live counter a single physical read
//! derives from it. The split keeps the spec immutable and freely
//! copyable while the counter stays private to the read that created it.

mod batch_spec;
mod batcher;
mod error;

pub use batch_spec::*;
pub use batcher::*;
pub use error::Error;
