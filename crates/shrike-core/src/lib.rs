#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr
)]

//! Core value and key types shared by every layer of the shrike read
//! pipeline: the ordered datum model, store keys and ranges, sort
//! directions, result rows, and the query error taxonomy.

mod datum;
mod error;
mod item;
mod key;
mod options;
mod sorting;

pub use datum::*;
pub use error::*;
pub use item::*;
pub use key::*;
pub use options::*;
pub use sorting::*;
