//! Shared error plumbing used across the gskills crates.

pub mod error;

pub use error::{FromMessage, prefixed};
