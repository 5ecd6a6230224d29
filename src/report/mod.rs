//! Digest export.

mod generator;

pub use generator::{render, Digest, ExportFormat};
