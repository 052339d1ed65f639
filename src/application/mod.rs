//! Application services: formula rendering, export jobs and the built-in exports.

pub mod error;
pub mod export;
pub mod jobs;
pub mod render;
