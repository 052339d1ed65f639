//! Small helpers shared by the application and CLI layers.

pub mod bytes;
pub(crate) mod lock;
