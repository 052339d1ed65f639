use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// One markup fragment to typeset, plus whether it is display (block) math.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderRequest {
    pub fragment: String,
    pub display_mode: bool,
}

impl RenderRequest {
    pub fn inline(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            display_mode: false,
        }
    }

    pub fn display(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            display_mode: true,
        }
    }

    /// Stable content hash of `(fragment, display_mode)`; doubles as the cache filename stem.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(if self.display_mode {
            b"display\0".as_slice()
        } else {
            b"inline\0".as_slice()
        });
        hasher.update(self.fragment.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// Hex-encoded SHA-256 of a [`RenderRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept only what [`RenderRequest::fingerprint`] can produce.
    pub fn from_hex(value: &str) -> Option<Self> {
        (value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(value.to_ascii_lowercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a rendered formula came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOrigin {
    Cache,
    Engine,
    /// The engine failed or the batch deadline passed; `html` is the error marker.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFormula {
    pub html: String,
    pub origin: RenderOrigin,
}

impl RenderedFormula {
    pub fn is_placeholder(&self) -> bool {
        self.origin == RenderOrigin::Placeholder
    }
}

/// Failures of the typesetting engine itself. Never escapes [`super::FormulaRenderer`].
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("failed to build engine options: {message}")]
    Options { message: String },
    #[error("typesetting failed: {message}")]
    Engine { message: String },
}

/// Typesetting engine seam. Implementations must be deterministic for identical input.
pub trait MathEngine: Send + Sync {
    fn render(&self, fragment: &str, display_mode: bool) -> Result<String, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_display_mode() {
        let inline = RenderRequest::inline("x^2");
        let display = RenderRequest::display("x^2");
        assert_ne!(inline.fingerprint(), display.fingerprint());
        assert_eq!(inline.fingerprint(), RenderRequest::inline("x^2").fingerprint());
    }

    #[test]
    fn fingerprint_parses_back_from_hex() {
        let fingerprint = RenderRequest::inline("\\frac{a}{b}").fingerprint();
        assert_eq!(Fingerprint::from_hex(fingerprint.as_str()), Some(fingerprint));
        assert_eq!(Fingerprint::from_hex("not-a-hash"), None);
        assert_eq!(Fingerprint::from_hex(&"g".repeat(64)), None);
    }
}
