use katex::{OptsBuilder, OutputType};

use super::types::{MathEngine, RenderError};

/// KaTeX typesetting, emitting an inline (`<span>`) or block (`<span class="katex-display">`) fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct KatexEngine;

impl MathEngine for KatexEngine {
    fn render(&self, fragment: &str, display_mode: bool) -> Result<String, RenderError> {
        let mut builder = OptsBuilder::default();
        builder.display_mode(display_mode);
        builder.output_type(OutputType::Html);

        let opts = builder.build().map_err(|err| RenderError::Options {
            message: format!("failed to build KaTeX options: {err}"),
        })?;

        katex::render_with_opts(fragment, opts).map_err(|err| RenderError::Engine {
            message: format!("KaTeX rendering failed: {err}"),
        })
    }
}
