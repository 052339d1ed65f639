use askama::{Error as AskamaError, Template};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{public_message}")]
pub struct TemplateRenderError {
    pub(crate) source: &'static str,
    pub(crate) public_message: &'static str,
    #[source]
    pub(crate) error: AskamaError,
}

impl TemplateRenderError {
    pub fn new(source: &'static str, public_message: &'static str, error: AskamaError) -> Self {
        Self {
            source,
            public_message,
            error,
        }
    }

    /// Where the failing template was rendered from.
    pub fn origin(&self) -> &'static str {
        self.source
    }
}

pub fn render_document<T: Template>(template: &T) -> Result<String, TemplateRenderError> {
    template.render().map_err(|err| {
        TemplateRenderError::new(
            "presentation::views::render_document",
            "Document template rendering failed",
            err,
        )
    })
}

/// Stand-alone HTML question sheet with typeset math.
#[derive(Template)]
#[template(path = "export/question_sheet.html")]
pub struct QuestionSheetTemplate {
    pub title: String,
    pub generated_at: String,
    pub questions: Vec<QuestionView>,
    /// Formulas shown as error markers instead of typeset output.
    pub untypeset_formulas: usize,
}

pub struct QuestionView {
    pub number: usize,
    pub prompt_html: String,
    pub choices: Vec<ChoiceView>,
    pub answer_html: Option<String>,
}

pub struct ChoiceView {
    pub label: String,
    pub html: String,
}

/// Choice labels run `A`..`Z`, then `AA`, `AB`, ...
pub fn choice_label(index: usize) -> String {
    let mut label = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        label.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}
