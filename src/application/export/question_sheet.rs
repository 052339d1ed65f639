use std::{collections::BTreeMap, time::Duration};

use comrak::{
    Arena, format_html,
    nodes::{NodeHtmlBlock, NodeValue},
    options::Options,
    parse_document,
};
use serde::Deserialize;
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::info;

use crate::{
    application::{
        jobs::{ExportContext, ExportError, ExportFn},
        render::{ParallelRenderBatch, RenderRequest, error_placeholder},
    },
    presentation::views::{
        ChoiceView, QuestionSheetTemplate, QuestionView, choice_label, render_document,
    },
};

pub const QUESTION_SHEET_EXPORT: &str = "question_sheet";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuestionSheetArgs {
    title: String,
    questions: Vec<QuestionArgs>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuestionArgs {
    prompt: String,
    #[serde(default)]
    choices: Vec<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// Renders a question set (Markdown with `$..$` / `$$..$$` math) into one HTML document.
///
/// Every formula in the document goes through a single render batch, so the
/// whole export shares one deadline no matter how many formulas it holds.
pub struct QuestionSheetExport {
    batch: ParallelRenderBatch,
    batch_timeout: Duration,
}

impl QuestionSheetExport {
    pub fn new(batch: ParallelRenderBatch, batch_timeout: Duration) -> Self {
        Self {
            batch,
            batch_timeout,
        }
    }
}

impl ExportFn for QuestionSheetExport {
    fn file_extension(&self) -> &str {
        "html"
    }

    fn export(&self, ctx: &ExportContext, args: &Value) -> Result<Option<Vec<u8>>, ExportError> {
        let sheet = QuestionSheetArgs::deserialize(args)
            .map_err(|err| ExportError::invalid_arguments(err.to_string()))?;
        if sheet.title.trim().is_empty() {
            return Err(ExportError::invalid_arguments("`title` must not be empty"));
        }
        if sheet.questions.is_empty() {
            return Err(ExportError::invalid_arguments(
                "at least one question is required",
            ));
        }

        let options = markdown_options();
        let mut math = MathPlaceholders::default();
        let mut drafts = Vec::with_capacity(sheet.questions.len());
        for question in &sheet.questions {
            let prompt = math.markdown_to_html(&question.prompt, &options)?;
            let choices = question
                .choices
                .iter()
                .map(|choice| math.markdown_to_html(choice, &options))
                .collect::<Result<Vec<_>, _>>()?;
            let answer = question
                .answer
                .as_deref()
                .map(|answer| math.markdown_to_html(answer, &options))
                .transpose()?;
            drafts.push((prompt, choices, answer));
        }

        let outcome = ctx.block_on(
            self.batch
                .render_all(math.requests().to_vec(), self.batch_timeout),
        );

        let questions = drafts
            .into_iter()
            .enumerate()
            .map(|(index, (prompt, choices, answer))| QuestionView {
                number: index + 1,
                prompt_html: math.restore(prompt, &outcome.outputs),
                choices: choices
                    .into_iter()
                    .enumerate()
                    .map(|(choice_index, html)| ChoiceView {
                        label: choice_label(choice_index),
                        html: math.restore(html, &outcome.outputs),
                    })
                    .collect(),
                answer_html: answer.map(|html| math.restore(html, &outcome.outputs)),
            })
            .collect::<Vec<_>>();

        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| ExportError::failed(format!("failed to format timestamp: {err}")))?;
        let document = QuestionSheetTemplate {
            title: sheet.title.trim().to_string(),
            generated_at,
            questions,
            untypeset_formulas: outcome.failed + outcome.timed_out,
        };
        let html = render_document(&document).map_err(|err| {
            ExportError::Template(format!("{err}: {}", err.error))
        })?;

        info!(
            target = "application::export::question_sheet",
            op = "question_sheet::export",
            questions = document.questions.len(),
            formulas = math.requests().len(),
            formulas_rendered = outcome.rendered,
            formulas_failed = outcome.failed,
            formulas_timed_out = outcome.timed_out,
            html_bytes = html.len(),
            "Question sheet built"
        );

        Ok(Some(html.into_bytes()))
    }
}

fn markdown_options() -> Options<'static> {
    let mut options = Options::default();
    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.table = true;
    ext.autolink = true;
    ext.superscript = true;
    ext.math_dollars = true;
    ext.math_code = true;
    // Raw HTML is kept so placeholders survive formatting; the sanitizer strips anything else.
    options.render.r#unsafe = true;
    options
}

fn placeholder(index: usize) -> String {
    format!("__MATH_PLACEHOLDER_{index}__")
}

/// Pulls math out of Markdown fields so all formulas of a document can be
/// rendered in one batch and spliced back afterwards.
#[derive(Default)]
struct MathPlaceholders {
    requests: Vec<RenderRequest>,
}

impl MathPlaceholders {
    fn requests(&self) -> &[RenderRequest] {
        &self.requests
    }

    /// Sanitized HTML for `markdown`, with each formula replaced by a placeholder.
    fn markdown_to_html(
        &mut self,
        markdown: &str,
        options: &Options<'static>,
    ) -> Result<String, ExportError> {
        let arena = Arena::new();
        let root = parse_document(&arena, markdown, options);

        for node in root.descendants() {
            let math = {
                let data = node.data.borrow();
                match &data.value {
                    NodeValue::Math(math) => Some((math.literal.clone(), math.display_math)),
                    _ => None,
                }
            };
            let Some((literal, display_mode)) = math else {
                continue;
            };

            let marker = placeholder(self.requests.len());
            let mut data = node.data.borrow_mut();
            if display_mode {
                self.requests.push(RenderRequest::display(literal));
                data.value = NodeValue::HtmlBlock(NodeHtmlBlock {
                    block_type: 0,
                    literal: format!("<div>{marker}</div>"),
                });
            } else {
                self.requests.push(RenderRequest::inline(literal));
                data.value = NodeValue::HtmlInline(marker);
            }
        }

        let mut html = String::new();
        format_html(root, options, &mut html)
            .map_err(|err| ExportError::failed(format!("markdown formatting failed: {err}")))?;
        Ok(ammonia::clean(&html))
    }

    fn restore(&self, html: String, outputs: &BTreeMap<usize, String>) -> String {
        self.requests
            .iter()
            .enumerate()
            .fold(html, |acc, (index, request)| {
                if !acc.contains(&placeholder(index)) {
                    return acc;
                }
                let rendered = outputs
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| error_placeholder(request, "formula was not rendered"));
                let marker = placeholder(index);
                if request.display_mode {
                    let container = format!(
                        "<div data-role=\"math-block\" data-math-style=\"display\">{rendered}</div>"
                    );
                    acc.replace(&format!("<div>{marker}</div>"), &container)
                        .replace(&marker, &container)
                } else {
                    let container = format!(
                        "<span data-role=\"math-inline\" data-math-style=\"inline\">{rendered}</span>"
                    );
                    acc.replace(&marker, &container)
                }
            })
    }
}
