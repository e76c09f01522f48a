use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParseError>;

/// A fatal configuration error, attributed to the line it occurred on.
/// The span covers the offending line of the original text so that the
/// host can render it with source context.
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("error in configuration file (line {line})")]
#[diagnostic()]
pub struct ParseError {
    pub line: usize,
    #[label("error here")]
    pub span: Option<SourceSpan>,
    #[help]
    pub message: String,
    pub file_name: Option<String>,
    pub file_content: Option<String>,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            span: None,
            message: message.into(),
            file_name: None,
            file_content: None,
        }
    }

    pub(crate) fn with_span(mut self, start: usize, len: usize) -> Self {
        self.span = Some(SourceSpan::new(start.into(), len.into()));
        self
    }

    pub(crate) fn with_source(mut self, name: &str, content: &str) -> Self {
        self.file_name = Some(name.to_string());
        self.file_content = Some(content.to_string());
        self
    }
}

/// Upgrades a [`ParseError`] into a report that prints the offending
/// line when the parser knew its source.
pub fn error_with_source(e: ParseError) -> miette::Error {
    let file_name = e.file_name.clone();
    let file_content = e.file_content.clone();
    let report: miette::Error = e.into();
    match (file_name, file_content) {
        (Some(name), Some(content)) => {
            report.with_source_code(NamedSource::new(name, content))
        }
        _ => report,
    }
}
