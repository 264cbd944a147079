use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
}

impl Span {
    pub fn line(line: usize) -> Self {
        Self { line }
    }
}

/// A reported frontend error: message plus the offending line, rendered with
/// a source snippet when one is attached.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub source_name: Option<String>,
    pub span: Option<Span>,
    pub snippet: Option<String>,
}

impl Diagnostic {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            source_name: None,
            span: None,
            snippet: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_source_name(mut self, name: &str) -> Self {
        self.source_name = Some(name.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(span) = self.span {
            if let Some(line_text) = source.lines().nth(span.line.saturating_sub(1)) {
                let width = span.line.to_string().len();
                self.snippet = Some(format!(
                    "{:>width$} | {}",
                    span.line,
                    line_text,
                    width = width
                ));
            }
        }
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.message)?;
        match (&self.source_name, self.span) {
            (Some(name), Some(span)) => write!(f, "\n--> {}:{}", name, span.line)?,
            (Some(name), None) => write!(f, "\n--> {}", name)?,
            (None, Some(span)) => write!(f, "\n--> line {}", span.line)?,
            (None, None) => {}
        }
        if let Some(snippet) = &self.snippet {
            write!(f, "\n{}", snippet)?;
        }
        Ok(())
    }
}
