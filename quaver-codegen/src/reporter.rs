//! Diagnostic reporting against the unit's source text.
//!
//! The reporter owns the source of the compilation unit and renders byte
//! offsets as 1-based line numbers. The line index is built lazily on the
//! first lookup, since most units compile without reporting anything.

use crate::error::CodegenError;

/// Collects diagnostics for one compilation unit.
pub struct ErrorReporter {
    source: String,
    /// Byte offset of the first character of each line; empty until the
    /// first line-number query.
    line_starts: Vec<usize>,
    errors: Vec<String>,
    suppress: bool,
}

impl ErrorReporter {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), line_starts: Vec::new(), errors: Vec::new(), suppress: false }
    }

    /// A reporter that records errors without logging them, for tests that
    /// exercise failure paths.
    pub fn suppressed(source: impl Into<String>) -> Self {
        let mut reporter = Self::new(source);
        reporter.suppress = true;
        reporter
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record a rendered diagnostic.
    pub fn report(&mut self, error: &CodegenError) {
        let rendered = error.to_string();
        if !self.suppress {
            log::error!("{}", rendered);
        }
        self.errors.push(rendered);
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// 1-based line number containing the byte at `offset`. Offsets past
    /// the end of the source report the last line.
    pub fn line_number(&mut self, offset: usize) -> usize {
        if self.line_starts.is_empty() {
            self.line_starts.push(0);
            for (index, byte) in self.source.bytes().enumerate() {
                if byte == b'\n' {
                    self.line_starts.push(index + 1);
                }
            }
        }
        self.line_starts.partition_point(|&start| start <= offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_is_line_one() {
        let mut reporter = ErrorReporter::new("");
        assert_eq!(reporter.line_number(0), 1);
    }

    #[test]
    fn single_line_offsets() {
        let source = "arg freq; freq * 2";
        let mut reporter = ErrorReporter::new(source);
        assert_eq!(reporter.line_number(0), 1);
        assert_eq!(reporter.line_number(10), 1);
        assert_eq!(reporter.line_number(source.len()), 1);
    }

    #[test]
    fn multiline_offsets() {
        let mut reporter = ErrorReporter::new("one\n two\n three\n four\n five\n");
        assert_eq!(reporter.line_number(0), 1);
        assert_eq!(reporter.line_number(10), 3);
        assert_eq!(reporter.line_number(4), 2);
        assert_eq!(reporter.line_number(16), 4);
        assert_eq!(reporter.line_number(22), 5);
    }

    #[test]
    fn consecutive_newlines() {
        let mut reporter = ErrorReporter::new("\n\n\n7");
        assert_eq!(reporter.line_number(0), 1);
        assert_eq!(reporter.line_number(1), 2);
        assert_eq!(reporter.line_number(2), 3);
        assert_eq!(reporter.line_number(3), 4);
    }

    #[test]
    fn reported_errors_accumulate() {
        let mut reporter = ErrorReporter::suppressed("x");
        reporter.report(&CodegenError::NameResolution { name: "y".into(), offset: 0 });
        reporter.report(&CodegenError::Internal("phi arity".into()));
        assert_eq!(reporter.error_count(), 2);
        assert!(reporter.errors()[0].contains("unresolved name 'y'"));
    }
}
