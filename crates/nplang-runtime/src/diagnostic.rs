//! Rich diagnostic error messages inspired by Rust's compiler.
//!
//! This module provides Rust-like error formatting with:
//! - Source code snippets with line numbers
//! - Visual underlines pointing to the error location
//! - Notes providing additional context
//! - Help suggestions showing how to fix the issue

use std::fmt;

/// A span in the source code (byte offsets).
#[derive(Debug, Clone, Copy, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A label attached to a span with a message.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

impl Label {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            is_primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            is_primary: false,
        }
    }
}

/// A rich diagnostic error with source context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The error message (e.g., "type mismatch")
    pub message: String,
    /// The source code that caused the error
    pub source: String,
    /// Labels pointing to specific locations
    pub labels: Vec<Label>,
    /// Additional notes (e.g., "argument `limit` expects an integer")
    pub notes: Vec<String>,
    /// Help suggestions (e.g., "try: search(\"query\", 5)")
    pub help: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: String::new(),
            labels: Vec::new(),
            notes: Vec::new(),
            help: Vec::new(),
        }
    }

    /// Set the source code.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a primary label (the main error location).
    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::primary(span, message));
        self
    }

    /// Add a secondary label (additional context).
    pub fn with_secondary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::secondary(span, message));
        self
    }

    /// Add a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Add a help suggestion.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help.push(help.into());
        self
    }

    /// Find the line and column for a byte offset.
    fn offset_to_line_col(&self, offset: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in self.source.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    /// Get the line content for a given line number (1-indexed).
    fn get_line(&self, line_num: usize) -> &str {
        self.source.lines().nth(line_num - 1).unwrap_or("")
    }

    /// Calculate the display width needed for line numbers.
    fn line_number_width(&self) -> usize {
        let max_line = self.source.lines().count();
        max_line.to_string().len().max(1)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Error header
        writeln!(f, "error: {}", self.message)?;

        if self.source.is_empty() || self.labels.is_empty() {
            // No source context, just show notes and help
            for note in &self.notes {
                writeln!(f, "  = note: {}", note)?;
            }
            for help in &self.help {
                writeln!(f, "  = help: {}", help)?;
            }
            return Ok(());
        }

        let width = self.line_number_width();

        // Group labels by line
        let mut labels_by_line: std::collections::BTreeMap<usize, Vec<&Label>> =
            std::collections::BTreeMap::new();

        for label in &self.labels {
            let (line, _) = self.offset_to_line_col(label.span.start);
            labels_by_line.entry(line).or_default().push(label);
        }

        // Print each line with its labels
        writeln!(f, "{:width$} |", "", width = width)?;

        for (&line_num, labels) in &labels_by_line {
            let line_content = self.get_line(line_num);

            // Print the source line
            writeln!(f, "{:width$} | {}", line_num, line_content, width = width)?;

            // Print underlines for each label on this line
            for label in labels {
                let (_, start_col) = self.offset_to_line_col(label.span.start);
                let (_, end_col) = self.offset_to_line_col(label.span.end);

                // Calculate underline position and length
                let underline_start = start_col - 1;
                let underline_len = (end_col - start_col).max(1);

                // Choose underline character based on primary/secondary
                let underline_char = if label.is_primary { '^' } else { '-' };

                // Print the underline
                write!(f, "{:width$} | ", "", width = width)?;
                write!(f, "{:underline_start$}", "")?;
                for _ in 0..underline_len {
                    write!(f, "{}", underline_char)?;
                }

                // Print label message on the same line if it fits
                if !label.message.is_empty() {
                    write!(f, " {}", label.message)?;
                }
                writeln!(f)?;
            }
        }

        writeln!(f, "{:width$} |", "", width = width)?;

        // Print notes
        for note in &self.notes {
            writeln!(f, "  = note: {}", note)?;
        }

        // Print help suggestions
        for help in &self.help {
            writeln!(f, "  = help: {}", help)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_diagnostic() {
        let diag = Diagnostic::new("expected ';' after expression")
            .with_source("let x = 1\nprint x")
            .with_label(Span::new(9, 9), "expected `;` here")
            .with_note("statements must be terminated")
            .with_help("insert a `;` at the end of the line");

        let output = diag.to_string();
        assert!(output.contains("error: expected ';' after expression"));
        assert!(output.contains("let x = 1"));
        assert!(output.contains("expected `;` here"));
        assert!(output.contains("note:"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_multiple_labels_on_different_lines() {
        let diag = Diagnostic::new("mismatched closing brace")
            .with_source("fun f() {\n  return 1;\n")
            .with_secondary_label(Span::new(8, 9), "unmatched `{` opened here")
            .with_label(Span::new(21, 21), "expected `}` before end of input");

        let output = diag.to_string();
        assert!(output.contains("unmatched `{` opened here"));
        assert!(output.contains("expected `}` before end of input"));
    }
}
