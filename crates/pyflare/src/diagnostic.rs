//! Source-located diagnostics.
//!
//! Provides the offset → line/column mapping used while compiling (the parser
//! reports byte offsets) and the context-window rendering the CLI prints for
//! a failed build: five lines above and below the offending line, with a
//! caret under the column.

use std::fmt::Write as _;

use crate::error::{Error, Location};

/// Precomputed line-start offsets for one source file.
///
/// Built once per compilation unit; `location()` is a binary search, cheap
/// enough to call per emitted `debugline` instruction.
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// 1-based line number for a byte offset.
    pub fn line(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset)
    }

    /// (1-based line, 0-based column) for a byte offset.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = self.line(offset);
        (line, offset - self.line_starts[line - 1])
    }
}

/// Number of context lines shown above and below the error line.
const CONTEXT_LINES: usize = 5;

/// Render a context window for `location` out of `source`.
///
/// Mirrors the layout the compiler has always printed: numbered lines around
/// the error with a caret marking the column.
pub fn render_context(source: &str, location: &Location) -> String {
    let mut out = String::new();
    let first = location.line.saturating_sub(CONTEXT_LINES).max(1);
    for (no, line) in source.lines().enumerate().map(|(i, l)| (i + 1, l)) {
        if no < first {
            continue;
        }
        if no > location.line + CONTEXT_LINES - 1 {
            break;
        }
        let _ = writeln!(out, "{no:4}  {}", line.trim_end());
        if no == location.line {
            let _ = writeln!(out, "{}^", " ".repeat(location.column + 6));
        }
    }
    out
}

/// Render an error together with its context window, when it has a location
/// and the file is readable.
pub fn render_error(err: &Error) -> String {
    let mut out = String::new();
    if let Some(location) = err.location() {
        if let Ok(source) = std::fs::read_to_string(&location.file) {
            out.push_str(&render_context(&source, location));
        }
    }
    let _ = writeln!(out, "error: {err}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_maps_offsets() {
        let idx = LineIndex::new("ab\ncd\n\nefg");
        assert_eq!(idx.line_col(0), (1, 0));
        assert_eq!(idx.line_col(1), (1, 1));
        assert_eq!(idx.line_col(3), (2, 0));
        assert_eq!(idx.line_col(6), (3, 0));
        assert_eq!(idx.line_col(9), (4, 2));
    }

    #[test]
    fn context_window_carets_the_column() {
        let source = "a = 1\nb = ?\nc = 3\n";
        let loc = Location::new("x.py", 2, 4);
        let rendered = render_context(source, &loc);
        assert!(rendered.contains("   2  b = ?"));
        let caret_line = rendered
            .lines()
            .find(|l| l.trim_end().ends_with('^'))
            .unwrap();
        assert_eq!(caret_line.len() - 1, 4 + 6);
    }

    #[test]
    fn context_window_is_clamped_to_the_file() {
        let source = "only\n";
        let loc = Location::new("x.py", 1, 0);
        let rendered = render_context(source, &loc);
        assert_eq!(rendered.lines().count(), 2);
    }
}
