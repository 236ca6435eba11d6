use serde::{Deserialize, Serialize};

/// Errors raised by the checking infrastructure itself
///
/// Problems found in guest code are never reported through this type; they
/// are data in [`crate::AnalysisResult`] and [`crate::ValidationResult`].
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Failed to load guest grammar: {0}")]
    Grammar(#[from] tree_sitter::LanguageError),

    #[error("Parser produced no syntax tree")]
    ParseFailed,

    #[error("Syntax probe failed: {0}")]
    Probe(String),
}

pub type Result<T> = std::result::Result<T, CheckError>;

/// 1-indexed position in caller source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Position of a tree-sitter point within `source`
    ///
    /// Tree-sitter columns count bytes; the returned column counts characters.
    pub fn from_point(source: &str, point: tree_sitter::Point) -> Self {
        let line_text = source.lines().nth(point.row).unwrap_or("");
        let byte_col = point.column.min(line_text.len());
        let column = line_text
            .char_indices()
            .take_while(|(idx, _)| *idx < byte_col)
            .count();
        Self {
            line: point.row + 1,
            column: column + 1,
        }
    }
}

/// Line and column (1-indexed) of a byte offset
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    let col = source[line_start..offset].chars().count() + 1;
    (line, col)
}

/// Number of lines in `source`, counting a trailing empty line
pub fn line_count(source: &str) -> usize {
    source.split('\n').count()
}
