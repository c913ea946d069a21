/// A resolved source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Maps byte offsets to line/column positions within one source file.
pub struct SourceMap {
    file: String,
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(file: impl Into<String>, source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { file: file.into(), line_starts }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn position(&self, offset: usize) -> Position {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        Position {
            line: line + 1,
            column: offset.saturating_sub(self.line_starts[line]) + 1,
        }
    }

    /// `file:line:col` for the start of a span — the prefix every fatal
    /// diagnostic is reported with.
    pub fn describe(&self, offset: usize) -> String {
        format!("{}:{}", self.file, self.position(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let sm = SourceMap::new("t.q", "int x = 5;");
        assert_eq!(sm.position(0), Position { line: 1, column: 1 });
        assert_eq!(sm.position(4), Position { line: 1, column: 5 });
    }

    #[test]
    fn multi_line() {
        let sm = SourceMap::new("t.q", "int x;\nint y;\nint z;");
        assert_eq!(sm.position(0), Position { line: 1, column: 1 });
        assert_eq!(sm.position(6), Position { line: 1, column: 7 }); // the '\n' itself
        assert_eq!(sm.position(7), Position { line: 2, column: 1 });
        assert_eq!(sm.position(14), Position { line: 3, column: 1 });
    }

    #[test]
    fn describe_prefixes_file() {
        let sm = SourceMap::new("lib/main.q", "a\nb");
        assert_eq!(sm.describe(2), "lib/main.q:2:1");
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("t.q", "");
        assert_eq!(sm.position(0), Position { line: 1, column: 1 });
    }
}
