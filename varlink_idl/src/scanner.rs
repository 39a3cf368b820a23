//! Tokenizer for varlink interface definition files.
//!
//! The scanner is expectation driven: the parser asks for a keyword,
//! punctuation or one of the name classes, and the scanner either consumes it
//! or leaves the position untouched. Whitespace and `#` comments are skipped
//! on every request, with contiguous comment blocks collected as the
//! docstring of the following declaration.

use std::fmt;

/// A syntax error with the position of the offending input and the token
/// class the parser expected there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub expected: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: expected {}",
            self.line, self.column, self.expected
        )
    }
}

impl std::error::Error for ParseError {}

pub(crate) struct Scanner<'a> {
    src: &'a str,
    pos: usize,
    doc_lines: Vec<&'a str>,
    // newlines seen since the last comment line; a run of more than one
    // means the comment block is not attached to what follows
    newlines_since_doc: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Scanner {
            src,
            pos: 0,
            doc_lines: Vec::new(),
            newlines_since_doc: 0,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    /// Consume whitespace and comments, accumulating comment lines.
    fn skip(&mut self) {
        loop {
            match self.bytes().get(self.pos) {
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.pos += 1,
                Some(b'\n') => {
                    self.pos += 1;
                    if !self.doc_lines.is_empty() {
                        self.newlines_since_doc += 1;
                    }
                }
                Some(b'#') => {
                    let start = self.pos;
                    while self.pos < self.src.len() && self.bytes()[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                    if self.newlines_since_doc > 1 {
                        self.doc_lines.clear();
                    }
                    let line = &self.src[start + 1..self.pos];
                    self.doc_lines.push(line.strip_prefix(' ').unwrap_or(line));
                    self.newlines_since_doc = 0;
                }
                _ => break,
            }
        }
    }

    /// Take the docstring attached to the declaration about to be parsed.
    ///
    /// Only a comment block directly above the current position counts; a
    /// blank line in between detaches it.
    pub fn take_doc(&mut self) -> String {
        let doc = if self.newlines_since_doc <= 1 {
            self.doc_lines.join("\n")
        } else {
            String::new()
        };
        self.doc_lines.clear();
        self.newlines_since_doc = 0;
        doc
    }

    pub fn at_end(&mut self) -> bool {
        self.skip();
        self.pos >= self.src.len()
    }

    /// Error at the current position, naming what was expected there.
    pub fn error(&mut self, expected: &str) -> ParseError {
        self.skip();
        let consumed = &self.src[..self.pos];
        let line = consumed.matches('\n').count() + 1;
        let column = self.pos - consumed.rfind('\n').map(|p| p + 1).unwrap_or(0) + 1;
        ParseError {
            line,
            column,
            expected: expected.to_string(),
        }
    }

    /// Try to consume a fixed keyword or punctuation token.
    pub fn get(&mut self, token: &str) -> bool {
        self.skip();
        if !self.src[self.pos..].starts_with(token) {
            return false;
        }
        // keywords must not run into a following identifier
        if token.as_bytes()[0].is_ascii_alphabetic() {
            if let Some(&c) = self.bytes().get(self.pos + token.len()) {
                if c.is_ascii_alphanumeric() || c == b'_' {
                    return false;
                }
            }
        }
        self.pos += token.len();
        true
    }

    pub fn expect(&mut self, token: &str) -> Result<(), ParseError> {
        if self.get(token) {
            Ok(())
        } else {
            Err(self.error(&format!("'{}'", token)))
        }
    }

    /// A member name: `[A-Z][A-Za-z0-9]*`.
    pub fn get_member_name(&mut self) -> Option<&'a str> {
        self.skip();
        let bytes = self.bytes();
        if !matches!(bytes.get(self.pos), Some(c) if c.is_ascii_uppercase()) {
            return None;
        }
        let start = self.pos;
        self.pos += 1;
        while matches!(bytes.get(self.pos), Some(c) if c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        Some(&self.src[start..self.pos])
    }

    /// A field name: starts with a letter, single interior underscores
    /// allowed between alphanumerics.
    pub fn get_field_name(&mut self) -> Option<&'a str> {
        self.skip();
        let bytes = self.bytes();
        if !matches!(bytes.get(self.pos), Some(c) if c.is_ascii_alphabetic()) {
            return None;
        }
        let start = self.pos;
        self.pos += 1;
        loop {
            match bytes.get(self.pos) {
                Some(c) if c.is_ascii_alphanumeric() => self.pos += 1,
                Some(b'_')
                    if matches!(bytes.get(self.pos + 1),
                        Some(c) if c.is_ascii_alphanumeric()) =>
                {
                    self.pos += 2;
                }
                _ => break,
            }
        }
        Some(&self.src[start..self.pos])
    }

    /// A dotted interface name with at least two segments. The first segment
    /// starts with a letter, later segments with a letter or digit; interior
    /// hyphen runs are allowed, leading or dangling hyphens are not.
    pub fn get_interface_name(&mut self) -> Option<&'a str> {
        self.skip();
        let start = self.pos;
        if self.scan_name_segment(true).is_none() {
            return None;
        }
        let mut dots = 0;
        while matches!(self.bytes().get(self.pos), Some(b'.')) {
            self.pos += 1;
            if self.scan_name_segment(false).is_none() {
                self.pos = start;
                return None;
            }
            dots += 1;
        }
        if dots == 0 {
            self.pos = start;
            return None;
        }
        Some(&self.src[start..self.pos])
    }

    fn scan_name_segment(&mut self, first: bool) -> Option<()> {
        let bytes = self.bytes();
        let lead_ok = match bytes.get(self.pos) {
            Some(c) if c.is_ascii_alphabetic() => true,
            Some(c) if !first && c.is_ascii_digit() => true,
            _ => false,
        };
        if !lead_ok {
            return None;
        }
        self.pos += 1;
        loop {
            match bytes.get(self.pos) {
                Some(c) if c.is_ascii_alphanumeric() => self.pos += 1,
                Some(b'-') => {
                    // hyphens only between alphanumerics
                    let mut ahead = self.pos;
                    while matches!(bytes.get(ahead), Some(b'-')) {
                        ahead += 1;
                    }
                    if matches!(bytes.get(ahead), Some(c) if c.is_ascii_alphanumeric()) {
                        self.pos = ahead + 1;
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_do_not_bite_identifiers() {
        let mut s = Scanner::new("interfaces");
        assert!(!s.get("interface"));
        let mut s = Scanner::new("interface x");
        assert!(s.get("interface"));
    }

    #[test]
    fn doc_block_detaches_over_blank_line() {
        let mut s = Scanner::new("# one\n# two\nmethod");
        assert!(s.get("method"));
        assert_eq!(s.take_doc(), "one\ntwo");

        let mut s = Scanner::new("# stale\n\nmethod");
        assert!(s.get("method"));
        assert_eq!(s.take_doc(), "");
    }

    #[test]
    fn error_position_is_line_and_column() {
        let mut s = Scanner::new("interface org.example\nmethod  +");
        assert!(s.get("interface"));
        assert!(s.get_interface_name().is_some());
        assert!(s.get("method"));
        let e = s.error("member name");
        assert_eq!((e.line, e.column), (2, 9));
    }

    #[test]
    fn interface_names() {
        for ok in [
            "org.varlink.service",
            "com.example.0example",
            "com.example.example-dash",
            "xn--lgbbat1ad8j.example.algeria",
            "a.b",
            "a.21.c",
            "Com.example.uppercase",
        ] {
            let mut s = Scanner::new(ok);
            assert_eq!(s.get_interface_name(), Some(ok), "{}", ok);
            assert!(s.at_end(), "{}", ok);
        }
        for bad in ["ab", "1.b.c", "-a.b.c", ".a.b"] {
            let mut s = Scanner::new(bad);
            let got = s.get_interface_name();
            assert!(got.is_none() || !s.at_end(), "{} -> {:?}", bad, got);
        }
    }
}
