//! Tokenizer for agent scripts.
//!
//! Produces a flat token stream where block structure is made explicit with
//! [`Tok::Indent`] / [`Tok::Dedent`] and logical line ends with [`Tok::Newline`].
//! Newlines inside brackets are ignored.

use crate::error::BuildError;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "break", "continue", "def", "elif", "else", "except",
    "for", "from", "global", "if", "import", "in", "is", "lambda", "not", "or", "pass", "raise",
    "return", "try", "while",
    // reserved but unsupported
    "class", "with", "yield", "async", "await", "del", "assert", "nonlocal", "finally",
];

// longest first
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*",
    "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Kw(&'static str),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

struct Lexer<'a> {
    file: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    indents: Vec<usize>,
    depth: usize,
    tokens: Vec<Token>,
}

/// Splits `source` into tokens. `file` is only used for error messages.
pub fn tokenize(file: &str, source: &str) -> Result<Vec<Token>, BuildError> {
    let mut lexer = Lexer {
        file,
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        indents: vec![0],
        depth: 0,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn error(&self, message: impl Into<String>) -> BuildError {
        BuildError::Syntax {
            file: self.file.to_owned(),
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), BuildError> {
        let mut line_start = true;
        while self.pos < self.chars.len() {
            if line_start && self.depth == 0 {
                if self.indentation()? {
                    continue;
                }
                line_start = false;
            }
            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    if self.depth == 0 && !self.last_is_newline() {
                        self.push(Tok::Newline);
                    }
                    self.pos += 1;
                    self.line += 1;
                    line_start = self.depth == 0;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\'' | '"' => self.string(c)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.word(),
                _ => self.operator()?,
            }
        }
        if !self.last_is_newline() {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measures the indentation of a new line. Returns `true` when the line is blank
    /// or holds only a comment, in which case it has been consumed.
    fn indentation(&mut self) -> Result<bool, BuildError> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\r' | '\x0c' => {}
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek(0) {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek(0) == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }

        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if self.indents.last() != Some(&width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn word(&mut self) {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match KEYWORDS.iter().find(|k| **k == word) {
            Some(kw) => self.push(Tok::Kw(kw)),
            None => self.push(Tok::Name(word)),
        }
    }

    fn number(&mut self) -> Result<(), BuildError> {
        let start = self.pos;
        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x') | Some('X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek(0).is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("invalid hexadecimal literal"))?;
            self.push(Tok::Int(value));
            return Ok(());
        }

        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && (self.peek(1).is_some_and(|n| n.is_ascii_digit())
                    || (matches!(self.peek(1), Some('+') | Some('-'))
                        && self.peek(2).is_some_and(|n| n.is_ascii_digit())))
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .ok()
                .filter(|v: &f64| v.is_finite())
                .ok_or_else(|| self.error(format!("invalid float literal '{text}'")))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(format!("integer literal '{text}' is too large")))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), BuildError> {
        let start_line = self.line;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut out = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                self.line = start_line;
                return Err(self.error("EOF while scanning string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
                out.push(c);
                self.pos += 1;
                continue;
            }
            match c {
                '\n' if !triple => {
                    return Err(self.error("EOL while scanning string literal"));
                }
                '\n' => {
                    self.line += 1;
                    out.push('\n');
                    self.pos += 1;
                }
                '\\' => {
                    let escaped = self.peek(1).ok_or_else(|| self.error("EOF in escape"))?;
                    self.pos += 2;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        '"' => out.push('"'),
                        '\n' => self.line += 1,
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        // tokens are stamped with the line the literal starts on
        let end_line = self.line;
        self.line = start_line;
        self.push(Tok::Str(out));
        self.line = end_line;
        Ok(())
    }

    fn operator(&mut self) -> Result<(), BuildError> {
        for op in OPERATORS {
            let len = op.chars().count();
            if self.pos + len <= self.chars.len()
                && self.chars[self.pos..self.pos + len]
                    .iter()
                    .copied()
                    .eq(op.chars())
            {
                self.pos += len;
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        Err(self.error(format!("invalid character '{}'", self.chars[self.pos])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize("t", src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn blocks_become_indent_dedent() {
        let t = toks("if x:\n    y = 1\nz = 2\n");
        assert_eq!(
            t,
            vec![
                Tok::Kw("if"),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let t = toks("x = [1,\n  2]\n");
        assert!(!t[..t.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let t = toks("# hi\n\nx = 1  # trailing\n\n");
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn triple_quoted_strings_track_lines() {
        let tokens = tokenize("t", "\"\"\"a\nb\"\"\"\nx = 1\n").unwrap();
        assert_eq!(tokens[0].tok, Tok::Str("a\nb".into()));
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn numbers_and_operators() {
        assert_eq!(
            toks("a //= 2.5e1 ** 0x10"),
            vec![
                Tok::Name("a".into()),
                Tok::Op("//="),
                Tok::Float(25.0),
                Tok::Op("**"),
                Tok::Int(16),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = tokenize("t", "if x:\n    y\n  z\n").unwrap_err();
        assert!(matches!(err, BuildError::Syntax { line: 3, .. }));
    }
}
