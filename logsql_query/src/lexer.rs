//! A quote aware tokenizer for the raw statement text.
//!
//! The SQL parser never sees `$` references or table names as written; they
//! are located here first and rewritten by byte span.

use std::ops::Range;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// `[A-Za-z0-9_]+`
    Word,
    /// `$` followed by `[A-Za-z0-9_.]*`
    Entity,
    /// A `'`, `"` or backtick quoted string, quotes included.
    Quoted,
    Semicolon,
    Open,
    Close,
    Whitespace,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub(crate) kind: TokenKind,
    pub(crate) text: &'a str,
    pub(crate) start: usize,
}

impl Token<'_> {
    pub(crate) fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub(crate) fn span(&self) -> Range<usize> {
        self.start..self.end()
    }

    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_entity_byte(b: u8) -> bool {
    is_word_byte(b) || b == b'.'
}

/// Split `input` into tokens. Fails on an unterminated quoted string.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;

    while start < bytes.len() {
        let b = bytes[start];
        let (kind, end) = match b {
            b'\'' | b'"' | b'`' => (TokenKind::Quoted, quoted_end(bytes, start)?),
            b'$' => (TokenKind::Entity, run_end(bytes, start + 1, is_entity_byte)),
            b';' => (TokenKind::Semicolon, start + 1),
            b'(' => (TokenKind::Open, start + 1),
            b')' => (TokenKind::Close, start + 1),
            b if b.is_ascii_whitespace() => (
                TokenKind::Whitespace,
                run_end(bytes, start, |b| b.is_ascii_whitespace()),
            ),
            b if is_word_byte(b) => (TokenKind::Word, run_end(bytes, start, is_word_byte)),
            _ => {
                let width = input[start..].chars().next().map_or(1, char::len_utf8);
                (TokenKind::Other, start + width)
            }
        };
        tokens.push(Token {
            kind,
            text: &input[start..end],
            start,
        });
        start = end;
    }
    Ok(tokens)
}

fn run_end(bytes: &[u8], from: usize, accept: impl Fn(u8) -> bool) -> usize {
    bytes[from..]
        .iter()
        .position(|b| !accept(*b))
        .map_or(bytes.len(), |n| from + n)
}

/// End of the quoted string opening at `start`. A doubled quote inside the
/// string stands for the quote itself.
fn quoted_end(bytes: &[u8], start: usize) -> Result<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(Error::Parse(format!(
        "unterminated quoted string starting at offset {start}"
    )))
}

/// Split a request body into its non-blank statements.
pub fn split_statements(text: &str) -> Result<Vec<&str>> {
    let mut statements = Vec::new();
    let mut start = 0;
    for token in tokenize(text)? {
        if token.kind == TokenKind::Semicolon {
            statements.push(&text[start..token.start]);
            start = token.end();
        }
    }
    statements.push(&text[start..]);

    let statements: Vec<&str> = statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if statements.is_empty() {
        return Err(Error::Parse("no statement found".to_string()));
    }
    Ok(statements)
}
