//! Tokenizer for rule text.
//!
//! Rule text is whitespace-separated words with a handful of punctuation
//! tokens. Comparison operators split words, so `dataset.size>1TB` lexes the
//! same as `dataset.size > 1TB`. Keywords (`and`, `not`, `in`, ...) are plain
//! words; the parser decides what they mean by position.

use replicore_error::{ReplicoreError, Result};

/// Byte range in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    /// Double-quoted text; the span excludes the quotes.
    Quoted,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    #[must_use]
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.span.start..self.span.end]
    }

    /// A bare word equal to `keyword`.
    #[must_use]
    pub fn is_keyword(&self, source: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text(source) == keyword
    }
}

const fn is_operator_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>')
}

const fn is_punct(c: char) -> bool {
    matches!(c, '[' | ']' | ',' | '"')
}

/// Split rule text into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let single = |kind| Token {
            kind,
            span: Span {
                start,
                end: start + 1,
            },
        };
        match c {
            '[' => {
                chars.next();
                tokens.push(single(TokenKind::LBracket));
            }
            ']' => {
                chars.next();
                tokens.push(single(TokenKind::RBracket));
            }
            ',' => {
                chars.next();
                tokens.push(single(TokenKind::Comma));
            }
            '"' => {
                chars.next();
                let body_start = start + 1;
                let mut body_end = None;
                for (idx, ch) in chars.by_ref() {
                    if ch == '"' {
                        body_end = Some(idx);
                        break;
                    }
                }
                let Some(body_end) = body_end else {
                    return Err(syntax(source, start, "unterminated quoted literal"));
                };
                tokens.push(Token {
                    kind: TokenKind::Quoted,
                    span: Span {
                        start: body_start,
                        end: body_end,
                    },
                });
            }
            c if is_operator_char(c) => {
                chars.next();
                let next = chars.peek().map(|&(_, ch)| ch);
                let (kind, len) = match (c, next) {
                    ('=', Some('=')) => (TokenKind::Eq, 2),
                    ('!', Some('=')) => (TokenKind::Ne, 2),
                    ('<', Some('=')) => (TokenKind::Le, 2),
                    ('>', Some('=')) => (TokenKind::Ge, 2),
                    ('<', _) => (TokenKind::Lt, 1),
                    ('>', _) => (TokenKind::Gt, 1),
                    _ => return Err(syntax(source, start, "unexpected operator character")),
                };
                if len == 2 {
                    chars.next();
                }
                tokens.push(Token {
                    kind,
                    span: Span {
                        start,
                        end: start + len,
                    },
                });
            }
            _ => {
                let mut end = source.len();
                while let Some(&(idx, ch)) = chars.peek() {
                    if ch.is_whitespace() || is_operator_char(ch) || is_punct(ch) {
                        end = idx;
                        break;
                    }
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    span: Span { start, end },
                });
            }
        }
    }
    Ok(tokens)
}

pub(crate) fn syntax(source: &str, offset: usize, message: impl Into<String>) -> ReplicoreError {
    ReplicoreError::RuleSyntax {
        rule: source.to_owned(),
        offset,
        message: message.into(),
    }
}
