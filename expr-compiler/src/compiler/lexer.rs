//! Single-pass, left-to-right lexer.

use crate::compiler::tokens::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {line}, col {col}")]
    UnexpectedChar { ch: char, line: usize, col: usize },
    #[error("unterminated string at line {line}, col {col}")]
    UnterminatedString { line: usize, col: usize },
    #[error("invalid number at line {line}, col {col}")]
    InvalidNumber { line: usize, col: usize },
    #[error("invalid unicode escape at line {line}, col {col}")]
    InvalidUnicodeEscape { line: usize, col: usize },
}

const OPERATORS_3: &[(&str, TokenKind)] = &[
    ("===", TokenKind::StrictEq),
    ("!==", TokenKind::StrictNotEq),
];
const OPERATORS_2: &[(&str, TokenKind)] = &[
    ("==", TokenKind::Eq),
    ("!=", TokenKind::NotEq),
    ("<=", TokenKind::LtEq),
    (">=", TokenKind::GtEq),
    ("&&", TokenKind::AndAnd),
    ("||", TokenKind::OrOr),
];
const OPERATORS_1: &[(char, TokenKind)] = &[
    ('+', TokenKind::Plus),
    ('-', TokenKind::Minus),
    ('*', TokenKind::Star),
    ('/', TokenKind::Slash),
    ('%', TokenKind::Percent),
    ('!', TokenKind::Bang),
    ('=', TokenKind::Assign),
    ('<', TokenKind::Lt),
    ('>', TokenKind::Gt),
    ('|', TokenKind::Pipe),
];

fn is_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n' | '\u{000B}' | '\u{00A0}')
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_continue(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    byte_offset: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            byte_offset: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn at(&self, offset: usize) -> Option<char> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(is_whitespace) {
            self.advance();
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let (start, line, col) = (self.byte_offset, self.line, self.col);
            let Some(ch) = self.current() else {
                tokens.push(Token::new(TokenKind::Eof, "", Span::new(start, start, line, col)));
                break;
            };

            if ch.is_ascii_digit() || (ch == '.' && self.at(1).is_some_and(|c| c.is_ascii_digit()))
            {
                tokens.push(self.lex_number(start, line, col)?);
                continue;
            }
            if ch == '\'' || ch == '"' {
                tokens.push(self.lex_string(start, line, col)?);
                continue;
            }
            if is_ident_start(ch) {
                tokens.push(self.lex_ident(start, line, col));
                continue;
            }
            if let Some(tok) = self.lex_punct(start, line, col) {
                tokens.push(tok);
                continue;
            }
            if let Some(tok) = self.lex_operator(start, line, col) {
                tokens.push(tok);
                continue;
            }
            return Err(LexError::UnexpectedChar { ch, line, col });
        }
        Ok(tokens)
    }

    fn span_from(&self, start: usize, line: usize, col: usize) -> Span {
        Span::new(start, self.byte_offset, line, col)
    }

    fn lex_number(&mut self, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        let mut text = String::new();
        while self.current().is_some_and(|c| c.is_ascii_digit()) {
            text.push(self.advance().unwrap());
        }
        if self.current() == Some('.') && self.at(1).is_some_and(|c| c.is_ascii_digit() || text.is_empty())
        {
            text.push(self.advance().unwrap());
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                text.push(self.advance().unwrap());
            }
        } else if self.current() == Some('.') && text.is_empty() {
            // handled by caller's lookahead; unreachable in practice
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let mut exp = String::new();
            exp.push(self.advance().unwrap());
            if matches!(self.current(), Some('+') | Some('-')) {
                exp.push(self.advance().unwrap());
            }
            let mut digits = String::new();
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                digits.push(self.advance().unwrap());
            }
            if digits.is_empty() {
                return Err(LexError::InvalidNumber { line, col });
            }
            exp.push_str(&digits);
            text.push_str(&exp);
        }
        let value: f64 = text
            .parse()
            .map_err(|_| LexError::InvalidNumber { line, col })?;
        Ok(Token::new(
            TokenKind::Number(value),
            text,
            self.span_from(start, line, col),
        ))
    }

    fn lex_string(&mut self, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        let quote = self.advance().unwrap();
        let mut raw = String::from(quote);
        let mut value = String::new();
        loop {
            match self.current() {
                None => return Err(LexError::UnterminatedString { line, col }),
                Some(c) if c == quote => {
                    raw.push(self.advance().unwrap());
                    break;
                }
                Some('\\') => {
                    raw.push(self.advance().unwrap());
                    let Some(esc) = self.current() else {
                        return Err(LexError::UnterminatedString { line, col });
                    };
                    raw.push(esc);
                    match esc {
                        'n' => {
                            value.push('\n');
                            self.advance();
                        }
                        'f' => {
                            value.push('\u{000C}');
                            self.advance();
                        }
                        'r' => {
                            value.push('\r');
                            self.advance();
                        }
                        't' => {
                            value.push('\t');
                            self.advance();
                        }
                        'v' => {
                            value.push('\u{000B}');
                            self.advance();
                        }
                        '\'' => {
                            value.push('\'');
                            self.advance();
                        }
                        '"' => {
                            value.push('"');
                            self.advance();
                        }
                        '\\' => {
                            value.push('\\');
                            self.advance();
                        }
                        'u' => {
                            self.advance();
                            let mut hex = String::new();
                            for _ in 0..4 {
                                let Some(h) = self.current() else {
                                    return Err(LexError::InvalidUnicodeEscape { line, col });
                                };
                                if !h.is_ascii_hexdigit() {
                                    return Err(LexError::InvalidUnicodeEscape { line, col });
                                }
                                hex.push(h);
                                raw.push(h);
                                self.advance();
                            }
                            let code = u32::from_str_radix(&hex, 16)
                                .map_err(|_| LexError::InvalidUnicodeEscape { line, col })?;
                            let ch = char::from_u32(code)
                                .ok_or(LexError::InvalidUnicodeEscape { line, col })?;
                            value.push(ch);
                        }
                        other => {
                            // unknown escapes pass the literal character through
                            value.push(other);
                            self.advance();
                        }
                    }
                }
                Some(c) => {
                    value.push(c);
                    raw.push(self.advance().unwrap());
                }
            }
        }
        Ok(Token::new(
            TokenKind::Str(value),
            raw,
            self.span_from(start, line, col),
        ))
    }

    fn lex_ident(&mut self, start: usize, line: usize, col: usize) -> Token {
        let mut text = String::new();
        while self.current().is_some_and(is_ident_continue) {
            text.push(self.advance().unwrap());
        }
        Token::new(
            TokenKind::Ident(text.clone()),
            text,
            self.span_from(start, line, col),
        )
    }

    fn lex_punct(&mut self, start: usize, line: usize, col: usize) -> Option<Token> {
        let kind = match self.current()? {
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '.' => TokenKind::Dot,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '?' => TokenKind::Question,
            _ => return None,
        };
        let ch = self.advance().unwrap();
        Some(Token::new(
            kind,
            ch.to_string(),
            self.span_from(start, line, col),
        ))
    }

    fn lex_operator(&mut self, start: usize, line: usize, col: usize) -> Option<Token> {
        let rest: String = self.source[self.pos..].iter().take(3).collect();
        for (op, kind) in OPERATORS_3 {
            if rest.starts_with(op) {
                for _ in 0..3 {
                    self.advance();
                }
                return Some(Token::new(kind.clone(), *op, self.span_from(start, line, col)));
            }
        }
        for (op, kind) in OPERATORS_2 {
            if rest.starts_with(op) {
                for _ in 0..2 {
                    self.advance();
                }
                return Some(Token::new(kind.clone(), *op, self.span_from(start, line, col)));
            }
        }
        for (op, kind) in OPERATORS_1 {
            if rest.starts_with(*op) {
                self.advance();
                return Some(Token::new(
                    kind.clone(),
                    op.to_string(),
                    self.span_from(start, line, col),
                ));
            }
        }
        None
    }
}

pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}
