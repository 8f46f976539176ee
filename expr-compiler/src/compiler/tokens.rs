//! Token types produced by the [`lexer`](crate::compiler::lexer).

use std::fmt;

/// Byte/line/column position of a token in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, col: usize) -> Self {
        Span {
            start,
            end,
            line,
            col,
        }
    }

    pub fn dummy() -> Self {
        Span::new(0, 0, 1, 1)
    }
}

/// The punctuation, operator, literal, and identifier kinds the lexer emits.
/// There is no keyword set beyond what the parser's `constantName` rule
/// resolves (`this`, `null`, `true`, `false`, `undefined`) — those arrive as
/// plain `Ident` tokens and are special-cased by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    /// Decoded string value; the raw spelling (quotes, escapes) lives on
    /// [`Token::text`] for diagnostics.
    Str(String),
    Ident(String),

    // Punctuation
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,

    // Operators (greedy longest match)
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,        // =
    Eq,            // ==
    NotEq,         // !=
    StrictEq,      // ===
    StrictNotEq,   // !==
    Lt,            // <
    Gt,            // >
    LtEq,          // <=
    GtEq,          // >=
    AndAnd,        // &&
    OrOr,          // ||
    Pipe,          // |

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "{n}"),
            TokenKind::Str(s) => write!(f, "{s:?}"),
            TokenKind::Ident(s) => write!(f, "{s}"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Question => write!(f, "?"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Bang => write!(f, "!"),
            TokenKind::Assign => write!(f, "="),
            TokenKind::Eq => write!(f, "=="),
            TokenKind::NotEq => write!(f, "!="),
            TokenKind::StrictEq => write!(f, "==="),
            TokenKind::StrictNotEq => write!(f, "!=="),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::AndAnd => write!(f, "&&"),
            TokenKind::OrOr => write!(f, "||"),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Eof => write!(f, "<eof>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw spelling from the source; kept alongside the decoded value on
    /// `kind` so diagnostics can point back at the original text.
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, span: Span) -> Self {
        Token {
            kind,
            text: text.into(),
            span,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Ident(_))
    }
}
