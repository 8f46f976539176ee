//! Recursive-descent parser — one routine per precedence level, lowest to
//! highest.

use crate::compiler::ast::{BinaryOp, LiteralValue, LogicalOp, Node, NodeKind, PropertyKey, UnaryOp};
use crate::compiler::ast::AstRef;
use crate::compiler::tokens::{Span, Token, TokenKind};
use expr_core::FilterRegistry;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected {expected}, found '{found}' at line {line}, col {col}")]
    UnexpectedToken {
        expected: String,
        found: String,
        line: usize,
        col: usize,
    },
    #[error("unmatched bracket at line {line}, col {col}")]
    UnmatchedBracket { line: usize, col: usize },
    #[error("trailing tokens after expression at line {line}, col {col}")]
    TrailingTokens { line: usize, col: usize },
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    filters: &'a FilterRegistry,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, filters: &'a FilterRegistry) -> Self {
        Parser {
            tokens,
            pos: 0,
            filters,
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let tok = self.peek().clone();
            Err(ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: tok.kind.to_string(),
                line: tok.span.line,
                col: tok.span.col,
            })
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ParseError> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, tok.span))
            }
            _ => Err(ParseError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: tok.kind.to_string(),
                line: tok.span.line,
                col: tok.span.col,
            }),
        }
    }

    /// `program := filter (';' filter)* ';'?`
    pub fn parse_program(&mut self) -> Result<AstRef, ParseError> {
        let start = self.peek().span;
        let mut body = Vec::new();
        if !self.at_end() {
            body.push(self.parse_filter_expr()?);
            while self.eat(&TokenKind::Semicolon) {
                if self.at_end() {
                    break;
                }
                body.push(self.parse_filter_expr()?);
            }
        }
        if !self.at_end() {
            let tok = self.peek().clone();
            return Err(ParseError::TrailingTokens {
                line: tok.span.line,
                col: tok.span.col,
            });
        }
        Ok(Node::build(NodeKind::Program(body), start))
    }

    /// `filter := assignment ('|' Identifier (':' assignment)*)*`
    fn parse_filter_expr(&mut self) -> Result<AstRef, ParseError> {
        let mut expr = self.parse_assignment()?;
        while self.eat(&TokenKind::Pipe) {
            let span = expr.span;
            let (name, _) = self.expect_ident()?;
            let mut args = vec![expr];
            while self.eat(&TokenKind::Colon) {
                args.push(self.parse_assignment()?);
            }
            let stateless = self.filters.is_stateless(&name);
            expr = Node::build_filter(name, args, span, stateless);
        }
        Ok(expr)
    }

    /// `assignment := ternary ('=' ternary)?`
    fn parse_assignment(&mut self) -> Result<AstRef, ParseError> {
        let left = self.parse_ternary()?;
        if self.eat(&TokenKind::Assign) {
            let span = left.span;
            let right = self.parse_ternary()?;
            return Ok(Node::build(NodeKind::Assignment { left, right }, span));
        }
        Ok(left)
    }

    /// `ternary := logicalOR ('?' assignment ':' assignment)?`
    fn parse_ternary(&mut self) -> Result<AstRef, ParseError> {
        let test = self.parse_logical_or()?;
        if self.eat(&TokenKind::Question) {
            let span = test.span;
            let consequent = self.parse_assignment()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let alternate = self.parse_assignment()?;
            return Ok(Node::build(
                NodeKind::Conditional {
                    test,
                    consequent,
                    alternate,
                },
                span,
            ));
        }
        Ok(test)
    }

    fn parse_logical_or(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_logical_and()?;
        while self.eat(&TokenKind::OrOr) {
            let span = left.span;
            let right = self.parse_logical_and()?;
            left = Node::build(
                NodeKind::Logical {
                    op: LogicalOp::Or,
                    left,
                    right,
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let span = left.span;
            let right = self.parse_equality()?;
            left = Node::build(
                NodeKind::Logical {
                    op: LogicalOp::And,
                    left,
                    right,
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::StrictEq => BinaryOp::StrictEq,
                TokenKind::StrictNotEq => BinaryOp::StrictNotEq,
                _ => break,
            };
            self.advance();
            let span = left.span;
            let right = self.parse_relational()?;
            left = Node::build(NodeKind::Binary { op, left, right }, span);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::GtEq => BinaryOp::GtEq,
                _ => break,
            };
            self.advance();
            let span = left.span;
            let right = self.parse_additive()?;
            left = Node::build(NodeKind::Binary { op, left, right }, span);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let span = left.span;
            let right = self.parse_multiplicative()?;
            left = Node::build(NodeKind::Binary { op, left, right }, span);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<AstRef, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let span = left.span;
            let right = self.parse_unary()?;
            left = Node::build(NodeKind::Binary { op, left, right }, span);
        }
        Ok(left)
    }

    /// `unary := ('+' | '!' | '-') unary | primary`
    fn parse_unary(&mut self) -> Result<AstRef, ParseError> {
        let op = match &self.peek().kind {
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Minus => Some(UnaryOp::Minus),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.peek().span;
            self.advance();
            let arg = self.parse_unary()?;
            return Ok(Node::build(NodeKind::Unary { op, arg }, span));
        }
        self.parse_primary()
    }

    /// `primary := '(' filter ')' | array | object | constantName |
    /// Identifier | Literal`, followed by postfix `.`/`[..]`/`(..)`.
    fn parse_primary(&mut self) -> Result<AstRef, ParseError> {
        let mut expr = self.parse_primary_base()?;
        loop {
            expr = match &self.peek().kind {
                TokenKind::Dot => {
                    let span = expr.span;
                    self.advance();
                    let (name, _) = self.expect_ident()?;
                    Node::build(
                        NodeKind::MemberNonComputed {
                            object: expr,
                            property: name,
                        },
                        span,
                    )
                }
                TokenKind::LBracket => {
                    let span = expr.span;
                    self.advance();
                    let property = self.parse_filter_expr()?;
                    self.expect(&TokenKind::RBracket, "']'")
                        .map_err(|_| ParseError::UnmatchedBracket {
                            line: span.line,
                            col: span.col,
                        })?;
                    Node::build(
                        NodeKind::MemberComputed {
                            object: expr,
                            property,
                        },
                        span,
                    )
                }
                TokenKind::LParen => {
                    let span = expr.span;
                    self.advance();
                    let args = self.parse_args()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    Node::build(NodeKind::Call { callee: expr, args }, span)
                }
                _ => break,
            };
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<AstRef>, ParseError> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.parse_assignment()?);
            while self.eat(&TokenKind::Comma) {
                args.push(self.parse_assignment()?);
            }
        }
        Ok(args)
    }

    fn parse_primary_base(&mut self) -> Result<AstRef, ParseError> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_filter_expr()?;
                self.expect(&TokenKind::RParen, "')'")
                    .map_err(|_| ParseError::UnmatchedBracket {
                        line: tok.span.line,
                        col: tok.span.col,
                    })?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_array(),
            TokenKind::LBrace => self.parse_object(),
            TokenKind::Number(n) => {
                self.advance();
                Ok(Node::build(
                    NodeKind::Literal(LiteralValue::Number(n)),
                    tok.span,
                ))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Node::build(
                    NodeKind::Literal(LiteralValue::String(s)),
                    tok.span,
                ))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Self::resolve_ident(&name, tok.span))
            }
            _ => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: tok.kind.to_string(),
                line: tok.span.line,
                col: tok.span.col,
            }),
        }
    }

    /// `constantName` resolves `this`/`null`/`true`/`false`/`undefined` to
    /// shared sentinel nodes; every other identifier becomes an `Identifier`.
    fn resolve_ident(name: &str, span: Span) -> AstRef {
        match name {
            "this" => Node::build(NodeKind::ThisExpr, span),
            "null" => Node::build(NodeKind::Literal(LiteralValue::Null), span),
            "true" => Node::build(NodeKind::Literal(LiteralValue::Bool(true)), span),
            "false" => Node::build(NodeKind::Literal(LiteralValue::Bool(false)), span),
            "undefined" => Node::build(NodeKind::Literal(LiteralValue::Undefined), span),
            _ => Node::build(NodeKind::Identifier(name.to_string()), span),
        }
    }

    /// `array := '[' (assignment (',' assignment)* ','?)? ']'`
    fn parse_array(&mut self) -> Result<AstRef, ParseError> {
        let start = self.expect(&TokenKind::LBracket, "'['")?;
        let mut elements = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            elements.push(self.parse_assignment()?);
            while self.eat(&TokenKind::Comma) {
                if self.check(&TokenKind::RBracket) {
                    break; // trailing comma
                }
                elements.push(self.parse_assignment()?);
            }
        }
        self.expect(&TokenKind::RBracket, "']'")
            .map_err(|_| ParseError::UnmatchedBracket {
                line: start.span.line,
                col: start.span.col,
            })?;
        Ok(Node::build(NodeKind::Array(elements), start.span))
    }

    /// `object := '{' (property (',' property)*)? '}'`
    /// `property := (Identifier | Literal) ':' assignment`
    fn parse_object(&mut self) -> Result<AstRef, ParseError> {
        let start = self.expect(&TokenKind::LBrace, "'{'")?;
        let mut props = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            props.push(self.parse_property()?);
            while self.eat(&TokenKind::Comma) {
                if self.check(&TokenKind::RBrace) {
                    break;
                }
                props.push(self.parse_property()?);
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")
            .map_err(|_| ParseError::UnmatchedBracket {
                line: start.span.line,
                col: start.span.col,
            })?;
        Ok(Node::build(NodeKind::Object(props), start.span))
    }

    fn parse_property(&mut self) -> Result<(PropertyKey, AstRef), ParseError> {
        let tok = self.peek().clone();
        let key = match tok.kind {
            TokenKind::Ident(name) => {
                self.advance();
                PropertyKey::Identifier(name)
            }
            TokenKind::Str(s) => {
                self.advance();
                PropertyKey::Literal(s)
            }
            TokenKind::Number(n) => {
                self.advance();
                PropertyKey::Literal(format!("{}", expr_core::Value::Number(n)))
            }
            _ => {
                return Err(ParseError::UnexpectedToken {
                    expected: "property key".to_string(),
                    found: tok.kind.to_string(),
                    line: tok.span.line,
                    col: tok.span.col,
                })
            }
        };
        self.expect(&TokenKind::Colon, "':'")?;
        let value = self.parse_assignment()?;
        Ok((key, value))
    }
}

pub fn parse(tokens: Vec<Token>, filters: &FilterRegistry) -> Result<AstRef, ParseError> {
    Parser::new(tokens, filters).parse_program()
}
