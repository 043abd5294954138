//! Recursive-descent parser: tag text → [`Expr`], and whole document text
//! (with `{{ }}` / `{% %}` tags) → [`Template`].

use thiserror::Error;

use super::ast::{BinOp, Expr, PathSegment, Template, TemplateNode, UnaryOp};
use super::lexer::{self, LexError, Token};

#[derive(Debug, Error, PartialEq)]
pub enum TemplateParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unexpected end of expression")]
    UnexpectedEof,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(Token),
    #[error("unclosed tag: missing '{0}'")]
    UnclosedTag(&'static str),
    #[error("'{0}' with no matching 'if'")]
    DanglingBlockTag(&'static str),
    #[error("missing 'endif' for an open 'if'")]
    UnclosedIf,
}

// ---------------------------------------------------------------------------
// Expression parsing (precedence climbing)
// ---------------------------------------------------------------------------

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), TemplateParseError> {
        match self.advance() {
            Some(t) if &t == want => Ok(()),
            Some(t) => Err(TemplateParseError::UnexpectedToken(t)),
            None => Err(TemplateParseError::UnexpectedEof),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, TemplateParseError> {
        self.parse_pipeline()
    }

    fn parse_pipeline(&mut self) -> Result<Expr, TemplateParseError> {
        let mut expr = self.parse_or()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                Some(t) => return Err(TemplateParseError::UnexpectedToken(t)),
                None => return Err(TemplateParseError::UnexpectedEof),
            };
            let mut args = Vec::new();
            if matches!(self.peek(), Some(Token::LParen)) {
                self.advance();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.parse_or()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
            }
            expr = Expr::Filter(Box::new(expr), name, args);
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, TemplateParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, TemplateParseError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some(Token::Minus) => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateParseError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.parse_path_tail(name),
            Some(t) => Err(TemplateParseError::UnexpectedToken(t)),
            None => Err(TemplateParseError::UnexpectedEof),
        }
    }

    fn parse_path_tail(&mut self, head: String) -> Result<Expr, TemplateParseError> {
        let mut segments = vec![PathSegment::Ident(head)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) => segments.push(PathSegment::Ident(name)),
                        Some(t) => return Err(TemplateParseError::UnexpectedToken(t)),
                        None => return Err(TemplateParseError::UnexpectedEof),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Number(n)) => segments.push(PathSegment::Index(n as i64)),
                        Some(Token::Str(s)) => segments.push(PathSegment::Key(s)),
                        Some(t) => return Err(TemplateParseError::UnexpectedToken(t)),
                        None => return Err(TemplateParseError::UnexpectedEof),
                    }
                    self.expect(&Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }

    fn finish(self) -> Result<(), TemplateParseError> {
        if self.pos < self.tokens.len() {
            return Err(TemplateParseError::UnexpectedToken(
                self.tokens[self.pos].clone(),
            ));
        }
        Ok(())
    }
}

/// Parse the contents of one `{{ … }}` tag (without the braces).
pub fn parse_expr(src: &str) -> Result<Expr, TemplateParseError> {
    let tokens = lexer::tokenize(src)?;
    let mut parser = ExprParser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.finish()?;
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Template text parsing ({{ }} / {% %} scanning with if/elif/else/endif nesting)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RawTag<'a> {
    Text(&'a str),
    ExprTag(&'a str),
    If(&'a str),
    Elif(&'a str),
    Else,
    Endif,
}

fn scan_tags(src: &str) -> Result<Vec<RawTag<'_>>, TemplateParseError> {
    let mut tags = Vec::new();
    let mut rest = src;

    loop {
        let next_expr = rest.find("{{");
        let next_block = rest.find("{%");

        let next = match (next_expr, next_block) {
            (None, None) => {
                if !rest.is_empty() {
                    tags.push(RawTag::Text(rest));
                }
                break;
            }
            (Some(e), None) => e,
            (None, Some(b)) => b,
            (Some(e), Some(b)) => e.min(b),
        };

        if next > 0 {
            tags.push(RawTag::Text(&rest[..next]));
        }
        rest = &rest[next..];

        if let Some(body) = rest.strip_prefix("{{") {
            let end = body
                .find("}}")
                .ok_or(TemplateParseError::UnclosedTag("}}"))?;
            tags.push(RawTag::ExprTag(body[..end].trim()));
            rest = &body[end + 2..];
        } else if let Some(body) = rest.strip_prefix("{%") {
            let end = body
                .find("%}")
                .ok_or(TemplateParseError::UnclosedTag("%}"))?;
            let tag_body = body[..end].trim();
            rest = &body[end + 2..];
            if let Some(cond) = tag_body.strip_prefix("if ") {
                tags.push(RawTag::If(cond.trim()));
            } else if tag_body == "if" {
                tags.push(RawTag::If(""));
            } else if let Some(cond) = tag_body.strip_prefix("elif ") {
                tags.push(RawTag::Elif(cond.trim()));
            } else if tag_body == "else" {
                tags.push(RawTag::Else);
            } else if tag_body == "endif" {
                tags.push(RawTag::Endif);
            } else {
                return Err(TemplateParseError::UnexpectedToken(Token::Ident(
                    tag_body.to_string(),
                )));
            }
        }
    }

    Ok(tags)
}

/// Parse a sequence of raw tags into a `Template`, stopping (and returning
/// the remaining tags) when an `elif`/`else`/`endif` closes the current
/// `if` block, or consuming everything at the top level.
fn parse_nodes<'a>(
    tags: &mut std::iter::Peekable<std::slice::Iter<'a, RawTag<'a>>>,
    in_if: bool,
) -> Result<Template, TemplateParseError> {
    let mut nodes = Vec::new();

    loop {
        match tags.peek() {
            None => {
                if in_if {
                    return Err(TemplateParseError::UnclosedIf);
                }
                return Ok(nodes);
            }
            Some(RawTag::Elif(_)) | Some(RawTag::Else) | Some(RawTag::Endif) if in_if => {
                return Ok(nodes);
            }
            Some(RawTag::Elif(_)) => {
                return Err(TemplateParseError::DanglingBlockTag("elif"));
            }
            Some(RawTag::Else) => {
                return Err(TemplateParseError::DanglingBlockTag("else"));
            }
            Some(RawTag::Endif) => {
                return Err(TemplateParseError::DanglingBlockTag("endif"));
            }
            Some(RawTag::Text(text)) => {
                nodes.push(TemplateNode::Text(text.to_string()));
                tags.next();
            }
            Some(RawTag::ExprTag(src)) => {
                let expr = parse_expr(src)?;
                nodes.push(TemplateNode::Expr(expr));
                tags.next();
            }
            Some(RawTag::If(cond)) => {
                let cond = cond.to_string();
                tags.next();
                let mut branches = Vec::new();
                let first_expr = parse_expr(&cond)?;
                let first_body = parse_nodes(tags, true)?;
                branches.push((first_expr, first_body));

                let mut else_body = None;
                loop {
                    match tags.next() {
                        Some(RawTag::Elif(cond)) => {
                            let expr = parse_expr(cond)?;
                            let body = parse_nodes(tags, true)?;
                            branches.push((expr, body));
                        }
                        Some(RawTag::Else) => {
                            let body = parse_nodes(tags, true)?;
                            else_body = Some(body);
                        }
                        Some(RawTag::Endif) => break,
                        _ => return Err(TemplateParseError::UnclosedIf),
                    }
                }

                nodes.push(TemplateNode::If(branches, else_body));
            }
        }
    }
}

/// Parse a whole document value (the text of a config field) into a
/// [`Template`].
pub fn parse_template(src: &str) -> Result<Template, TemplateParseError> {
    let tags = scan_tags(src)?;
    let mut iter = tags.iter().peekable();
    parse_nodes(&mut iter, false)
}
