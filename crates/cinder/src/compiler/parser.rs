//! Recursive-descent parser producing the statement tree.

use super::lexer::{Spanned, Token};
use super::{CompileError, Pos};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Var(String),
    Assign {
        name: String,
        value: Box<Expr>,
        pos: Pos,
    },
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    If {
        cond: Box<Expr>,
        then_body: Vec<Expr>,
        else_body: Option<Vec<Expr>>,
    },
    While {
        cond: Box<Expr>,
        body: Vec<Expr>,
    },
    Raise {
        class: Option<String>,
        message: Option<Box<Expr>>,
    },
    Suspend,
}

pub(crate) fn parse(tokens: Vec<Spanned>, max_depth: usize) -> Result<Vec<Expr>, CompileError> {
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
        max_depth,
    };
    let body = parser.body()?;
    match parser.peek() {
        Token::Eof => Ok(body),
        other => Err(parser.error(format!("unexpected {}", other.describe()))),
    }
}

static EOF: Token = Token::Eof;

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.cursor + offset)
            .or_else(|| self.tokens.last())
            .map_or(&EOF, |s| &s.token)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map_or(Pos { line: 1, column: 1 }, |s| s.pos)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(self.pos(), message)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {}, found {}",
                expected.describe(),
                self.peek().describe()
            )))
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Token::Newline {
            self.advance();
        }
    }

    /// Consume a binary operator and any line breaks that follow it.
    fn operator(&mut self) {
        self.advance();
        self.skip_newlines();
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(self.error(format!("nesting too deep (limit {})", self.max_depth)));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Undo the `enter` calls made while folding an operator chain.
    fn unfold(&mut self, folded: usize) {
        self.depth -= folded;
    }

    /// Statements up to a block terminator (`end`, `else`, `elsif`, EOF).
    fn body(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(
                self.peek(),
                Token::Eof | Token::End | Token::Else | Token::Elsif | Token::RParen
            ) {
                return Ok(statements);
            }
            statements.push(self.expression()?);
            match self.peek() {
                Token::Newline => {}
                Token::Eof | Token::End | Token::Else | Token::Elsif | Token::RParen => {}
                other => return Err(self.error(format!("unexpected {}", other.describe()))),
            }
        }
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let expr = self.assignment();
        self.leave();
        expr
    }

    fn assignment(&mut self) -> Result<Expr, CompileError> {
        if *self.peek_at(1) == Token::Assign
            && let Token::Ident(name) = self.peek().clone()
        {
            let pos = self.pos();
            self.advance();
            self.operator();
            let value = self.expression()?;
            return Ok(Expr::Assign {
                name,
                value: Box::new(value),
                pos,
            });
        }
        self.or()
    }

    fn or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and()?;
        let mut folded = 0;
        while *self.peek() == Token::OrOr {
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.unfold(folded);
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.equality()?;
        let mut folded = 0;
        while *self.peek() == Token::AndAnd {
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.unfold(folded);
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.comparison()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => {
                    self.unfold(folded);
                    return Ok(lhs);
                }
            };
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.additive()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => {
                    self.unfold(folded);
                    return Ok(lhs);
                }
            };
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.term()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => {
                    self.unfold(folded);
                    return Ok(lhs);
                }
            };
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.unary()?;
        let mut folded = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => {
                    self.unfold(folded);
                    return Ok(lhs);
                }
            };
            self.enter()?;
            folded += 1;
            self.operator();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let expr = match self.peek() {
            Token::Minus => {
                self.advance();
                match self.unary()? {
                    Expr::Int(n) => Expr::Int(-n),
                    Expr::Float(x) => Expr::Float(-x),
                    other => Expr::Neg(Box::new(other)),
                }
            }
            Token::Bang => {
                self.advance();
                Expr::Not(Box::new(self.unary()?))
            }
            _ => self.primary()?,
        };
        self.leave();
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Token::Nil => Ok(Expr::Nil),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Int(n) => Ok(Expr::Int(n)),
            Token::Float(x) => Ok(Expr::Float(x)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::Suspend => Ok(Expr::Suspend),
            Token::Constant(name) if name == "Task" => {
                self.expect(&Token::Dot)?;
                self.expect(&Token::Ident("current".to_string()))?;
                self.expect(&Token::Dot)?;
                self.expect(&Token::Suspend)?;
                Ok(Expr::Suspend)
            }
            Token::Constant(name) => {
                Err(self.error(format!("uninitialized constant {name}")))
            }
            Token::LParen => {
                let mut body = self.body()?;
                self.expect(&Token::RParen)?;
                Ok(match body.len() {
                    0 => Expr::Nil,
                    1 => body.remove(0),
                    // `(a; b)` evaluates to its last statement.
                    _ => Expr::If {
                        cond: Box::new(Expr::Bool(true)),
                        then_body: body,
                        else_body: None,
                    },
                })
            }
            Token::If => self.if_expr(),
            Token::While => self.while_expr(),
            Token::Raise => self.raise_expr(),
            other => Err(CompileError::at(
                self.previous_pos(),
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn previous_pos(&self) -> Pos {
        self.tokens
            .get(self.cursor.saturating_sub(1))
            .map_or(Pos { line: 1, column: 1 }, |s| s.pos)
    }

    /// Consume the separator between a condition and its body.
    fn clause_separator(&mut self, keyword: &Token) -> Result<(), CompileError> {
        match self.peek() {
            Token::Newline => {
                self.skip_newlines();
                Ok(())
            }
            t if t == keyword => {
                self.advance();
                Ok(())
            }
            other => Err(self.error(format!(
                "expected {} or end of line, found {}",
                keyword.describe(),
                other.describe()
            ))),
        }
    }

    fn if_expr(&mut self) -> Result<Expr, CompileError> {
        let cond = self.expression()?;
        self.clause_separator(&Token::Then)?;
        let then_body = self.body()?;
        let else_body = match self.advance() {
            Token::End => None,
            Token::Else => {
                let body = self.body()?;
                self.expect(&Token::End)?;
                Some(body)
            }
            Token::Elsif => {
                self.enter()?;
                let nested = self.if_expr()?;
                self.leave();
                Some(vec![nested])
            }
            other => {
                return Err(CompileError::at(
                    self.previous_pos(),
                    format!("expected 'end' to close 'if', found {}", other.describe()),
                ));
            }
        };
        Ok(Expr::If {
            cond: Box::new(cond),
            then_body,
            else_body,
        })
    }

    fn while_expr(&mut self) -> Result<Expr, CompileError> {
        let cond = self.expression()?;
        self.clause_separator(&Token::Do)?;
        let body = self.body()?;
        self.expect(&Token::End)?;
        Ok(Expr::While {
            cond: Box::new(cond),
            body,
        })
    }

    fn raise_expr(&mut self) -> Result<Expr, CompileError> {
        let class = if let Token::Constant(name) = self.peek().clone() {
            self.advance();
            Some(name)
        } else {
            None
        };

        let has_message = if class.is_some() {
            if *self.peek() == Token::Comma {
                self.operator();
                true
            } else {
                false
            }
        } else {
            !matches!(
                self.peek(),
                Token::Newline | Token::Eof | Token::End | Token::Else | Token::Elsif | Token::RParen
            )
        };

        let message = if has_message {
            Some(Box::new(self.expression()?))
        } else {
            None
        };
        Ok(Expr::Raise { class, message })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_str(source: &str) -> Result<Vec<Expr>, CompileError> {
        parse(tokenize(source)?, 64)
    }

    #[test]
    fn test_precedence() {
        let body = parse_str("1 + 2 * 3").expect("parse");
        assert_eq!(
            body,
            vec![Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Int(2)),
                    Box::new(Expr::Int(3))
                ))
            )]
        );
    }

    #[test]
    fn test_operator_continues_across_newline() {
        let body = parse_str("1 +\n 2").expect("parse");
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_raise_forms() {
        let body = parse_str("raise\nraise \"boom\"\nraise ArgumentError, \"bad\"").expect("parse");
        assert_eq!(
            body[0],
            Expr::Raise {
                class: None,
                message: None
            }
        );
        assert_eq!(
            body[1],
            Expr::Raise {
                class: None,
                message: Some(Box::new(Expr::Str("boom".into())))
            }
        );
        assert_eq!(
            body[2],
            Expr::Raise {
                class: Some("ArgumentError".into()),
                message: Some(Box::new(Expr::Str("bad".into())))
            }
        );
    }

    #[test]
    fn test_placeholder_parses_to_suspend() {
        assert_eq!(parse_str("Task.current.suspend").expect("parse"), vec![Expr::Suspend]);
    }

    #[test]
    fn test_if_elsif_else() {
        let body = parse_str("if a then 1 elsif b then 2 else 3 end").expect("parse");
        let Expr::If { else_body, .. } = &body[0] else {
            panic!("expected if");
        };
        let nested = else_body.as_ref().expect("elsif branch");
        assert!(matches!(nested[0], Expr::If { else_body: Some(_), .. }));
    }

    #[test]
    fn test_unclosed_block_is_an_error() {
        let err = parse_str("while true\n  x = 1\n").expect_err("should fail");
        assert!(err.message.contains("expected end"), "{}", err.message);
    }

    #[test]
    fn test_dangling_operator_is_an_error() {
        assert!(parse_str("40 +").is_err());
        assert!(parse_str("1 2").is_err());
        assert!(parse_str(")").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let source = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        let err = parse_str(&source).expect_err("should hit depth limit");
        assert!(err.message.contains("nesting too deep"));
    }

    #[test]
    fn test_operator_chains_count_toward_depth() {
        for op in ["+", "*", "<", "==", "&&", "||"] {
            let source = format!("1{}", format!(" {op} 1").repeat(1_000));
            let err = parse_str(&source).expect_err("should hit depth limit");
            assert!(err.message.contains("nesting too deep"), "{op}: {}", err.message);
        }
        assert!(parse_str(&format!("1{}", " + 1".repeat(30))).is_ok());
    }

    #[test]
    fn test_elsif_chain_counts_toward_depth() {
        let source = format!("if a then 1\n{}end", "elsif a then 1\n".repeat(1_000));
        let err = parse_str(&source).expect_err("should hit depth limit");
        assert!(err.message.contains("nesting too deep"));
        assert!(parse_str(&format!("if a then 1\n{}end", "elsif a then 1\n".repeat(20))).is_ok());
    }

    #[test]
    fn test_depth_is_restored_between_statements() {
        let line = format!("1{}\n", " + 1".repeat(30));
        assert!(parse_str(&line.repeat(100)).is_ok());
    }

    #[test]
    fn test_assignment_records_position() {
        let body = parse_str("\n  total = 1").expect("parse");
        let Expr::Assign { name, pos, .. } = &body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(name, "total");
        assert_eq!(*pos, Pos { line: 2, column: 3 });
    }
}
