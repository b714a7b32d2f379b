//! Tokenizer for script text.

use super::{CompileError, Pos};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Constant(String),
    If,
    Elsif,
    Else,
    Then,
    End,
    While,
    Do,
    True,
    False,
    Nil,
    Raise,
    Suspend,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
    Dot,
    Newline,
    Eof,
}

impl Token {
    /// Tokens after which a line break does not end the expression.
    pub(crate) fn continues_line(&self) -> bool {
        matches!(
            self,
            Self::Plus
                | Self::Minus
                | Self::Star
                | Self::Slash
                | Self::Percent
                | Self::EqEq
                | Self::NotEq
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::Assign
                | Self::AndAnd
                | Self::OrOr
                | Self::Comma
                | Self::Dot
                | Self::LParen
        )
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Int(n) => format!("integer {n}"),
            Self::Float(x) => format!("float {x}"),
            Self::Str(_) => "string literal".to_string(),
            Self::Ident(name) | Self::Constant(name) => format!("'{name}'"),
            Self::Newline => "end of line".to_string(),
            Self::Eof => "end of input".to_string(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: Pos,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    tokens: Vec<Spanned>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            tokens: Vec::new(),
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn push(&mut self, token: Token, pos: Pos) {
        // Collapse runs of separators.
        if token == Token::Newline
            && matches!(self.tokens.last(), None | Some(Spanned { token: Token::Newline, .. }))
        {
            return;
        }
        self.tokens.push(Spanned { token, pos });
    }

    fn run(mut self) -> Result<Vec<Spanned>, CompileError> {
        while let Some(&c) = self.chars.peek() {
            let pos = self.pos();
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\\' => {
                    // Explicit line continuation.
                    self.bump();
                    if !self.eat('\n') {
                        return Err(CompileError::at(pos, "unexpected '\\'"));
                    }
                }
                '\n' | ';' => {
                    self.bump();
                    self.push(Token::Newline, pos);
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '0'..='9' => {
                    let token = self.number(pos)?;
                    self.push(token, pos);
                }
                '"' | '\'' => {
                    let token = self.string(c, pos)?;
                    self.push(token, pos);
                }
                c if c == '_' || c.is_alphabetic() => {
                    let token = self.word();
                    self.push(token, pos);
                }
                _ => {
                    self.bump();
                    let token = match c {
                        '+' => Token::Plus,
                        '-' => Token::Minus,
                        '*' => Token::Star,
                        '/' => Token::Slash,
                        '%' => Token::Percent,
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        ',' => Token::Comma,
                        '.' => Token::Dot,
                        '=' if self.eat('=') => Token::EqEq,
                        '=' => Token::Assign,
                        '!' if self.eat('=') => Token::NotEq,
                        '!' => Token::Bang,
                        '<' if self.eat('=') => Token::Le,
                        '<' => Token::Lt,
                        '>' if self.eat('=') => Token::Ge,
                        '>' => Token::Gt,
                        '&' if self.eat('&') => Token::AndAnd,
                        '|' if self.eat('|') => Token::OrOr,
                        other => {
                            return Err(CompileError::at(
                                pos,
                                format!("unexpected character '{other}'"),
                            ));
                        }
                    };
                    self.push(token, pos);
                }
            }
        }
        let pos = self.pos();
        self.push(Token::Newline, pos);
        self.tokens.push(Spanned {
            token: Token::Eof,
            pos,
        });
        Ok(self.tokens)
    }

    fn number(&mut self, pos: Pos) -> Result<Token, CompileError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '_' {
                self.bump();
            } else if c == '.' && !is_float {
                // `1.foo` is a method call in Ruby; only `1.5` is a float.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if !lookahead.peek().is_some_and(char::is_ascii_digit) {
                    break;
                }
                is_float = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| CompileError::at(pos, format!("invalid float literal '{text}'")))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| CompileError::at(pos, format!("integer literal too large: {text}")))
        }
    }

    fn string(&mut self, quote: char, pos: Pos) -> Result<Token, CompileError> {
        self.bump();
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(CompileError::at(pos, "unterminated string literal"));
            };
            if c == quote {
                return Ok(Token::Str(out));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(escaped) = self.bump() else {
                return Err(CompileError::at(pos, "unterminated string literal"));
            };
            if quote == '\'' {
                // Single quotes only recognise \' and \\.
                if escaped != '\'' && escaped != '\\' {
                    out.push('\\');
                }
                out.push(escaped);
                continue;
            }
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                'e' => '\u{1b}',
                other => other,
            });
        }
    }

    fn word(&mut self) -> Token {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c == '_' || c.is_alphanumeric() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "if" => Token::If,
            "elsif" => Token::Elsif,
            "else" => Token::Else,
            "then" => Token::Then,
            "end" => Token::End,
            "while" => Token::While,
            "do" => Token::Do,
            "true" => Token::True,
            "false" => Token::False,
            "nil" => Token::Nil,
            "raise" => Token::Raise,
            "suspend" => Token::Suspend,
            _ if text.starts_with(char::is_uppercase) => Token::Constant(text),
            _ => Token::Ident(text),
        }
    }
}
