//! Parser for the `SELECT` subset of CQL served by the in-memory node.
//!
//! Grammar:
//!
//! ```text
//! SELECT ( '*' | NULL | ident { ',' ident } ) FROM ident
//!     [ WHERE ident '=' literal { AND ident '=' literal } ] [ ';' ]
//! ```

use uuid::Uuid;

use crate::driver::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SelectItems {
    All,
    Null,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Uuid(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub column: String,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectQuery {
    pub items: SelectItems,
    pub table: String,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    QuotedIdent(String),
    Str(String),
    Comma,
    Equals,
    Star,
    Semicolon,
}

pub(crate) fn parse_select(text: &str) -> Result<SelectQuery, DriverError> {
    let tokens = tokenize(text)?;
    Parser { tokens, pos: 0 }.select()
}

fn syntax(message: impl AsRef<str>) -> DriverError {
    DriverError::Syntax(format!("line 1: {}", message.as_ref()))
}

fn tokenize(text: &str) -> Result<Vec<Token>, DriverError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '\'' | '"' => {
                let quote = ch;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => {
                            // A doubled quote is an escaped quote.
                            if chars.peek() == Some(&quote) {
                                chars.next();
                                value.push(quote);
                            } else {
                                break;
                            }
                        }
                        Some(c) => value.push(c),
                        None => return Err(syntax("unterminated quoted token")),
                    }
                }
                tokens.push(if quote == '\'' {
                    Token::Str(value)
                } else {
                    Token::QuotedIdent(value)
                });
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            other => return Err(syntax(format!("no viable alternative at character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn select(mut self) -> Result<SelectQuery, DriverError> {
        self.expect_keyword("SELECT")?;
        let items = self.select_items()?;
        self.expect_keyword("FROM")?;
        let table = self.table_name()?;

        let mut conditions = Vec::new();
        if self.peek_keyword("WHERE") {
            self.pos += 1;
            loop {
                conditions.push(self.condition()?);
                if !self.peek_keyword("AND") {
                    break;
                }
                self.pos += 1;
            }
        }
        if self.peek() == Some(&Token::Semicolon) {
            self.pos += 1;
        }
        if let Some(token) = self.peek() {
            return Err(syntax(format!("extraneous input {token:?}")));
        }
        Ok(SelectQuery {
            items,
            table,
            conditions,
        })
    }

    fn select_items(&mut self) -> Result<SelectItems, DriverError> {
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            return Ok(SelectItems::All);
        }
        if self.peek_keyword("NULL") {
            self.pos += 1;
            return Ok(SelectItems::Null);
        }
        let mut columns = vec![self.identifier()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            columns.push(self.identifier()?);
        }
        Ok(SelectItems::Columns(columns))
    }

    fn condition(&mut self) -> Result<Condition, DriverError> {
        let column = self.identifier()?;
        match self.advance() {
            Some(Token::Equals) => {}
            other => return Err(syntax(format!("expected '=' but found {other:?}"))),
        }
        let value = self.literal()?;
        Ok(Condition { column, value })
    }

    fn literal(&mut self) -> Result<Literal, DriverError> {
        match self.advance() {
            Some(Token::Str(value)) => Ok(Literal::Text(value)),
            Some(Token::Word(word)) => classify_word(&word),
            other => Err(syntax(format!("expected a literal but found {other:?}"))),
        }
    }

    fn identifier(&mut self) -> Result<String, DriverError> {
        match self.advance() {
            // Unquoted identifiers are case-insensitive.
            Some(Token::Word(word)) if is_identifier(&word) => Ok(word.to_ascii_lowercase()),
            Some(Token::QuotedIdent(name)) => Ok(name),
            other => Err(syntax(format!("expected an identifier but found {other:?}"))),
        }
    }

    fn table_name(&mut self) -> Result<String, DriverError> {
        match self.advance() {
            Some(Token::Word(word)) if word.split('.').all(is_identifier) => {
                Ok(word.to_ascii_lowercase())
            }
            Some(Token::QuotedIdent(name)) => Ok(name),
            other => Err(syntax(format!("expected a table name but found {other:?}"))),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), DriverError> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(format!(
                "expected {keyword} but found {:?}",
                self.peek()
            )))
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn classify_word(word: &str) -> Result<Literal, DriverError> {
    if word.eq_ignore_ascii_case("null") {
        return Ok(Literal::Null);
    }
    if word.eq_ignore_ascii_case("true") {
        return Ok(Literal::Boolean(true));
    }
    if word.eq_ignore_ascii_case("false") {
        return Ok(Literal::Boolean(false));
    }
    if let Ok(value) = word.parse::<i64>() {
        return Ok(Literal::Integer(value));
    }
    if word.len() == 36 {
        if let Ok(value) = Uuid::parse_str(word) {
            return Ok(Literal::Uuid(value));
        }
    }
    if word.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(value) = word.parse::<f64>() {
            return Ok(Literal::Float(value));
        }
    }
    Err(syntax(format!("invalid literal {word}")))
}
