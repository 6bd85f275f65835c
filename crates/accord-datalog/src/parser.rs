//! Parser for the rule language.
//!
//! Grammar:
//!
//! ```text
//! rule     := head [":-" literal ("," literal)*] ["."]
//! head     := "execute" "[" ident ":" ident args "]" | ident args
//! literal  := ["not"] ident [":" ident] args
//! args     := "(" [arg ("," arg)*] ")"
//! arg      := term | ident "=" term
//! term     := ident | string | integer | "None" | "_"
//! ```
//!
//! Named arguments (`alarms(name=n)`) follow the positional ones and refer
//! to columns of the table's schema.
//!
//! Identifiers may contain interior dots (`alarms.metrics`, `servers.set_meta`).
//! Bare identifiers in argument position are variables.

use crate::ast::{Atom, Head, Literal, Rule, TableRef, Term};
use crate::error::DatalogError;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    ColonDash,
    Dot,
    Eq,
    Eof,
}

#[derive(Debug, Clone)]
struct SpannedToken {
    token: Token,
    offset: usize,
}

fn error(offset: usize, message: impl Into<String>) -> DatalogError {
    DatalogError::Parse {
        offset,
        message: message.into(),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(source: &str) -> Result<Vec<SpannedToken>, DatalogError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '=' => Token::Eq,
            ':' if next == Some('-') => {
                i += 1;
                Token::ColonDash
            }
            ':' => Token::Colon,
            '"' => {
                let mut text = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    match chars[i].1 {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars
                                .get(i + 1)
                                .map(|(_, c)| *c)
                                .ok_or_else(|| error(chars[i].0, "dangling escape"))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        other => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(error(offset, "unterminated string"));
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| error(offset, format!("integer out of range: {}", text)))?;
                tokens.push(SpannedToken {
                    token: Token::Int(value),
                    offset,
                });
                continue;
            }
            c if is_ident_start(c) => {
                let start = i;
                i += 1;
                loop {
                    match chars.get(i).map(|(_, c)| *c) {
                        Some(c) if is_ident_char(c) => i += 1,
                        // Interior dot: only when an identifier character follows.
                        Some('.') if chars.get(i + 1).is_some_and(|(_, c)| is_ident_char(*c)) => {
                            i += 1
                        }
                        _ => break,
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push(SpannedToken {
                    token: Token::Ident(text),
                    offset,
                });
                continue;
            }
            other => return Err(error(offset, format!("unexpected character `{}`", other))),
        };

        tokens.push(SpannedToken { token, offset });
        i += 1;
    }

    tokens.push(SpannedToken {
        token: Token::Eof,
        offset: source.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    current: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.current)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.current + ahead)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.current < self.tokens.len() {
            self.current += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), DatalogError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(error(
                self.offset(),
                format!("expected {}, found {:?}", what, self.peek()),
            ))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, DatalogError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(error(
                self.offset(),
                format!("expected {}, found {:?}", what, other),
            )),
        }
    }

    fn rule(&mut self) -> Result<Rule, DatalogError> {
        let head = self.head()?;
        let mut body = Vec::new();

        if *self.peek() == Token::ColonDash {
            self.advance();
            body.push(self.literal()?);
            while *self.peek() == Token::Comma {
                self.advance();
                body.push(self.literal()?);
            }
        }

        if *self.peek() == Token::Dot {
            self.advance();
        }
        if *self.peek() != Token::Eof {
            return Err(error(
                self.offset(),
                format!("unexpected trailing input {:?}", self.peek()),
            ));
        }

        Ok(Rule { head, body })
    }

    fn head(&mut self) -> Result<Head, DatalogError> {
        if matches!(self.peek(), Token::Ident(name) if name == "execute")
            && *self.peek_at(1) == Token::LBracket
        {
            self.advance();
            self.advance();
            let service = self.ident("service name")?;
            self.expect(Token::Colon, "`:` between service and action")?;
            let action = self.ident("action name")?;
            let offset = self.offset();
            let (args, named) = self.args()?;
            if !named.is_empty() {
                return Err(error(offset, "named arguments are not allowed in a rule head"));
            }
            self.expect(Token::RBracket, "`]`")?;
            return Ok(Head::Execute {
                service,
                action,
                args,
            });
        }

        let offset = self.offset();
        let atom = self.atom()?;
        if atom.table.owner.is_some() {
            return Err(error(offset, "rule head cannot be qualified"));
        }
        if !atom.named.is_empty() {
            return Err(error(offset, "named arguments are not allowed in a rule head"));
        }
        Ok(Head::Atom(atom))
    }

    fn literal(&mut self) -> Result<Literal, DatalogError> {
        let negated = matches!(self.peek(), Token::Ident(name) if name == "not")
            && matches!(self.peek_at(1), Token::Ident(_));
        if negated {
            self.advance();
        }
        let atom = self.atom()?;
        Ok(Literal { atom, negated })
    }

    fn atom(&mut self) -> Result<Atom, DatalogError> {
        let first = self.ident("predicate name")?;
        let table = if *self.peek() == Token::Colon {
            self.advance();
            let name = self.ident("table name after `:`")?;
            TableRef::qualified(first, name)
        } else {
            TableRef::local(first)
        };
        let (args, named) = self.args()?;
        Ok(Atom { table, args, named })
    }

    fn args(&mut self) -> Result<(Vec<Term>, Vec<(String, Term)>), DatalogError> {
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        let mut named = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok((args, named));
        }
        loop {
            if matches!(self.peek(), Token::Ident(_)) && *self.peek_at(1) == Token::Eq {
                let column = self.ident("column name")?;
                self.advance();
                named.push((column, self.term()?));
            } else if named.is_empty() {
                args.push(self.term()?);
            } else {
                return Err(error(
                    self.offset(),
                    "positional argument after named argument",
                ));
            }
            match self.advance() {
                Token::Comma => continue,
                Token::RParen => break,
                other => {
                    return Err(error(
                        self.offset(),
                        format!("expected `,` or `)`, found {:?}", other),
                    ));
                }
            }
        }
        Ok((args, named))
    }

    fn term(&mut self) -> Result<Term, DatalogError> {
        let offset = self.offset();
        match self.advance() {
            Token::Ident(name) if name == "_" => Ok(Term::Wildcard),
            Token::Ident(name) if name == "None" => Ok(Term::Const(Value::Null)),
            Token::Ident(name) => Ok(Term::Var(name)),
            Token::Str(s) => Ok(Term::Const(Value::Str(s))),
            Token::Int(i) => Ok(Term::Const(Value::Int(i))),
            other => Err(error(offset, format!("expected a term, found {:?}", other))),
        }
    }
}

/// Parse a single rule or fact.
pub fn parse_rule(text: &str) -> Result<Rule, DatalogError> {
    let tokens = tokenize(text)?;
    if tokens.len() == 1 {
        return Err(error(0, "empty rule"));
    }
    Parser { tokens, current: 0 }.rule()
}

/// Parse a rules file: one rule per statement, `//` and `#` comment lines
/// ignored. A statement continues onto the next line when its line ends with
/// `,` or `:-`.
pub fn parse_rules(text: &str) -> Result<Vec<(String, Rule)>, DatalogError> {
    let mut statements = Vec::new();
    let mut pending = String::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
            continue;
        }
        if !pending.is_empty() {
            pending.push(' ');
        }
        pending.push_str(line);
        if !(line.ends_with(',') || line.ends_with(":-")) {
            statements.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        statements.push(pending);
    }

    statements
        .into_iter()
        .map(|stmt| parse_rule(&stmt).map(|rule| (stmt, rule)))
        .collect()
}
