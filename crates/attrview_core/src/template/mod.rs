//! Restricted template evaluator for template columns.
//!
//! # Responsibility
//! - Replace each `.action{ ... }` block of a template source with the value
//!   of its pipeline, evaluated against a typed row context.
//!
//! # Invariants
//! - Only allow-listed functions can be called; anything else is an error.
//! - Unknown variables evaluate to empty text.
//! - Evaluation has no side effects and no I/O.
//!
//! Pipeline syntax: `term (| func arg*)*`. A term is `.name` (or `."Two words"`
//! for names with spaces), a string or number literal, a parenthesized
//! pipeline, or `func arg*`. A piped value is
//! passed as the last argument of the next function.

use crate::model::key::trim_float;
use chrono::{DateTime, Local, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::iter::Peekable;
use std::str::Chars;

static ACTION_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.action\{").expect("action pattern is valid"));

const DATE_DISPLAY: &str = "%Y-%m-%d %H:%M";

/// Function allow-list.
pub const FUNCTIONS: &[&str] = &[
    "upper", "lower", "trim", "len", "default", "index", "concat", "replace", "add", "sub", "mul",
    "div", "mod", "date",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    pub message: String,
}

impl TemplateError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for TemplateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "template error: {}", self.message)
    }
}

impl Error for TemplateError {}

/// Typed value visible to templates.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateScalar {
    Number(f64),
    Date(DateTime<Local>),
    Text(String),
}

impl TemplateScalar {
    pub fn display(&self) -> String {
        match self {
            Self::Number(value) => trim_float(*value),
            Self::Date(value) => value.format(DATE_DISPLAY).to_string(),
            Self::Text(value) => value.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Text(value) if value.is_empty())
    }

    fn as_number(&self) -> Result<f64, TemplateError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Date(value) => Ok(value.timestamp_millis() as f64),
            Self::Text(value) if value.trim().is_empty() => Ok(0.0),
            Self::Text(value) => value
                .trim()
                .parse::<f64>()
                .map_err(|_| TemplateError::new(format!("`{value}` is not a number"))),
        }
    }
}

/// Row data a template is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub id: String,
    pub created: Option<DateTime<Local>>,
    pub updated: Option<DateTime<Local>>,
    /// Backing block attributes.
    pub attrs: BTreeMap<String, String>,
    /// Other columns of the row by column name.
    pub columns: BTreeMap<String, TemplateScalar>,
}

impl TemplateContext {
    /// Builtins first, then columns, then block attributes.
    pub fn lookup(&self, name: &str) -> TemplateScalar {
        let date = |value: Option<DateTime<Local>>| {
            value
                .map(TemplateScalar::Date)
                .unwrap_or_else(|| TemplateScalar::Text(String::new()))
        };
        match name {
            "id" => TemplateScalar::Text(self.id.clone()),
            "created" => date(self.created),
            "updated" => date(self.updated),
            _ => self
                .columns
                .get(name)
                .cloned()
                .or_else(|| self.attrs.get(name).cloned().map(TemplateScalar::Text))
                .unwrap_or_else(|| TemplateScalar::Text(String::new())),
        }
    }
}

/// Renders `source`, replacing every action with its evaluated text.
///
/// Action bodies may span lines and may contain `}` inside string literals.
pub fn render_template(source: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    while let Some(open) = ACTION_OPEN_RE.find_at(source, last) {
        out.push_str(&source[last..open.start()]);
        let body_end = action_body_end(source, open.end())
            .ok_or_else(|| TemplateError::new("unterminated action"))?;
        out.push_str(&evaluate(&source[open.end()..body_end], ctx)?.display());
        last = body_end + 1;
    }
    out.push_str(&source[last..]);
    Ok(out)
}

/// Byte offset of the `}` closing an action body that starts at `start`.
fn action_body_end(source: &str, start: usize) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in source[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '}' => return Some(start + offset),
            _ => {}
        }
    }
    None
}

/// Evaluates one action body.
pub fn evaluate(body: &str, ctx: &TemplateContext) -> Result<TemplateScalar, TemplateError> {
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Ok(TemplateScalar::Text(String::new()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let pipeline = parser.pipeline()?;
    if parser.pos != parser.tokens.len() {
        return Err(TemplateError::new("unexpected `)`"));
    }
    eval_pipeline(&pipeline, ctx)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Ident(String),
    Str(String),
    Num(f64),
    Pipe,
    LParen,
    RParen,
}

fn tokenize(body: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                let name = if chars.peek() == Some(&'"') {
                    chars.next();
                    read_string(&mut chars)?
                } else {
                    take_while(&mut chars, |c| c.is_alphanumeric() || c == '_' || c == '-')
                };
                if name.is_empty() {
                    return Err(TemplateError::new("expected a field name after `.`"));
                }
                tokens.push(Token::Field(name));
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(read_string(&mut chars)?));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let literal = take_while(&mut chars, |c| c.is_ascii_digit() || c == '.' || c == '-');
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| TemplateError::new(format!("invalid number `{literal}`")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() => {
                let name = take_while(&mut chars, |c| c.is_alphanumeric() || c == '_');
                tokens.push(Token::Ident(name));
            }
            other => return Err(TemplateError::new(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

/// Reads a string literal body; the opening quote is already consumed.
fn read_string(chars: &mut Peekable<Chars<'_>>) -> Result<String, TemplateError> {
    let mut text = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(text),
            Some('\\') => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some(other) => text.push(other),
                None => return Err(TemplateError::new("unterminated string")),
            },
            Some(other) => text.push(other),
            None => return Err(TemplateError::new("unterminated string")),
        }
    }
}

fn take_while(
    chars: &mut Peekable<Chars<'_>>,
    accept: impl Fn(char) -> bool,
) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if !accept(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

#[derive(Debug, Clone)]
enum Term {
    Field(String),
    Literal(TemplateScalar),
    Ident(String),
    Group(Vec<Command>),
}

type Command = Vec<Term>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn pipeline(&mut self) -> Result<Vec<Command>, TemplateError> {
        let mut commands = vec![self.command()?];
        while self.tokens.get(self.pos) == Some(&Token::Pipe) {
            self.pos += 1;
            commands.push(self.command()?);
        }
        Ok(commands)
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        let mut terms = Vec::new();
        while let Some(token) = self.tokens.get(self.pos).cloned() {
            let term = match token {
                Token::Pipe | Token::RParen => break,
                Token::Field(name) => Term::Field(name),
                Token::Ident(name) => Term::Ident(name),
                Token::Str(text) => Term::Literal(TemplateScalar::Text(text)),
                Token::Num(value) => Term::Literal(TemplateScalar::Number(value)),
                Token::LParen => {
                    self.pos += 1;
                    let inner = self.pipeline()?;
                    if self.tokens.get(self.pos) != Some(&Token::RParen) {
                        return Err(TemplateError::new("missing `)`"));
                    }
                    Term::Group(inner)
                }
            };
            self.pos += 1;
            terms.push(term);
        }
        if terms.is_empty() {
            return Err(TemplateError::new("empty command"));
        }
        Ok(terms)
    }
}

fn eval_pipeline(
    pipeline: &[Command],
    ctx: &TemplateContext,
) -> Result<TemplateScalar, TemplateError> {
    let mut piped: Option<TemplateScalar> = None;
    for command in pipeline {
        piped = Some(eval_command(command, piped.take(), ctx)?);
    }
    Ok(piped.unwrap_or_else(|| TemplateScalar::Text(String::new())))
}

fn eval_command(
    command: &[Term],
    piped: Option<TemplateScalar>,
    ctx: &TemplateContext,
) -> Result<TemplateScalar, TemplateError> {
    match command {
        [Term::Ident(name), rest @ ..] => {
            let mut args = rest
                .iter()
                .map(|term| eval_term(term, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            args.extend(piped);
            call(name, args, ctx)
        }
        [term] if piped.is_none() => eval_term(term, ctx),
        [_] => Err(TemplateError::new("cannot pipe into a value")),
        _ => Err(TemplateError::new("a value cannot take arguments")),
    }
}

fn eval_term(term: &Term, ctx: &TemplateContext) -> Result<TemplateScalar, TemplateError> {
    match term {
        Term::Field(name) => Ok(ctx.lookup(name)),
        Term::Literal(value) => Ok(value.clone()),
        Term::Group(pipeline) => eval_pipeline(pipeline, ctx),
        Term::Ident(name) => Err(TemplateError::new(format!(
            "function `{name}` must start a command"
        ))),
    }
}

fn expect_args(name: &str, args: &[TemplateScalar], count: usize) -> Result<(), TemplateError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(TemplateError::new(format!(
            "`{name}` expects {count} argument(s), got {}",
            args.len()
        )))
    }
}

fn call(
    name: &str,
    args: Vec<TemplateScalar>,
    ctx: &TemplateContext,
) -> Result<TemplateScalar, TemplateError> {
    let text = |value: &TemplateScalar| value.display();
    match name {
        "upper" | "lower" | "trim" | "len" => {
            expect_args(name, &args, 1)?;
            let value = text(&args[0]);
            Ok(match name {
                "upper" => TemplateScalar::Text(value.to_uppercase()),
                "lower" => TemplateScalar::Text(value.to_lowercase()),
                "trim" => TemplateScalar::Text(value.trim().to_string()),
                _ => TemplateScalar::Number(value.chars().count() as f64),
            })
        }
        "default" => {
            expect_args(name, &args, 2)?;
            let mut args = args;
            let value = args.remove(1);
            Ok(if value.is_empty() {
                args.remove(0)
            } else {
                value
            })
        }
        "index" => {
            expect_args(name, &args, 1)?;
            Ok(ctx.lookup(&text(&args[0])))
        }
        "concat" => Ok(TemplateScalar::Text(args.iter().map(text).collect())),
        "replace" => {
            expect_args(name, &args, 3)?;
            Ok(TemplateScalar::Text(
                text(&args[2]).replace(&text(&args[0]), &text(&args[1])),
            ))
        }
        "add" | "sub" | "mul" | "div" | "mod" => {
            expect_args(name, &args, 2)?;
            let left = args[0].as_number()?;
            let right = args[1].as_number()?;
            let value = match name {
                "add" => left + right,
                "sub" => left - right,
                "mul" => left * right,
                "div" if right == 0.0 => return Err(TemplateError::new("division by zero")),
                "div" => left / right,
                _ if right == 0.0 => return Err(TemplateError::new("modulo by zero")),
                _ => left % right,
            };
            Ok(TemplateScalar::Number(value))
        }
        "date" => {
            expect_args(name, &args, 2)?;
            let layout = text(&args[0]);
            let moment = match &args[1] {
                TemplateScalar::Date(value) => *value,
                TemplateScalar::Number(millis) => Local
                    .timestamp_millis_opt(*millis as i64)
                    .single()
                    .ok_or_else(|| TemplateError::new("timestamp out of range"))?,
                TemplateScalar::Text(value) if value.is_empty() => {
                    return Ok(TemplateScalar::Text(String::new()))
                }
                TemplateScalar::Text(value) => {
                    return Err(TemplateError::new(format!("`{value}` is not a date")))
                }
            };
            let mut formatted = String::new();
            use std::fmt::Write;
            write!(formatted, "{}", moment.format(&layout))
                .map_err(|_| TemplateError::new(format!("invalid date layout `{layout}`")))?;
            Ok(TemplateScalar::Text(formatted))
        }
        other => Err(TemplateError::new(format!("unknown function `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::{render_template, TemplateContext, TemplateScalar};
    use chrono::{Local, TimeZone};

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext {
            id: "20240102030405-abcdefg".to_string(),
            created: Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single(),
            ..TemplateContext::default()
        };
        ctx.columns
            .insert("Name".to_string(), TemplateScalar::Text("Alice".to_string()));
        ctx.columns.insert("Price".to_string(), TemplateScalar::Number(10.0));
        ctx.columns.insert("Qty".to_string(), TemplateScalar::Number(3.0));
        ctx.attrs
            .insert("custom-note".to_string(), "hello".to_string());
        ctx
    }

    #[test]
    fn renders_fields_and_literal_text() {
        let out = render_template("Hi .action{.Name}!", &context()).unwrap();
        assert_eq!(out, "Hi Alice!");
    }

    #[test]
    fn pipelines_pass_value_last() {
        let ctx = context();
        assert_eq!(render_template(".action{.Name | upper}", &ctx).unwrap(), "ALICE");
        assert_eq!(
            render_template(".action{mul .Price .Qty}", &ctx).unwrap(),
            "30"
        );
        assert_eq!(
            render_template(".action{.Missing | default \"n/a\"}", &ctx).unwrap(),
            "n/a"
        );
        assert_eq!(
            render_template(".action{add 1 (mul .Price 2)}", &ctx).unwrap(),
            "21"
        );
    }

    #[test]
    fn builtins_and_attrs_resolve() {
        let ctx = context();
        assert_eq!(
            render_template(".action{date \"%Y/%m/%d\" .created}", &ctx).unwrap(),
            "2024/01/02"
        );
        assert_eq!(
            render_template(".action{index \"custom-note\"}", &ctx).unwrap(),
            "hello"
        );
        assert_eq!(render_template(".action{.nothing}", &ctx).unwrap(), "");
    }

    #[test]
    fn unknown_functions_and_bad_math_are_errors() {
        let ctx = context();
        assert!(render_template(".action{exec \"rm\"}", &ctx).is_err());
        assert!(render_template(".action{div .Price 0}", &ctx).is_err());
        assert!(render_template(".action{\"unterminated}", &ctx).is_err());
        assert!(render_template("tail .action{.Name", &ctx).is_err());
    }

    #[test]
    fn action_bodies_span_lines_and_quote_braces() {
        let ctx = context();
        let source = ".action{\n  .Missing\n  | default \"{}\"\n} and .action{.Name}";
        assert_eq!(render_template(source, &ctx).unwrap(), "{} and Alice");
    }

    #[test]
    fn quoted_and_dashed_field_names_resolve() {
        let mut ctx = context();
        ctx.columns.insert(
            "Tasks Links".to_string(),
            TemplateScalar::Text("T1".to_string()),
        );
        assert_eq!(render_template(".action{.\"Tasks Links\"}", &ctx).unwrap(), "T1");
        assert_eq!(render_template(".action{.custom-note}", &ctx).unwrap(), "hello");
    }
}
