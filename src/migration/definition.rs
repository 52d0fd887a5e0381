//! `CREATE FUNCTION` / `CREATE PROCEDURE` header grammar
//!
//! Only the header is parsed: name, parameter list and `RETURNS` clause. The
//! body is never looked at. Two strings come out of a header:
//!
//! - the *definition*, `name (IN a int, b text DEFAULT 'x') RETURNS json`,
//!   compared between runs to detect a signature change;
//! - the *signature*, `name (int, text)`, with `OUT` parameters and directions
//!   removed, which is what `DROP FUNCTION` needs.
//!
//! Whitespace is collapsed in both so that reformatting a header does not count
//! as a change.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static ROUTINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcreate\s+(?:or\s+replace\s+)?(?:function|procedure)\b").expect("valid regex")
});

static OR_REPLACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcreate\s+or\s+replace\s+(?:function|procedure)\b").expect("valid regex")
});

/// Words that end a `RETURNS` type.
const RETURNS_STOP_WORDS: &[&str] = &[
    "AS", "BEGIN", "CALLED", "COST", "EXTERNAL", "IMMUTABLE", "LANGUAGE", "LEAKPROOF", "NOT",
    "PARALLEL", "RETURN", "RETURNS", "ROWS", "SECURITY", "SET", "STABLE", "STRICT", "SUPPORT",
    "TRANSFORM", "VOLATILE", "WINDOW",
];

/// First words of types spelled with several words (`double precision`,
/// `timestamp with time zone`, ...).
const MULTI_WORD_TYPES: &[&str] = &[
    "bit", "character", "double", "interval", "national", "time", "timestamp",
];

/// Words that can follow the first word of a multi-word type. When one comes
/// second, the first word is the start of the type, not a parameter name.
const TYPE_CONTINUATIONS: &[&str] = &[
    "char", "character", "day", "hour", "minute", "month", "precision", "second", "to", "varying",
    "with", "without", "year", "zone",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionError(String);

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DefinitionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineKind {
    Function,
    Procedure,
}

impl RoutineKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            RoutineKind::Function => "FUNCTION",
            RoutineKind::Procedure => "PROCEDURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    In,
    Out,
    InOut,
    Variadic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub mode: Option<ParameterMode>,
    pub name: Option<String>,
    pub data_type: String,
    pub default: Option<String>,
    /// The whole declaration, whitespace collapsed
    pub declaration: String,
}

impl Parameter {
    /// Whether the parameter is part of the identity used by `DROP`.
    pub fn is_input(&self) -> bool {
        self.mode != Some(ParameterMode::Out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHeader {
    pub kind: RoutineKind,
    pub or_replace: bool,
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub returns: Option<String>,
}

impl FunctionHeader {
    /// `name (declarations) RETURNS type`
    pub fn definition(&self) -> String {
        let declarations = self
            .parameters
            .iter()
            .map(|p| p.declaration.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        match &self.returns {
            Some(returns) => format!("{} ({}) RETURNS {}", self.name, declarations, returns),
            None => format!("{} ({})", self.name, declarations),
        }
    }

    /// `name (types)` of the non-`OUT` parameters
    pub fn signature(&self) -> String {
        let types = self
            .parameters
            .iter()
            .filter(|p| p.is_input())
            .map(|p| p.data_type.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} ({})", self.name, types)
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP {} IF EXISTS {};", self.kind.keyword(), self.signature())
    }
}

/// Number of `CREATE [OR REPLACE] FUNCTION|PROCEDURE` statements outside
/// comments, string literals and dollar-quoted bodies.
pub fn count_routines(content: &str) -> usize {
    ROUTINE.find_iter(&mask_literals(&strip_comments(content))).count()
}

/// Whether the routine is declared with `OR REPLACE`.
pub fn has_or_replace(content: &str) -> bool {
    OR_REPLACE.is_match(&mask_literals(&strip_comments(content)))
}

/// Parse the first routine header of `content`.
pub fn parse_header(content: &str) -> Result<FunctionHeader, DefinitionError> {
    let stripped = strip_comments(content);
    let start = ROUTINE
        .find(&stripped)
        .ok_or_else(|| DefinitionError("no CREATE FUNCTION or CREATE PROCEDURE statement".to_string()))?
        .start();

    let (rest, (or_replace, kind, name, raw_parameters)) = header(&stripped[start..])
        .map_err(|e| DefinitionError(format!("invalid routine header: {e}")))?;

    let parameters = if raw_parameters.trim().is_empty() {
        Vec::new()
    } else {
        split_top_level(raw_parameters, ',')
            .into_iter()
            .map(parse_parameter)
            .collect::<Result<Vec<_>, _>>()?
    };

    let returns = match returns_clause(rest) {
        Ok((_, returns)) => returns,
        Err(e) => return Err(DefinitionError(format!("invalid RETURNS clause: {e}"))),
    };

    Ok(FunctionHeader {
        kind,
        or_replace,
        name: normalize(name),
        parameters,
        returns,
    })
}

fn header(input: &str) -> IResult<&str, (bool, RoutineKind, &str, &str)> {
    let (input, _) = tag_no_case("create")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, or_replace) = opt(tuple((
        tag_no_case("or"),
        multispace1,
        tag_no_case("replace"),
        multispace1,
    )))(input)?;
    let (input, kind) = routine_kind(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = qualified_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('(')(input)?;
    let (input, parameters) = balanced(input)?;
    Ok((input, (or_replace.is_some(), kind, name, parameters)))
}

fn routine_kind(input: &str) -> IResult<&str, RoutineKind> {
    alt((
        value(RoutineKind::Function, tag_no_case("function")),
        value(RoutineKind::Procedure, tag_no_case("procedure")),
    ))(input)
}

fn bare_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '$'),
    ))(input)
}

fn quoted_identifier(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('"'),
        many0(alt((tag("\"\""), is_not("\"")))),
        char('"'),
    ))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    alt((quoted_identifier, bare_identifier))(input)
}

/// `schema.name`, `"Quoted"."Name"`, `name`
fn qualified_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(identifier, many0(preceded(char('.'), identifier))))(input)
}

/// Content up to the `)` matching an already consumed `(`.
fn balanced(input: &str) -> IResult<&str, &str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' if depth == 0 => return Ok((&input[i + 1..], &input[..i])),
            ')' => depth -= 1,
            _ => {}
        }
    }
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

fn returns_clause(input: &str) -> IResult<&str, Option<String>> {
    opt(preceded(
        tuple((multispace0, tag_no_case("returns"), multispace1)),
        return_type,
    ))(input)
}

fn type_word(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || "_.$%[]\"".contains(c))(input)
}

/// Words (and parenthesized groups) up to the first routine attribute.
fn return_type(input: &str) -> IResult<&str, String> {
    let mut rest = input;
    let mut out = String::new();
    loop {
        let trimmed = rest.trim_start();
        if let Some(group) = trimmed.strip_prefix('(') {
            let (after, inner) = balanced(group)?;
            out.push('(');
            out.push_str(&normalize(inner));
            out.push(')');
            rest = after;
            continue;
        }
        let Ok((after, word)) = type_word(trimmed) else {
            break;
        };
        if RETURNS_STOP_WORDS.contains(&word.to_ascii_uppercase().as_str()) {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
        rest = after;
    }
    if out.is_empty() {
        return Err(nom::Err::Error(NomError::new(input, ErrorKind::TakeWhile1)));
    }
    Ok((rest, out))
}

fn parameter_mode(input: &str) -> IResult<&str, ParameterMode> {
    alt((
        value(ParameterMode::InOut, tag_no_case("inout")),
        value(ParameterMode::In, tag_no_case("in")),
        value(ParameterMode::Out, tag_no_case("out")),
        value(ParameterMode::Variadic, tag_no_case("variadic")),
    ))(input)
}

fn parse_parameter(raw: &str) -> Result<Parameter, DefinitionError> {
    let declaration = normalize(raw);
    if declaration.is_empty() {
        return Err(DefinitionError("empty parameter declaration".to_string()));
    }

    let (rest, mode) = opt(terminated(parameter_mode, multispace1))(declaration.as_str())
        .map_err(|e: nom::Err<NomError<&str>>| DefinitionError(format!("invalid parameter {declaration}: {e}")))?;

    let (head, default) = split_default(rest);
    let head = head.trim();
    if head.is_empty() {
        return Err(DefinitionError(format!("parameter without type: {declaration}")));
    }

    let (name, data_type) = split_name(head);
    // `argname argmode argtype`
    let (mode, data_type) = match (mode, name) {
        (None, Some(_)) => match terminated(parameter_mode, multispace1)(data_type) {
            Ok((data_type, mode)) => (Some(mode), data_type),
            Err(_) => (None, data_type),
        },
        _ => (mode, data_type),
    };
    Ok(Parameter {
        mode,
        name: name.map(str::to_string),
        data_type: data_type.to_string(),
        default: default.map(|d| d.trim().to_string()),
        declaration: declaration.clone(),
    })
}

/// `x int DEFAULT 1` / `x int = 1` → (`x int`, `1`)
fn split_default(input: &str) -> (&str, Option<&str>) {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'=' if depth == 0 => return (&input[..i], Some(&input[i + 1..])),
            b' ' if depth == 0 => {
                let tail = &input[i + 1..];
                if tail.len() >= 7
                    && tail.is_char_boundary(7)
                    && tail[..7].eq_ignore_ascii_case("default")
                    && tail[7..].starts_with(' ')
                {
                    return (&input[..i], Some(&tail[8..]));
                }
            }
            _ => {}
        }
    }
    (input, None)
}

/// `x double precision` → (`x`, `double precision`); `double precision` → (none, ..);
/// `time timestamp` → (`time`, `timestamp`)
fn split_name(head: &str) -> (Option<&str>, &str) {
    let Some((first, rest)) = head.split_once(' ') else {
        return (None, head);
    };
    let rest = rest.trim();
    if !identifier(first).is_ok_and(|(after, _)| after.is_empty()) {
        return (None, head);
    }

    let starts_multi_word_type = MULTI_WORD_TYPES
        .iter()
        .any(|t| first.eq_ignore_ascii_case(t));
    let second = rest.split(&[' ', '('][..]).next().unwrap_or(rest);
    let continues_type = TYPE_CONTINUATIONS
        .iter()
        .any(|w| second.eq_ignore_ascii_case(w));
    if starts_multi_word_type && continues_type {
        return (None, head);
    }
    (Some(first), rest)
}

fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn normalize(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace the content of `'...'` literals and `$tag$...$tag$` bodies, so only
/// statement text is left.
fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            let end = rest[1..].find('\'').map_or(rest.len(), |i| i + 2);
            out.push_str("''");
            rest = &rest[end..];
            continue;
        }
        if let Some(tag) = dollar_tag(rest) {
            let body = &rest[tag.len()..];
            let end = body
                .find(tag)
                .map_or(rest.len(), |i| tag.len() + i + tag.len());
            out.push_str("$$");
            rest = &rest[end..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// `$$` or `$tag$` opening `input`; `$1` parameter references are not tags.
fn dollar_tag(input: &str) -> Option<&str> {
    let inner = input.strip_prefix('$')?;
    let len = inner.find('$')?;
    let tag = &inner[..len];
    let valid = tag.chars().next().map_or(true, |c| c.is_alphabetic() || c == '_')
        && tag.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(&input[..len + 2])
}

/// Remove `--` and `/* */` comments outside quoted text.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                while chars.peek().is_some_and(|n| *n != '\n') {
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for n in chars.by_ref() {
                    if previous == '*' && n == '/' {
                        break;
                    }
                    previous = n;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}
