#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the sampler console.
//!
//! A bounded hand-written lexer produces a token stream with byte spans;
//! `winnow` combinators over those tokens build structured command values.
//! Everything is fixed capacity so the grammar runs unchanged on the
//! instrument console and in the host emulator.

use core::fmt;
use core::ops::Range;
use core::time::Duration;

use heapless::Vec as HeaplessVec;
use winnow::error::ParserError;
use winnow::prelude::*;

use crate::MAX_VALVES;

/// Maximum number of tokens per console line.
pub const MAX_TOKENS: usize = 32;

/// Lexical token kinds recognized by the console grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Duration literal ending in `ms` or `s`.
    Duration,
    /// Unsuffixed integer literal.
    Integer,
    /// Identifier or keyword (matched case-insensitively).
    Ident,
    /// Comma separator inside valve lists.
    Comma,
    /// Anything the lexer cannot classify.
    Error,
}

/// Token with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

/// Bounded token buffer.
pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

/// Lexer errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens { processed: usize },
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
        }
    }
}

/// Grammar errors emitted by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: Option<TokenKind>,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidInteger {
        span: Range<usize>,
    },
    InvalidDuration {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
    TooManyValves,
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found {found:?} at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::InvalidInteger { span } => {
                write!(f, "invalid integer literal at {span:?}")
            }
            GrammarErrorKind::InvalidDuration { span } => {
                write!(f, "invalid duration literal at {span:?}")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
            }
            GrammarErrorKind::TooManyValves => {
                write!(f, "valve list exceeds {MAX_VALVES} entries")
            }
        }
    }
}

/// Wrapper type giving consumers a single error surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    found: Some(tok.kind),
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_integer(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidInteger {
                span: token.span.clone(),
            },
        }
    }

    fn invalid_duration(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidDuration {
                span: token.span.clone(),
            },
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    type Inner = Self;

    fn from_input(input: &Input<'src, 'slice>) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn into_inner(self) -> Result<Self::Inner, Self> {
        Ok(self)
    }
}

/// Combined lex/parse error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// When a task should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// Absolute wall-clock seconds.
    At(i64),
    /// Offset from the current time.
    In(Duration),
}

/// Structured commands produced by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Status,
    Valves,
    Tasks,
    Events,
    Task(TaskCommand<'a>),
    HyperFlush,
    Debubble,
    Now { valve: Option<u8> },
    Tick { duration: Option<Duration> },
    Help,
}

/// Subcommands under `task`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskCommand<'a> {
    Create { name: &'a str },
    Show { id: u32 },
    Delete { id: u32 },
    Valves {
        id: u32,
        valves: HeaplessVec<u8, MAX_VALVES>,
    },
    Schedule { id: u32, at: ScheduleSpec },
    Unschedule { id: u32 },
}

/// Tokenizes the provided line.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let mut buffer = TokenBuffer::new();
    let bytes = line.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte.is_ascii_whitespace() {
            index += 1;
            continue;
        }
        let start = index;
        let kind = if byte == b',' {
            index += 1;
            TokenKind::Comma
        } else {
            while index < bytes.len()
                && !bytes[index].is_ascii_whitespace()
                && bytes[index] != b','
            {
                index += 1;
            }
            classify(&line[start..index])
        };
        let span = start..index;
        let lexeme = &line[span.clone()];
        if buffer.push(Token { kind, lexeme, span }).is_err() {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn classify(lexeme: &str) -> TokenKind {
    if lexeme.chars().all(|ch| ch.is_ascii_digit()) {
        return TokenKind::Integer;
    }
    let digits = lexeme
        .strip_suffix("ms")
        .or_else(|| lexeme.strip_suffix('s'));
    if let Some(digits) = digits {
        if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) {
            return TokenKind::Duration;
        }
    }
    if lexeme
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic())
        && lexeme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return TokenKind::Ident;
    }
    TokenKind::Error
}

/// Parses a console command from the provided line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    for token in &tokens {
        if token.kind == TokenKind::Error {
            return Err(ParseError::Grammar(GrammarError::invalid_token(token)));
        }
    }

    let mut input = tokens.as_slice();
    let command = command()
        .parse_next(&mut input)
        .map_err(ParseError::Grammar)?;

    if let Some(token) = input.first() {
        return Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        )));
    }
    Ok(command)
}

fn command<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let keyword = expect_kind(TokenKind::Ident, "command keyword").parse_next(input)?;
        match_keyword(&keyword, input)
    }
}

fn match_keyword<'src, 'slice>(
    keyword: &Token<'src>,
    input: &mut Input<'src, 'slice>,
) -> Result<Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    let word = keyword.lexeme;
    if word.eq_ignore_ascii_case("status") {
        Ok(Command::Status)
    } else if word.eq_ignore_ascii_case("valves") {
        Ok(Command::Valves)
    } else if word.eq_ignore_ascii_case("tasks") {
        Ok(Command::Tasks)
    } else if word.eq_ignore_ascii_case("events") {
        Ok(Command::Events)
    } else if word.eq_ignore_ascii_case("task") {
        task_command(input).map(Command::Task)
    } else if word.eq_ignore_ascii_case("hyperflush") {
        Ok(Command::HyperFlush)
    } else if word.eq_ignore_ascii_case("debubble") {
        Ok(Command::Debubble)
    } else if word.eq_ignore_ascii_case("now") {
        let valve = optional_integer(input)?;
        Ok(Command::Now { valve })
    } else if word.eq_ignore_ascii_case("tick") {
        let duration = optional_duration(input)?;
        Ok(Command::Tick { duration })
    } else if word.eq_ignore_ascii_case("help") {
        Ok(Command::Help)
    } else {
        Err(GrammarError::unexpected("command keyword", Some(keyword)))
    }
}

fn task_command<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<TaskCommand<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    let sub = expect_kind(TokenKind::Ident, "task subcommand").parse_next(input)?;
    let word = sub.lexeme;
    if word.eq_ignore_ascii_case("create") {
        let name = expect_kind(TokenKind::Ident, "task name").parse_next(input)?;
        Ok(TaskCommand::Create { name: name.lexeme })
    } else if word.eq_ignore_ascii_case("show") {
        Ok(TaskCommand::Show {
            id: integer(input)?,
        })
    } else if word.eq_ignore_ascii_case("delete") {
        Ok(TaskCommand::Delete {
            id: integer(input)?,
        })
    } else if word.eq_ignore_ascii_case("valves") {
        let id = integer(input)?;
        let valves = valve_list(input)?;
        Ok(TaskCommand::Valves { id, valves })
    } else if word.eq_ignore_ascii_case("schedule") {
        let id = integer(input)?;
        let at = schedule_spec(input)?;
        Ok(TaskCommand::Schedule { id, at })
    } else if word.eq_ignore_ascii_case("unschedule") {
        Ok(TaskCommand::Unschedule {
            id: integer(input)?,
        })
    } else {
        Err(GrammarError::unexpected("task subcommand", Some(&sub)))
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    expected: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            let token = token.clone();
            *input = rest;
            Ok(token)
        }
        other => Err(GrammarError::unexpected(
            expected,
            other.map(|(token, _)| token),
        )),
    }
}

fn integer<'src, 'slice, T: core::str::FromStr>(
    input: &mut Input<'src, 'slice>,
) -> Result<T, GrammarError<'src>>
where
    'src: 'slice,
{
    let token = expect_kind(TokenKind::Integer, "integer").parse_next(input)?;
    token
        .lexeme
        .parse()
        .map_err(|_| GrammarError::invalid_integer(&token))
}

fn optional_integer<'src, 'slice, T: core::str::FromStr>(
    input: &mut Input<'src, 'slice>,
) -> Result<Option<T>, GrammarError<'src>>
where
    'src: 'slice,
{
    if input
        .first()
        .is_some_and(|token| token.kind == TokenKind::Integer)
    {
        return integer(input).map(Some);
    }
    Ok(None)
}

fn duration<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<Duration, GrammarError<'src>>
where
    'src: 'slice,
{
    let token = expect_kind(TokenKind::Duration, "duration").parse_next(input)?;
    parse_duration(token.lexeme).ok_or_else(|| GrammarError::invalid_duration(&token))
}

fn optional_duration<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<Option<Duration>, GrammarError<'src>>
where
    'src: 'slice,
{
    if input
        .first()
        .is_some_and(|token| token.kind == TokenKind::Duration)
    {
        return duration(input).map(Some);
    }
    Ok(None)
}

fn parse_duration(lexeme: &str) -> Option<Duration> {
    if let Some(digits) = lexeme.strip_suffix("ms") {
        return digits.parse().ok().map(Duration::from_millis);
    }
    let digits = lexeme.strip_suffix('s')?;
    digits.parse().ok().map(Duration::from_secs)
}

fn schedule_spec<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<ScheduleSpec, GrammarError<'src>>
where
    'src: 'slice,
{
    match input.first().map(|token| token.kind) {
        Some(TokenKind::Duration) => duration(input).map(ScheduleSpec::In),
        Some(TokenKind::Integer) => integer(input).map(ScheduleSpec::At),
        _ => Err(GrammarError::unexpected("schedule time", input.first())),
    }
}

fn valve_list<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
) -> Result<HeaplessVec<u8, MAX_VALVES>, GrammarError<'src>>
where
    'src: 'slice,
{
    let mut valves = HeaplessVec::new();
    valves.push(integer(input)?).map_err(|_| too_many_valves())?;
    while input
        .first()
        .is_some_and(|token| token.kind == TokenKind::Comma)
    {
        *input = &input[1..];
        valves.push(integer(input)?).map_err(|_| too_many_valves())?;
    }
    Ok(valves)
}

fn too_many_valves() -> GrammarError<'static> {
    GrammarError {
        kind: GrammarErrorKind::TooManyValves,
    }
}
