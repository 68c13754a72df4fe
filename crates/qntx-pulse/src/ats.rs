//! ATS code tokenization and pluggable parsing (spec §4.5).
//!
//! The core hard-codes no subcommand vocabulary (spec §9 open question) —
//! it only tokenizes and dispatches on the first token to a registered
//! [`AtsParser`]. Unknown first tokens fail with `UnknownCommand`.

use std::collections::HashMap;

use thiserror::Error;

/// Parse-stage errors, distinct from the broader [`qntx_core::QntxError`]
/// taxonomy so the tokenizer/dispatch boundary can be tested in isolation;
/// callers convert with `From<AtsError> for QntxError` at the API edge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AtsError {
    #[error("mismatched quote in ATS code")]
    MismatchedQuote,

    #[error("empty ATS code")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl From<AtsError> for qntx_core::error::QntxError {
    fn from(e: AtsError) -> Self {
        match e {
            AtsError::MismatchedQuote | AtsError::Empty => {
                qntx_core::error::QntxError::ParseError(e.to_string())
            }
            AtsError::UnknownCommand(_) => qntx_core::error::QntxError::ParseError(e.to_string()),
        }
    }
}

/// Splits ATS code into whitespace-separated tokens, preserving single- and
/// double-quote grouping. A quote that never closes is a parse error.
pub fn tokenize(input: &str) -> Result<Vec<String>, AtsError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => current.push(c),
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else {
                    current.push(c);
                    in_token = true;
                }
            }
        }
    }

    if quote.is_some() {
        return Err(AtsError::MismatchedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(AtsError::Empty);
    }
    Ok(tokens)
}

/// The result of parsing ATS code: a handler name plus an opaque payload
/// ready to hand to C2/C5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAts {
    pub handler_name: String,
    pub payload: Vec<u8>,
    pub source_url: Option<String>,
}

/// A pluggable subcommand parser, keyed by the first ATS token.
pub trait AtsParser: Send + Sync {
    fn parse(&self, tokens: &[String]) -> Result<ParsedAts, AtsError>;
}

#[derive(Default)]
pub struct AtsParserRegistry {
    parsers: HashMap<String, Box<dyn AtsParser>>,
}

impl AtsParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: impl Into<String>, parser: Box<dyn AtsParser>) {
        self.parsers.insert(command.into(), parser);
    }

    pub fn parse(&self, input: &str) -> Result<ParsedAts, AtsError> {
        let tokens = tokenize(input)?;
        let command = &tokens[0];
        let parser = self
            .parsers
            .get(command)
            .ok_or_else(|| AtsError::UnknownCommand(command.clone()))?;
        parser.parse(&tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_whitespace_separated() {
        let tokens = tokenize("demo x y").unwrap();
        assert_eq!(tokens, vec!["demo", "x", "y"]);
    }

    #[test]
    fn preserves_quoted_groups() {
        let tokens = tokenize(r#"demo "hello world" 'single group'"#).unwrap();
        assert_eq!(tokens, vec!["demo", "hello world", "single group"]);
    }

    #[test]
    fn mismatched_quote_is_parse_error() {
        let err = tokenize(r#"demo "unterminated"#).unwrap_err();
        assert_eq!(err, AtsError::MismatchedQuote);
    }

    #[test]
    fn empty_input_is_error() {
        assert_eq!(tokenize("   ").unwrap_err(), AtsError::Empty);
    }

    struct DemoParser;
    impl AtsParser for DemoParser {
        fn parse(&self, tokens: &[String]) -> Result<ParsedAts, AtsError> {
            Ok(ParsedAts {
                handler_name: tokens[0].clone(),
                payload: tokens[1..].join(" ").into_bytes(),
                source_url: None,
            })
        }
    }

    #[test]
    fn unknown_command_fails() {
        let registry = AtsParserRegistry::new();
        let err = registry.parse("ix frobnicate").unwrap_err();
        assert_eq!(err, AtsError::UnknownCommand("ix".to_string()));
    }

    #[test]
    fn registered_command_dispatches() {
        let mut registry = AtsParserRegistry::new();
        registry.register("demo", Box::new(DemoParser));
        let parsed = registry.parse("demo x y").unwrap();
        assert_eq!(parsed.handler_name, "demo");
        assert_eq!(parsed.payload, b"x y");
    }
}
