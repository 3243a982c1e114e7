// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command templates taken from test parameters and filled with values
//! discovered at runtime (guest paths, drive letters, interface names).
//!
//! Two placeholder styles appear in params files and both are supported:
//! printf-style `%s`/`%d` and brace-style `{}`/`{0}`. A template containing
//! `%s` or `%d` is printf-style and its braces are literal text; otherwise
//! braces are placeholders and `{{`/`}}` escape them.

use thiserror::Error;

use crate::error::ScriptError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}` expects {expected} value(s), got {got}")]
    Arity { template: String, expected: usize, got: usize },

    #[error("template `{template}` has a malformed placeholder")]
    Malformed { template: String },
}

impl From<TemplateError> for ScriptError {
    fn from(e: TemplateError) -> Self {
        ScriptError::config(e.to_string())
    }
}

#[derive(Debug)]
enum Piece {
    Literal(String),
    Positional(usize),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitutes `args` into the template's positional placeholders.
    pub fn fill(&self, args: &[&str]) -> Result<String, TemplateError> {
        let pieces = self.parse()?;
        let expected = pieces
            .iter()
            .filter_map(|p| match p {
                Piece::Positional(i) => Some(i + 1),
                Piece::Literal(_) => None,
            })
            .max()
            .unwrap_or(0);

        if expected != args.len() {
            return Err(TemplateError::Arity {
                template: self.0.clone(),
                expected,
                got: args.len(),
            });
        }

        let mut out = String::with_capacity(self.0.len());
        for piece in pieces {
            match piece {
                Piece::Literal(s) => out.push_str(&s),
                Piece::Positional(i) => out.push_str(args[i]),
            }
        }
        Ok(out)
    }

    /// Replaces every occurrence of each named token, e.g. `WIN_UTILS` or
    /// `VIOWIN_LTR`, leaving positional placeholders alone.
    pub fn fill_named(&self, tokens: &[(&str, &str)]) -> CommandTemplate {
        let mut out = self.0.clone();
        for (token, value) in tokens {
            out = out.replace(token, value);
        }
        CommandTemplate(out)
    }

    fn parse(&self) -> Result<Vec<Piece>, TemplateError> {
        if self.0.contains("%s") || self.0.contains("%d") {
            Ok(self.parse_printf())
        } else {
            self.parse_braces()
        }
    }

    fn parse_printf(&self) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut next = 0;

        let mut chars = self.0.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }

            match chars.next() {
                Some('%') => literal.push('%'),
                Some('s') | Some('d') => {
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    pieces.push(Piece::Positional(next));
                    next += 1;
                }
                // A lone `%` followed by something else (for example
                // `%errorlevel%` in cmd.exe) is literal text.
                Some(other) => {
                    literal.push('%');
                    literal.push(other);
                }
                None => literal.push('%'),
            }
        }

        pieces.push(Piece::Literal(literal));
        pieces
    }

    fn parse_braces(&self) -> Result<Vec<Piece>, TemplateError> {
        let malformed =
            || TemplateError::Malformed { template: self.0.clone() };
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut next = 0;

        let mut chars = self.0.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        literal.push('{');
                        continue;
                    }

                    let mut index = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(d) if d.is_ascii_digit() => index.push(d),
                            _ => return Err(malformed()),
                        }
                    }

                    let idx = if index.is_empty() {
                        next += 1;
                        next - 1
                    } else {
                        index.parse().map_err(|_| malformed())?
                    };
                    pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    pieces.push(Piece::Positional(idx));
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                    }
                    literal.push('}');
                }
                _ => literal.push(c),
            }
        }

        pieces.push(Piece::Literal(literal));
        Ok(pieces)
    }
}

impl From<String> for CommandTemplate {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CommandTemplate {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
