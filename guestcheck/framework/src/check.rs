// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named predicates over free-text command output.
//!
//! Every assertion a script makes about guest output goes through a [`Check`]
//! so that the intent of the assertion ("secure boot is enabled", "service is
//! running") is spelled out next to the pattern that implements it.

use std::borrow::Cow;

use regex::Regex;

use crate::error::ScriptError;

#[derive(Clone, Debug)]
pub enum Predicate {
    /// Accepts any output.
    Any,

    /// The output contains the string.
    Contains(String),

    /// The output does not contain the string.
    Lacks(String),

    /// The output contains the string, ignoring ASCII case.
    ContainsIgnoreCase(String),

    /// The regular expression matches somewhere in the output.
    Matches(Regex),

}

impl Predicate {
    /// Compiles `pattern` into a [`Predicate::Matches`]. A bad pattern comes
    /// from test parameters and is a configuration error.
    pub fn regex(pattern: &str) -> Result<Self, ScriptError> {
        Regex::new(pattern).map(Predicate::Matches).map_err(|e| {
            ScriptError::config(format!("invalid pattern {pattern:?}: {e}"))
        })
    }

    pub fn holds(&self, output: &str) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Contains(s) => output.contains(s.as_str()),
            Predicate::Lacks(s) => !output.contains(s.as_str()),
            Predicate::ContainsIgnoreCase(s) => {
                output.to_lowercase().contains(&s.to_lowercase())
            }
            Predicate::Matches(re) => re.is_match(output),
        }
    }
}

/// A predicate together with a description of what it establishes.
#[derive(Clone, Debug)]
pub struct Check {
    intent: Cow<'static, str>,
    predicate: Predicate,
}

impl Check {
    pub fn new(
        intent: impl Into<Cow<'static, str>>,
        predicate: Predicate,
    ) -> Self {
        Self { intent: intent.into(), predicate }
    }

    /// A check that accepts every output.
    pub fn any() -> Self {
        Self::new("command completed", Predicate::Any)
    }

    pub fn contains(
        intent: impl Into<Cow<'static, str>>,
        needle: impl Into<String>,
    ) -> Self {
        Self::new(intent, Predicate::Contains(needle.into()))
    }

    pub fn lacks(
        intent: impl Into<Cow<'static, str>>,
        needle: impl Into<String>,
    ) -> Self {
        Self::new(intent, Predicate::Lacks(needle.into()))
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn holds(&self, output: &str) -> bool {
        self.predicate.holds(output)
    }
}

/// Returns true if the whitespace-separated fields at `a` and `b` in
/// `output` are present and equal. Used for checks of the form "column 1
/// equals column 2" on tool output.
pub fn fields_equal(output: &str, a: usize, b: usize) -> bool {
    let fields: Vec<&str> = output.split_whitespace().collect();
    match (fields.get(a), fields.get(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
