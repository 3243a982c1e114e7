// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flat key-value configuration map that parameterizes each test.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use anyhow::Context;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ScriptError;

/// A single configuration value. Values are written in the params file as
/// TOML strings, booleans, integers, or floats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(true) => f.write_str("yes"),
            ParamValue::Bool(false) => f.write_str("no"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// The configuration map for one test run.
///
/// Lookups of keys that a test requires unconditionally go through
/// [`Params::require`], which turns a missing key into a configuration
/// error rather than a runtime failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

/// The on-disk layout of a params file: a base map plus per-test overlays.
#[derive(Debug, Deserialize)]
struct ParamsFile {
    #[serde(default)]
    tests: BTreeMap<String, Params>,

    #[serde(flatten)]
    base: Params,
}

/// A parsed params file.
#[derive(Clone, Debug, Default)]
pub struct ParamsStore {
    base: Params,
    overlays: BTreeMap<String, Params>,
}

impl ParamsStore {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let file: ParamsFile =
            toml::from_str(raw).context("parsing params file")?;
        Ok(Self { base: file.base, overlays: file.tests })
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading params file {path}"))?;
        Self::from_toml(&raw)
    }

    /// Returns the params for the test named `test_name`: the base map with
    /// the test's `[tests.<name>]` table laid over it.
    pub fn for_test(&self, test_name: &str) -> Params {
        let mut params = self.base.clone();
        if let Some(overlay) = self.overlays.get(test_name) {
            for (k, v) in &overlay.0 {
                params.0.insert(k.clone(), v.clone());
            }
        }
        params
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns the value of `key` rendered as a string, or `None` if it is
    /// absent or empty.
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).map(ToString::to_string).filter(|s| !s.is_empty())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    /// Returns the value of a key the caller cannot proceed without.
    pub fn require(&self, key: &str) -> Result<String, ScriptError> {
        self.get(key).ok_or_else(|| {
            let msg = format!("required parameter `{key}` is missing");
            ScriptError::config(msg)
        })
    }

    /// Interprets `key` as a yes/no switch. Missing keys are `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(ParamValue::Bool(b)) => *b,
            Some(ParamValue::Int(i)) => *i != 0,
            Some(ParamValue::Float(_)) => false,
            Some(ParamValue::Str(s)) => {
                matches!(s.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
            }
            None => false,
        }
    }

    /// Parses `key` as a number, returning `None` if it is absent and a
    /// configuration error if it is present but malformed.
    pub fn get_numeric<T: FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ScriptError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                ScriptError::config(format!(
                    "parameter `{key}` is not a valid number: {raw:?}"
                ))
            }),
        }
    }

    pub fn numeric_or<T: FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ScriptError> {
        Ok(self.get_numeric(key)?.unwrap_or(default))
    }

    /// Reads a timeout expressed in whole seconds.
    pub fn duration_secs(
        &self,
        key: &str,
        default_secs: u64,
    ) -> Result<Duration, ScriptError> {
        self.numeric_or(key, default_secs).map(Duration::from_secs)
    }

    /// Splits a whitespace-separated object list such as `filesystems` or
    /// `vms`.
    pub fn objects(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Returns the params for object `name`: every `key_<name>` entry
    /// overrides the plain `key` entry.
    pub fn object_params(&self, name: &str) -> Params {
        let suffix = format!("_{name}");
        let mut out = self.clone();
        for (k, v) in &self.0 {
            if let Some(base) = k.strip_suffix(&suffix) {
                if !base.is_empty() {
                    out.0.insert(base.to_owned(), v.clone());
                }
            }
        }
        out
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Params {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut params = Params::new();
        for (k, v) in pairs {
            params.set(k, v);
        }
        params
    }
}
