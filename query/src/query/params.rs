//! Named placeholders and bound parameters
//!
//! Queries reference values only through ClickHouse placeholders of the form
//! `{name:Type}`; the values travel in a separate [`Parameters`] map. This
//! module owns the placeholder syntax: rendering, renaming templates and
//! checking that a finished query and its parameter map agree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

use super::error::QueryError;
use super::types::{ClickhouseType, ParamValue};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*):([A-Za-z0-9_()]+)\}").expect("Invalid regex")
});

/// Render a `{name:Type}` placeholder
pub fn placeholder(name: &str, ty: &ClickhouseType) -> String {
    format!("{{{}:{}}}", name, ty)
}

/// Names of all placeholders referenced by a query. Text inside `'...'`
/// literals and `` `...` `` identifiers is not scanned.
pub fn placeholder_names(query: &str) -> BTreeSet<String> {
    PLACEHOLDER_RE
        .captures_iter(&blank_quoted(query))
        .map(|c| c[1].to_string())
        .collect()
}

/// Replace the contents of quoted spans with spaces, keeping the quotes.
/// Literals use backslash escapes; doubled quotes close and reopen the span.
fn blank_quoted(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut open: Option<char> = None;
    let mut escaped = false;

    for ch in query.chars() {
        match open {
            None => {
                if ch == '\'' || ch == '`' {
                    open = Some(ch);
                }
                out.push(ch);
            }
            Some(_) if escaped => {
                escaped = false;
                out.push(' ');
            }
            Some('\'') if ch == '\\' => {
                escaped = true;
                out.push(' ');
            }
            Some(quote) if ch == quote => {
                open = None;
                out.push(ch);
            }
            Some(_) => out.push(' '),
        }
    }
    out
}

/// Build the parameter key for the filter at `index`: `<prefix>_<column>_<index>`.
///
/// Column ids may contain characters that are not valid in a placeholder name
/// (`score:accuracy`), so everything outside `[A-Za-z0-9_]` becomes `_`.
pub fn param_key(prefix: &str, column: &str, index: usize) -> String {
    let sanitized: String = column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}_{}", prefix, sanitized, index)
}

/// SQL fragment with template placeholders that get renamed before use.
///
/// Templates are written with short upper-case names (`{KEY:String}`) and
/// bound to a concrete parameter key with [`SqlTemplate::bind_to_key`], which
/// yields `{<key>_key:String}`. Types are kept as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTemplate {
    text: String,
}

impl SqlTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Template placeholder names in order of appearance
    pub fn names(&self) -> Vec<String> {
        PLACEHOLDER_RE
            .captures_iter(&self.text)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Rename every placeholder through `rename`, keeping its type
    pub fn rename<F>(&self, rename: F) -> String
    where
        F: Fn(&str) -> String,
    {
        PLACEHOLDER_RE
            .replace_all(&self.text, |caps: &Captures| {
                format!("{{{}:{}}}", rename(&caps[1]), &caps[2])
            })
            .into_owned()
    }

    /// Rename `{NAME:Type}` to `{<key>_name:Type}`
    pub fn bind_to_key(&self, key: &str) -> String {
        self.rename(|name| Self::bound_name(key, name))
    }

    /// Parameter name a template placeholder receives under `key`
    pub fn bound_name(key: &str, name: &str) -> String {
        format!("{}_{}", key, name.to_lowercase())
    }
}

/// Parameter map of a query, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParamValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value. Re-binding a name to the same value is allowed; binding
    /// it to a different value is a collision.
    pub fn bind(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> Result<(), QueryError> {
        let name = name.into();
        let value = value.into();
        match self.0.get(&name) {
            Some(existing) if *existing != value => Err(QueryError::ParameterCollision(name)),
            Some(_) => Ok(()),
            None => {
                self.0.insert(name, value);
                Ok(())
            }
        }
    }

    pub fn extend<I>(&mut self, params: I) -> Result<(), QueryError>
    where
        I: IntoIterator<Item = (String, ParamValue)>,
    {
        for (name, value) in params {
            self.bind(name, value)?;
        }
        Ok(())
    }

    /// Merge another map, e.g. from a subquery
    pub fn merge(&mut self, other: Parameters) -> Result<(), QueryError> {
        self.extend(other.0)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A finished query: SQL text plus the parameters it references
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub parameters: Parameters,
}

impl QueryResult {
    /// Pair a query with its parameters, checking that every placeholder is
    /// bound and every parameter is referenced.
    pub fn new(query: String, parameters: Parameters) -> Result<Self, QueryError> {
        let names = placeholder_names(&query);
        if let Some(unbound) = names.iter().find(|n| !parameters.contains_key(n)) {
            return Err(QueryError::UnboundPlaceholder(unbound.clone()));
        }
        if let Some(unused) = parameters.keys().find(|k| !names.contains(*k)) {
            return Err(QueryError::UnusedParameter(unused.clone()));
        }
        Ok(Self { query, parameters })
    }
}
