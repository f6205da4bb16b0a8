//! Small expression builder that renders statements with `:name` placeholders,
//! plus the `?` form the store client binds positionally.
//!
//! Caller-supplied names enter only through [`Identifier`]; caller-supplied
//! values enter only through [`Params`]. Nothing else reaches SQL text.

mod expr;
mod ident;
mod select;
mod value;

pub use expr::{AggregationFunction, CompareOp, Expr, Logic, OrderBy, Param, Predicate, SortOrder};
pub use ident::{redact, Identifier, Sanitizer};
pub use select::{Select, Source};
pub use value::BindParam;

use crate::error::{Result, ServiceError};
use serde::Serialize;
use std::collections::BTreeMap;

/// How placeholders are written into rendered SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placeholders {
    /// `:name`, the form callers see from `/translate`.
    #[default]
    Named,
    /// `?` in bind order, the form the store client executes.
    Positional,
}

/// Named bind values for one statement.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Params {
    values: BTreeMap<String, BindParam>,
    #[serde(skip)]
    style: Placeholders,
    /// Values in placeholder order; filled in positional style only.
    #[serde(skip)]
    positional: Vec<BindParam>,
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Params {
    pub fn with_style(style: Placeholders) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    /// Binds a value and returns the placeholder text to emit in its place.
    /// Binding the same name twice is allowed only with an equal value.
    pub fn bind(&mut self, param: &Param) -> Result<String> {
        match self.values.get(&param.name) {
            Some(existing) if existing != &param.value => {
                return Err(ServiceError::Internal(anyhow::anyhow!(
                    "parameter '{}' bound twice with different values",
                    param.name
                )));
            }
            Some(_) => {}
            None => {
                self.values.insert(param.name.clone(), param.value.clone());
            }
        }

        Ok(match self.style {
            Placeholders::Named => param.placeholder(),
            Placeholders::Positional => self.slot(&param.value),
        })
    }

    /// Lists expand to one slot per element so `IN (?, ?)` reads as a tuple.
    fn slot(&mut self, value: &BindParam) -> String {
        match value {
            BindParam::List(items) if items.is_empty() => "(NULL)".to_string(),
            BindParam::List(items) => {
                self.positional.extend(items.iter().cloned());
                format!("({})", vec!["?"; items.len()].join(", "))
            }
            BindParam::Timestamp(_) => {
                self.positional.push(value.clone());
                "parseDateTime64BestEffort(?, 3)".to_string()
            }
            other => {
                self.positional.push(other.clone());
                "?".to_string()
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BindParam> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindParam)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    /// Copy without the given names, e.g. pagination binds.
    pub fn without(&self, excluded: &[&str]) -> Params {
        Params {
            values: self
                .values
                .iter()
                .filter(|(name, _)| !excluded.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            ..Params::default()
        }
    }

    pub fn into_positional(self) -> Vec<BindParam> {
        self.positional
    }
}

/// `?`-placeholder SQL with its values in bind order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundSql {
    pub sql: String,
    pub values: Vec<BindParam>,
}

/// A rendered statement ready for an executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Params,
    /// What the store client actually runs; `sql` is its named rendition.
    #[serde(skip)]
    pub bound: BoundSql,
}

impl Statement {
    /// Text between `WHERE` and the next clause keyword, if any. Table sources only.
    pub fn where_clause(&self) -> Option<&str> {
        let start = self.sql.find(" WHERE ")? + " WHERE ".len();
        let rest = &self.sql[start..];
        let end = [" GROUP BY ", " ORDER BY ", " LIMIT ", " OFFSET "]
            .iter()
            .filter_map(|keyword| rest.find(keyword))
            .min()
            .unwrap_or(rest.len());
        Some(&rest[..end])
    }
}
