//! Identifier sanitizer: the only path by which caller-supplied names reach SQL text.

use crate::error::{Result, ServiceError};
use std::fmt;

const MAX_IDENTIFIER_LEN: usize = 128;
const REDACT_LEN: usize = 64;

/// A validated column, alias, or table name. Renders back-quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    parts: Vec<String>,
}

impl Identifier {
    /// Accepts a single name made of ASCII letters, digits and underscores.
    pub fn parse(raw: &str) -> Result<Self> {
        validate_part(raw, raw)?;
        Ok(Self {
            parts: vec![raw.to_string()],
        })
    }

    /// Accepts `name` or `database.name`.
    pub fn parse_qualified(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() > 2 {
            return Err(ServiceError::InvalidIdentifier(format!(
                "'{}' has too many qualifiers",
                redact(raw)
            )));
        }
        for part in &parts {
            validate_part(part, raw)?;
        }
        Ok(Self {
            parts: parts.into_iter().map(str::to_string).collect(),
        })
    }

    /// Unqualified name, as callers see it in result sets.
    pub fn name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The `database` of `database.name`, if given.
    pub fn qualifier(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [database, _] => Some(database.as_str()),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        self.parts
            .iter()
            .map(|part| format!("`{part}`"))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn validate_part(part: &str, whole: &str) -> Result<()> {
    if part.is_empty() {
        return Err(ServiceError::InvalidIdentifier(format!(
            "'{}' contains an empty name",
            redact(whole)
        )));
    }
    if part.len() > MAX_IDENTIFIER_LEN {
        return Err(ServiceError::InvalidIdentifier(format!(
            "'{}' exceeds {MAX_IDENTIFIER_LEN} characters",
            redact(whole)
        )));
    }
    if !part
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(ServiceError::InvalidIdentifier(format!(
            "'{}' must contain only ASCII letters, digits and underscores",
            redact(whole)
        )));
    }
    Ok(())
}

/// Escaped, length-capped rendition of caller input for error messages and logs.
pub fn redact(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .take(REDACT_LEN)
        .collect::<String>()
        .escape_debug()
        .to_string();
    if raw.chars().count() > REDACT_LEN {
        out.push_str("...");
    }
    out
}

/// Column resolution policy for one endpoint family.
#[derive(Debug, Clone, Copy)]
pub enum Sanitizer {
    /// Any name in the allowed character class.
    CharacterClass,
    /// Only the listed names; everything else is rejected.
    AllowList(&'static [&'static str]),
}

impl Sanitizer {
    pub fn column(&self, raw: &str) -> Result<Identifier> {
        let ident = Identifier::parse(raw)?;
        match self {
            Sanitizer::CharacterClass => Ok(ident),
            Sanitizer::AllowList(allowed) => {
                if allowed.contains(&raw) {
                    Ok(ident)
                } else {
                    Err(ServiceError::InvalidIdentifier(format!(
                        "unknown column '{}'",
                        redact(raw)
                    )))
                }
            }
        }
    }

    pub fn columns<S: AsRef<str>>(&self, raw: &[S]) -> Result<Vec<Identifier>> {
        raw.iter().map(|name| self.column(name.as_ref())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names_and_quotes_them() {
        let ident = Identifier::parse("territory_2").unwrap();
        assert_eq!(ident.render(), "`territory_2`");
        assert_eq!(ident.name(), "territory_2");
    }

    #[test]
    fn rejects_anything_outside_character_class() {
        for raw in [
            "",
            "year; DROP TABLE sop_facts",
            "a`b",
            "name--",
            "col name",
            "терр",
            "x)",
        ] {
            let err = Identifier::parse(raw).expect_err(raw);
            assert!(matches!(err, ServiceError::InvalidIdentifier(_)), "{raw}");
        }
    }

    #[test]
    fn qualified_names_render_each_part() {
        let ident = Identifier::parse_qualified("system.columns").unwrap();
        assert_eq!(ident.render(), "`system`.`columns`");
        assert!(Identifier::parse_qualified("a.b.c").is_err());
        assert!(Identifier::parse_qualified("a.").is_err());
    }

    #[test]
    fn allow_list_rejects_unknown_columns() {
        let sanitizer = Sanitizer::AllowList(&["year", "month"]);
        assert!(sanitizer.column("year").is_ok());
        let err = sanitizer.column("id").unwrap_err();
        assert_eq!(err.to_string(), "invalid identifier: unknown column 'id'");
    }

    #[test]
    fn redaction_escapes_and_truncates() {
        assert_eq!(redact("a'\nb"), "a\\'\\nb");
        let long = "x".repeat(100);
        let redacted = redact(&long);
        assert!(redacted.ends_with("..."));
        assert_eq!(redacted.len(), REDACT_LEN + 3);
    }
}
