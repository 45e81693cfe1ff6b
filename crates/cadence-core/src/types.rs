use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Group assigned to jobs and triggers created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Unique identity of a job: `name` within `group`.
///
/// Rendered as `group.name`. Group names may not contain a `.`; job names may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Key in the [`DEFAULT_GROUP`].
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    /// Parse `group.name`; a string without a dot lands in the default group.
    pub fn parse(s: &str) -> Result<Self> {
        let (group, name) = split_key(s)?;
        Ok(Self::new(name, group))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Unique identity of a trigger: `name` within `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (group, name) = split_key(s)?;
        Ok(Self::new(name, group))
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn split_key(s: &str) -> Result<(&str, &str)> {
    let (group, name) = match s.split_once('.') {
        Some((group, name)) => (group, name),
        None => (DEFAULT_GROUP, s),
    };
    if group.is_empty() || name.is_empty() {
        return Err(CoreError::InvalidKey(format!(
            "key components must not be empty: {s:?}"
        )));
    }
    Ok((group, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_group_dot_name() {
        let key = JobKey::new("nightly-report", "reports");
        assert_eq!(key.to_string(), "reports.nightly-report");
    }

    #[test]
    fn parse_keeps_dots_in_name() {
        let key = TriggerKey::parse("billing.invoice.monthly").expect("parse failed");
        assert_eq!(key.group, "billing");
        assert_eq!(key.name, "invoice.monthly");
    }

    #[test]
    fn parse_without_group_uses_default() {
        let key = JobKey::parse("cleanup").expect("parse failed");
        assert_eq!(key, JobKey::named("cleanup"));
    }

    #[test]
    fn parse_empty_component_is_err() {
        assert!(JobKey::parse(".cleanup").is_err());
        assert!(TriggerKey::parse("group.").is_err());
    }

    #[test]
    fn keys_order_by_name_then_group() {
        let mut keys = vec![JobKey::new("b", "x"), JobKey::new("a", "y")];
        keys.sort();
        assert_eq!(keys[0].name, "a");
    }
}
