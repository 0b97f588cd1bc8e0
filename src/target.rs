//! Monitored target descriptors
//!
//! A target is one cache server or proxy identified by its network address.
//! Targets are read from the configuration document as `"<address> <name>"`
//! lines, one list per target kind.
//!
//! # Examples
//!
//! **YAML Format:**
//! ```yaml
//! redis:
//!   - "10.0.0.1:6379 cache-a"
//!   - "10.0.0.2:6379 cache-b"
//! predixy:
//!   - "10.0.0.10:7617 proxy-a"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of monitored endpoint, selects the collector implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A Redis server (`redis` section)
    CacheServer,
    /// A Predixy proxy (`predixy` section)
    Proxy,
}

impl TargetKind {
    /// Name of the configuration section this kind is read from
    pub fn section(&self) -> &'static str {
        match self {
            TargetKind::CacheServer => "redis",
            TargetKind::Proxy => "predixy",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// Errors produced while reading a target line
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("{kind} server \"{line}\" invalid: expected \"<address> <name>\", got {fields} field(s)")]
    FieldCount {
        kind: TargetKind,
        line: String,
        fields: usize,
    },
    #[error("{kind} target has an empty {field}")]
    EmptyField {
        kind: TargetKind,
        field: &'static str,
    },
    #[error("{kind} target {field} \"{value}\" contains whitespace")]
    Whitespace {
        kind: TargetKind,
        field: &'static str,
        value: String,
    },
}

/// Normalized description of one monitored endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Network location, the unique key of the slot
    pub address: String,
    /// Secondary identifier supplied alongside the address
    pub name: String,
    /// Which collector implementation handles this target
    pub kind: TargetKind,
}

impl Target {
    pub fn new(address: impl Into<String>, name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            kind,
        }
    }

    /// Parse a `"<address> <name>"` line
    pub fn parse_line(kind: TargetKind, line: &str) -> Result<Self, TargetError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(TargetError::FieldCount {
                kind,
                line: line.to_string(),
                fields: fields.len(),
            });
        }

        Ok(Self::new(fields[0], fields[1], kind))
    }

    /// Check the shape of a descriptor that did not come from `parse_line`
    pub fn validate(&self) -> Result<(), TargetError> {
        for (field, value) in [("address", &self.address), ("name", &self.name)] {
            if value.is_empty() {
                return Err(TargetError::EmptyField {
                    kind: self.kind,
                    field,
                });
            }
            if value.chars().any(char::is_whitespace) {
                return Err(TargetError::Whitespace {
                    kind: self.kind,
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Whether a collector created for `(kind, name)` can keep serving this target
    pub fn same_identity(&self, kind: TargetKind, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.address, self.name)
    }
}

/// Parse every line of one section, skipping malformed ones.
///
/// Skipped lines are logged and returned alongside the valid targets so callers
/// can report them.
pub fn parse_section(kind: TargetKind, lines: &[String]) -> (Vec<Target>, Vec<TargetError>) {
    let mut targets = Vec::with_capacity(lines.len());
    let mut skipped = Vec::new();

    for line in lines {
        match Target::parse_line(kind, line) {
            Ok(target) => targets.push(target),
            Err(e) => {
                tracing::warn!("{}, ignore it", e);
                skipped.push(e);
            }
        }
    }

    (targets, skipped)
}
