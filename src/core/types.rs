//! Core domain type definitions

use std::fmt;
use std::str::FromStr;

use crate::common::error::Error;

/// Identifier of a relation within the scope of a service
pub type RelationId = u64;

/// Lifecycle phase of a unit or service.
///
/// Life only ever advances: Alive -> Dying -> Dead. The derived ordering
/// reflects that progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_alive(self) -> bool {
        self == Life::Alive
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Life::Alive => write!(f, "alive"),
            Life::Dying => write!(f, "dying"),
            Life::Dead => write!(f, "dead"),
        }
    }
}

/// Hint requesting the consumer to retry or skip previously failed hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvedMode {
    #[default]
    None,
    RetryHooks,
    NoHooks,
}

impl ResolvedMode {
    /// Check whether a resolution has actually been requested
    pub fn is_set(self) -> bool {
        self != ResolvedMode::None
    }
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedMode::None => write!(f, "none"),
            ResolvedMode::RetryHooks => write!(f, "retry-hooks"),
            ResolvedMode::NoHooks => write!(f, "no-hooks"),
        }
    }
}

/// URL identifying a versioned charm, e.g. `cs:wordpress-3`.
///
/// The format is `schema:name` with an optional numeric `-revision` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharmUrl(String);

impl CharmUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The schema part, e.g. `cs` in `cs:wordpress-3`
    pub fn schema(&self) -> &str {
        // Validated at construction: the separator is always present
        match self.0.split_once(':') {
            Some((schema, _)) => schema,
            None => "",
        }
    }

    /// The numeric revision suffix, if the URL carries one
    pub fn revision(&self) -> Option<u32> {
        let (_, rest) = self.0.split_once(':')?;
        let (_, revision) = rest.rsplit_once('-')?;
        revision.parse().ok()
    }
}

impl fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CharmUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidCharmUrl { url: s.to_string() };
        let (schema, name) = s.split_once(':').ok_or_else(invalid)?;
        if schema.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(CharmUrl(s.to_string()))
    }
}
