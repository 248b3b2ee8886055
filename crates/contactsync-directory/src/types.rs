//! Common types shared by directory clients and the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two directories a user's contacts live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKind {
    /// Messaging-platform contact list.
    Messaging,
    /// Cloud contacts directory.
    Cloud,
}

impl DirectoryKind {
    /// Both directory kinds, in tie-break priority order.
    pub const ALL: [DirectoryKind; 2] = [DirectoryKind::Messaging, DirectoryKind::Cloud];

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryKind::Messaging => "messaging",
            DirectoryKind::Cloud => "cloud",
        }
    }

    /// The opposite directory.
    #[must_use]
    pub fn other(&self) -> DirectoryKind {
        match self {
            DirectoryKind::Messaging => DirectoryKind::Cloud,
            DirectoryKind::Cloud => DirectoryKind::Messaging,
        }
    }
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DirectoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "messaging" => Ok(DirectoryKind::Messaging),
            "cloud" => Ok(DirectoryKind::Cloud),
            _ => Err(format!("Unknown directory kind: {s}")),
        }
    }
}

/// Kind of change observed in a directory's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_kind_other() {
        assert_eq!(DirectoryKind::Messaging.other(), DirectoryKind::Cloud);
        assert_eq!(DirectoryKind::Cloud.other(), DirectoryKind::Messaging);
    }

    #[test]
    fn test_directory_kind_from_str() {
        assert_eq!("Cloud".parse::<DirectoryKind>(), Ok(DirectoryKind::Cloud));
        assert!("ldap".parse::<DirectoryKind>().is_err());
    }
}
