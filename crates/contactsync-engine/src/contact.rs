//! Canonical contact representation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use contactsync_directory::ids::{ContactId, NativeId, Revision};
use contactsync_directory::payload::SocialLink;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Fields of the canonical contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Name,
    Phones,
    Emails,
    Organization,
    JobTitle,
    SocialLinks,
    Notes,
    Tags,
}

impl FieldName {
    pub const ALL: [FieldName; 8] = [
        FieldName::Name,
        FieldName::Phones,
        FieldName::Emails,
        FieldName::Organization,
        FieldName::JobTitle,
        FieldName::SocialLinks,
        FieldName::Notes,
        FieldName::Tags,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Name => "name",
            FieldName::Phones => "phones",
            FieldName::Emails => "emails",
            FieldName::Organization => "organization",
            FieldName::JobTitle => "job_title",
            FieldName::SocialLinks => "social_links",
            FieldName::Notes => "notes",
            FieldName::Tags => "tags",
        }
    }

    /// List-valued fields are unioned on merge instead of overwritten.
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            FieldName::Phones | FieldName::Emails | FieldName::SocialLinks | FieldName::Tags
        )
    }

    /// Free-text fields are concatenated on conflicting edits.
    #[must_use]
    pub fn is_free_text(&self) -> bool {
        matches!(self, FieldName::Notes)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FieldName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|f| f.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown field: {s}"))
    }
}

/// Value of one canonical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Links(Vec<SocialLink>),
}

impl FieldValue {
    /// Empty text or an empty list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(v) => v.is_empty(),
            FieldValue::Links(v) => v.is_empty(),
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Text(s) => usize::from(!s.is_empty()),
            FieldValue::List(v) => v.len(),
            FieldValue::Links(v) => v.len(),
        }
    }

    /// Keep only the first element of a list value.
    #[must_use]
    pub fn first_only(&self) -> FieldValue {
        match self {
            FieldValue::Text(s) => FieldValue::Text(s.clone()),
            FieldValue::List(v) => FieldValue::List(v.iter().take(1).cloned().collect()),
            FieldValue::Links(v) => FieldValue::Links(v.iter().take(1).cloned().collect()),
        }
    }
}

/// Which directory last wrote a field, and at what revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub directory: DirectoryKind,
    pub revision: Option<Revision>,
    pub written_at: DateTime<Utc>,
}

/// Cross-directory link of a canonical contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryLink {
    pub native_id: NativeId,
    /// Revision the engine last read or wrote.
    pub revision: Option<Revision>,
}

/// The engine's unified, directory-agnostic view of one person.
///
/// Always carries at least one directory link; a contact with no link cannot
/// be written anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalContact {
    pub id: ContactId,
    pub fields: BTreeMap<FieldName, FieldValue>,
    pub provenance: BTreeMap<FieldName, Provenance>,
    pub links: BTreeMap<DirectoryKind, DirectoryLink>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalContact {
    /// Create an empty contact sourced from one directory record.
    pub fn from_source(
        directory: DirectoryKind,
        native_id: NativeId,
        revision: Option<Revision>,
    ) -> Self {
        let mut links = BTreeMap::new();
        links.insert(
            directory,
            DirectoryLink {
                native_id,
                revision,
            },
        );
        Self {
            id: ContactId::new(),
            fields: BTreeMap::new(),
            provenance: BTreeMap::new(),
            links,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn get(&self, field: FieldName) -> Option<&FieldValue> {
        self.fields.get(&field).filter(|v| !v.is_empty())
    }

    /// Set a field; empty values remove it.
    pub fn set(&mut self, field: FieldName, value: FieldValue, provenance: Provenance) {
        if value.is_empty() {
            self.fields.remove(&field);
            self.provenance.remove(&field);
        } else {
            self.fields.insert(field, value);
            self.provenance.insert(field, provenance);
        }
    }

    #[must_use]
    pub fn link(&self, directory: DirectoryKind) -> Option<&DirectoryLink> {
        self.links.get(&directory)
    }

    #[must_use]
    pub fn native_id(&self, directory: DirectoryKind) -> Option<&NativeId> {
        self.links.get(&directory).map(|l| &l.native_id)
    }

    pub fn set_link(&mut self, directory: DirectoryKind, native_id: NativeId, revision: Option<Revision>) {
        self.links.insert(
            directory,
            DirectoryLink {
                native_id,
                revision,
            },
        );
    }

    /// Check the at-least-one-link invariant.
    pub fn validate(&self) -> SyncResult<()> {
        if self.links.is_empty() {
            return Err(SyncError::invariant(format!(
                "contact {} has no directory link",
                self.id
            )));
        }
        Ok(())
    }
}
