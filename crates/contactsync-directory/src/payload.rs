//! Native payload shapes of the two directories.
//!
//! Each directory speaks its own schema. The engine only sees these types at
//! the boundary and converts them to the canonical form immediately.

use serde::{Deserialize, Serialize};

use crate::types::DirectoryKind;

/// A link to a profile on some social platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocialLink {
    pub platform: String,
    pub url: String,
}

impl SocialLink {
    pub fn new(platform: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
        }
    }
}

/// Contact as stored in the messaging platform.
///
/// The messaging list holds one phone and one email per contact and has no
/// notion of a job title.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagingContact {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub social_links: Vec<SocialLink>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub archived: bool,
}

/// A name entry of a cloud person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudName {
    pub display_name: String,
    #[serde(default)]
    pub primary: bool,
}

/// A phone number or email entry of a cloud person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudValue {
    pub value: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

impl CloudValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: None,
            primary: false,
        }
    }

    #[must_use]
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }
}

/// An organization entry of a cloud person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudOrganization {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub primary: bool,
}

/// A url entry of a cloud person; `kind` carries the platform label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudUrl {
    pub value: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A free-text biography entry of a cloud person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudBiography {
    pub value: String,
    #[serde(default)]
    pub primary: bool,
}

/// Person resource as stored in the cloud contacts directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudPerson {
    #[serde(default)]
    pub names: Vec<CloudName>,
    #[serde(default)]
    pub phone_numbers: Vec<CloudValue>,
    #[serde(default)]
    pub email_addresses: Vec<CloudValue>,
    #[serde(default)]
    pub organizations: Vec<CloudOrganization>,
    #[serde(default)]
    pub biographies: Vec<CloudBiography>,
    #[serde(default)]
    pub urls: Vec<CloudUrl>,
    /// Contact group labels.
    #[serde(default)]
    pub memberships: Vec<String>,
    #[serde(default)]
    pub archived: bool,
}

/// Native payload tagged by the directory it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directory", rename_all = "snake_case")]
pub enum NativePayload {
    Messaging(MessagingContact),
    Cloud(CloudPerson),
}

impl NativePayload {
    /// Directory this payload belongs to.
    #[must_use]
    pub fn kind(&self) -> DirectoryKind {
        match self {
            NativePayload::Messaging(_) => DirectoryKind::Messaging,
            NativePayload::Cloud(_) => DirectoryKind::Cloud,
        }
    }

    /// An empty payload of the given directory's shape.
    #[must_use]
    pub fn empty(kind: DirectoryKind) -> Self {
        match kind {
            DirectoryKind::Messaging => NativePayload::Messaging(MessagingContact::default()),
            DirectoryKind::Cloud => NativePayload::Cloud(CloudPerson::default()),
        }
    }

    /// Whether the record is archived (soft-deleted) in its directory.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        match self {
            NativePayload::Messaging(c) => c.archived,
            NativePayload::Cloud(p) => p.archived,
        }
    }

    pub fn set_archived(&mut self, archived: bool) {
        match self {
            NativePayload::Messaging(c) => c.archived = archived,
            NativePayload::Cloud(p) => p.archived = archived,
        }
    }
}
