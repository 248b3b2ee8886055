//! Field mapping between native payloads and the canonical contact.
//!
//! Inbound mapping keeps every value the source holds. Outbound mapping drops
//! fields the target directory cannot store and truncates list fields the
//! target only stores once.
//!
//! Name, organization, job title and notes are single-valued in canonical
//! form. A cloud person's primary entry supplies them; other entries stay in
//! the native record, because outbound writes overlay the last read payload
//! and only touch the primary entry.

use std::collections::BTreeMap;

use contactsync_directory::payload::{
    CloudBiography, CloudName, CloudOrganization, CloudPerson, CloudUrl, CloudValue,
    MessagingContact, NativePayload, SocialLink,
};
use contactsync_directory::record::DirectoryRecord;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contact::{CanonicalContact, FieldName, FieldValue, Provenance};
use crate::error::SchemaError;
use crate::normalize;

/// Platform label under which the messaging username travels as a link.
pub const MESSAGING_HANDLE_PLATFORM: &str = "messaging";

/// How many values of a canonical field a directory can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCapacity {
    Unsupported,
    Single,
    Multi,
}

/// Canonical field values keyed by field.
pub type FieldMap = BTreeMap<FieldName, FieldValue>;

/// Translates native payloads to canonical form and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapper;

impl FieldMapper {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Capacity of `kind` for `field`.
    #[must_use]
    pub fn capacity(kind: DirectoryKind, field: FieldName) -> FieldCapacity {
        match (kind, field) {
            (DirectoryKind::Messaging, FieldName::JobTitle) => FieldCapacity::Unsupported,
            (DirectoryKind::Messaging, FieldName::Phones | FieldName::Emails) => {
                FieldCapacity::Single
            }
            (_, FieldName::SocialLinks | FieldName::Tags) => FieldCapacity::Multi,
            (DirectoryKind::Cloud, FieldName::Phones | FieldName::Emails) => FieldCapacity::Multi,
            _ => FieldCapacity::Single,
        }
    }

    /// The part of `value` that `kind` can store, or `None` if unsupported.
    ///
    /// The messaging directory keeps one username, so its links project to
    /// the first messaging handle followed by every other link.
    #[must_use]
    pub fn project(kind: DirectoryKind, field: FieldName, value: &FieldValue) -> Option<FieldValue> {
        if let (DirectoryKind::Messaging, FieldName::SocialLinks, FieldValue::Links(links)) =
            (kind, field, value)
        {
            return Some(FieldValue::Links(single_handle(links)));
        }
        match Self::capacity(kind, field) {
            FieldCapacity::Unsupported => None,
            FieldCapacity::Single => Some(value.first_only()),
            FieldCapacity::Multi => Some(value.clone()),
        }
    }

    /// Map a directory record to a new canonical contact.
    ///
    /// Every field is attributed to the record's directory and revision.
    pub fn to_canonical(&self, record: &DirectoryRecord) -> Result<CanonicalContact, SchemaError> {
        let mut contact = CanonicalContact::from_source(
            record.directory,
            record.native_id.clone(),
            record.revision.clone(),
        );
        contact.updated_at = record.updated_at;
        let Some(payload) = &record.payload else {
            contact.deleted = true;
            return Ok(contact);
        };
        if payload.kind() != record.directory {
            return Err(SchemaError::new(
                "directory",
                format!(
                    "{} payload in a {} record",
                    payload.kind(),
                    record.directory
                ),
            ));
        }

        let provenance = Provenance {
            directory: record.directory,
            revision: record.revision.clone(),
            written_at: record.updated_at,
        };
        for (field, value) in self.fields(payload)? {
            contact.set(field, value, provenance.clone());
        }
        contact.deleted = payload.is_archived();
        Ok(contact)
    }

    /// Canonical field values held by a native payload.
    pub fn fields(&self, payload: &NativePayload) -> Result<FieldMap, SchemaError> {
        match payload {
            NativePayload::Messaging(c) => messaging_fields(c),
            NativePayload::Cloud(p) => cloud_fields(p),
        }
    }

    /// Full native payload of `kind` for a canonical contact.
    #[must_use]
    pub fn from_canonical(&self, contact: &CanonicalContact, kind: DirectoryKind) -> NativePayload {
        let changes: Vec<(FieldName, FieldValue)> = contact
            .fields
            .iter()
            .filter_map(|(field, value)| Self::project(kind, *field, value).map(|v| (*field, v)))
            .collect();
        let mut payload = self.apply(None, kind, &changes);
        payload.set_archived(contact.deleted);
        payload
    }

    /// Overlay canonical field values onto `base` (or an empty payload).
    ///
    /// Native details the canonical form does not model, such as value type
    /// labels and non-primary entries, are kept from `base`.
    #[must_use]
    pub fn apply(
        &self,
        base: Option<&NativePayload>,
        kind: DirectoryKind,
        changes: &[(FieldName, FieldValue)],
    ) -> NativePayload {
        let mut payload = base
            .filter(|b| b.kind() == kind)
            .cloned()
            .unwrap_or_else(|| NativePayload::empty(kind));
        for (field, value) in changes {
            let Some(value) = Self::project(kind, *field, value) else {
                continue;
            };
            match &mut payload {
                NativePayload::Messaging(c) => apply_messaging(c, *field, &value),
                NativePayload::Cloud(p) => apply_cloud(p, *field, &value),
            }
        }
        payload
    }
}

/// First messaging handle, then the non-handle links in their order.
fn single_handle(links: &[SocialLink]) -> Vec<SocialLink> {
    let (handles, others): (Vec<&SocialLink>, Vec<&SocialLink>) = links
        .iter()
        .partition(|l| l.platform == MESSAGING_HANDLE_PLATFORM);
    handles
        .into_iter()
        .take(1)
        .chain(others)
        .cloned()
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn text_value(value: &FieldValue) -> Option<String> {
    value.as_text().and_then(|s| non_empty(Some(s)))
}

fn list_value(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::List(items) => items.clone(),
        FieldValue::Text(s) => non_empty(Some(s.as_str())).into_iter().collect(),
        FieldValue::Links(links) => links.iter().map(|l| l.url.clone()).collect(),
    }
}

fn validated_phone(field: &str, raw: &str) -> Result<String, SchemaError> {
    normalize::phone(raw)
        .map(|_| raw.trim().to_string())
        .ok_or_else(|| SchemaError::new(field, format!("'{raw}' is not a phone number")))
}

fn validated_email(field: &str, raw: &str) -> Result<String, SchemaError> {
    normalize::email(raw)
        .map(|_| raw.trim().to_string())
        .ok_or_else(|| SchemaError::new(field, format!("'{raw}' is not an email address")))
}

fn validated_link(field: &str, link: &SocialLink) -> Result<SocialLink, SchemaError> {
    let url = link.url.trim();
    if url.is_empty() {
        return Err(SchemaError::new(field, "link without url"));
    }
    let platform = non_empty(Some(link.platform.as_str())).unwrap_or_else(|| "website".to_string());
    Ok(SocialLink::new(platform, url))
}

fn insert_text(fields: &mut FieldMap, field: FieldName, value: Option<String>) {
    if let Some(v) = value {
        fields.insert(field, FieldValue::Text(v));
    }
}

fn insert_list(fields: &mut FieldMap, field: FieldName, values: Vec<String>) {
    if !values.is_empty() {
        fields.insert(field, FieldValue::List(values));
    }
}

fn messaging_fields(c: &MessagingContact) -> Result<FieldMap, SchemaError> {
    let mut fields = FieldMap::new();

    let full_name = [non_empty(c.first_name.as_deref()), non_empty(c.last_name.as_deref())]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    insert_text(&mut fields, FieldName::Name, non_empty(Some(full_name.as_str())));

    let phones = match non_empty(c.phone.as_deref()) {
        Some(p) => vec![validated_phone("phone", &p)?],
        None => Vec::new(),
    };
    insert_list(&mut fields, FieldName::Phones, phones);

    let emails = match non_empty(c.email.as_deref()) {
        Some(e) => vec![validated_email("email", &e)?],
        None => Vec::new(),
    };
    insert_list(&mut fields, FieldName::Emails, emails);

    insert_text(&mut fields, FieldName::Organization, non_empty(c.company.as_deref()));
    insert_text(&mut fields, FieldName::Notes, non_empty(c.notes.as_deref()));

    let mut links = Vec::new();
    if let Some(username) = non_empty(c.username.as_deref()) {
        let handle = if username.starts_with('@') {
            username
        } else {
            format!("@{username}")
        };
        links.push(SocialLink::new(MESSAGING_HANDLE_PLATFORM, handle));
    }
    for link in &c.social_links {
        links.push(validated_link("social_links", link)?);
    }
    if !links.is_empty() {
        fields.insert(FieldName::SocialLinks, FieldValue::Links(links));
    }

    let tags: Vec<String> = c.tags.iter().filter_map(|t| non_empty(Some(t.as_str()))).collect();
    insert_list(&mut fields, FieldName::Tags, tags);

    Ok(fields)
}

/// Primary entry first, remaining entries in native order.
fn primary_first<T>(entries: &[T], is_primary: impl Fn(&T) -> bool) -> Vec<&T> {
    let mut ordered: Vec<&T> = entries.iter().filter(|e| is_primary(e)).collect();
    ordered.extend(entries.iter().filter(|e| !is_primary(e)));
    ordered
}

fn cloud_fields(p: &CloudPerson) -> Result<FieldMap, SchemaError> {
    let mut fields = FieldMap::new();

    let secondary = |count: usize| count.saturating_sub(1);
    if p.names.len() > 1 || p.organizations.len() > 1 || p.biographies.len() > 1 {
        debug!(
            names = secondary(p.names.len()),
            organizations = secondary(p.organizations.len()),
            biographies = secondary(p.biographies.len()),
            "Non-primary cloud entries left in the native record"
        );
    }

    let name = primary_first(&p.names, |n| n.primary)
        .into_iter()
        .find_map(|n| non_empty(Some(n.display_name.as_str())));
    insert_text(&mut fields, FieldName::Name, name);

    let mut phones = Vec::new();
    for entry in primary_first(&p.phone_numbers, |v| v.primary) {
        if let Some(raw) = non_empty(Some(entry.value.as_str())) {
            phones.push(validated_phone("phoneNumbers", &raw)?);
        }
    }
    insert_list(&mut fields, FieldName::Phones, phones);

    let mut emails = Vec::new();
    for entry in primary_first(&p.email_addresses, |v| v.primary) {
        if let Some(raw) = non_empty(Some(entry.value.as_str())) {
            emails.push(validated_email("emailAddresses", &raw)?);
        }
    }
    insert_list(&mut fields, FieldName::Emails, emails);

    if let Some(org) = primary_first(&p.organizations, |o| o.primary).first() {
        insert_text(&mut fields, FieldName::Organization, non_empty(org.name.as_deref()));
        insert_text(&mut fields, FieldName::JobTitle, non_empty(org.title.as_deref()));
    }

    let bio = primary_first(&p.biographies, |b| b.primary)
        .into_iter()
        .find_map(|b| non_empty(Some(b.value.as_str())));
    insert_text(&mut fields, FieldName::Notes, bio);

    let mut links = Vec::new();
    for url in &p.urls {
        let link = SocialLink::new(url.kind.clone().unwrap_or_default(), url.value.clone());
        links.push(validated_link("urls", &link)?);
    }
    if !links.is_empty() {
        fields.insert(FieldName::SocialLinks, FieldValue::Links(links));
    }

    let tags: Vec<String> = p
        .memberships
        .iter()
        .filter_map(|t| non_empty(Some(t.as_str())))
        .collect();
    insert_list(&mut fields, FieldName::Tags, tags);

    Ok(fields)
}

fn apply_messaging(c: &mut MessagingContact, field: FieldName, value: &FieldValue) {
    match field {
        FieldName::Name => {
            let full = text_value(value).unwrap_or_default();
            let mut parts = full.splitn(2, ' ');
            c.first_name = non_empty(parts.next());
            c.last_name = non_empty(parts.next());
        }
        FieldName::Phones => c.phone = list_value(value).into_iter().next(),
        FieldName::Emails => c.email = list_value(value).into_iter().next(),
        FieldName::Organization => c.company = text_value(value),
        FieldName::Notes => c.notes = text_value(value),
        FieldName::SocialLinks => {
            let FieldValue::Links(links) = value else {
                return;
            };
            let (handles, others): (Vec<&SocialLink>, Vec<&SocialLink>) = links
                .iter()
                .partition(|l| l.platform == MESSAGING_HANDLE_PLATFORM);
            if let Some(handle) = handles.first() {
                c.username = Some(handle.url.trim_start_matches('@').to_string());
            }
            c.social_links = others.into_iter().cloned().collect();
        }
        FieldName::Tags => c.tags = list_value(value),
        FieldName::JobTitle => {}
    }
}

/// Rebuild a cloud value list, keeping type labels of surviving entries.
fn rebuild_values(existing: &[CloudValue], values: Vec<String>, field: FieldName) -> Vec<CloudValue> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let key = normalize::list_key(field, &value);
            let kind = existing
                .iter()
                .find(|e| normalize::list_key(field, &e.value) == key)
                .and_then(|e| e.kind.clone());
            CloudValue {
                value,
                kind,
                primary: i == 0,
            }
        })
        .collect()
}

fn primary_index(flags: impl Iterator<Item = bool>) -> Option<usize> {
    let flags: Vec<bool> = flags.collect();
    flags
        .iter()
        .position(|p| *p)
        .or(if flags.is_empty() { None } else { Some(0) })
}

fn apply_cloud(p: &mut CloudPerson, field: FieldName, value: &FieldValue) {
    match field {
        FieldName::Name => {
            let Some(name) = text_value(value) else {
                return;
            };
            match primary_index(p.names.iter().map(|n| n.primary)) {
                Some(i) => p.names[i].display_name = name,
                None => p.names.push(CloudName {
                    display_name: name,
                    primary: true,
                }),
            }
        }
        FieldName::Phones => {
            p.phone_numbers = rebuild_values(&p.phone_numbers, list_value(value), field);
        }
        FieldName::Emails => {
            p.email_addresses = rebuild_values(&p.email_addresses, list_value(value), field);
        }
        FieldName::Organization | FieldName::JobTitle => {
            let text = text_value(value);
            let index = match primary_index(p.organizations.iter().map(|o| o.primary)) {
                Some(i) => i,
                None => {
                    p.organizations.push(CloudOrganization {
                        primary: true,
                        ..Default::default()
                    });
                    p.organizations.len() - 1
                }
            };
            let org = &mut p.organizations[index];
            if field == FieldName::Organization {
                org.name = text;
            } else {
                org.title = text;
            }
        }
        FieldName::Notes => {
            let Some(text) = text_value(value) else {
                return;
            };
            match primary_index(p.biographies.iter().map(|b| b.primary)) {
                Some(i) => p.biographies[i].value = text,
                None => p.biographies.push(CloudBiography {
                    value: text,
                    primary: true,
                }),
            }
        }
        FieldName::SocialLinks => {
            let FieldValue::Links(links) = value else {
                return;
            };
            p.urls = links
                .iter()
                .map(|l| CloudUrl {
                    value: l.url.clone(),
                    kind: non_empty(Some(l.platform.as_str())),
                })
                .collect();
        }
        FieldName::Tags => p.memberships = list_value(value),
    }
}
