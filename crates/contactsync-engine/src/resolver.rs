//! Merge resolution of match groups.
//!
//! Per field:
//! - one side has a value: take it and push it to the other side;
//! - equal after normalization: nothing to do;
//! - list fields: union, messaging values first;
//! - notes: the side that changed since the last sync wins; when both
//!   changed, the fragments are concatenated with provenance markers;
//! - other scalars: last writer wins. A side whose value still equals the
//!   previous canonical value is dated by that value's provenance, so an edit
//!   always beats an untouched value. Exact ties go to the messaging side.
//!
//! Deltas compare what each directory can store against what it holds, so a
//! directory that keeps a single phone is converged when it holds the
//! canonical primary phone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use contactsync_directory::ids::{ContactId, NativeId, Revision};
use contactsync_directory::payload::SocialLink;
use contactsync_directory::record::WriteTarget;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::contact::{CanonicalContact, FieldName, FieldValue, Provenance};
use crate::mapper::FieldMapper;
use crate::matcher::{MatchCandidate, MatchGroup};
use crate::normalize;

/// What a delta does to its target record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaChange {
    Set { field: FieldName, value: FieldValue },
    SoftDelete,
}

/// A single write instruction targeting one directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub contact_id: ContactId,
    pub target: DirectoryKind,
    pub target_id: WriteTarget,
    pub change: DeltaChange,
    /// Revision the target held when the delta was computed.
    pub expected_revision: Option<Revision>,
}

impl FieldDelta {
    #[must_use]
    pub fn field(&self) -> Option<FieldName> {
        match &self.change {
            DeltaChange::Set { field, .. } => Some(*field),
            DeltaChange::SoftDelete => None,
        }
    }

    #[must_use]
    pub fn is_create(&self) -> bool {
        matches!(self.target_id, WriteTarget::Create)
    }
}

/// Summary of what resolving a group amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// A record is created in the directory that lacks one.
    Created,
    /// Existing records receive field updates.
    Updated,
    /// Both sides already agree.
    Unchanged,
    /// A deletion is propagated as an archive.
    SoftDeleted,
    /// Nothing to merge or propagate.
    Skipped,
}

/// Merged contact and the writes still needed to converge both directories.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub contact: CanonicalContact,
    pub deltas: Vec<FieldDelta>,
    pub kind: ResolutionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideState {
    Live,
    Deleted,
    /// No record and no link: a create target.
    Missing,
    /// Linked but not part of the group; left untouched.
    Unknown,
}

/// A side's value for one field with its provenance.
#[derive(Debug, Clone)]
struct SideValue {
    value: FieldValue,
    provenance: Provenance,
}

/// Computes merged contacts and deltas.
#[derive(Debug, Clone)]
pub struct MergeResolver {
    notes_separator: String,
    sync_fields: Vec<FieldName>,
}

impl Default for MergeResolver {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

impl MergeResolver {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            notes_separator: config.notes_separator.clone(),
            sync_fields: config.sync_fields.clone(),
        }
    }

    fn syncs(&self, field: FieldName) -> bool {
        self.sync_fields.is_empty() || self.sync_fields.contains(&field)
    }

    /// Merge a group against the contact it was previously merged into.
    pub fn resolve(&self, group: &MatchGroup, previous: Option<&CanonicalContact>) -> Resolution {
        let states = DirectoryKind::ALL.map(|kind| side_state(group, kind, previous));
        let state_of = |kind: DirectoryKind| states[kind_index(kind)];

        let mut contact = self.base_contact(group, previous);
        for field in FieldName::ALL {
            let prev = previous.and_then(|p| {
                p.get(field)
                    .zip(p.provenance.get(&field))
                    .map(|(v, pr)| (v.clone(), pr.clone()))
            });
            let messaging = side_value(group, DirectoryKind::Messaging, state_of(DirectoryKind::Messaging), field, previous);
            let cloud = side_value(group, DirectoryKind::Cloud, state_of(DirectoryKind::Cloud), field, previous);

            match self.merge_field(field, messaging, cloud, prev.as_ref()) {
                Some(merged) => contact.set(field, merged.value, merged.provenance),
                None => {
                    contact.fields.remove(&field);
                    contact.provenance.remove(&field);
                }
            }
        }

        let any_deleted = DirectoryKind::ALL
            .iter()
            .any(|k| state_of(*k) == SideState::Deleted);
        if any_deleted {
            contact.deleted = true;
            let deltas: Vec<FieldDelta> = DirectoryKind::ALL
                .into_iter()
                .filter(|k| state_of(*k) == SideState::Live)
                .filter_map(|k| group.side(k))
                .map(|side| FieldDelta {
                    contact_id: contact.id,
                    target: side.directory(),
                    target_id: WriteTarget::Existing(side.native_id().clone()),
                    change: DeltaChange::SoftDelete,
                    expected_revision: side.record.revision.clone(),
                })
                .collect();
            let kind = if !deltas.is_empty() || previous.is_some_and(|p| !p.deleted) {
                ResolutionKind::SoftDeleted
            } else {
                ResolutionKind::Skipped
            };
            return Resolution {
                contact,
                deltas,
                kind,
            };
        }
        contact.deleted = false;

        let mut deltas = Vec::new();
        for kind in DirectoryKind::ALL {
            match state_of(kind) {
                SideState::Live => {
                    if let Some(side) = group.side(kind) {
                        deltas.extend(self.update_deltas(&contact, side));
                    }
                }
                SideState::Missing => deltas.extend(self.create_deltas(&contact, kind)),
                SideState::Deleted | SideState::Unknown => {}
            }
        }

        let kind = if deltas.iter().any(FieldDelta::is_create) {
            ResolutionKind::Created
        } else if !deltas.is_empty() {
            ResolutionKind::Updated
        } else {
            ResolutionKind::Unchanged
        };
        Resolution {
            contact,
            deltas,
            kind,
        }
    }

    fn base_contact(&self, group: &MatchGroup, previous: Option<&CanonicalContact>) -> CanonicalContact {
        let mut contact = match previous {
            Some(p) => p.clone(),
            None => CanonicalContact {
                id: ContactId::new(),
                fields: BTreeMap::new(),
                provenance: BTreeMap::new(),
                links: BTreeMap::new(),
                deleted: false,
                updated_at: Utc::now(),
            },
        };
        if let Some(id) = group.contact_id {
            contact.id = id;
        }
        for side in group.records() {
            contact.set_link(side.directory(), side.native_id().clone(), side.record.revision.clone());
        }
        if let Some(latest) = group.records().map(|r| r.record.updated_at).max() {
            contact.updated_at = if previous.is_some() {
                contact.updated_at.max(latest)
            } else {
                latest
            };
        }
        contact
    }

    fn merge_field(
        &self,
        field: FieldName,
        messaging: Option<SideValue>,
        cloud: Option<SideValue>,
        prev: Option<&(FieldValue, Provenance)>,
    ) -> Option<SideValue> {
        let merged = match (messaging, cloud) {
            (None, None) => return None,
            (Some(only), None) | (None, Some(only)) => only,
            (Some(m), Some(c)) if normalize::values_equal(field, &m.value, &c.value) => m,
            (Some(m), Some(c)) if field.is_list() => union(field, m, c),
            (Some(m), Some(c)) if field.is_free_text() => self.merge_text(field, m, c, prev),
            (Some(m), Some(c)) => {
                if effective_time(field, &c, prev) > effective_time(field, &m, prev) {
                    c
                } else {
                    m
                }
            }
        };

        // An unchanged value keeps its original provenance.
        Some(match prev {
            Some((value, provenance)) if normalize::values_equal(field, value, &merged.value) => {
                SideValue {
                    value: merged.value,
                    provenance: provenance.clone(),
                }
            }
            _ => merged,
        })
    }

    fn merge_text(
        &self,
        field: FieldName,
        m: SideValue,
        c: SideValue,
        prev: Option<&(FieldValue, Provenance)>,
    ) -> SideValue {
        let text_m = m.value.as_text().map(normalize::text).unwrap_or_default();
        let text_c = c.value.as_text().map(normalize::text).unwrap_or_default();
        if text_m.contains(&text_c) {
            return m;
        }
        if text_c.contains(&text_m) {
            return c;
        }

        let changed = |side: &SideValue| {
            prev.map_or(true, |(value, _)| !normalize::values_equal(field, value, &side.value))
        };
        match (changed(&m), changed(&c)) {
            (true, false) => return m,
            (false, true) => return c,
            _ => {}
        }

        let (first, second) = if c.provenance.written_at < m.provenance.written_at {
            (c, m)
        } else {
            (m, c)
        };
        let combined = format!(
            "{}{}{}",
            marked_fragment(&first),
            self.notes_separator,
            marked_fragment(&second)
        );
        SideValue {
            value: FieldValue::Text(combined),
            provenance: second.provenance,
        }
    }

    fn update_deltas(&self, contact: &CanonicalContact, side: &MatchCandidate) -> Vec<FieldDelta> {
        let kind = side.directory();
        contact
            .fields
            .iter()
            .filter(|(field, _)| self.syncs(**field))
            .filter_map(|(field, value)| {
                let projected = FieldMapper::project(kind, *field, value)?;
                if projected.is_empty() {
                    return None;
                }
                let current = side.fields.get(field).filter(|v| !v.is_empty());
                if current.is_some_and(|cur| normalize::values_equal(*field, &projected, cur)) {
                    return None;
                }
                Some(FieldDelta {
                    contact_id: contact.id,
                    target: kind,
                    target_id: WriteTarget::Existing(side.native_id().clone()),
                    change: DeltaChange::Set {
                        field: *field,
                        value: projected,
                    },
                    expected_revision: side.record.revision.clone(),
                })
            })
            .collect()
    }

    fn create_deltas(&self, contact: &CanonicalContact, kind: DirectoryKind) -> Vec<FieldDelta> {
        contact
            .fields
            .iter()
            .filter(|(field, _)| self.syncs(**field))
            .filter_map(|(field, value)| {
                let projected = FieldMapper::project(kind, *field, value)?;
                (!projected.is_empty()).then(|| FieldDelta {
                    contact_id: contact.id,
                    target: kind,
                    target_id: WriteTarget::Create,
                    change: DeltaChange::Set {
                        field: *field,
                        value: projected,
                    },
                    expected_revision: None,
                })
            })
            .collect()
    }
}

fn kind_index(kind: DirectoryKind) -> usize {
    match kind {
        DirectoryKind::Messaging => 0,
        DirectoryKind::Cloud => 1,
    }
}

fn side_state(group: &MatchGroup, kind: DirectoryKind, previous: Option<&CanonicalContact>) -> SideState {
    match group.side(kind) {
        Some(side) if side.record.is_deleted() => SideState::Deleted,
        Some(_) => SideState::Live,
        None if previous.and_then(|p| p.link(kind)).is_some() => SideState::Unknown,
        None => SideState::Missing,
    }
}

fn side_value(
    group: &MatchGroup,
    kind: DirectoryKind,
    state: SideState,
    field: FieldName,
    previous: Option<&CanonicalContact>,
) -> Option<SideValue> {
    match state {
        SideState::Live | SideState::Deleted => {
            let side = group.side(kind)?;
            let value = side.fields.get(&field).filter(|v| !v.is_empty())?;
            Some(SideValue {
                value: value.clone(),
                provenance: Provenance {
                    directory: kind,
                    revision: side.record.revision.clone(),
                    written_at: side.record.updated_at,
                },
            })
        }
        SideState::Unknown => {
            let prev = previous?;
            let value = prev.get(field)?;
            let provenance = prev.provenance.get(&field)?;
            Some(SideValue {
                value: FieldMapper::project(kind, field, value)?,
                provenance: provenance.clone(),
            })
        }
        SideState::Missing => None,
    }
}

/// When a side's value was last written.
fn effective_time(
    field: FieldName,
    side: &SideValue,
    prev: Option<&(FieldValue, Provenance)>,
) -> DateTime<Utc> {
    match prev {
        Some((value, provenance)) if normalize::values_equal(field, value, &side.value) => {
            provenance.written_at.min(side.provenance.written_at)
        }
        _ => side.provenance.written_at,
    }
}

fn union(field: FieldName, m: SideValue, c: SideValue) -> SideValue {
    let value = match (&m.value, &c.value) {
        (FieldValue::List(a), FieldValue::List(b)) => {
            let mut seen = Vec::new();
            let mut out = Vec::new();
            for item in a.iter().chain(b.iter()) {
                let key = normalize::list_key(field, item);
                if !seen.contains(&key) {
                    seen.push(key);
                    out.push(item.clone());
                }
            }
            FieldValue::List(out)
        }
        (FieldValue::Links(a), FieldValue::Links(b)) => {
            let mut seen = Vec::new();
            let mut out: Vec<SocialLink> = Vec::new();
            for link in a.iter().chain(b.iter()) {
                let key = normalize::url(&link.url);
                if !seen.contains(&key) {
                    seen.push(key);
                    out.push(link.clone());
                }
            }
            FieldValue::Links(out)
        }
        _ => m.value.clone(),
    };

    let provenance = if normalize::values_equal(field, &value, &c.value) {
        c.provenance
    } else if normalize::values_equal(field, &value, &m.value)
        || m.provenance.written_at >= c.provenance.written_at
    {
        m.provenance
    } else {
        c.provenance
    };
    SideValue { value, provenance }
}

fn marked_fragment(side: &SideValue) -> String {
    format!(
        "[{} {}] {}",
        side.provenance.directory,
        side.provenance.written_at.format("%Y-%m-%d %H:%M"),
        side.value.as_text().unwrap_or_default().trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchSignal;
    use chrono::TimeZone;
    use contactsync_directory::payload::{
        CloudBiography, CloudName, CloudOrganization, CloudPerson, CloudValue, MessagingContact,
        NativePayload,
    };
    use contactsync_directory::record::DirectoryRecord;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap()
    }

    fn candidate(id: &str, payload: NativePayload, updated: DateTime<Utc>) -> MatchCandidate {
        let record = DirectoryRecord::new(id, Revision::new("5"), payload, updated);
        let fields = FieldMapper::new().fields(record.payload.as_ref().unwrap()).unwrap();
        MatchCandidate::new(record, fields)
    }

    fn pair(m: MatchCandidate, c: MatchCandidate) -> MatchGroup {
        MatchGroup {
            messaging: Some(m),
            cloud: Some(c),
            signal: Some(MatchSignal::Phone),
            contact_id: None,
        }
    }

    fn jane_messaging(notes: Option<&str>, updated: DateTime<Utc>) -> MatchCandidate {
        candidate(
            "m1",
            NativePayload::Messaging(MessagingContact {
                first_name: Some("Jane".into()),
                last_name: Some("Doe".into()),
                phone: Some("+15551230000".into()),
                notes: notes.map(str::to_string),
                ..Default::default()
            }),
            updated,
        )
    }

    fn jane_cloud(name: &str, notes: Option<&str>, updated: DateTime<Utc>) -> MatchCandidate {
        candidate(
            "people/c1",
            NativePayload::Cloud(CloudPerson {
                names: vec![CloudName {
                    display_name: name.into(),
                    primary: true,
                }],
                phone_numbers: vec![CloudValue::new("+15551230000").primary()],
                organizations: vec![CloudOrganization {
                    name: Some("Acme".into()),
                    title: None,
                    primary: true,
                }],
                biographies: notes
                    .map(|n| CloudBiography {
                        value: n.into(),
                        primary: true,
                    })
                    .into_iter()
                    .collect(),
                ..Default::default()
            }),
            updated,
        )
    }

    fn set_deltas(resolution: &Resolution, target: DirectoryKind) -> Vec<(FieldName, FieldValue)> {
        resolution
            .deltas
            .iter()
            .filter(|d| d.target == target)
            .filter_map(|d| match &d.change {
                DeltaChange::Set { field, value } => Some((*field, value.clone())),
                DeltaChange::SoftDelete => None,
            })
            .collect()
    }

    #[test]
    fn test_one_sided_value_propagates() {
        let resolver = MergeResolver::default();
        let group = pair(jane_messaging(None, at(0)), jane_cloud("J. Doe", None, at(1)));
        let resolution = resolver.resolve(&group, None);

        assert_eq!(
            resolution.contact.get(FieldName::Organization),
            Some(&FieldValue::Text("Acme".into()))
        );
        let to_messaging = set_deltas(&resolution, DirectoryKind::Messaging);
        assert!(to_messaging.contains(&(FieldName::Organization, FieldValue::Text("Acme".into()))));
        let org_delta = resolution
            .deltas
            .iter()
            .find(|d| d.field() == Some(FieldName::Organization))
            .unwrap();
        assert_eq!(org_delta.expected_revision, Some(Revision::new("5")));
        assert_eq!(org_delta.target_id, WriteTarget::Existing(NativeId::new("m1")));
        assert_eq!(resolution.kind, ResolutionKind::Updated);
    }

    #[test]
    fn test_last_writer_wins_for_scalars() {
        let resolver = MergeResolver::default();
        // Cloud edited later: its name wins and is pushed to messaging.
        let group = pair(jane_messaging(None, at(0)), jane_cloud("J. Doe", None, at(1)));
        let resolution = resolver.resolve(&group, None);
        assert_eq!(
            resolution.contact.get(FieldName::Name),
            Some(&FieldValue::Text("J. Doe".into()))
        );
        assert!(set_deltas(&resolution, DirectoryKind::Messaging)
            .iter()
            .any(|(f, _)| *f == FieldName::Name));
    }

    #[test]
    fn test_untouched_value_loses_to_edit() {
        let resolver = MergeResolver::default();
        // Previous canonical name came from both sides long ago; messaging
        // renamed, cloud is older but untouched.
        let previous_group = pair(jane_messaging(None, at(0)), jane_cloud("Jane Doe", None, at(0)));
        let previous = resolver.resolve(&previous_group, None).contact;

        let renamed = candidate(
            "m1",
            NativePayload::Messaging(MessagingContact {
                first_name: Some("Janet".into()),
                last_name: Some("Doe".into()),
                phone: Some("+15551230000".into()),
                ..Default::default()
            }),
            at(10),
        );
        // Cloud saw an unrelated change after the rename.
        let cloud = jane_cloud("Jane Doe", None, at(20));
        let mut group = pair(renamed, cloud);
        group.contact_id = Some(previous.id);

        let resolution = resolver.resolve(&group, Some(&previous));
        assert_eq!(
            resolution.contact.get(FieldName::Name),
            Some(&FieldValue::Text("Janet Doe".into()))
        );
        assert_eq!(resolution.contact.id, previous.id);
    }

    #[test]
    fn test_lww_tie_goes_to_messaging() {
        let resolver = MergeResolver::default();
        let group = pair(jane_messaging(None, at(5)), jane_cloud("J. Doe", None, at(5)));
        let resolution = resolver.resolve(&group, None);
        assert_eq!(
            resolution.contact.get(FieldName::Name),
            Some(&FieldValue::Text("Jane Doe".into()))
        );
    }

    #[test]
    fn test_lists_are_unioned() {
        let resolver = MergeResolver::default();
        let mut m = jane_messaging(None, at(0));
        m.fields.insert(
            FieldName::Tags,
            FieldValue::List(vec!["friends".into(), "work".into()]),
        );
        let mut c = jane_cloud("Jane Doe", None, at(1));
        c.fields.insert(
            FieldName::Tags,
            FieldValue::List(vec!["Work".into(), "climbing".into()]),
        );
        let resolution = resolver.resolve(&pair(m, c), None);
        assert_eq!(
            resolution.contact.get(FieldName::Tags),
            Some(&FieldValue::List(vec![
                "friends".into(),
                "work".into(),
                "climbing".into()
            ]))
        );
        assert_eq!(
            set_deltas(&resolution, DirectoryKind::Messaging)
                .iter()
                .filter(|(f, _)| *f == FieldName::Tags)
                .count(),
            1
        );
        assert_eq!(
            set_deltas(&resolution, DirectoryKind::Cloud)
                .iter()
                .filter(|(f, _)| *f == FieldName::Tags)
                .count(),
            1
        );
    }

    #[test]
    fn test_single_valued_target_converged_on_primary() {
        let resolver = MergeResolver::default();
        let m = jane_messaging(None, at(0));
        let mut c = jane_cloud("Jane Doe", None, at(0));
        c.fields.insert(
            FieldName::Phones,
            FieldValue::List(vec!["+15551230000".into(), "+15550009999".into()]),
        );
        let resolution = resolver.resolve(&pair(m, c), None);
        assert!(!set_deltas(&resolution, DirectoryKind::Messaging)
            .iter()
            .any(|(f, _)| *f == FieldName::Phones));
        assert!(!set_deltas(&resolution, DirectoryKind::Cloud)
            .iter()
            .any(|(f, _)| *f == FieldName::Phones));
    }

    #[test]
    fn test_notes_concatenated_when_both_changed() {
        let resolver = MergeResolver::default();
        let previous_group = pair(
            jane_messaging(Some("Met at RustConf"), at(0)),
            jane_cloud("Jane Doe", Some("Met at RustConf"), at(0)),
        );
        let previous = resolver.resolve(&previous_group, None).contact;

        let mut group = pair(
            jane_messaging(Some("Likes climbing"), at(10)),
            jane_cloud("Jane Doe", Some("Prefers email"), at(12)),
        );
        group.contact_id = Some(previous.id);
        let resolution = resolver.resolve(&group, Some(&previous));

        let notes = resolution
            .contact
            .get(FieldName::Notes)
            .and_then(FieldValue::as_text)
            .unwrap()
            .to_string();
        assert!(notes.contains("[messaging 2026-03-01 09:10] Likes climbing"));
        assert!(notes.contains("[cloud 2026-03-01 09:12] Prefers email"));
        assert!(notes.contains("\n---\n"));
        assert!(set_deltas(&resolution, DirectoryKind::Messaging)
            .contains(&(FieldName::Notes, FieldValue::Text(notes.clone()))));
        assert!(set_deltas(&resolution, DirectoryKind::Cloud)
            .contains(&(FieldName::Notes, FieldValue::Text(notes))));
    }

    #[test]
    fn test_notes_superset_wins() {
        let resolver = MergeResolver::default();
        let group = pair(
            jane_messaging(Some("Met at RustConf"), at(0)),
            jane_cloud("Jane Doe", Some("Met at RustConf. Follow up in May"), at(0)),
        );
        let resolution = resolver.resolve(&group, None);
        assert_eq!(
            resolution.contact.get(FieldName::Notes),
            Some(&FieldValue::Text("Met at RustConf. Follow up in May".into()))
        );
    }

    #[test]
    fn test_notes_single_edit_is_taken() {
        let resolver = MergeResolver::default();
        let previous = resolver
            .resolve(
                &pair(
                    jane_messaging(Some("old"), at(0)),
                    jane_cloud("Jane Doe", Some("old"), at(0)),
                ),
                None,
            )
            .contact;
        let resolution = resolver.resolve(
            &pair(
                jane_messaging(Some("new words"), at(3)),
                jane_cloud("Jane Doe", Some("old"), at(0)),
            ),
            Some(&previous),
        );
        assert_eq!(
            resolution.contact.get(FieldName::Notes),
            Some(&FieldValue::Text("new words".into()))
        );
    }

    #[test]
    fn test_missing_side_is_created() {
        let resolver = MergeResolver::default();
        let group = MatchGroup {
            messaging: None,
            cloud: Some(jane_cloud("Jane Doe", None, at(0))),
            signal: None,
            contact_id: None,
        };
        let resolution = resolver.resolve(&group, None);
        assert_eq!(resolution.kind, ResolutionKind::Created);
        assert!(resolution
            .deltas
            .iter()
            .all(|d| d.target == DirectoryKind::Messaging && d.is_create()));
        assert!(resolution.contact.validate().is_ok());
    }

    #[test]
    fn test_converged_pair_is_unchanged() {
        let resolver = MergeResolver::default();
        let mut m = jane_messaging(None, at(0));
        m.fields
            .insert(FieldName::Organization, FieldValue::Text("Acme".into()));
        let group = pair(m, jane_cloud("Jane Doe", None, at(0)));
        let resolution = resolver.resolve(&group, None);
        assert!(resolution.deltas.is_empty());
        assert_eq!(resolution.kind, ResolutionKind::Unchanged);
    }

    #[test]
    fn test_tombstone_soft_deletes_other_side() {
        let resolver = MergeResolver::default();
        let previous = resolver
            .resolve(&pair(jane_messaging(None, at(0)), jane_cloud("Jane Doe", None, at(0))), None)
            .contact;
        let tombstone = MatchCandidate::new(
            DirectoryRecord::tombstone(DirectoryKind::Messaging, "m1", at(9)),
            Default::default(),
        );
        let mut group = pair(tombstone, jane_cloud("Jane Doe", None, at(0)));
        group.contact_id = Some(previous.id);

        let resolution = resolver.resolve(&group, Some(&previous));
        assert_eq!(resolution.kind, ResolutionKind::SoftDeleted);
        assert!(resolution.contact.deleted);
        assert_eq!(resolution.deltas.len(), 1);
        assert_eq!(resolution.deltas[0].change, DeltaChange::SoftDelete);
        assert_eq!(resolution.deltas[0].target, DirectoryKind::Cloud);
        // Field values survive the deletion.
        assert!(resolution.contact.get(FieldName::Phones).is_some());
    }

    #[test]
    fn test_sync_fields_filter_outbound_only() {
        let config = SyncConfig {
            sync_fields: vec![FieldName::Name],
            ..Default::default()
        };
        let resolver = MergeResolver::new(&config);
        let group = pair(jane_messaging(None, at(0)), jane_cloud("J. Doe", None, at(1)));
        let resolution = resolver.resolve(&group, None);
        assert!(resolution.contact.get(FieldName::Organization).is_some());
        assert!(resolution
            .deltas
            .iter()
            .all(|d| d.field() == Some(FieldName::Name)));
    }

    #[test]
    fn test_job_title_never_sent_to_messaging() {
        let resolver = MergeResolver::default();
        let mut c = jane_cloud("Jane Doe", None, at(0));
        c.fields
            .insert(FieldName::JobTitle, FieldValue::Text("CTO".into()));
        let resolution = resolver.resolve(&pair(jane_messaging(None, at(0)), c), None);
        assert!(resolution.contact.get(FieldName::JobTitle).is_some());
        assert!(!set_deltas(&resolution, DirectoryKind::Messaging)
            .iter()
            .any(|(f, _)| *f == FieldName::JobTitle));
    }
}
