//! Identity matching across the two directories.
//!
//! Records are paired in priority order: an existing cross-directory link,
//! then a shared normalized phone number, then a shared normalized email,
//! then a fuzzy name match backed by a secondary signal. Within one signal
//! level a pair is formed only when each record is the other's unique best
//! candidate (ties broken by most recent update). Remaining ties are reported
//! as conflicts and never merged automatically.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use contactsync_directory::ids::{ContactId, NativeId};
use contactsync_directory::record::DirectoryRecord;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contact::{FieldName, FieldValue};
use crate::fuzzy::NameScorer;
use crate::mapper::FieldMap;
use crate::normalize;

/// Existing canonical link of a detected record.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateLink {
    pub contact_id: ContactId,
    /// Native ID the same contact has in the other directory, if any.
    pub counterpart: Option<NativeId>,
}

/// A directory record offered to the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub record: DirectoryRecord,
    /// Canonical fields mapped from the record; empty for tombstones.
    pub fields: FieldMap,
    pub link: Option<CandidateLink>,
}

impl MatchCandidate {
    #[must_use]
    pub fn new(record: DirectoryRecord, fields: FieldMap) -> Self {
        Self {
            record,
            fields,
            link: None,
        }
    }

    #[must_use]
    pub fn with_link(mut self, contact_id: ContactId, counterpart: Option<NativeId>) -> Self {
        self.link = Some(CandidateLink {
            contact_id,
            counterpart,
        });
        self
    }

    #[must_use]
    pub fn directory(&self) -> DirectoryKind {
        self.record.directory
    }

    #[must_use]
    pub fn native_id(&self) -> &NativeId {
        &self.record.native_id
    }

    fn linked_contact(&self) -> Option<ContactId> {
        self.link.as_ref().map(|l| l.contact_id)
    }

    /// Unlinked or linked to a contact that has no record on the other side.
    fn open_for_signals(&self) -> bool {
        !self.record.is_deleted() && self.link.as_ref().map_or(true, |l| l.counterpart.is_none())
    }
}

/// Evidence that two records represent the same person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchSignal {
    Link,
    Phone,
    Email,
    Fuzzy { score: f64 },
}

impl MatchSignal {
    /// Higher is stronger.
    #[must_use]
    pub fn strength(&self) -> u8 {
        match self {
            MatchSignal::Link => 4,
            MatchSignal::Phone => 3,
            MatchSignal::Email => 2,
            MatchSignal::Fuzzy { .. } => 1,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSignal::Link => "link",
            MatchSignal::Phone => "phone",
            MatchSignal::Email => "email",
            MatchSignal::Fuzzy { .. } => "fuzzy",
        }
    }
}

/// At most one record per directory believed to be the same person.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchGroup {
    pub messaging: Option<MatchCandidate>,
    pub cloud: Option<MatchCandidate>,
    /// `None` for singletons.
    pub signal: Option<MatchSignal>,
    /// Canonical contact the group already belongs to.
    pub contact_id: Option<ContactId>,
}

impl MatchGroup {
    fn singleton(candidate: MatchCandidate) -> Self {
        let contact_id = candidate.linked_contact();
        let (messaging, cloud) = match candidate.directory() {
            DirectoryKind::Messaging => (Some(candidate), None),
            DirectoryKind::Cloud => (None, Some(candidate)),
        };
        Self {
            messaging,
            cloud,
            signal: None,
            contact_id,
        }
    }

    #[must_use]
    pub fn side(&self, kind: DirectoryKind) -> Option<&MatchCandidate> {
        match kind {
            DirectoryKind::Messaging => self.messaging.as_ref(),
            DirectoryKind::Cloud => self.cloud.as_ref(),
        }
    }

    #[must_use]
    pub fn is_pair(&self) -> bool {
        self.messaging.is_some() && self.cloud.is_some()
    }

    pub fn records(&self) -> impl Iterator<Item = &MatchCandidate> {
        self.messaging.iter().chain(self.cloud.iter())
    }
}

/// An ambiguous identity held back for manual review.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictingMatch {
    /// Every record involved in the tie.
    pub records: Vec<MatchCandidate>,
    pub signal: MatchSignal,
    pub reason: String,
}

/// Output of one matching pass.
///
/// Every input record appears exactly once, either in a group or in a
/// conflict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub groups: Vec<MatchGroup>,
    pub conflicts: Vec<ConflictingMatch>,
}

impl MatchOutcome {
    /// All `(directory, native id)` pairs in the outcome, with repeats.
    #[must_use]
    pub fn record_keys(&self) -> Vec<(DirectoryKind, NativeId)> {
        self.groups
            .iter()
            .flat_map(MatchGroup::records)
            .chain(self.conflicts.iter().flat_map(|c| c.records.iter()))
            .map(|c| (c.directory(), c.native_id().clone()))
            .collect()
    }
}

/// Matching features extracted once per record.
struct Features {
    phones: BTreeSet<String>,
    partial_phones: BTreeSet<String>,
    emails: BTreeSet<String>,
    name: Option<String>,
    organization: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Features {
    fn of(candidate: &MatchCandidate) -> Self {
        let list = |field: FieldName| -> Vec<String> {
            match candidate.fields.get(&field) {
                Some(FieldValue::List(items)) => items.clone(),
                _ => Vec::new(),
            }
        };
        let text = |field: FieldName| candidate.fields.get(&field).and_then(FieldValue::as_text);

        let phones: BTreeSet<String> = list(FieldName::Phones)
            .iter()
            .filter_map(|p| normalize::phone(p))
            .collect();
        let partial_phones = phones.iter().map(|p| normalize::partial_phone(p)).collect();
        let emails = list(FieldName::Emails)
            .iter()
            .filter_map(|e| normalize::email(e))
            .collect();

        Self {
            phones,
            partial_phones,
            emails,
            name: text(FieldName::Name).map(str::to_string),
            organization: text(FieldName::Organization)
                .map(normalize::name)
                .filter(|o| !o.is_empty()),
            updated_at: candidate.record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    a: usize,
    b: usize,
    signal: MatchSignal,
}

impl Edge {
    fn score(&self) -> f64 {
        match self.signal {
            MatchSignal::Fuzzy { score } => score,
            _ => 1.0,
        }
    }
}

/// Pairs messaging records with cloud records.
#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    scorer: NameScorer,
    /// Minimum name similarity for a fuzzy match.
    threshold: f64,
}

impl IdentityMatcher {
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            scorer: NameScorer::new(),
            threshold,
        }
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: NameScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Partition the candidates into match groups and conflicts.
    pub fn match_records(
        &self,
        messaging: Vec<MatchCandidate>,
        cloud: Vec<MatchCandidate>,
    ) -> MatchOutcome {
        let mut a_slots: Vec<Option<MatchCandidate>> = messaging.into_iter().map(Some).collect();
        let mut b_slots: Vec<Option<MatchCandidate>> = cloud.into_iter().map(Some).collect();
        let mut outcome = MatchOutcome::default();

        self.pair_by_link(&mut a_slots, &mut b_slots, &mut outcome);

        let a_features: Vec<Option<Features>> = a_slots
            .iter()
            .map(|s| s.as_ref().filter(|c| c.open_for_signals()).map(Features::of))
            .collect();
        let b_features: Vec<Option<Features>> = b_slots
            .iter()
            .map(|s| s.as_ref().filter(|c| c.open_for_signals()).map(Features::of))
            .collect();

        let edges = self.signal_edges(&a_slots, &b_slots, &a_features, &b_features);
        for strength in [
            MatchSignal::Phone.strength(),
            MatchSignal::Email.strength(),
            MatchSignal::Fuzzy { score: 0.0 }.strength(),
        ] {
            let level: Vec<Edge> = edges
                .iter()
                .filter(|e| e.signal.strength() == strength)
                .copied()
                .collect();
            resolve_level(
                &level,
                &mut a_slots,
                &mut b_slots,
                &a_features,
                &b_features,
                &mut outcome,
            );
        }

        for candidate in a_slots.into_iter().chain(b_slots).flatten() {
            outcome.groups.push(MatchGroup::singleton(candidate));
        }

        debug!(
            groups = outcome.groups.len(),
            conflicts = outcome.conflicts.len(),
            "Identity matching complete"
        );
        outcome
    }

    fn pair_by_link(
        &self,
        a_slots: &mut [Option<MatchCandidate>],
        b_slots: &mut [Option<MatchCandidate>],
        outcome: &mut MatchOutcome,
    ) {
        let b_by_contact: HashMap<ContactId, usize> = b_slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().and_then(MatchCandidate::linked_contact).map(|c| (c, i)))
            .collect();

        for a_slot in a_slots.iter_mut() {
            let Some(contact_id) = a_slot.as_ref().and_then(MatchCandidate::linked_contact) else {
                continue;
            };
            let Some(&bi) = b_by_contact.get(&contact_id) else {
                continue;
            };
            if b_slots[bi].is_none() {
                continue;
            }
            if let (Some(a), Some(b)) = (a_slot.take(), b_slots[bi].take()) {
                outcome.groups.push(MatchGroup {
                    messaging: Some(a),
                    cloud: Some(b),
                    signal: Some(MatchSignal::Link),
                    contact_id: Some(contact_id),
                });
            }
        }
    }

    fn signal_edges(
        &self,
        a_slots: &[Option<MatchCandidate>],
        b_slots: &[Option<MatchCandidate>],
        a_features: &[Option<Features>],
        b_features: &[Option<Features>],
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        let mut strong_a = vec![false; a_features.len()];
        let mut strong_b = vec![false; b_features.len()];

        let pairs = || {
            a_features.iter().enumerate().flat_map(move |(ai, fa)| {
                b_features
                    .iter()
                    .enumerate()
                    .filter_map(move |(bi, fb)| match (fa, fb) {
                        (Some(fa), Some(fb)) => Some((ai, bi, fa, fb)),
                        _ => None,
                    })
            })
        };

        // Two records linked to different contacts are never merged here.
        let both_linked = |ai: usize, bi: usize| {
            let linked = |s: &Option<MatchCandidate>| s.as_ref().and_then(|c| c.link.as_ref()).is_some();
            linked(&a_slots[ai]) && linked(&b_slots[bi])
        };

        for (ai, bi, fa, fb) in pairs() {
            if both_linked(ai, bi) {
                continue;
            }
            let signal = if !fa.phones.is_disjoint(&fb.phones) {
                MatchSignal::Phone
            } else if !fa.emails.is_disjoint(&fb.emails) {
                MatchSignal::Email
            } else {
                continue;
            };
            strong_a[ai] = true;
            strong_b[bi] = true;
            edges.push(Edge { a: ai, b: bi, signal });
        }

        for (ai, bi, fa, fb) in pairs() {
            if strong_a[ai] || strong_b[bi] || both_linked(ai, bi) {
                continue;
            }
            let (Some(name_a), Some(name_b)) = (&fa.name, &fb.name) else {
                continue;
            };
            let secondary = matches!((&fa.organization, &fb.organization), (Some(x), Some(y)) if x == y)
                || !fa.partial_phones.is_disjoint(&fb.partial_phones);
            if !secondary {
                continue;
            }
            let similarity = self.scorer.compare(name_a, name_b);
            if similarity.score >= self.threshold {
                edges.push(Edge {
                    a: ai,
                    b: bi,
                    signal: MatchSignal::Fuzzy {
                        score: similarity.score,
                    },
                });
            }
        }

        edges
    }
}

/// Candidates of one record with the best `(score, updated_at)` key.
fn best_of(candidates: Vec<(usize, f64, DateTime<Utc>)>) -> Vec<usize> {
    let Some(best) = candidates.iter().map(|(_, s, t)| (*s, *t)).reduce(|x, y| {
        if y.0 > x.0 || (y.0 == x.0 && y.1 > x.1) {
            y
        } else {
            x
        }
    }) else {
        return Vec::new();
    };
    candidates
        .into_iter()
        .filter(|(_, s, t)| *s == best.0 && *t == best.1)
        .map(|(i, _, _)| i)
        .collect()
}

fn updated_at(features: &[Option<Features>], i: usize) -> DateTime<Utc> {
    features[i]
        .as_ref()
        .map_or(DateTime::<Utc>::MIN_UTC, |f| f.updated_at)
}

fn resolve_level(
    edges: &[Edge],
    a_slots: &mut [Option<MatchCandidate>],
    b_slots: &mut [Option<MatchCandidate>],
    a_features: &[Option<Features>],
    b_features: &[Option<Features>],
    outcome: &mut MatchOutcome,
) {
    let Some(signal_kind) = edges.first().map(|e| e.signal) else {
        return;
    };

    loop {
        let mut progressed = false;

        for ai in 0..a_slots.len() {
            if a_slots[ai].is_none() {
                continue;
            }
            let a_candidates: Vec<(usize, f64, DateTime<Utc>)> = edges
                .iter()
                .filter(|e| e.a == ai && b_slots[e.b].is_some())
                .map(|e| (e.b, e.score(), updated_at(b_features, e.b)))
                .collect();
            if a_candidates.is_empty() {
                continue;
            }

            let best_b = best_of(a_candidates);
            if best_b.len() > 1 {
                hold_conflict(&[ai], &best_b, a_slots, b_slots, signal_kind, outcome);
                progressed = true;
                continue;
            }
            let bi = best_b[0];

            let b_candidates: Vec<(usize, f64, DateTime<Utc>)> = edges
                .iter()
                .filter(|e| e.b == bi && a_slots[e.a].is_some())
                .map(|e| (e.a, e.score(), updated_at(a_features, e.a)))
                .collect();
            let best_a = best_of(b_candidates);

            if best_a == [ai] {
                let signal = edges
                    .iter()
                    .find(|e| e.a == ai && e.b == bi)
                    .map_or(signal_kind, |e| e.signal);
                if let (Some(a), Some(b)) = (a_slots[ai].take(), b_slots[bi].take()) {
                    if let MatchSignal::Fuzzy { score } = signal {
                        info!(
                            messaging_id = %a.native_id(),
                            cloud_id = %b.native_id(),
                            score,
                            "Fuzzy identity match"
                        );
                    }
                    let contact_id = a.linked_contact().or_else(|| b.linked_contact());
                    outcome.groups.push(MatchGroup {
                        messaging: Some(a),
                        cloud: Some(b),
                        signal: Some(signal),
                        contact_id,
                    });
                }
                progressed = true;
            } else if best_a.len() > 1 && best_a.contains(&ai) {
                hold_conflict(&best_a, &[bi], a_slots, b_slots, signal_kind, outcome);
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
}

fn hold_conflict(
    a_indices: &[usize],
    b_indices: &[usize],
    a_slots: &mut [Option<MatchCandidate>],
    b_slots: &mut [Option<MatchCandidate>],
    signal: MatchSignal,
    outcome: &mut MatchOutcome,
) {
    let records: Vec<MatchCandidate> = a_indices
        .iter()
        .filter_map(|&i| a_slots[i].take())
        .chain(b_indices.iter().filter_map(|&i| b_slots[i].take()))
        .collect();
    let ids: Vec<String> = records.iter().map(|r| r.native_id().to_string()).collect();
    info!(
        signal = signal.as_str(),
        records = ?ids,
        "Ambiguous identity match held for review"
    );
    outcome.conflicts.push(ConflictingMatch {
        records,
        signal,
        reason: format!(
            "equally strong {} candidates with identical update times",
            signal.as_str()
        ),
    });
}
