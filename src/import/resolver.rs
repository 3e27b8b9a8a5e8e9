//! Duplicate resolution against the pre-fetched lead index.
//!
//! Classification is a two-stage check: keys already handled in this run
//! are skipped, then the index of existing leads decides between a fresh
//! insert and a merge. The index is built once per run from batched lookups
//! so no row ever queries the store individually.
//!
//! The deduplication key is the canonical phone. A record without a phone is
//! keyed by its lowercased email instead, and only ever matches stored leads
//! that have no phone either.

use crate::import::data_structures::{ExistingLead, LeadUpdate, ParsedLeadRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

const EMAIL_KEY_PREFIX: &str = "email:";

/// Lowercased, trimmed email used for lookups; `None` when blank.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim();
    (!email.is_empty()).then(|| email.to_lowercase())
}

/// Deduplication key for a record: its canonical phone, else its email.
///
/// Empty when the record has neither.
pub fn dedup_key(phone: &str, email: Option<&str>) -> String {
    if !phone.is_empty() {
        return phone.to_string();
    }
    email
        .and_then(normalize_email)
        .map(|email| format!("{EMAIL_KEY_PREFIX}{email}"))
        .unwrap_or_default()
}

/// Existing leads keyed by deduplication key. Read-only once built.
#[derive(Debug, Default, Clone)]
pub struct ExistingLeadIndex {
    by_key: HashMap<String, ExistingLead>,
}

impl ExistingLeadIndex {
    /// Build the index from repository rows. When several stored leads share
    /// a key, the lowest id wins.
    pub fn from_leads(leads: Vec<ExistingLead>) -> Self {
        let mut by_key: HashMap<String, ExistingLead> = HashMap::with_capacity(leads.len());
        for lead in leads {
            let key = dedup_key(&lead.phone, lead.email.as_deref());
            if key.is_empty() {
                continue;
            }
            match by_key.get(&key) {
                Some(current) if current.id <= lead.id => {}
                _ => {
                    by_key.insert(key, lead);
                }
            }
        }
        Self { by_key }
    }

    pub fn get(&self, key: &str) -> Option<&ExistingLead> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Deduplication keys already classified during the current run.
#[derive(Debug, Default)]
pub struct ProcessedPhoneSet {
    seen: Mutex<HashSet<String>>,
}

impl ProcessedPhoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`, returning `true` if it had not been seen before.
    ///
    /// Check and insert happen under one lock so two rows collapsing to the
    /// same key can never both be treated as first.
    pub fn insert(&self, key: &str) -> bool {
        self.seen.lock().insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of duplicate resolution for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No lead with this key exists yet.
    New,
    /// A lead with this key exists; carries its stored projection.
    Merge(ExistingLead),
    /// The key was already handled earlier in this run.
    Skip,
}

/// Classify a record by its deduplication key (see [`dedup_key`]).
///
/// An empty key cannot be deduplicated and always resolves to
/// [`Resolution::New`] without touching the processed set.
pub fn resolve(key: &str, index: &ExistingLeadIndex, seen: &ProcessedPhoneSet) -> Resolution {
    if key.is_empty() {
        return Resolution::New;
    }

    if !seen.insert(key) {
        return Resolution::Skip;
    }

    match index.get(key) {
        Some(existing) => Resolution::Merge(existing.clone()),
        None => Resolution::New,
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn fill_if_blank(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    if is_blank(existing) && !is_blank(incoming) {
        incoming.clone()
    } else {
        None
    }
}

/// Compute the non-destructive update for merging `record` into `existing`.
///
/// Company, email, revenue band and segment are only filled where the
/// stored value is empty. Notes are appended after a divider labelled with
/// `divider_label`, unless the stored notes already contain them.
pub fn merge_update(
    existing: &ExistingLead,
    record: &ParsedLeadRecord,
    divider_label: &str,
) -> LeadUpdate {
    let notes = match record.notes.as_deref().map(str::trim) {
        Some(incoming) if !incoming.is_empty() => match existing.notes.as_deref() {
            Some(current) if current.contains(incoming) => None,
            Some(current) if !current.trim().is_empty() => {
                Some(format!("{current}\n\n--- {divider_label} ---\n{incoming}"))
            }
            _ => Some(incoming.to_string()),
        },
        _ => None,
    };

    LeadUpdate {
        company: fill_if_blank(&existing.company, &record.company),
        email: fill_if_blank(&existing.email, &record.email),
        revenue_band: fill_if_blank(&existing.revenue_band, &record.revenue_band),
        segment: fill_if_blank(&existing.segment, &record.segment),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(id: i32, phone: &str) -> ExistingLead {
        ExistingLead {
            id,
            name: "Ana".into(),
            phone: phone.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_new_merge_skip() {
        let index = ExistingLeadIndex::from_leads(vec![existing(7, "5511988887777")]);
        let seen = ProcessedPhoneSet::new();

        assert_eq!(
            resolve("5511988887777", &index, &seen),
            Resolution::Merge(existing(7, "5511988887777"))
        );
        assert_eq!(resolve("5511988887777", &index, &seen), Resolution::Skip);
        assert_eq!(resolve("5511977776666", &index, &seen), Resolution::New);
        assert_eq!(resolve("5511977776666", &index, &seen), Resolution::Skip);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_resolve_empty_key_is_always_new() {
        let index = ExistingLeadIndex::default();
        let seen = ProcessedPhoneSet::new();

        assert_eq!(resolve("", &index, &seen), Resolution::New);
        assert_eq!(resolve("", &index, &seen), Resolution::New);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_dedup_key_falls_back_to_email() {
        assert_eq!(dedup_key("5511988887777", Some("a@x.com")), "5511988887777");
        assert_eq!(dedup_key("", Some("  Carlos@Example.com ")), "email:carlos@example.com");
        assert_eq!(dedup_key("", Some("  ")), "");
        assert_eq!(dedup_key("", None), "");
    }

    #[test]
    fn test_phoneless_lead_resolves_by_email() {
        let stored = ExistingLead {
            id: 4,
            name: "Carlos".into(),
            email: Some("carlos@example.com".into()),
            ..Default::default()
        };
        let index = ExistingLeadIndex::from_leads(vec![stored.clone()]);
        let seen = ProcessedPhoneSet::new();
        let key = dedup_key("", Some("CARLOS@example.com"));

        assert_eq!(resolve(&key, &index, &seen), Resolution::Merge(stored));
        assert_eq!(resolve(&key, &index, &seen), Resolution::Skip);
    }

    #[test]
    fn test_index_prefers_lowest_id_for_shared_phone() {
        let index = ExistingLeadIndex::from_leads(vec![
            existing(9, "5511988887777"),
            existing(3, "5511988887777"),
            existing(5, "5511988887777"),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("5511988887777").map(|l| l.id), Some(3));
    }

    #[test]
    fn test_merge_never_overwrites_existing_values() {
        let stored = ExistingLead {
            company: Some("ACME".into()),
            email: Some("".into()),
            ..existing(1, "5511988887777")
        };
        let record = ParsedLeadRecord {
            name: "Ana".into(),
            company: Some("Other Corp".into()),
            email: Some("ana@example.com".into()),
            segment: Some("Varejo".into()),
            ..Default::default()
        };

        let update = merge_update(&stored, &record, "Importação CRM");
        assert_eq!(update.company, None);
        assert_eq!(update.email.as_deref(), Some("ana@example.com"));
        assert_eq!(update.segment.as_deref(), Some("Varejo"));
        assert_eq!(update.revenue_band, None);
    }

    #[test]
    fn test_merge_appends_notes_with_divider_once() {
        let stored = ExistingLead {
            notes: Some("Primeiro contato".into()),
            ..existing(1, "5511988887777")
        };
        let record = ParsedLeadRecord {
            name: "Ana".into(),
            notes: Some("Pediu proposta".into()),
            ..Default::default()
        };

        let update = merge_update(&stored, &record, "Lote março");
        let notes = update.notes.expect("notes appended");
        assert_eq!(notes, "Primeiro contato\n\n--- Lote março ---\nPediu proposta");

        let stored = ExistingLead {
            notes: Some(notes),
            ..existing(1, "5511988887777")
        };
        assert!(merge_update(&stored, &record, "Lote março").is_empty());
    }

    #[test]
    fn test_merge_with_nothing_new_is_empty() {
        let stored = ExistingLead {
            company: Some("ACME".into()),
            ..existing(1, "5511988887777")
        };
        let record = ParsedLeadRecord {
            name: "Ana".into(),
            company: Some("ACME".into()),
            ..Default::default()
        };
        assert!(merge_update(&stored, &record, "x").is_empty());
    }
}
