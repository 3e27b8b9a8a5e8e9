//! Records flowing through the import pipeline.
//!
//! A [`RawRow`] comes out of the decoder, the consolidator turns it into a
//! [`ParsedLeadRecord`], and the resolver compares that against an
//! [`ExistingLead`] projection to produce a [`LeadUpdate`].

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One decoded input row: header -> cell value, in file column order.
///
/// Headers keep the case they have in the source file. Duplicate headers are
/// kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    cells: Vec<(String, String)>,
}

impl RawRow {
    pub fn new(cells: Vec<(String, String)>) -> Self {
        Self { cells }
    }

    /// Value of the first column whose header equals `header` exactly.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate `(header, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(h, v)| (h.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// True when every cell is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.trim().is_empty())
    }
}

/// Logical lead fields that column rules resolve into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadField {
    Name,
    Phone,
    Email,
    Company,
    RevenueBand,
    Segment,
    Notes,
    UtmCampaign,
    UtmSource,
    UtmMedium,
    UtmContent,
    UtmTerm,
}

impl LeadField {
    pub const ALL: [LeadField; 12] = [
        LeadField::Name,
        LeadField::Phone,
        LeadField::Email,
        LeadField::Company,
        LeadField::RevenueBand,
        LeadField::Segment,
        LeadField::Notes,
        LeadField::UtmCampaign,
        LeadField::UtmSource,
        LeadField::UtmMedium,
        LeadField::UtmContent,
        LeadField::UtmTerm,
    ];
}

/// A candidate lead consolidated from one input row.
///
/// Always carries a name and at least one of phone/email; rows that cannot
/// satisfy that never become a `ParsedLeadRecord`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLeadRecord {
    pub name: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub revenue_band: Option<String>,
    pub segment: Option<String>,
    pub notes: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_content: Option<String>,
    pub utm_term: Option<String>,
}

/// Minimal projection of a lead already present in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow)]
pub struct ExistingLead {
    pub id: i32,
    pub name: String,
    pub phone: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub revenue_band: Option<String>,
    pub segment: Option<String>,
    pub notes: Option<String>,
}

/// Partial set of columns to write onto an existing lead during a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadUpdate {
    pub company: Option<String>,
    pub email: Option<String>,
    pub revenue_band: Option<String>,
    pub segment: Option<String>,
    pub notes: Option<String>,
}

impl LeadUpdate {
    pub fn is_empty(&self) -> bool {
        self.company.is_none()
            && self.email.is_none()
            && self.revenue_band.is_none()
            && self.segment.is_none()
            && self.notes.is_none()
    }
}

/// A lead row to insert, with its canonical phone already computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLead {
    pub record: ParsedLeadRecord,
    /// Canonical phone; `None` when the record had no usable digits.
    pub phone: Option<String>,
}

/// Placement of a lead into a campaign board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingLink {
    pub campaign_id: i32,
    pub lead_id: i32,
    pub stage_id: i32,
    pub assignee_id: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_row_get_returns_first_duplicate() {
        let row = RawRow::new(vec![
            ("Telefone".into(), "".into()),
            ("Telefone".into(), "11999990000".into()),
        ]);
        assert_eq!(row.get("Telefone"), Some(""));
        assert_eq!(row.get("telefone"), None);
    }

    #[test]
    fn test_raw_row_blank_detection() {
        let row = RawRow::new(vec![("Nome".into(), "  ".into()), ("Email".into(), "".into())]);
        assert!(row.is_blank());
    }

    #[test]
    fn test_lead_update_emptiness() {
        assert!(LeadUpdate::default().is_empty());
        let update = LeadUpdate {
            segment: Some("Varejo".into()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
