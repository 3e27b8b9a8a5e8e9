//! Field consolidation: one authoritative value per logical lead field.
//!
//! Export tools from different platforms name the same data differently and
//! often repeat it across several columns. For each field the consolidator
//! first tries the rule's exact header names in priority order, then falls
//! back to the first header (in column order) matching one of the rule's
//! patterns. Notes are the exception: every matching column contributes.

use crate::import::data_structures::{LeadField, ParsedLeadRecord, RawRow};
use crate::import::rules::{CompiledFieldRule, CompiledRules};

/// Separator placed between note fragments coming from different columns.
pub const NOTES_SEPARATOR: &str = "\n\n";

/// Resolves [`RawRow`]s into [`ParsedLeadRecord`]s for one vocabulary.
pub struct Consolidator<'a> {
    rules: &'a CompiledRules,
}

impl<'a> Consolidator<'a> {
    pub fn new(rules: &'a CompiledRules) -> Self {
        Self { rules }
    }

    /// Consolidate a row, or `None` when it lacks a name or any contact.
    pub fn consolidate(&self, row: &RawRow) -> Option<ParsedLeadRecord> {
        let name = self.resolve(row, LeadField::Name)?;
        let phone = self.resolve(row, LeadField::Phone);
        let email = self.resolve(row, LeadField::Email);

        if phone.is_none() && email.is_none() {
            return None;
        }

        Some(ParsedLeadRecord {
            name,
            phone,
            email,
            company: self.resolve(row, LeadField::Company),
            revenue_band: self.resolve(row, LeadField::RevenueBand),
            segment: self.resolve(row, LeadField::Segment),
            notes: self.collect_notes(row),
            utm_campaign: self.resolve(row, LeadField::UtmCampaign),
            utm_source: self.resolve(row, LeadField::UtmSource),
            utm_medium: self.resolve(row, LeadField::UtmMedium),
            utm_content: self.resolve(row, LeadField::UtmContent),
            utm_term: self.resolve(row, LeadField::UtmTerm),
        })
    }

    /// Resolve a single-valued field with the exact-then-pattern policy.
    pub fn resolve(&self, row: &RawRow, field: LeadField) -> Option<String> {
        let rule = self.rules.field(field)?;
        resolve_exact(row, rule).or_else(|| resolve_pattern(row, rule))
    }

    fn collect_notes(&self, row: &RawRow) -> Option<String> {
        let rule = self.rules.field(LeadField::Notes)?;

        let fragments: Vec<&str> = row
            .iter()
            .filter(|(header, _)| {
                rule.exact.iter().any(|exact| exact.as_str() == *header)
                    || rule.matches_pattern(header)
            })
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .collect();

        if fragments.is_empty() {
            None
        } else {
            Some(fragments.join(NOTES_SEPARATOR))
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn resolve_exact(row: &RawRow, rule: &CompiledFieldRule) -> Option<String> {
    rule.exact
        .iter()
        .find_map(|header| row.get(header).and_then(non_empty))
}

fn resolve_pattern(row: &RawRow, rule: &CompiledFieldRule) -> Option<String> {
    row.iter()
        .filter(|(header, _)| rule.matches_pattern(header))
        .find_map(|(_, value)| non_empty(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::rules::RuleRegistry;

    fn row(cells: &[(&str, &str)]) -> RawRow {
        RawRow::new(
            cells
                .iter()
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_exact_header_beats_earlier_pattern_match() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("crm").unwrap());

        let record = consolidator
            .consolidate(&row(&[
                ("Telefone fixo", "11 3333-4444"),
                ("Nome", "Ana"),
                ("Celular", "11 98888-7777"),
            ]))
            .expect("valid lead");

        assert_eq!(record.phone.as_deref(), Some("11 98888-7777"));
    }

    #[test]
    fn test_empty_exact_match_falls_through_to_next_priority() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("crm").unwrap());

        let record = consolidator
            .consolidate(&row(&[
                ("Nome", "Ana"),
                ("Celular", "  "),
                ("Telefone", "11 98888-7777"),
            ]))
            .expect("valid lead");

        assert_eq!(record.phone.as_deref(), Some("11 98888-7777"));
    }

    #[test]
    fn test_pattern_fallback_uses_column_order() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("crm").unwrap());

        let record = consolidator
            .consolidate(&row(&[
                ("Nome", "Ana"),
                ("Telefone comercial", ""),
                ("Fone residencial", "11 2222-1111"),
                ("WhatsApp pessoal", "11 97777-6666"),
            ]))
            .expect("valid lead");

        assert_eq!(record.phone.as_deref(), Some("11 2222-1111"));
    }

    #[test]
    fn test_notes_concatenate_every_matching_column() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("crm").unwrap());

        let record = consolidator
            .consolidate(&row(&[
                ("Nome", "Ana"),
                ("Email", "ana@example.com"),
                ("Observações", "Ligar de manhã"),
                ("Comentário do vendedor", ""),
                ("Anotações internas", "Cliente antigo"),
            ]))
            .expect("valid lead");

        assert_eq!(
            record.notes.as_deref(),
            Some("Ligar de manhã\n\nCliente antigo")
        );
    }

    #[test]
    fn test_rows_without_name_or_contact_are_dropped() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("crm").unwrap());

        assert!(consolidator
            .consolidate(&row(&[("Empresa", "ACME"), ("Telefone", "11988887777")]))
            .is_none());
        assert!(consolidator
            .consolidate(&row(&[("Nome", "Ana"), ("Empresa", "ACME")]))
            .is_none());
        assert!(consolidator
            .consolidate(&row(&[("Empresa", "ACME")]))
            .is_none());
    }

    #[test]
    fn test_ad_platform_vocabulary() {
        let registry = RuleRegistry::builtin().unwrap();
        let consolidator = Consolidator::new(registry.get("ads").unwrap());

        let record = consolidator
            .consolidate(&row(&[
                ("campaign_name", "Black Friday"),
                ("ad_name", "Video 1"),
                ("full_name", "Carla Souza"),
                ("phone_number", "+5511977776666"),
                ("company_name", "Souza ME"),
                ("qual_o_faturamento_mensal?", "50k-100k"),
            ]))
            .expect("valid lead");

        assert_eq!(record.name, "Carla Souza");
        assert_eq!(record.company.as_deref(), Some("Souza ME"));
        assert_eq!(record.revenue_band.as_deref(), Some("50k-100k"));
        assert_eq!(record.utm_campaign.as_deref(), Some("Black Friday"));
        assert_eq!(record.utm_content.as_deref(), Some("Video 1"));
        assert!(record.email.is_none());
    }
}
