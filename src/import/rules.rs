//! Declarative column rules per export vocabulary.
//!
//! Each source kind (CRM export, ad-platform lead form, ...) is described by
//! a [`RuleSet`]: for every logical [`LeadField`] an ordered list of exact
//! header names and an ordered list of case-insensitive patterns. Rule sets
//! are plain JSON, so supporting a new export tool means dropping a file in
//! `IMPORT_RULES_DIR` rather than touching code.

use crate::import::data_structures::LeadField;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

const BUILTIN_CRM: &str = include_str!("rules/crm.json");
const BUILTIN_ADS: &str = include_str!("rules/ads.json");

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid rule set JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rule set '{set}': invalid pattern '{pattern}' for {field:?}: {source}")]
    Pattern {
        set: String,
        field: LeadField,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read rule directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exact-then-pattern header rule for one logical field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldRule {
    /// Header names checked verbatim, highest priority first.
    #[serde(default)]
    pub exact: Vec<String>,
    /// Case-insensitive regular expressions checked against every header.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Serialized description of one export vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    /// Source kind key used by callers (`crm`, `ads`, ...).
    pub name: String,
    /// Human-readable label used in the import tag name.
    pub label: String,
    /// Color given to import tags created for this source kind.
    #[serde(default)]
    pub tag_color: Option<String>,
    pub fields: BTreeMap<LeadField, FieldRule>,
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self, RulesError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A field rule with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledFieldRule {
    pub exact: Vec<String>,
    pub patterns: Vec<Regex>,
}

impl CompiledFieldRule {
    pub fn matches_pattern(&self, header: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(header))
    }
}

/// A [`RuleSet`] ready for consolidation.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub name: String,
    pub label: String,
    pub tag_color: Option<String>,
    fields: HashMap<LeadField, CompiledFieldRule>,
}

impl CompiledRules {
    pub fn compile(set: RuleSet) -> Result<Self, RulesError> {
        let mut fields = HashMap::with_capacity(set.fields.len());

        for (field, rule) in set.fields {
            let patterns = rule
                .patterns
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| RulesError::Pattern {
                            set: set.name.clone(),
                            field,
                            pattern: pattern.clone(),
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            fields.insert(
                field,
                CompiledFieldRule {
                    exact: rule.exact,
                    patterns,
                },
            );
        }

        Ok(Self {
            name: set.name,
            label: set.label,
            tag_color: set.tag_color,
            fields,
        })
    }

    /// Rule for `field`, if the vocabulary defines one.
    pub fn field(&self, field: LeadField) -> Option<&CompiledFieldRule> {
        self.fields.get(&field)
    }
}

/// All known source kinds, keyed by [`RuleSet::name`].
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    sets: HashMap<String, CompiledRules>,
}

impl RuleRegistry {
    /// Registry with the built-in `crm` and `ads` vocabularies.
    pub fn builtin() -> Result<Self, RulesError> {
        let mut registry = Self {
            sets: HashMap::new(),
        };
        registry.register(RuleSet::from_json(BUILTIN_CRM)?)?;
        registry.register(RuleSet::from_json(BUILTIN_ADS)?)?;
        Ok(registry)
    }

    /// Built-ins plus every `*.json` rule set found in `dir`.
    ///
    /// A file whose `name` matches a built-in replaces it.
    pub fn with_directory(dir: &Path) -> Result<Self, RulesError> {
        let mut registry = Self::builtin()?;

        let io_err = |source| RulesError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let json = std::fs::read_to_string(&path).map_err(|source| RulesError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let set = RuleSet::from_json(&json)?;
            log::info!("loaded import rule set '{}' from {}", set.name, path.display());
            registry.register(set)?;
        }

        Ok(registry)
    }

    pub fn register(&mut self, set: RuleSet) -> Result<(), RulesError> {
        let compiled = CompiledRules::compile(set)?;
        self.sets.insert(compiled.name.clone(), compiled);
        Ok(())
    }

    pub fn get(&self, source_kind: &str) -> Option<&CompiledRules> {
        self.sets.get(source_kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.sets.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_registry_has_both_vocabularies() {
        let registry = RuleRegistry::builtin().expect("builtins compile");
        assert_eq!(registry.kinds(), vec!["ads", "crm"]);

        let crm = registry.get("crm").expect("crm rules");
        let phone = crm.field(LeadField::Phone).expect("phone rule");
        assert_eq!(phone.exact[0], "Celular");
        assert!(phone.matches_pattern("Telefone Comercial"));
        assert!(phone.matches_pattern("WHATSAPP"));
        assert!(!phone.matches_pattern("Empresa"));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let json = r#"{"name":"bad","label":"Bad","fields":{"phone":{"patterns":["("]}}}"#;
        let set = RuleSet::from_json(json).expect("valid JSON");
        let err = CompiledRules::compile(set).expect_err("pattern must fail");
        assert!(matches!(err, RulesError::Pattern { field: LeadField::Phone, .. }));
    }

    #[test]
    fn test_directory_adds_third_vocabulary() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut file = std::fs::File::create(dir.path().join("hubspot.json")).expect("create");
        file.write_all(
            br#"{"name":"hubspot","label":"HubSpot","fields":{
                "name":{"exact":["First Name"]},
                "email":{"exact":["Email Address"],"patterns":["mail"]}}}"#,
        )
        .expect("write");

        let registry = RuleRegistry::with_directory(dir.path()).expect("registry");
        assert_eq!(registry.kinds(), vec!["ads", "crm", "hubspot"]);
        let hubspot = registry.get("hubspot").expect("hubspot");
        assert!(hubspot.field(LeadField::Phone).is_none());
        assert_eq!(hubspot.label, "HubSpot");
    }
}
