//! Import orchestration.
//!
//! [`LeadImporter::run`] drives one import end to end:
//! 1. Validate the request and pick the rule set and distribution mode
//! 2. Decode the file and consolidate rows (blocking pool, rows in parallel)
//! 3. Normalize phones and build the existing-lead index from batched lookups
//!    (by phone, and by email for records without one)
//! 4. Ensure the run's tag
//! 5. Persist batches, reporting progress and honouring cancellation between them
//!
//! A run either completes with a full [`ImportResult`] or fails with an
//! [`ImportError`]. Only a cancelled run reports partial counts, inside
//! [`ImportError::Cancelled`].

use crate::config::ImportConfig;
use crate::import::consolidator::Consolidator;
use crate::import::data_structures::{ParsedLeadRecord, RawRow};
use crate::import::decoder::{self, DecodeError, FileFormat};
use crate::import::distribution::{DistributionMode, Distributor};
use crate::import::persister::{BatchPersister, PendingRecord, RunTarget};
use crate::import::phone;
use crate::import::progress::{ProgressSink, ProgressTracker};
use crate::import::repository::{LeadRepository, RepositoryError};
use crate::import::resolver::{self, ExistingLeadIndex};
use crate::import::rules::{CompiledRules, RuleRegistry, RulesError};
use crate::import::stats::ImportResult;
use crate::import::tags::{self, DEFAULT_TAG_COLOR, TagManager};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("rule set error: {0}")]
    Rules(#[from] RulesError),
    #[error("unknown source kind '{0}'")]
    UnknownSourceKind(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("file has no rows with a name and a phone or email")]
    NoEligibleRows,
    #[error("import setup failed: {0}")]
    Setup(#[from] RepositoryError),
    /// `partial` holds the counts of the batches that were written.
    #[error("import cancelled after {processed} of {total} records")]
    Cancelled {
        processed: usize,
        total: usize,
        partial: ImportResult,
    },
    #[error("import worker failed: {0}")]
    Worker(String),
}

/// Parameters of one import run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub campaign_id: i32,
    pub stage_id: i32,
    pub fixed_assignee_id: Option<i32>,
    pub auto_distribute: bool,
    pub member_ids: Vec<i32>,
    /// Rule set name, e.g. `crm` or `ads`.
    pub source_kind: String,
    /// Human label for this run; part of the tag name.
    pub import_label: String,
    /// Explicit file format; inferred from the extension when absent.
    pub format: Option<FileFormat>,
}

impl ImportRequest {
    /// Distribution mode implied by the request.
    pub fn distribution_mode(&self) -> Result<DistributionMode, ImportError> {
        if self.auto_distribute {
            if self.member_ids.is_empty() {
                return Err(ImportError::InvalidRequest(
                    "auto distribution needs at least one member".to_string(),
                ));
            }
            return Ok(DistributionMode::RoundRobin(self.member_ids.clone()));
        }

        Ok(match self.fixed_assignee_id {
            Some(member) => DistributionMode::Fixed(member),
            None => DistributionMode::Unassigned,
        })
    }
}

/// Output of the decode/consolidate stage.
struct Consolidated {
    records: Vec<PendingRecord>,
    dropped: usize,
}

/// Runs imports against a [`LeadRepository`].
#[derive(Clone)]
pub struct LeadImporter {
    repository: Arc<dyn LeadRepository>,
    rules: Arc<RuleRegistry>,
    config: ImportConfig,
}

impl LeadImporter {
    pub fn new(
        repository: Arc<dyn LeadRepository>,
        rules: Arc<RuleRegistry>,
        config: ImportConfig,
    ) -> Self {
        Self {
            repository,
            rules,
            config,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Import the file at `path`.
    ///
    /// `progress` receives a value after every batch; the last one is 100.
    /// `cancel` is checked before each batch, never inside one.
    pub async fn run(
        &self,
        request: &ImportRequest,
        path: &Path,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<ImportResult, ImportError> {
        let mode = request.distribution_mode()?;
        let rules = self
            .rules
            .get(&request.source_kind)
            .cloned()
            .ok_or_else(|| ImportError::UnknownSourceKind(request.source_kind.clone()))?;
        let format = match request.format {
            Some(format) => format,
            None => FileFormat::from_path(path).ok_or_else(|| {
                DecodeError::UnsupportedFormat(path.display().to_string())
            })?,
        };

        log::info!(
            "import: starting '{}' ({}) for campaign {} from {}",
            request.import_label,
            rules.name,
            request.campaign_id,
            path.display()
        );

        let divider_label = rules.label.clone();
        let tag_color = self
            .config
            .tag_color
            .clone()
            .or_else(|| rules.tag_color.clone())
            .unwrap_or_else(|| DEFAULT_TAG_COLOR.to_string());
        let tag_name = tags::tag_name(&rules.label, &request.import_label);

        let owned_path = path.to_path_buf();
        let Consolidated { records, dropped } =
            tokio::task::spawn_blocking(move || consolidate_file(&owned_path, format, &rules))
                .await
                .map_err(|e| ImportError::Worker(e.to_string()))??;

        let total = records.len();
        if total == 0 {
            log::warn!("import: no eligible rows ({} dropped)", dropped);
            return Err(ImportError::NoEligibleRows);
        }
        log::info!("import: {} eligible records, {} dropped", total, dropped);

        let phones: Vec<String> = records
            .iter()
            .filter(|r| !r.phone.is_empty())
            .map(|r| r.phone.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let emails: Vec<String> = records
            .iter()
            .filter(|r| r.phone.is_empty())
            .filter_map(|r| r.record.email.as_deref().and_then(resolver::normalize_email))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut existing = self.repository.find_leads_by_phones(&phones).await?;
        if !emails.is_empty() {
            existing.extend(
                self.repository
                    .find_phoneless_leads_by_emails(&emails)
                    .await?,
            );
        }
        let index = ExistingLeadIndex::from_leads(existing);
        log::debug!(
            "import: {} distinct phones, {} phoneless emails, {} already stored",
            phones.len(),
            emails.len(),
            index.len()
        );

        let tag = TagManager::new(Arc::clone(&self.repository))
            .ensure(&tag_name, &tag_color)
            .await?;

        let distributor = Arc::new(Distributor::new(mode));
        let persister = BatchPersister::new(
            Arc::clone(&self.repository),
            Arc::new(index),
            Arc::clone(&distributor),
            RunTarget {
                campaign_id: request.campaign_id,
                stage_id: request.stage_id,
                tag_id: tag.id,
                divider_label,
            },
            self.config.workers,
        );

        let mut result = ImportResult {
            total,
            dropped,
            ..Default::default()
        };
        let mut tracker = ProgressTracker::new(progress, total);
        let mut processed = 0;

        for batch in records.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                log::warn!(
                    "import: cancelled after {}/{} records (imported {}, updated {}, duplicates {}, invalid {})",
                    processed,
                    total,
                    result.imported,
                    result.updated,
                    result.duplicates,
                    result.invalid
                );
                result.distribution = distributor.tally();
                return Err(ImportError::Cancelled {
                    processed,
                    total,
                    partial: result,
                });
            }

            let counts = persister.persist_batch(batch.to_vec()).await;
            result.merge(&counts);
            processed += batch.len();
            tracker.advance(processed);
        }

        result.distribution = distributor.tally();

        if !result.is_balanced() {
            return Err(ImportError::Worker(format!(
                "tally mismatch: {} processed of {} records",
                result.processed(),
                total
            )));
        }

        log::info!(
            "import: '{}' complete - {} imported, {} updated, {} duplicates, {} invalid",
            tag.name,
            result.imported,
            result.updated,
            result.duplicates,
            result.invalid
        );
        Ok(result)
    }
}

/// Decode `path` and turn its rows into pending records, in file order.
fn consolidate_file(
    path: &Path,
    format: FileFormat,
    rules: &CompiledRules,
) -> Result<Consolidated, ImportError> {
    let rows: Vec<RawRow> = decoder::decode(path, format)?.collect::<Result<_, _>>()?;
    let consolidator = Consolidator::new(rules);

    let parsed: Vec<Option<ParsedLeadRecord>> = rows
        .par_iter()
        .map(|row| consolidator.consolidate(row))
        .collect();

    let dropped = parsed.iter().filter(|r| r.is_none()).count();
    let records = parsed
        .into_iter()
        .flatten()
        .map(|record| {
            let phone = record
                .phone
                .as_deref()
                .map(phone::normalize)
                .unwrap_or_default();
            PendingRecord::new(record, phone)
        })
        .collect();

    Ok(Consolidated { records, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ImportRequest {
        ImportRequest {
            campaign_id: 1,
            stage_id: 1,
            fixed_assignee_id: None,
            auto_distribute: false,
            member_ids: Vec::new(),
            source_kind: "crm".into(),
            import_label: "Lote".into(),
            format: None,
        }
    }

    #[test]
    fn test_distribution_mode_selection() {
        let mut req = request();
        assert_eq!(req.distribution_mode().unwrap(), DistributionMode::Unassigned);

        req.fixed_assignee_id = Some(3);
        assert_eq!(req.distribution_mode().unwrap(), DistributionMode::Fixed(3));

        req.auto_distribute = true;
        req.member_ids = vec![1, 2];
        assert_eq!(
            req.distribution_mode().unwrap(),
            DistributionMode::RoundRobin(vec![1, 2])
        );
    }

    #[test]
    fn test_auto_distribute_requires_members() {
        let mut req = request();
        req.auto_distribute = true;
        assert!(matches!(
            req.distribution_mode(),
            Err(ImportError::InvalidRequest(_))
        ));
    }
}
