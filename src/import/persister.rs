//! Batched persistence of resolved records.
//!
//! Each batch runs in two stages:
//!
//! 1. **Plan** (serial): resolve every record against the existing-lead index
//!    and the processed-phone set, compute merge updates, check whether merged
//!    leads are already in the target campaign and draw assignees. Running this
//!    serially keeps deduplication race-free and round-robin order equal to
//!    file order.
//! 2. **Write** (concurrent): the planned writes run on a `JoinSet`, at most
//!    `workers` at a time. Every record's writes are their own unit of work;
//!    a failure marks that record invalid and nothing else.
//!
//! A batch returns only after all of its writes have finished.

use crate::import::data_structures::{GroupingLink, LeadUpdate, NewLead, ParsedLeadRecord};
use crate::import::distribution::Distributor;
use crate::import::repository::{LeadRepository, RepositoryError};
use crate::import::resolver::{self, ExistingLeadIndex, ProcessedPhoneSet, Resolution};
use crate::import::stats::{ImportResult, RecordOutcome};
use crate::import::tags::TagManager;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// A consolidated record with its canonical phone and deduplication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub record: ParsedLeadRecord,
    /// Canonical phone, empty when the record has none.
    pub phone: String,
    pub key: String,
}

impl PendingRecord {
    pub fn new(record: ParsedLeadRecord, phone: String) -> Self {
        let key = resolver::dedup_key(&phone, record.email.as_deref());
        Self { record, phone, key }
    }
}

/// Where touched leads are placed for one run.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub campaign_id: i32,
    pub stage_id: i32,
    pub tag_id: i32,
    /// Label written above notes appended during a merge.
    pub divider_label: String,
}

/// Write work decided during planning.
#[derive(Debug)]
enum PlannedWrite {
    Create {
        lead: NewLead,
        assignee: Option<i32>,
    },
    Merge {
        lead_id: i32,
        update: LeadUpdate,
        /// `Some(assignee)` when the lead still needs a campaign link.
        link: Option<Option<i32>>,
    },
}

/// Shared, read-only state handed to write tasks.
struct WriteContext {
    repository: Arc<dyn LeadRepository>,
    tags: TagManager,
    target: RunTarget,
}

pub struct BatchPersister {
    context: Arc<WriteContext>,
    index: Arc<ExistingLeadIndex>,
    seen: ProcessedPhoneSet,
    distributor: Arc<Distributor>,
    workers: usize,
}

impl BatchPersister {
    pub fn new(
        repository: Arc<dyn LeadRepository>,
        index: Arc<ExistingLeadIndex>,
        distributor: Arc<Distributor>,
        target: RunTarget,
        workers: usize,
    ) -> Self {
        let tags = TagManager::new(Arc::clone(&repository));
        Self {
            context: Arc::new(WriteContext {
                repository,
                tags,
                target,
            }),
            index,
            seen: ProcessedPhoneSet::new(),
            distributor,
            workers: workers.max(1),
        }
    }

    /// Plan and write one batch, returning its counts.
    pub async fn persist_batch(&self, batch: Vec<PendingRecord>) -> ImportResult {
        let mut counts = ImportResult::default();
        let mut planned = Vec::with_capacity(batch.len());

        for pending in batch {
            match self.plan(pending).await {
                Ok(Some(write)) => planned.push(write),
                Ok(None) => counts.record(RecordOutcome::Duplicate),
                Err(err) => {
                    log::warn!("import: campaign link lookup failed: {}", err);
                    counts.record(RecordOutcome::Invalid);
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for write in planned {
            let context = Arc::clone(&self.context);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return RecordOutcome::Invalid;
                };
                context.apply(write).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => counts.record(outcome),
                Err(err) => {
                    log::error!("import: write task aborted: {}", err);
                    counts.record(RecordOutcome::Invalid);
                }
            }
        }

        counts
    }

    /// Decide what to write for `pending`; `None` means duplicate.
    async fn plan(&self, pending: PendingRecord) -> Result<Option<PlannedWrite>, RepositoryError> {
        let target = &self.context.target;

        match resolver::resolve(&pending.key, &self.index, &self.seen) {
            Resolution::Skip => Ok(None),
            Resolution::New => {
                let phone = (!pending.phone.is_empty()).then_some(pending.phone);
                Ok(Some(PlannedWrite::Create {
                    lead: NewLead {
                        record: pending.record,
                        phone,
                    },
                    assignee: self.distributor.assign(),
                }))
            }
            Resolution::Merge(existing) => {
                let update =
                    resolver::merge_update(&existing, &pending.record, &target.divider_label);
                let linked = self
                    .context
                    .repository
                    .find_grouping_link(existing.id, target.campaign_id)
                    .await?;

                // Leads already on the board keep their current owner.
                let link = (!linked).then(|| self.distributor.assign());

                Ok(Some(PlannedWrite::Merge {
                    lead_id: existing.id,
                    update,
                    link,
                }))
            }
        }
    }
}

impl WriteContext {
    async fn apply(&self, write: PlannedWrite) -> RecordOutcome {
        match write {
            PlannedWrite::Create { lead, assignee } => {
                let name = lead.record.name.clone();
                match self.create(lead, assignee).await {
                    Ok(()) => RecordOutcome::Imported,
                    Err(err) => {
                        log::warn!("import: failed to create lead '{}': {}", name, err);
                        RecordOutcome::Invalid
                    }
                }
            }
            PlannedWrite::Merge {
                lead_id,
                update,
                link,
            } => {
                let changed = !update.is_empty();
                match self.merge(lead_id, update, link).await {
                    Ok(()) if changed => RecordOutcome::Updated,
                    Ok(()) => RecordOutcome::Duplicate,
                    Err(err) => {
                        log::warn!("import: failed to merge into lead {}: {}", lead_id, err);
                        RecordOutcome::Invalid
                    }
                }
            }
        }
    }

    async fn create(&self, lead: NewLead, assignee: Option<i32>) -> Result<(), RepositoryError> {
        let lead_id = self.repository.insert_lead(&lead).await?;
        self.repository
            .insert_grouping_link(self.link(lead_id, assignee))
            .await?;
        self.tags.link(lead_id, self.target.tag_id).await?;
        Ok(())
    }

    async fn merge(
        &self,
        lead_id: i32,
        update: LeadUpdate,
        link: Option<Option<i32>>,
    ) -> Result<(), RepositoryError> {
        if !update.is_empty() {
            self.repository.update_lead(lead_id, &update).await?;
        }
        if let Some(assignee) = link {
            self.repository
                .insert_grouping_link(self.link(lead_id, assignee))
                .await?;
        }
        self.tags.link(lead_id, self.target.tag_id).await?;
        Ok(())
    }

    fn link(&self, lead_id: i32, assignee_id: Option<i32>) -> GroupingLink {
        GroupingLink {
            campaign_id: self.target.campaign_id,
            lead_id,
            stage_id: self.target.stage_id,
            assignee_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::data_structures::ExistingLead;
    use crate::import::distribution::DistributionMode;
    use crate::test_support::memory::MemoryLeadRepository;

    fn pending(name: &str, phone: &str) -> PendingRecord {
        PendingRecord::new(
            ParsedLeadRecord {
                name: name.into(),
                phone: Some(phone.into()),
                ..Default::default()
            },
            phone.into(),
        )
    }

    fn target(tag_id: i32) -> RunTarget {
        RunTarget {
            campaign_id: 1,
            stage_id: 10,
            tag_id,
            divider_label: "Importação CRM".into(),
        }
    }

    #[tokio::test]
    async fn test_batch_counts_new_and_in_run_duplicates() {
        let repository = Arc::new(MemoryLeadRepository::new());
        let tag_id = repository.get_or_create_tag("t", "#000").await.unwrap();
        let persister = BatchPersister::new(
            repository.clone(),
            Arc::new(ExistingLeadIndex::default()),
            Arc::new(Distributor::new(DistributionMode::Unassigned)),
            target(tag_id),
            4,
        );

        let counts = persister
            .persist_batch(vec![
                pending("Ana", "5511988887777"),
                pending("Ana B", "5511988887777"),
                pending("Bia", "5511977776666"),
            ])
            .await;

        assert_eq!(counts.imported, 2);
        assert_eq!(counts.duplicates, 1);
        assert_eq!(repository.lead_count(), 2);
        assert_eq!(repository.campaign_link_count(1), 2);
    }

    #[tokio::test]
    async fn test_merge_keeps_owner_when_already_linked() {
        let repository = Arc::new(MemoryLeadRepository::new());
        let lead_id = repository.seed_lead(ExistingLead {
            name: "Ana".into(),
            phone: "5511988887777".into(),
            ..Default::default()
        });
        repository
            .insert_grouping_link(GroupingLink {
                campaign_id: 1,
                lead_id,
                stage_id: 10,
                assignee_id: Some(99),
            })
            .await
            .unwrap();
        let tag_id = repository.get_or_create_tag("t", "#000").await.unwrap();

        let index = ExistingLeadIndex::from_leads(
            repository
                .find_leads_by_phones(&["5511988887777".to_string()])
                .await
                .unwrap(),
        );
        let distributor = Arc::new(Distributor::new(DistributionMode::RoundRobin(vec![1, 2])));
        let persister = BatchPersister::new(
            repository.clone(),
            Arc::new(index),
            Arc::clone(&distributor),
            target(tag_id),
            2,
        );

        let mut record = pending("Ana", "5511988887777");
        record.record.company = Some("ACME".into());
        let counts = persister.persist_batch(vec![record]).await;

        assert_eq!(counts.updated, 1);
        assert_eq!(repository.assignee_of(1, lead_id), Some(Some(99)));
        assert_eq!(distributor.tally().unwrap().values().sum::<usize>(), 0);
        assert_eq!(repository.tag_links_for(lead_id), vec![tag_id]);
    }

    #[tokio::test]
    async fn test_failed_write_counts_invalid() {
        let repository = Arc::new(MemoryLeadRepository::new());
        repository.fail_inserts_for("Quebrado");
        let tag_id = repository.get_or_create_tag("t", "#000").await.unwrap();
        let persister = BatchPersister::new(
            repository.clone(),
            Arc::new(ExistingLeadIndex::default()),
            Arc::new(Distributor::new(DistributionMode::Fixed(5))),
            target(tag_id),
            4,
        );

        let counts = persister
            .persist_batch(vec![
                pending("Quebrado", "5511911112222"),
                pending("Ok", "5511933334444"),
            ])
            .await;

        assert_eq!(counts.invalid, 1);
        assert_eq!(counts.imported, 1);
        assert_eq!(counts.processed(), 2);
    }
}
