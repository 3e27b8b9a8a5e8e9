//! Persistence contract required by the import engine.
//!
//! The engine only ever talks to the store through [`LeadRepository`]. The
//! PostgreSQL implementation below issues one statement per operation; the
//! phone and email lookups are the only batched reads and are chunked so a
//! large upload never produces an oversized `ANY($1)` array.

use crate::import::data_structures::{ExistingLead, GroupingLink, LeadUpdate, NewLead};
use rocket_db_pools::sqlx::{self, PgPool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Read/write operations the import engine needs from the lead store.
#[rocket::async_trait]
pub trait LeadRepository: Send + Sync {
    /// Existing leads whose stored phone is one of `phones`.
    async fn find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<Vec<ExistingLead>, RepositoryError>;

    /// Existing leads without a phone whose lowercased email is one of `emails`.
    async fn find_phoneless_leads_by_emails(
        &self,
        emails: &[String],
    ) -> Result<Vec<ExistingLead>, RepositoryError>;

    async fn insert_lead(&self, lead: &NewLead) -> Result<i32, RepositoryError>;

    async fn update_lead(&self, lead_id: i32, update: &LeadUpdate) -> Result<(), RepositoryError>;

    async fn find_tag_by_name(&self, name: &str) -> Result<Option<i32>, RepositoryError>;

    async fn insert_tag(&self, name: &str, color: &str) -> Result<i32, RepositoryError>;

    /// Look a tag up by name, creating it when absent.
    ///
    /// The default composes the two primitives; stores that can enforce
    /// name uniqueness should override it with a race-free variant.
    async fn get_or_create_tag(&self, name: &str, color: &str) -> Result<i32, RepositoryError> {
        if let Some(id) = self.find_tag_by_name(name).await? {
            return Ok(id);
        }
        self.insert_tag(name, color).await
    }

    async fn find_grouping_link(
        &self,
        lead_id: i32,
        campaign_id: i32,
    ) -> Result<bool, RepositoryError>;

    async fn insert_grouping_link(&self, link: GroupingLink) -> Result<(), RepositoryError>;

    async fn find_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<bool, RepositoryError>;

    async fn insert_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<(), RepositoryError>;
}

/// [`LeadRepository`] backed by the CRM PostgreSQL schema.
#[derive(Clone)]
pub struct PgLeadRepository {
    pool: PgPool,
    lookup_chunk_size: usize,
}

impl PgLeadRepository {
    pub fn new(pool: PgPool, lookup_chunk_size: usize) -> Self {
        Self {
            pool,
            lookup_chunk_size: lookup_chunk_size.max(1),
        }
    }
}

#[rocket::async_trait]
impl LeadRepository for PgLeadRepository {
    async fn find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<Vec<ExistingLead>, RepositoryError> {
        let mut leads = Vec::new();

        for chunk in phones.chunks(self.lookup_chunk_size) {
            let rows: Vec<ExistingLead> = sqlx::query_as(
                r#"SELECT id, name, phone, company, email, revenue_band, segment, notes
                   FROM leads
                   WHERE phone = ANY($1)"#,
            )
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;

            leads.extend(rows);
        }

        log::debug!(
            "phone lookup: {} phones matched {} existing leads",
            phones.len(),
            leads.len()
        );
        Ok(leads)
    }

    async fn find_phoneless_leads_by_emails(
        &self,
        emails: &[String],
    ) -> Result<Vec<ExistingLead>, RepositoryError> {
        let mut leads = Vec::new();

        for chunk in emails.chunks(self.lookup_chunk_size) {
            let rows: Vec<ExistingLead> = sqlx::query_as(
                r#"SELECT id, name, COALESCE(phone, '') AS phone, company, email,
                          revenue_band, segment, notes
                   FROM leads
                   WHERE COALESCE(phone, '') = ''
                     AND LOWER(TRIM(email)) = ANY($1)"#,
            )
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;

            leads.extend(rows);
        }

        log::debug!(
            "email lookup: {} emails matched {} phoneless leads",
            emails.len(),
            leads.len()
        );
        Ok(leads)
    }

    async fn insert_lead(&self, lead: &NewLead) -> Result<i32, RepositoryError> {
        let record = &lead.record;
        let id: i32 = sqlx::query_scalar(
            r#"INSERT INTO leads (
                   name, company, phone, email, revenue_band, segment, notes,
                   utm_campaign, utm_source, utm_medium, utm_content, utm_term
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               RETURNING id"#,
        )
        .bind(&record.name)
        .bind(&record.company)
        .bind(&lead.phone)
        .bind(&record.email)
        .bind(&record.revenue_band)
        .bind(&record.segment)
        .bind(&record.notes)
        .bind(&record.utm_campaign)
        .bind(&record.utm_source)
        .bind(&record.utm_medium)
        .bind(&record.utm_content)
        .bind(&record.utm_term)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_lead(&self, lead_id: i32, update: &LeadUpdate) -> Result<(), RepositoryError> {
        if update.is_empty() {
            return Ok(());
        }

        // COALESCE keeps the stored value for every column the update leaves unset.
        let result = sqlx::query(
            r#"UPDATE leads
               SET company = COALESCE($2, company),
                   email = COALESCE($3, email),
                   revenue_band = COALESCE($4, revenue_band),
                   segment = COALESCE($5, segment),
                   notes = COALESCE($6, notes),
                   updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(lead_id)
        .bind(&update.company)
        .bind(&update.email)
        .bind(&update.revenue_band)
        .bind(&update.segment)
        .bind(&update.notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Rejected(format!("lead {lead_id} not found")));
        }
        Ok(())
    }

    async fn find_tag_by_name(&self, name: &str) -> Result<Option<i32>, RepositoryError> {
        let id = sqlx::query_scalar("SELECT id FROM tags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_tag(&self, name: &str, color: &str) -> Result<i32, RepositoryError> {
        let id = sqlx::query_scalar("INSERT INTO tags (name, color) VALUES ($1, $2) RETURNING id")
            .bind(name)
            .bind(color)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn get_or_create_tag(&self, name: &str, color: &str) -> Result<i32, RepositoryError> {
        // The unique index on tags.name makes concurrent creators converge on one row.
        let inserted: Option<i32> = sqlx::query_scalar(
            r#"INSERT INTO tags (name, color) VALUES ($1, $2)
               ON CONFLICT (name) DO NOTHING
               RETURNING id"#,
        )
        .bind(name)
        .bind(color)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(id) => {
                log::info!("created import tag '{}' ({})", name, id);
                Ok(id)
            }
            None => self
                .find_tag_by_name(name)
                .await?
                .ok_or_else(|| RepositoryError::Rejected(format!("tag '{name}' vanished"))),
        }
    }

    async fn find_grouping_link(
        &self,
        lead_id: i32,
        campaign_id: i32,
    ) -> Result<bool, RepositoryError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM campaign_leads WHERE lead_id = $1 AND campaign_id = $2)",
        )
        .bind(lead_id)
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_grouping_link(&self, link: GroupingLink) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO campaign_leads (campaign_id, lead_id, stage_id, assigned_to)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (campaign_id, lead_id) DO NOTHING"#,
        )
        .bind(link.campaign_id)
        .bind(link.lead_id)
        .bind(link.stage_id)
        .bind(link.assignee_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<bool, RepositoryError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM lead_tags WHERE lead_id = $1 AND tag_id = $2)",
        )
        .bind(lead_id)
        .bind(tag_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_tag_link(&self, lead_id: i32, tag_id: i32) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO lead_tags (lead_id, tag_id) VALUES ($1, $2)
               ON CONFLICT (lead_id, tag_id) DO NOTHING"#,
        )
        .bind(lead_id)
        .bind(tag_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
