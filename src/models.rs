use crate::import::{FileFormat, ImportRequest};
use rocket::form::FromForm;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ===== Import Request Models =====

/// Query parameters of `POST /imports`.
#[derive(Debug, Clone, FromForm)]
pub struct ImportParams {
    #[field(name = "sourceKind")]
    pub source_kind: String,
    #[field(name = "campaignId")]
    pub campaign_id: i32,
    #[field(name = "stageId")]
    pub stage_id: i32,
    #[field(name = "assigneeId")]
    pub assignee_id: Option<i32>,
    #[field(name = "autoDistribute")]
    pub auto_distribute: bool,
    #[field(name = "memberId")]
    pub member_ids: Vec<i32>,
    pub label: String,
    /// `csv`, `xlsx`, ...; falls back to the request content type.
    pub format: Option<String>,
}

impl ImportParams {
    pub fn into_request(self, format: FileFormat) -> ImportRequest {
        ImportRequest {
            campaign_id: self.campaign_id,
            stage_id: self.stage_id,
            fixed_assignee_id: self.assignee_id,
            auto_distribute: self.auto_distribute,
            member_ids: self.member_ids,
            source_kind: self.source_kind,
            import_label: self.label,
            format: Some(format),
        }
    }
}

// ===== Import Response Models =====

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportAccepted {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: String,
    pub message: String,
}

/// Rule sets available for `sourceKind`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceKindsResponse {
    pub source_kinds: Vec<String>,
}
