//! Lead import endpoints: upload a file, poll the run, cancel it.

use crate::error::ApiError;
use crate::import::{FileFormat, JobRegistry, JobSnapshot, LeadImporter};
use crate::models::{CancelResponse, ImportAccepted, ImportParams, SourceKindsResponse};
use rocket::data::{ByteUnit, Data};
use rocket::http::ContentType;
use rocket::response::status::Accepted;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rocket_okapi::openapi;
use std::str::FromStr;
use uuid::Uuid;

/// Pick the file format from the `format` parameter, then the content type.
fn resolve_format(
    format: Option<&str>,
    content_type: Option<&ContentType>,
) -> Result<FileFormat, ApiError> {
    if let Some(format) = format {
        return FileFormat::from_str(format).map_err(|e| ApiError::BadRequest(e.to_string()));
    }

    let spreadsheet = content_type.is_some_and(|ct| {
        let sub = ct.sub().as_str();
        sub.contains("spreadsheet") || sub.contains("excel")
    });

    Ok(if spreadsheet {
        FileFormat::Spreadsheet
    } else {
        FileFormat::Delimited
    })
}

fn parse_job_id(job_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(job_id).map_err(|_| ApiError::BadRequest(format!("invalid job id '{job_id}'")))
}

/// Start an import from the raw file in the request body.
///
/// Validation happens before the body is read; the run itself continues in
/// the background and is polled through `GET /imports/<jobId>`.
#[post("/imports?<params..>", data = "<data>")]
pub async fn start_import(
    params: ImportParams,
    content_type: Option<&ContentType>,
    data: Data<'_>,
    importer: &State<LeadImporter>,
    registry: &State<JobRegistry>,
) -> Result<Accepted<Json<ImportAccepted>>, ApiError> {
    let format = resolve_format(params.format.as_deref(), content_type)?;
    let request = params.into_request(format);

    request.distribution_mode()?;
    if importer.rules().get(&request.source_kind).is_none() {
        return Err(ApiError::BadRequest(format!(
            "unknown source kind '{}' (known: {})",
            request.source_kind,
            importer.rules().kinds().join(", ")
        )));
    }

    let suffix = match format {
        FileFormat::Delimited => ".csv",
        FileFormat::Spreadsheet => ".xlsx",
    };
    let path = tempfile::Builder::new()
        .prefix("lead-import-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| ApiError::InternalError(format!("Failed to create upload file: {e}")))?
        .into_temp_path();

    let limit = ByteUnit::from(importer.config().max_upload_bytes);
    let complete = data
        .open(limit)
        .into_file(&path)
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to store upload: {e}")))?
        .is_complete();

    if !complete {
        return Err(ApiError::PayloadTooLarge(format!(
            "upload exceeds {} bytes",
            importer.config().max_upload_bytes
        )));
    }

    let job_id = registry.start(importer.inner().clone(), request, path);

    Ok(Accepted(Json(ImportAccepted {
        job_id: job_id.to_string(),
    })))
}

/// Current state, progress and result of an import job.
#[openapi(tag = "Imports")]
#[get("/imports/<job_id>")]
pub fn get_import(job_id: &str, registry: &State<JobRegistry>) -> Result<Json<JobSnapshot>, ApiError> {
    let id = parse_job_id(job_id)?;
    let job = registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("import job {job_id} not found")))?;

    Ok(Json(job.snapshot()))
}

/// Request cancellation of a running import. The current batch finishes first.
#[openapi(tag = "Imports")]
#[post("/imports/<job_id>/cancel")]
pub fn cancel_import(
    job_id: &str,
    registry: &State<JobRegistry>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = parse_job_id(job_id)?;
    let job = registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("import job {job_id} not found")))?;

    if !job.is_running() {
        return Err(ApiError::BadRequest(format!(
            "import job {job_id} already finished"
        )));
    }

    job.cancel();
    log::info!("import job {} cancellation requested", job_id);

    Ok(Json(CancelResponse {
        job_id: job_id.to_string(),
        message: "Cancellation requested".to_string(),
    }))
}

/// Rule sets accepted as `sourceKind`.
#[openapi(tag = "Imports")]
#[get("/source-kinds")]
pub fn list_source_kinds(importer: &State<LeadImporter>) -> Json<SourceKindsResponse> {
    Json(SourceKindsResponse {
        source_kinds: importer
            .rules()
            .kinds()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_format_prefers_parameter() {
        assert_eq!(
            resolve_format(Some("xlsx"), Some(&ContentType::CSV)).unwrap(),
            FileFormat::Spreadsheet
        );
        assert!(resolve_format(Some("pdf"), None).is_err());
    }

    #[test]
    fn test_resolve_format_from_content_type() {
        let xlsx = ContentType::new(
            "application",
            "vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        );
        assert_eq!(resolve_format(None, Some(&xlsx)).unwrap(), FileFormat::Spreadsheet);
        assert_eq!(resolve_format(None, None).unwrap(), FileFormat::Delimited);
    }
}
