//! File endpoints: multipart upload, fetch, listing, edit and delete.

use super::{require_manager, serve::file_response, with_deadline};
use crate::{
    errors::AppError,
    models::{
        file::{FileAccess, FileEntry},
        identity::Identity,
    },
    services::coordinator::{
        CoordinatorError, CoordinatorResult, EditFileRequest, UploadItem, UploadOutcome,
        UploadSource, file_entry,
    },
    state::AppState,
};
use async_trait::async_trait;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub access: Option<FileAccess>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub results: Vec<UploadResult>,
}

/// Outcome of one multipart part.
#[derive(Debug, Serialize)]
pub struct UploadResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<UploadOutcome> for UploadResult {
    fn from(outcome: UploadOutcome) -> Self {
        match outcome.result {
            Ok(id) => Self {
                id: Some(id),
                name: outcome.filename,
                result: "ok",
                error: None,
            },
            Err(err) => Self {
                id: None,
                name: outcome.filename,
                result: "error",
                error: Some(AppError::from(err).message),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
pub struct EditFileBody {
    pub filename: Option<String>,
    pub access: Option<FileAccess>,
}

/// Every part of a multipart body is one upload item. The part's file name
/// is the stored filename, falling back to the field name.
struct MultipartItems {
    multipart: Multipart,
    access: FileAccess,
}

#[async_trait]
impl UploadSource for MultipartItems {
    async fn next_item(&mut self) -> CoordinatorResult<Option<UploadItem<'_>>> {
        let field = self
            .multipart
            .next_field()
            .await
            .map_err(|err| CoordinatorError::BadRequest(err.body_text()))?;
        let Some(field) = field else {
            return Ok(None);
        };

        let filename = field
            .file_name()
            .or_else(|| field.name())
            .unwrap_or_default()
            .to_string();
        let mime = field.content_type().unwrap_or_default().to_string();
        Ok(Some(UploadItem {
            filename,
            mime,
            access: self.access,
            body: field.map(|chunk| chunk.map_err(io::Error::other)).boxed(),
        }))
    }
}

/// `POST /api/buckets/{bucket}?access=public|private`. Admin or root only.
/// The deadline applies per part; parts finished before it keep their result.
pub async fn upload_files(
    State(state): State<AppState>,
    identity: Identity,
    Path(bucket): Path<String>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    require_manager(&identity)?;

    let mut items = MultipartItems {
        multipart,
        access: query.access.unwrap_or_default(),
    };
    let deadline = Instant::now() + state.request_timeout;
    let outcomes = state
        .coordinator
        .upload_files(&bucket, identity.user_id, &mut items, deadline)
        .await;

    Ok(Json(UploadResponse {
        results: outcomes.into_iter().map(UploadResult::from).collect(),
    }))
}

/// `GET|HEAD /buckets/{bucket}/{file_id}`. Anonymous callers are allowed.
pub async fn fetch_file(
    State(state): State<AppState>,
    identity: Option<Identity>,
    Path((bucket, file_id)): Path<(String, Uuid)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let requester = identity.map(|identity| identity.user_id);
    let download = with_deadline(
        state.request_timeout,
        state.coordinator.fetch_file(&bucket, file_id, requester),
    )
    .await?;
    file_response(download, &headers, method == Method::HEAD).await
}

/// `GET /api/manage/buckets/{bucket}/files`
pub async fn list_files(
    State(state): State<AppState>,
    identity: Identity,
    Path(bucket): Path<String>,
) -> Result<Json<FileListing>, AppError> {
    require_manager(&identity)?;
    let files = with_deadline(
        state.request_timeout,
        state.coordinator.list_files(&bucket, identity.user_id),
    )
    .await?;
    Ok(Json(FileListing { files }))
}

/// `PATCH /api/manage/buckets/{bucket}/{file_id}`
pub async fn edit_file(
    State(state): State<AppState>,
    identity: Identity,
    Path((bucket, file_id)): Path<(String, Uuid)>,
    Json(body): Json<EditFileBody>,
) -> Result<Json<FileEntry>, AppError> {
    require_manager(&identity)?;
    let request = EditFileRequest {
        bucket_name: bucket,
        file_id,
        requester: identity.user_id,
        filename: body.filename,
        access: body.access,
    };
    let file = with_deadline(state.request_timeout, state.coordinator.edit_file(request)).await?;
    Ok(Json(file_entry(file)))
}

/// `DELETE /api/manage/buckets/{bucket}/{file_id}`
pub async fn delete_file(
    State(state): State<AppState>,
    identity: Identity,
    Path((bucket, file_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    require_manager(&identity)?;
    with_deadline(
        state.request_timeout,
        state
            .coordinator
            .delete_file(&bucket, file_id, identity.user_id),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
