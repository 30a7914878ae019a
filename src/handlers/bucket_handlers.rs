//! Bucket management: create and edit.

use super::{require_manager, with_deadline};
use crate::{
    errors::AppError,
    models::{
        bucket::{Bucket, BucketAvailability},
        identity::Identity,
    },
    services::coordinator::{CreateBucketRequest, EditBucketRequest},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateBucketBody {
    pub name: String,
    /// New buckets are closed unless asked otherwise.
    #[serde(default = "closed")]
    pub availability: BucketAvailability,
}

fn closed() -> BucketAvailability {
    BucketAvailability::Closed
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBucketBody {
    pub availability: Option<BucketAvailability>,
    pub size_quota: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketView {
    pub name: String,
    pub availability: BucketAvailability,
    pub size_quota: f64,
}

impl From<Bucket> for BucketView {
    fn from(bucket: Bucket) -> Self {
        Self {
            name: bucket.name,
            availability: bucket.availability,
            size_quota: bucket.size_quota,
        }
    }
}

/// `POST /api/manage/buckets`
pub async fn create_bucket(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<CreateBucketBody>,
) -> Result<(StatusCode, Json<BucketView>), AppError> {
    require_manager(&identity)?;
    let request = CreateBucketRequest {
        name: body.name,
        availability: body.availability,
        owner: identity.user_id,
    };
    let bucket = with_deadline(
        state.request_timeout,
        state.coordinator.create_bucket(request),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(bucket.into())))
}

/// `PATCH /api/manage/buckets/{bucket}`
pub async fn edit_bucket(
    State(state): State<AppState>,
    identity: Identity,
    Path(bucket): Path<String>,
    Json(body): Json<EditBucketBody>,
) -> Result<Json<BucketView>, AppError> {
    require_manager(&identity)?;
    let request = EditBucketRequest {
        bucket_name: bucket,
        requester: identity.user_id,
        availability: body.availability,
        size_quota: body.size_quota,
    };
    let bucket =
        with_deadline(state.request_timeout, state.coordinator.edit_bucket(request)).await?;
    Ok(Json(bucket.into()))
}
