//! HTTP handlers. Each one resolves the caller, runs one coordinator
//! operation under the request deadline, and maps the outcome to a response.

pub mod bucket_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod identity;
pub mod serve;

use crate::{errors::AppError, models::identity::Identity, services::coordinator::CoordinatorError};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Run `operation` under `deadline`. A timed-out operation is dropped, which
/// rolls back whatever metadata transaction it had open.
pub async fn with_deadline<T, F>(deadline: Duration, operation: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, CoordinatorError>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => {
            warn!("operation abandoned after {:?}", deadline);
            Err(AppError::timed_out())
        }
    }
}

/// Management routes are restricted to admins and roots.
pub fn require_manager(identity: &Identity) -> Result<(), AppError> {
    if identity.can_manage() {
        Ok(())
    } else {
        Err(AppError::forbidden("management requires the admin or root role"))
    }
}
