use crate::{
    services::coordinator::Coordinator,
    storage::{disk::DiskBlobStore, sqlite::SqliteMetadataStore},
};
use std::{sync::Arc, time::Duration};

pub type AppCoordinator = Coordinator<SqliteMetadataStore, DiskBlobStore>;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<AppCoordinator>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(coordinator: AppCoordinator, request_timeout: Duration) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            request_timeout,
        }
    }
}
