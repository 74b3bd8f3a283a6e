use sqlx::PgPool;
use std::sync::Arc;

use crate::db::{JobStore, PgJobStore};
use crate::services::{queue::JobQueue, storage::ObjectStore};

/// Shared state passed to the foreman's route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<JobQueue>,
    pub objects: Option<Arc<dyn ObjectStore>>,
}

impl AppState {
    pub fn new(db: PgPool, queue: JobQueue, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            store: Arc::new(PgJobStore::new(db.clone())),
            db,
            queue: Arc::new(queue),
            objects,
        }
    }
}
