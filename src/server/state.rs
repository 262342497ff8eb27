// Application state shared by every HTTP handler.
use crate::store::Store;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub assets_path: String,
    pub last_reconcile_unix: Arc<RwLock<Option<i64>>>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        assets_path: String,
        last_reconcile_unix: Arc<RwLock<Option<i64>>>,
    ) -> Self {
        Self {
            store,
            assets_path,
            last_reconcile_unix,
        }
    }
}
