//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;
use object_store::ObjectStore;
use patchwork_control::{
    ContentStore, MemoryStore, MockExecutor, OverlayManager, OverlayStore, RedeployExecutor,
};

/// Complete test control plane with every component wired together.
///
/// The overlay store and the object store outlive the manager, so
/// [`TestControl::restart`] can stand up a fresh manager over the same data.
pub struct TestControl {
    pub manager: OverlayManager,
    pub executor: Arc<MockExecutor>,
    pub store: Arc<MemoryStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl TestControl {
    /// Creates a control plane over the two-group topology with base content
    /// deployed everywhere.
    pub async fn new() -> Self {
        Self::with_objects(Arc::new(InMemory::new())).await
    }

    /// Creates a control plane writing content into `objects`.
    pub async fn with_objects(objects: Arc<dyn ObjectStore>) -> Self {
        let executor = Arc::new(MockExecutor::new());
        fixtures::deploy_base_everywhere(&executor);

        let store = Arc::new(MemoryStore::new());
        let manager = open_manager(&store, &objects, &executor).await;

        Self {
            manager,
            executor,
            store,
            objects,
        }
    }

    /// Drops the manager and opens a new one over the same store, object
    /// store and running servers.
    pub async fn restart(self) -> Self {
        let Self {
            manager,
            executor,
            store,
            objects,
        } = self;
        drop(manager);

        let manager = open_manager(&store, &objects, &executor).await;
        Self {
            manager,
            executor,
            store,
            objects,
        }
    }
}

async fn open_manager(
    store: &Arc<MemoryStore>,
    objects: &Arc<dyn ObjectStore>,
    executor: &Arc<MockExecutor>,
) -> OverlayManager {
    OverlayManager::open(
        Arc::clone(store) as Arc<dyn OverlayStore>,
        Arc::new(ContentStore::new(Arc::clone(objects), "overlay-content")),
        Arc::new(fixtures::topology()),
        Arc::clone(executor) as Arc<dyn RedeployExecutor>,
        Duration::from_secs(5),
    )
    .await
    .expect("open failed")
}
