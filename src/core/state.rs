use std::sync::Arc;

use crate::core::config::Settings;
use crate::repositories::TaskStore;
use crate::services::health::HealthReporter;
use crate::services::resource_cache::ResourceCache;
use crate::tasks::dispatcher::TaskDispatcher;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    tasks: Arc<dyn TaskStore>,
    dispatcher: TaskDispatcher,
    cache: Arc<ResourceCache>,
    health: HealthReporter,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        tasks: Arc<dyn TaskStore>,
        dispatcher: TaskDispatcher,
        cache: Arc<ResourceCache>,
        health: HealthReporter,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, tasks, dispatcher, cache, health }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn tasks(&self) -> &dyn TaskStore {
        self.inner.tasks.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &TaskDispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    pub(crate) fn health(&self) -> &HealthReporter {
        &self.inner.health
    }
}
