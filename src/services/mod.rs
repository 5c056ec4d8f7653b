pub(crate) mod health;
pub(crate) mod llm_scoring;
pub(crate) mod notifier;
pub(crate) mod resource_cache;
pub(crate) mod retrieval;
pub(crate) mod storage;
pub(crate) mod submissions;
