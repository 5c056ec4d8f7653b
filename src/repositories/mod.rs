pub(crate) mod examples;
pub(crate) mod health;
pub(crate) mod store;
pub(crate) mod tasks;

pub(crate) use store::{
    CompletionOutcome, ExampleFilter, ExampleStore, NewExample, NewTask, PgExampleStore,
    PgTaskStore, TaskCompletion, TaskStore, TaskWithResult,
};
