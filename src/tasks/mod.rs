pub(crate) mod dispatcher;
pub(crate) mod evaluation;
pub(crate) mod scheduler;
