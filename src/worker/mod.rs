mod once;
mod periodic;

/// Completion marker written by run-once.
pub(crate) const PROGRESS_KEY: &str = "progress";
pub(crate) const PROGRESS_DONE: &str = "done";

/// RFC 1123 timestamp of the last run-periodically execution.
pub(crate) const LAST_PERFORMED_KEY: &str = "lastPerformed";
