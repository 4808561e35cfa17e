use mailer_module::MailError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job {0} not found")]
    JobNotFound(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider selection failed: no provider available")]
    NoProvider,
    #[error(transparent)]
    Mail(#[from] MailError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("workflow error: {0}")]
    Workflow(String),
}
