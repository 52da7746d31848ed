use rfp_common::error::CommonError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("carryover store error: {0}")]
    Carryover(String),

    #[error("opportunity source error: {0}")]
    Source(String),

    #[error("scoring backend error: {0}")]
    Backend(String),
}

/// Conditions that stop a pipeline run early. The orchestrator converts both into a partial
/// run and still persists everything gathered so far.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("run interrupted by operator")]
    Interrupted,

    #[error("systemic failure: {0}")]
    Systemic(String),
}

impl From<AppError> for PipelineError {
    fn from(err: AppError) -> Self {
        PipelineError::Systemic(err.to_string())
    }
}
