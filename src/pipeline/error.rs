use crate::ai::AiError;
use crate::ledger::LedgerError;
use crate::marketplace::MarketplaceError;
use crate::recovery::{Classify, ErrorKind, classify_message};
use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
    details: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineErrorKind {
    ExternalService,
    Validation,
    InsufficientData,
    DuplicateJob,
    Generation,
    Configuration,
    Internal,
}

impl PipelineError {
    fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
            details: Vec::new(),
        }
    }

    pub fn external(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::ExternalService, message)
    }

    pub fn validation(stage: &'static str, message: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            details,
            ..Self::new(stage, PipelineErrorKind::Validation, message)
        }
    }

    pub fn insufficient_data(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::InsufficientData, message)
    }

    pub fn duplicate_job(stage: &'static str, job_key: &str) -> Self {
        Self::new(
            stage,
            PipelineErrorKind::DuplicateJob,
            format!("job `{job_key}` is already in progress"),
        )
    }

    pub fn generation(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Generation, message)
    }

    pub fn configuration(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Configuration, message)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Internal, message)
    }

    pub fn from_ledger(stage: &'static str, err: LedgerError) -> Self {
        match err {
            LedgerError::DuplicateJob(key) => Self::duplicate_job(stage, &key),
            other => Self::internal(stage, other.to_string()),
        }
    }

    pub fn from_store(stage: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => Self::external(stage, err.to_string()),
            StoreError::NotFound { .. } | StoreError::Invalid(_) => {
                Self::internal(stage, err.to_string())
            }
        }
    }

    pub fn from_ai(stage: &'static str, err: &AiError) -> Self {
        match err {
            AiError::Malformed(_) => Self::generation(stage, err.to_string()),
            AiError::MissingConfig(_) | AiError::UnknownProvider(_) | AiError::Unsupported(_) => {
                Self::configuration(stage, err.to_string())
            }
            _ => Self::external(stage, err.to_string()),
        }
    }

    pub fn from_marketplace(stage: &'static str, err: &MarketplaceError) -> Self {
        match err {
            MarketplaceError::NotConfigured(_) => Self::configuration(stage, err.to_string()),
            _ => Self::external(stage, err.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn details(&self) -> &[String] {
        &self.details
    }
}

impl Classify for PipelineError {
    fn error_kind(&self) -> ErrorKind {
        match self.kind {
            PipelineErrorKind::Configuration => ErrorKind::ConfigError,
            PipelineErrorKind::ExternalService => match classify_message(&self.message) {
                ErrorKind::UnknownError => ErrorKind::ApiError,
                kind => kind,
            },
            _ => ErrorKind::UnknownError,
        }
    }

    fn is_retryable(&self) -> bool {
        self.kind == PipelineErrorKind::ExternalService
    }
}
