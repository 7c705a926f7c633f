use thiserror::Error;

use crate::action::RegistryError;
use crate::coordination::CoordinationError;
use crate::job::JobError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
