//! Risk Manager errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Invalid risk configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RiskError>;
