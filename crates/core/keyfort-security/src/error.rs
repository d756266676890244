use std::time::Duration;

use crate::HashAlgo;

#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
    #[error("no idle signer within {0:?}")]
    NoIdleSigner(Duration),

    #[error("could not get idle digest for {0}")]
    NoIdleDigest(HashAlgo),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
