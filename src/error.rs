// Errors that a caller of UpstreamClient needs to branch on. Everything else
// in the crate carries context through anyhow::Result, same as the rest of
// the stack.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("request to upstream provider failed: {0}")]
    Transient(#[from] reqwest::Error),
    #[error("malformed field in upstream payload: {0}")]
    Malformed(String),
    #[error("provider published no schedule for this route")]
    NoSchedule,
}
