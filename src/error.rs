//! Domain error types shared by the store, the external clients and the stages.

use thiserror::Error;

/// Leaf errors of the feedback pipeline.
///
/// Stages wrap these in `anyhow` context chains; callers that need to branch on
/// the cause use `anyhow::Error::downcast_ref::<FeedbackError>()`.
#[derive(Debug, Error)]
pub enum FeedbackError {
    /// Filter parameters that cannot select anything.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("object not found")]
    ObjectNotFound,

    #[error("{service} responded with unexpected status {status}: {body}")]
    BadStatusCode {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid phone number format: {0}")]
    InvalidPhoneFormat(String),

    /// New orders were fetched but none of them could be stored.
    #[error("orders were missed trying to be added ({fetched} fetched)")]
    OrdersMissed { fetched: usize },

    #[error("job cancelled")]
    Cancelled,
}

impl FeedbackError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound)
    }
}
