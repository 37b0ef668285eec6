use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("Feedback has fewer receive deltas than received packets")]
    ErrMissingRecvDeltas,
    #[error("Invalid field trial value: {0}")]
    ErrInvalidFieldTrialValue(String),

    #[error("{0}")]
    Other(String),
}
