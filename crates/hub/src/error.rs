/// Errors surfaced by zone control calls.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown zone '{0}'")]
    ZoneNotFound(String),

    #[error("invalid zone update: {0}")]
    InvalidUpdate(String),

    #[error("hub is shutting down")]
    ShuttingDown,
}
