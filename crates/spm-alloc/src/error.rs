#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid scratchpad properties: {0}")]
    InvalidProperties(String),

    /// Returned by [`Emitter`](crate::emit::Emitter) implementations asked
    /// to produce code the target cannot express.
    #[error("emission not supported: {0}")]
    UnsupportedEmission(String),
}

pub type Result<T> = std::result::Result<T, Error>;
