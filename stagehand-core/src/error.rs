use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("vocabulary load failed: {0}")]
    VocabularyLoad(String),

    #[error("prompt too long: {tokens} tokens, max {max}")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("token id {id} out of range for vocabulary of {vocab_size}")]
    OutOfRangeToken { id: u32, vocab_size: usize },

    #[error("position {position} out of range, table holds {max} positions")]
    PositionOutOfRange { position: usize, max: usize },

    #[error("{phase} stage {stage} failed: {reason}")]
    Backend {
        phase: String,
        stage: usize,
        reason: String,
    },

    #[error("stage load failed: {0}")]
    StageLoad(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("invalid logits: {0}")]
    InvalidLogits(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StagehandError {
    /// Errors after which the caller may adjust its input and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StagehandError::PromptTooLong { .. } | StagehandError::OutOfRangeToken { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StagehandError>;
