pub mod config;
pub mod error;
pub mod mmap;
pub mod tokenizer;

pub use config::{Alignment, GenerationConfig, ModelLayout, RopeConfig};
pub use error::{Result, StagehandError};
pub use tokenizer::Tokenizer;
