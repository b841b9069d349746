use crate::error::{Result, StagehandError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where the prompt sits inside the positional window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// Prompt positions start at 0.
    Left,
    /// Prompt positions end at `max_sequence_length`, padding on the left.
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeConfig {
    pub head_dim: usize,
    pub theta: f32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 128,
            theta: 10000.0,
        }
    }
}

/// Shape of the split model. Fixed per model family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLayout {
    pub num_stages: usize,
    pub layers_per_stage: usize,
    pub num_kv_heads: usize,
    pub hidden_dim: usize,
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self {
            num_stages: 4,
            layers_per_stage: 8,
            num_kv_heads: 32,
            hidden_dim: 4096,
        }
    }
}

impl ModelLayout {
    pub fn total_layers(&self) -> usize {
        self.num_stages * self.layers_per_stage
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<u64>,
    pub max_sequence_length: usize,
    pub max_new_tokens: Option<usize>,
    pub num_bos: usize,
    pub num_eos: usize,
    pub alignment: Alignment,
    pub rope: RopeConfig,
    pub layout: ModelLayout,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            seed: None,
            max_sequence_length: 1024,
            max_new_tokens: None,
            num_bos: 1,
            num_eos: 1,
            alignment: Alignment::Left,
            rope: RopeConfig::default(),
            layout: ModelLayout::default(),
        }
    }
}

impl GenerationConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(StagehandError::Config(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() {
            return Err(StagehandError::Config("top_p must be finite".into()));
        }
        if self.max_sequence_length == 0 {
            return Err(StagehandError::Config(
                "max_sequence_length must be non-zero".into(),
            ));
        }
        if self.rope.head_dim == 0 || self.rope.head_dim % 2 != 0 {
            return Err(StagehandError::Config(format!(
                "rope head_dim must be even and non-zero, got {}",
                self.rope.head_dim
            )));
        }
        if self.layout.num_stages == 0 {
            return Err(StagehandError::Config("num_stages must be non-zero".into()));
        }
        Ok(())
    }
}
