//! Contract between the generation loop and the compute backend that runs
//! compiled model stages. Stage implementations live outside this workspace.

pub mod kv_cache;

pub use kv_cache::KvCache;

use stagehand_core::error::{Result, StagehandError};
use std::fmt;
use std::path::Path;

/// The two compiled graph shapes of a split model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Many positions per call (prefill).
    PromptProcessor,
    /// One position per call, extending the carried cache (decode).
    TokenGenerator,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::PromptProcessor => f.write_str("prompt"),
            PipelineKind::TokenGenerator => f.write_str("decode"),
        }
    }
}

/// Dense row-major f32 activations.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(StagehandError::Inference(format!(
                "tensor shape {shape:?} needs {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Leading dimension, i.e. the number of positions for `[seq, hidden]` activations.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }
}

/// Per-request RoPE rows: `cos[i * half_dim..(i + 1) * half_dim]` belongs to `positions[i]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseSlice {
    pub positions: Vec<usize>,
    pub half_dim: usize,
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
}

impl PhaseSlice {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn cos_row(&self, i: usize) -> &[f32] {
        &self.cos[i * self.half_dim..(i + 1) * self.half_dim]
    }

    pub fn sin_row(&self, i: usize) -> &[f32] {
        &self.sin[i * self.half_dim..(i + 1) * self.half_dim]
    }
}

/// What a stage consumes: token ids for the first stage, activations after that.
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    Tokens(Vec<u32>),
    Hidden(Tensor),
}

impl StageInput {
    /// Number of positions carried by this input.
    pub fn positions(&self) -> usize {
        match self {
            StageInput::Tokens(t) => t.len(),
            StageInput::Hidden(h) => h.rows(),
        }
    }
}

/// What a stage produces: activations for the next stage, or logits from the last one.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Hidden(Tensor),
    Logits(Vec<f32>),
}

/// One compiled block of transformer layers.
///
/// `invoke` may block for the duration of the accelerator call. The caller owns the
/// cache between calls and hands it back in on the next invocation of the same stage index.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        input: StageInput,
        phases: &PhaseSlice,
        cache: KvCache,
    ) -> Result<(StageOutput, KvCache)>;
}

/// Turns a stage source (a compiled model file) into a stage handle.
pub trait StageLoader {
    fn load(&self, source: &Path, kind: PipelineKind, index: usize) -> Result<Box<dyn Stage>>;
}

impl<F> StageLoader for F
where
    F: Fn(&Path, PipelineKind, usize) -> Result<Box<dyn Stage>>,
{
    fn load(&self, source: &Path, kind: PipelineKind, index: usize) -> Result<Box<dyn Stage>> {
        self(source, kind, index)
    }
}
