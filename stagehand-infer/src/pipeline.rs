use stagehand_backend::{KvCache, PhaseSlice, PipelineKind, Stage, StageInput, StageLoader, StageOutput};
use stagehand_core::error::{Result, StagehandError};
use std::path::PathBuf;
use std::time::Instant;

/// Ordered stages of one compiled graph shape. Built once, invoked by index.
pub struct Pipeline {
    kind: PipelineKind,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(kind: PipelineKind, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { kind, stages }
    }

    pub fn load(kind: PipelineKind, sources: &[PathBuf], loader: &dyn StageLoader) -> Result<Self> {
        let mut stages = Vec::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            let stage = loader.load(source, kind, i).map_err(|e| {
                StagehandError::StageLoad(format!("{kind} stage {i} ({}): {e}", source.display()))
            })?;
            tracing::debug!(phase = %kind, stage = i, name = stage.name(), "stage loaded");
            stages.push(stage);
        }
        Ok(Self::new(kind, stages))
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    fn failure(&self, stage: usize, reason: impl Into<String>) -> StagehandError {
        let reason = reason.into();
        tracing::warn!(phase = %self.kind, stage, %reason, "stage invocation failed");
        StagehandError::Backend {
            phase: self.kind.to_string(),
            stage,
            reason,
        }
    }

    /// Run `tokens` through every stage in order and return the final stage's logits.
    ///
    /// `caches[i]` goes into stage `i` and is replaced by what the stage hands back.
    pub fn run(
        &self,
        tokens: &[u32],
        phases: &PhaseSlice,
        caches: &mut [KvCache],
        vocab_size: usize,
    ) -> Result<Vec<f32>> {
        if self.stages.is_empty() {
            return Err(self.failure(0, "pipeline has no stages"));
        }
        if caches.len() != self.stages.len() {
            return Err(self.failure(
                0,
                format!("{} caches for {} stages", caches.len(), self.stages.len()),
            ));
        }

        let positions = phases.len();
        let last = self.stages.len() - 1;
        let mut input = StageInput::Tokens(tokens.to_vec());

        for (i, stage) in self.stages.iter().enumerate() {
            let start = Instant::now();
            let cache = std::mem::take(&mut caches[i]);
            let (output, cache) = stage
                .invoke(input, phases, cache)
                .map_err(|e| self.failure(i, e.to_string()))?;
            caches[i] = cache;

            tracing::debug!(
                phase = %self.kind,
                stage = i,
                positions,
                elapsed_us = start.elapsed().as_micros() as u64,
                "stage invoked"
            );

            input = match (output, i == last) {
                (StageOutput::Hidden(h), false) => {
                    if h.rows() != positions {
                        return Err(self.failure(
                            i,
                            format!("activations for {} positions, expected {positions}", h.rows()),
                        ));
                    }
                    StageInput::Hidden(h)
                }
                (StageOutput::Logits(logits), true) => {
                    if logits.len() != vocab_size {
                        return Err(self.failure(
                            i,
                            format!("{} logits, expected {vocab_size}", logits.len()),
                        ));
                    }
                    return Ok(logits);
                }
                (StageOutput::Hidden(_), true) => {
                    return Err(self.failure(i, "final stage returned activations, expected logits"));
                }
                (StageOutput::Logits(_), false) => {
                    return Err(self.failure(i, "logits returned before the final stage"));
                }
            };
        }

        unreachable!("the final stage always returns")
    }
}
