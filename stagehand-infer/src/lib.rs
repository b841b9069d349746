pub mod pipeline;
pub mod rope;
pub mod sampler;
pub mod utf8;

use std::path::{Path, PathBuf};
use std::time::Instant;

use stagehand_backend::{KvCache, PipelineKind, StageLoader};
use stagehand_core::config::{Alignment, GenerationConfig};
use stagehand_core::error::{Result, StagehandError};
use stagehand_core::tokenizer::Tokenizer;

use crate::pipeline::Pipeline;
use crate::rope::RopeTable;
use crate::sampler::Sampler;
use crate::utf8::FragmentAssembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    MaxSequenceLength,
    MaxNewTokens,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub prompt_tokens: usize,
    pub tokens: Vec<u32>,
    /// One fragment per produced token.
    pub fragments: Vec<String>,
    pub finish_reason: FinishReason,
    pub prefill_ms: f64,
    pub decode_ms: f64,
}

impl Generation {
    pub fn text(&self) -> String {
        self.fragments.concat()
    }
}

// lives for one generate call
struct GenerationState {
    // position the next token will be evaluated at
    position: usize,
    prompt_len: usize,
    tokens: Vec<u32>,
    caches: Vec<KvCache>,
}

impl GenerationState {
    fn new(config: &GenerationConfig, prompt: Vec<u32>) -> Self {
        let layout = &config.layout;
        let cache = KvCache::new(
            layout.layers_per_stage,
            layout.num_kv_heads,
            config.rope.head_dim,
            config.max_sequence_length,
        );
        Self {
            position: 0,
            prompt_len: prompt.len(),
            tokens: prompt,
            caches: vec![cache; layout.num_stages],
        }
    }

    fn produced(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }
}

/// Drives prefill and decode over a split model.
///
/// Owns both stage pipelines and is the only caller of the backend; `generate` takes
/// `&mut self`, so at most one stage invocation is ever in flight per instance.
pub struct Orchestrator {
    config: GenerationConfig,
    tokenizer: Tokenizer,
    sampler: Sampler,
    rope: RopeTable,
    prompt_pipeline: Pipeline,
    generator_pipeline: Pipeline,
    creation_error: Option<StagehandError>,
}

impl Orchestrator {
    /// Load the vocabulary and every stage. Never fails outright: check
    /// [`Orchestrator::creation_status`] before generating.
    pub fn new(
        config: GenerationConfig,
        prompt_sources: Vec<PathBuf>,
        generator_sources: Vec<PathBuf>,
        vocab_source: &Path,
        loader: &dyn StageLoader,
    ) -> Self {
        let assembled = config.validate().and_then(|()| {
            let tokenizer = Tokenizer::from_file(vocab_source)?;
            let prompt = Pipeline::load(PipelineKind::PromptProcessor, &prompt_sources, loader)?;
            let generator =
                Pipeline::load(PipelineKind::TokenGenerator, &generator_sources, loader)?;
            Self::from_parts(config.clone(), tokenizer, prompt, generator)
        });

        match assembled {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                tracing::warn!(error = %e, "orchestrator creation failed");
                Self {
                    sampler: Sampler::with_seed(0, config.temperature, config.top_p, 0),
                    rope: RopeTable::new(0, 0),
                    config,
                    tokenizer: Tokenizer::default(),
                    prompt_pipeline: Pipeline::new(PipelineKind::PromptProcessor, Vec::new()),
                    generator_pipeline: Pipeline::new(PipelineKind::TokenGenerator, Vec::new()),
                    creation_error: Some(e),
                }
            }
        }
    }

    /// Assemble from an already-loaded tokenizer and pipelines.
    pub fn from_parts(
        config: GenerationConfig,
        tokenizer: Tokenizer,
        prompt_pipeline: Pipeline,
        generator_pipeline: Pipeline,
    ) -> Result<Self> {
        config.validate()?;
        if tokenizer.vocab_size() == 0 {
            return Err(StagehandError::VocabularyLoad("vocabulary is empty".into()));
        }
        let stages = config.layout.num_stages;
        if prompt_pipeline.len() != stages || generator_pipeline.len() != stages {
            return Err(StagehandError::Config(format!(
                "expected {stages} stages per pipeline, got {} prompt and {} decode",
                prompt_pipeline.len(),
                generator_pipeline.len()
            )));
        }

        let vocab_size = tokenizer.vocab_size();
        let sampler = match config.seed {
            Some(seed) => Sampler::with_seed(vocab_size, config.temperature, config.top_p, seed),
            None => Sampler::new(vocab_size, config.temperature, config.top_p)?,
        };
        let rope = RopeTable::with_theta(
            config.rope.head_dim,
            config.max_sequence_length,
            config.rope.theta,
        );

        tracing::info!(
            vocab_size,
            stages,
            layers = config.layout.total_layers(),
            max_sequence_length = config.max_sequence_length,
            "orchestrator ready"
        );

        Ok(Self {
            config,
            tokenizer,
            sampler,
            rope,
            prompt_pipeline,
            generator_pipeline,
            creation_error: None,
        })
    }

    pub fn creation_status(&self) -> bool {
        self.creation_error.is_none()
    }

    pub fn creation_error(&self) -> Option<&StagehandError> {
        self.creation_error.as_ref()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate text for `prompt`, one fragment per produced token.
    ///
    /// Empty on any failure; use [`Orchestrator::try_generate`] to see why.
    pub fn generate(&mut self, prompt: &str) -> Vec<String> {
        match self.try_generate(prompt) {
            Ok(generation) => generation.fragments,
            Err(e) => {
                tracing::warn!(error = %e, "generation failed");
                Vec::new()
            }
        }
    }

    pub fn try_generate(&mut self, prompt: &str) -> Result<Generation> {
        if let Some(e) = &self.creation_error {
            return Err(StagehandError::Config(format!("orchestrator unusable: {e}")));
        }

        let max_len = self.config.max_sequence_length;
        let vocab_size = self.tokenizer.vocab_size();
        let eos = self.tokenizer.eos_id();

        // 1. encode
        let prompt_ids = self
            .tokenizer
            .encode(prompt, self.config.num_bos, self.config.num_eos);
        let n = prompt_ids.len();
        if n > max_len {
            return Err(StagehandError::PromptTooLong { tokens: n, max: max_len });
        }
        if n == 0 {
            return Err(StagehandError::Inference("prompt encodes to no tokens".into()));
        }

        // 2. positions
        let start = match self.config.alignment {
            Alignment::Left => 0,
            Alignment::Right => max_len - n,
        };
        let positions: Vec<usize> = (start..start + n).collect();
        tracing::info!(
            prompt_tokens = n,
            start,
            alignment = ?self.config.alignment,
            "generation started"
        );

        let mut state = GenerationState::new(&self.config, prompt_ids);

        // 3. prefill
        let prefill_start = Instant::now();
        let phases = self.rope.slice(&positions)?;
        let mut logits =
            self.prompt_pipeline
                .run(&state.tokens, &phases, &mut state.caches, vocab_size)?;
        state.position = start + n;
        let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;

        // 4-5. decode until EOS or the window is full
        let decode_start = Instant::now();
        let limit = self.config.max_new_tokens.unwrap_or(usize::MAX);
        let finish_reason = loop {
            if state.produced().len() >= limit {
                break FinishReason::MaxNewTokens;
            }
            let next = self.sampler.sample(&mut logits)?;
            if next == eos {
                break FinishReason::Eos;
            }
            state.tokens.push(next);

            if state.position >= max_len {
                break FinishReason::MaxSequenceLength;
            }
            if state.produced().len() >= limit {
                break FinishReason::MaxNewTokens;
            }

            let phases = self.rope.slice(&[state.position])?;
            logits = self
                .generator_pipeline
                .run(&[next], &phases, &mut state.caches, vocab_size)?;
            state.position += 1;
        };
        let decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;

        // 6. text
        let fragments = self.decode_fragments(&state);
        let produced = state.produced().to_vec();

        tracing::info!(
            reason = ?finish_reason,
            produced = produced.len(),
            prefill_ms,
            decode_ms,
            "generation finished"
        );

        Ok(Generation {
            prompt_tokens: n,
            tokens: produced,
            fragments,
            finish_reason,
            prefill_ms,
            decode_ms,
        })
    }

    fn decode_fragments(&self, state: &GenerationState) -> Vec<String> {
        let mut assembler = FragmentAssembler::default();
        let mut prev = state.tokens[state.prompt_len - 1];
        let mut fragments: Vec<String> = state
            .produced()
            .iter()
            .map(|&id| {
                let fragment = assembler.push(&self.tokenizer.decode(prev, id));
                prev = id;
                fragment
            })
            .collect();
        if let Some(last) = fragments.last_mut() {
            last.push_str(&assembler.finish());
        }
        fragments
    }
}
