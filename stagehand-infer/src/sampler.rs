use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stagehand_core::error::{Result, StagehandError};

/// Picks the next token from a logits vector.
///
/// temperature 0 is greedy argmax. Otherwise logits are scaled and softmaxed, then
/// sampled from the full distribution (`top_p <= 0` or `>= 1`) or from the nucleus.
pub struct Sampler {
    vocab_size: usize,
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Seeded from OS entropy. Fails if the OS cannot provide any.
    pub fn new(vocab_size: usize, temperature: f32, top_p: f32) -> Result<Self> {
        let rng = StdRng::try_from_os_rng()
            .map_err(|e| StagehandError::Inference(format!("OS entropy unavailable: {e}")))?;
        Ok(Self {
            vocab_size,
            temperature,
            top_p,
            rng,
        })
    }

    pub fn with_seed(vocab_size: usize, temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            vocab_size,
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Sample one token id.
    ///
    /// `logits` is modified in place: after a non-greedy call it holds the
    /// temperature-scaled softmax probabilities. Exactly one random draw is made when
    /// temperature is non-zero, none otherwise.
    pub fn sample(&mut self, logits: &mut [f32]) -> Result<u32> {
        if logits.is_empty() || logits.len() != self.vocab_size {
            return Err(StagehandError::InvalidLogits(format!(
                "expected {} logits, got {}",
                self.vocab_size,
                logits.len()
            )));
        }

        if self.temperature == 0.0 {
            return Ok(argmax(logits) as u32);
        }

        for l in logits.iter_mut() {
            *l /= self.temperature;
        }
        softmax(logits);

        let coin: f32 = self.rng.random();
        let next = if self.top_p <= 0.0 || self.top_p >= 1.0 {
            sample_mult(logits, coin)
        } else {
            sample_top_p(logits, self.top_p, coin)
        };
        Ok(next as u32)
    }
}

/// First index of the maximum value.
pub fn argmax(values: &[f32]) -> usize {
    let mut best_idx = 0;
    let mut best_val = values[0];
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > best_val {
            best_idx = i;
            best_val = v;
        }
    }
    best_idx
}

/// Numerically stable softmax, in place.
pub fn softmax(values: &mut [f32]) {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv_sum = 1.0 / sum;
    for v in values.iter_mut() {
        *v *= inv_sum;
    }
}

/// Walk the CDF; `coin` in `[0, 1)`. Falls back to the last index on rounding.
fn sample_mult(probs: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i;
        }
    }
    probs.len() - 1
}

/// Nucleus sampling: only the smallest high-probability set whose mass exceeds `top_p`.
fn sample_top_p(probs: &[f32], top_p: f32, coin: f32) -> usize {
    let n = probs.len();
    if n == 1 {
        return 0;
    }

    // tokens below this can never be part of the nucleus
    let cutoff = (1.0 - top_p) / (n - 1) as f32;
    let mut candidates: Vec<usize> = (0..n).filter(|&i| probs[i] > cutoff).collect();
    if candidates.is_empty() {
        candidates = (0..n).collect();
    }
    candidates.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut last = candidates.len() - 1;
    for (rank, &idx) in candidates.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > top_p {
            last = rank;
            break;
        }
    }

    let r = coin * cumulative;
    let mut cdf = 0.0f32;
    for &idx in &candidates[..=last] {
        cdf += probs[idx];
        if r < cdf {
            return idx;
        }
    }
    candidates[last]
}
