use stagehand_backend::PhaseSlice;
use stagehand_core::error::{Result, StagehandError};

pub const DEFAULT_THETA: f32 = 10000.0;

/// Precomputed rotary position embedding phases.
///
/// Row `p` holds `cos`/`sin` of `p * theta^(-2j / head_dim)` for `j` in `0..head_dim / 2`.
/// Theta and the table length must match the model's trained configuration.
pub struct RopeTable {
    cos: Vec<f32>,
    sin: Vec<f32>,
    half_dim: usize,
    max_len: usize,
}

impl RopeTable {
    pub fn new(head_dim: usize, max_len: usize) -> Self {
        Self::with_theta(head_dim, max_len, DEFAULT_THETA)
    }

    pub fn with_theta(head_dim: usize, max_len: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|j| 1.0 / theta.powf((2 * j) as f32 / head_dim as f32))
            .collect();

        let len = max_len * half;
        let mut cos = vec![0.0f32; len];
        let mut sin = vec![0.0f32; len];

        for pos in 0..max_len {
            for (j, &freq) in freqs.iter().enumerate() {
                let angle = pos as f32 * freq;
                let (s, c) = angle.sin_cos();
                cos[pos * half + j] = c;
                sin[pos * half + j] = s;
            }
        }

        Self {
            cos,
            sin,
            half_dim: half,
            max_len,
        }
    }

    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Copy the rows for `positions`, in request order.
    pub fn slice(&self, positions: &[usize]) -> Result<PhaseSlice> {
        let half = self.half_dim;
        let mut cos = Vec::with_capacity(positions.len() * half);
        let mut sin = Vec::with_capacity(positions.len() * half);

        for &pos in positions {
            if pos >= self.max_len {
                return Err(StagehandError::PositionOutOfRange {
                    position: pos,
                    max: self.max_len,
                });
            }
            let row = pos * half..(pos + 1) * half;
            cos.extend_from_slice(&self.cos[row.clone()]);
            sin.extend_from_slice(&self.sin[row]);
        }

        Ok(PhaseSlice {
            positions: positions.to_vec(),
            half_dim: half,
            cos,
            sin,
        })
    }
}
