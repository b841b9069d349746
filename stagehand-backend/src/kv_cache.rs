use stagehand_core::error::{Result, StagehandError};

/// Key/value state carried by one stage between invocations.
///
/// Rows are laid out `[position][kv_head * head_dim]` per layer, so appending a
/// position appends `num_kv_heads * head_dim` floats to every layer's key and value buffer.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    pub current_len: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
}

impl KvCache {
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize, max_seq_len: usize) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            max_seq_len,
            current_len: 0,
            keys: vec![Vec::new(); num_layers],
            values: vec![Vec::new(); num_layers],
        }
    }

    /// Floats per position per layer.
    pub fn row_len(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn size_bytes(&self) -> u64 {
        // per layer: 2 * num_kv_heads * head_dim * max_seq_len * sizeof(f32)
        let per_layer = 2 * self.row_len() as u64 * self.max_seq_len as u64 * 4;
        per_layer * self.num_layers as u64
    }

    pub fn remaining_tokens(&self) -> usize {
        self.max_seq_len.saturating_sub(self.current_len)
    }

    pub fn is_empty(&self) -> bool {
        self.current_len == 0
    }

    /// Append `positions` rows to `layer`. Call once per layer, then [`KvCache::advance`].
    pub fn append(&mut self, layer: usize, keys: &[f32], values: &[f32], positions: usize) -> Result<()> {
        let want = positions * self.row_len();
        if keys.len() != want || values.len() != want {
            return Err(StagehandError::Inference(format!(
                "kv append: expected {want} floats, got keys {} values {}",
                keys.len(),
                values.len()
            )));
        }
        if positions > self.remaining_tokens() {
            return Err(StagehandError::Inference(format!(
                "kv cache full: {} of {} positions used, {positions} more requested",
                self.current_len, self.max_seq_len
            )));
        }
        let (Some(k), Some(v)) = (self.keys.get_mut(layer), self.values.get_mut(layer)) else {
            return Err(StagehandError::Inference(format!(
                "kv append: layer {layer} out of {}",
                self.num_layers
            )));
        };
        k.extend_from_slice(keys);
        v.extend_from_slice(values);
        Ok(())
    }

    pub fn advance(&mut self, positions: usize) {
        self.current_len = (self.current_len + positions).min(self.max_seq_len);
    }

    pub fn keys(&self, layer: usize) -> &[f32] {
        self.keys.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn values(&self, layer: usize) -> &[f32] {
        self.values.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear(&mut self) {
        self.current_len = 0;
        for buf in self.keys.iter_mut().chain(self.values.iter_mut()) {
            buf.clear();
        }
    }
}
