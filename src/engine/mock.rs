//! Deterministic mock backend
//!
//! Produces stable, content-dependent embeddings without any weight files.
//! Used by the `mock` model and throughout the test suite.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array3;
use tracing::debug;

use crate::engine::{ForwardPass, InferenceEngine, TextTokenizer, TokenBatch};
use crate::models::{EmbeddingError, EmbeddingResult, ModelDescriptor, ModelLoader};

const VOCAB_SIZE: u64 = 50_000;
const PAD_ID: u32 = 0;

/// Written into padded positions so pooling that reads them is easy to spot
const PAD_SENTINEL: f32 = 1.0e3;

/// Whitespace tokenizer with hashed ids and no special tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct MockTokenizer;

impl TextTokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> EmbeddingResult<Vec<u32>> {
        let ids: Vec<u32> = text
            .split_whitespace()
            .map(|word| {
                let mut hasher = DefaultHasher::new();
                word.hash(&mut hasher);
                (hasher.finish() % (VOCAB_SIZE - 1) + 1) as u32
            })
            .collect();

        if ids.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(ids)
    }

    fn pad_id(&self) -> u32 {
        PAD_ID
    }
}

/// Causal-style forward pass: the hidden state at position `t` is the running
/// mean of pseudo-random token vectors `0..=t`, so the last token summarizes
/// the whole sequence.
#[derive(Debug)]
pub struct MockForwardPass {
    hidden_size: usize,
    forward_passes: Arc<AtomicUsize>,
    latency: Duration,
    fail: bool,
    panic: bool,
}

impl MockForwardPass {
    pub fn new(hidden_size: usize, forward_passes: Arc<AtomicUsize>) -> Self {
        Self {
            hidden_size,
            forward_passes,
            latency: Duration::ZERO,
            fail: false,
            panic: false,
        }
    }

    fn token_vector(&self, id: i64, out: &mut [f32]) {
        // xorshift64*, seeded per token
        let mut state = (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        for value in out.iter_mut().take(self.hidden_size) {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let bits = state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 40;
            *value = (bits as f32 / (1u64 << 24) as f32) * 2.0 - 1.0;
        }
    }
}

impl ForwardPass for MockForwardPass {
    fn forward(&mut self, batch: &TokenBatch) -> EmbeddingResult<Array3<f32>> {
        self.forward_passes.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if self.fail {
            return Err(EmbeddingError::compute("mock", "Injected forward pass failure"));
        }
        if self.panic {
            panic!("injected forward pass panic");
        }

        let (rows, seq_len) = batch.input_ids.dim();
        let mut hidden = Array3::from_elem((rows, seq_len, self.hidden_size), PAD_SENTINEL);
        let mut token = vec![0.0f32; self.hidden_size];
        let mut running = vec![0.0f32; self.hidden_size];

        for row in 0..rows {
            running.iter_mut().for_each(|v| *v = 0.0);
            for col in 0..batch.lengths[row] {
                self.token_vector(batch.input_ids[[row, col]], &mut token);
                for (sum, value) in running.iter_mut().zip(&token) {
                    *sum += value;
                }
                let count = (col + 1) as f32;
                for (h, sum) in running.iter().enumerate() {
                    hidden[[row, col, h]] = sum / count;
                }
            }
        }

        Ok(hidden)
    }
}

/// Loader for the mock backend.
///
/// Counts loads and forward passes so callers can observe reloads and cache
/// hits. Latency and failures can be injected to exercise timeouts and error
/// paths.
#[derive(Debug, Clone, Default)]
pub struct MockModelLoader {
    loads: Arc<AtomicUsize>,
    forward_passes: Arc<AtomicUsize>,
    latency: Duration,
    fail_forward: bool,
    fail_load: bool,
    panic_forward: bool,
    panic_load: bool,
}

impl MockModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every forward pass sleeps for `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every forward pass fails with a compute error
    pub fn with_failing_forward(mut self) -> Self {
        self.fail_forward = true;
        self
    }

    /// Every load fails
    pub fn with_failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Every forward pass panics
    pub fn with_panicking_forward(mut self) -> Self {
        self.panic_forward = true;
        self
    }

    /// Every load panics, like a runtime library that cannot be opened
    pub fn with_panicking_load(mut self) -> Self {
        self.panic_load = true;
        self
    }

    /// Number of engines handed out so far
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of forward passes run by all engines from this loader
    pub fn forward_passes(&self) -> usize {
        self.forward_passes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for MockModelLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> EmbeddingResult<InferenceEngine> {
        if self.panic_load {
            panic!("injected model load panic");
        }
        if self.fail_load {
            return Err(EmbeddingError::ModelLoadFailed {
                model_name: descriptor.name.to_string(),
                error: "Injected load failure".to_string(),
            });
        }

        let count = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(model = descriptor.name, loads = count, "Mock model loaded");

        let runtime = MockForwardPass {
            hidden_size: descriptor.native_dim,
            forward_passes: Arc::clone(&self.forward_passes),
            latency: self.latency,
            fail: self.fail_forward,
            panic: self.panic_forward,
        };
        Ok(InferenceEngine::new(
            *descriptor,
            Box::new(MockTokenizer),
            Box::new(runtime),
        ))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
