//! Autoregressive sampling.
//!
//! Each step feeds the last `block_size` symbols to the model, scales the
//! final position's logits by the temperature, optionally keeps only the
//! `top_k` largest, and either draws from the resulting distribution or
//! takes the most likely symbol.

use crate::model::LanguageModel;
use candle_core::{Device, IndexOp, Tensor};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use recipes_core::Result;
use recipes_core::config::CharnnConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub do_sample: bool,
    pub top_k: Option<usize>,
}

impl SamplingConfig {
    pub fn from_charnn(config: &CharnnConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            do_sample: config.sample,
            top_k: config.top_k,
        }
    }
}

/// Generated symbols, one per step. Consumed once; it cannot be restarted.
pub struct SampleStream<'a, M, R> {
    model: &'a M,
    context: Vec<u32>,
    remaining: usize,
    config: SamplingConfig,
    rng: &'a mut R,
    device: Device,
}

impl<'a, M: LanguageModel, R: Rng> SampleStream<'a, M, R> {
    pub fn new(
        model: &'a M,
        seed: &[u32],
        config: SamplingConfig,
        rng: &'a mut R,
        device: Device,
    ) -> Self {
        Self {
            model,
            context: seed.to_vec(),
            remaining: config.max_new_tokens,
            config,
            rng,
            device,
        }
    }

    /// Every symbol so far, seed included.
    pub fn context(&self) -> &[u32] {
        &self.context
    }

    fn step(&mut self) -> Result<u32> {
        if self.context.is_empty() {
            return Err(candle_core::Error::Msg("cannot sample from an empty context".into()).into());
        }
        let start = self.context.len().saturating_sub(self.model.block_size());
        let window = &self.context[start..];
        let idx = Tensor::from_slice(window, (1, window.len()), &self.device)?;
        let logits = self.model.forward(&idx, false)?;
        let last = logits.i((0, window.len() - 1))?.to_vec1::<f32>()?;

        let temperature = self.config.temperature as f32;
        let mut scaled: Vec<f32> = last.iter().map(|l| l / temperature).collect();
        if let Some(k) = self.config.top_k {
            keep_top_k(&mut scaled, k);
        }
        let probs = softmax(&scaled);

        let next = if self.config.do_sample {
            let dist = WeightedIndex::new(&probs)
                .map_err(|e| candle_core::Error::Msg(format!("invalid distribution: {e}")))?;
            dist.sample(&mut *self.rng) as u32
        } else {
            argmax(&probs) as u32
        };
        self.context.push(next);
        Ok(next)
    }
}

impl<M: LanguageModel, R: Rng> Iterator for SampleStream<'_, M, R> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let next = self.step();
        if next.is_err() {
            self.remaining = 0;
        }
        Some(next)
    }
}

/// Extend `seed` by `config.max_new_tokens` symbols, returning the whole
/// sequence.
pub fn sample<M: LanguageModel, R: Rng>(
    model: &M,
    seed: &[u32],
    config: SamplingConfig,
    rng: &mut R,
    device: &Device,
) -> Result<Vec<u32>> {
    let mut out = seed.to_vec();
    for next in SampleStream::new(model, seed, config, rng, device.clone()) {
        out.push(next?);
    }
    Ok(out)
}

/// Set every logit below the k-th largest to negative infinity.
fn keep_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for l in logits.iter_mut() {
        if *l < threshold {
            *l = f32::NEG_INFINITY;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
