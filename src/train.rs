use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::{Batch, SampleSet, Sequence, SortSampler};
use crate::error::{Error, Result};
use crate::model::{Block, Stack};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub step_size: f64,
    pub batch_size: usize,
    pub sort_batch_size: usize,
    /// Stop after this many updates; `None` runs until cancelled.
    pub max_iterations: Option<usize>,
    /// Seeds the per-epoch shuffle.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            step_size: 0.001,
            batch_size: 32,
            sort_batch_size: 128,
            max_iterations: None,
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size > 0.0 && self.step_size.is_finite()) {
            return Err(Error::Config(format!(
                "step size must be positive, got {}",
                self.step_size
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if self.sort_batch_size < self.batch_size {
            return Err(Error::Config(format!(
                "sort batch size {} is smaller than batch size {}",
                self.sort_batch_size, self.batch_size
            )));
        }
        Ok(())
    }
}

/// Cooperative stop flag, checked between mini-batches only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStatus {
    pub iteration: usize,
    pub cost: f32,
}

/// Negative log-likelihood of the targets: the dot product of predicted
/// log-probabilities with one-hot targets, summed over time and averaged over
/// the sequences in the batch. Padded steps have all-zero targets and add 0.
pub fn batch_cost(stack: &Stack, batch: &Batch) -> candle_core::Result<Tensor> {
    if batch.size() == 0 || batch.steps() == 0 {
        return Tensor::zeros((), DType::F32, stack.device());
    }
    let mut state = stack.start(batch.size())?;
    let mut outputs = Vec::with_capacity(batch.steps());
    for t in 0..batch.steps() {
        let x = batch.inputs.i((.., t, ..))?.contiguous()?;
        let (out, next) = stack.step(&state, &x)?;
        outputs.push(out);
        state = next;
    }
    let log_probs = Tensor::stack(&outputs, 1)?;
    log_probs
        .mul(&batch.targets)?
        .sum_all()?
        .affine(-1.0 / batch.size() as f64, 0.0)
}

/// Fits `stack` to `samples` with Adam until `cancel` fires or
/// `max_iterations` updates have been applied. Returns the number of updates.
///
/// Mini-batches are applied strictly in the order they are drawn; a
/// cancellation observed before a batch leaves the parameters from the last
/// completed update.
pub fn training_loop(
    stack: &Stack,
    samples: &SampleSet,
    cfg: &TrainConfig,
    cancel: &CancelToken,
    mut status: impl FnMut(&IterationStatus),
) -> Result<usize> {
    cfg.validate()?;
    let vocab_size = stack.config().vocab_size;
    if samples.is_empty() {
        warn!("no training samples, nothing to do");
        return Ok(0);
    }
    samples.check_vocabulary(vocab_size)?;

    let params = ParamsAdamW {
        lr: cfg.step_size,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay: 0.0,
    };
    let mut optim = AdamW::new(stack.vars(), params)?;
    let mut sampler = SortSampler::new(samples, cfg.batch_size, cfg.sort_batch_size, cfg.seed);

    info!(
        sequences = samples.len(),
        chars = samples.char_count(),
        "Training (ctrl+c to stop)..."
    );
    let mut iter = 0;
    loop {
        if cancel.is_cancelled() {
            info!(iterations = iter, "training interrupted");
            break;
        }
        if cfg.max_iterations.is_some_and(|max| iter >= max) {
            info!(iterations = iter, "reached iteration limit");
            break;
        }

        let picked = sampler.next_batch();
        let seqs: Vec<&Sequence> = picked.iter().filter_map(|&i| samples.get(i)).collect();
        let batch = Batch::new(&seqs, vocab_size, stack.device())?;
        let cost = batch_cost(stack, &batch)?;
        optim.backward_step(&cost)?;

        let cost = cost.to_scalar::<f32>()?;
        info!("iter {iter}: cost={cost}");
        status(&IterationStatus {
            iteration: iter,
            cost,
        });
        iter += 1;
    }
    Ok(iter)
}
