use candle_core::{IndexOp, Tensor};
use rand::Rng;

use crate::data::{one_hot, SENTINEL};
use crate::error::Result;
use crate::model::{Block, BlockState, Stack};

/// Picks an index from the categorical distribution given by `log_probs`,
/// using `p` in `[0, 1)` as the uniform draw. Walks the vocabulary in order,
/// subtracting each probability from `p`, and returns the first index where
/// `p` goes negative. Rounding slack that never triggers falls back to the
/// last index.
pub fn sample_index(log_probs: &[f32], mut p: f64) -> usize {
    for (i, &x) in log_probs.iter().enumerate() {
        p -= (x as f64).exp();
        if p < 0.0 {
            return i;
        }
    }
    log_probs.len().saturating_sub(1)
}

pub fn sample_softmax<R: Rng + ?Sized>(log_probs: &[f32], rng: &mut R) -> usize {
    sample_index(log_probs, rng.gen::<f64>())
}

/// Autoregressive sampler. Yields exactly `length` bytes, feeding each one
/// back as the next input; the recurrent state lives only as long as the
/// generator. A failed step is yielded once and ends the stream.
pub struct Generator<'a, R> {
    stack: &'a Stack,
    rng: R,
    state: BlockState,
    last: Tensor,
    remaining: usize,
}

impl<'a, R: Rng> Generator<'a, R> {
    pub fn new(stack: &'a Stack, length: usize, rng: R) -> Result<Self> {
        let state = stack.start(1)?;
        let last = Self::encode(stack, SENTINEL)?;
        Ok(Self {
            stack,
            rng,
            state,
            last,
            remaining: length,
        })
    }

    fn encode(stack: &Stack, byte: u8) -> Result<Tensor> {
        let vocab_size = stack.config().vocab_size;
        Ok(Tensor::from_vec(
            one_hot(byte, vocab_size),
            (1, vocab_size),
            stack.device(),
        )?)
    }

    fn advance(&mut self) -> Result<u8> {
        let (out, next) = self.stack.step(&self.state, &self.last)?;
        let log_probs = out.i(0)?.to_vec1::<f32>()?;
        // vocabularies never exceed the byte range
        let ch = sample_softmax(&log_probs, &mut self.rng) as u8;
        self.last = Self::encode(self.stack, ch)?;
        self.state = next;
        Ok(ch)
    }
}

impl<R: Rng> Iterator for Generator<'_, R> {
    type Item = Result<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let res = self.advance();
        if res.is_err() {
            self.remaining = 0;
        }
        Some(res)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
