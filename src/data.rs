use candle_core::{Device, Tensor};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

pub const TEXT_CHUNK_SIZE: usize = 512;
pub const ASCII_COUNT: usize = 128;
/// Input fed at the first position of every sequence.
pub const SENTINEL: u8 = 0;

/// One training window: `targets` is a chunk of raw text, `inputs` is the same
/// chunk shifted right by one with [`SENTINEL`] in front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    inputs: Vec<u8>,
    targets: Vec<u8>,
}

impl Sequence {
    pub fn inputs(&self) -> &[u8] {
        &self.inputs
    }

    pub fn targets(&self) -> &[u8] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

pub fn seq_for_chunk(chunk: &[u8]) -> Sequence {
    let inputs = std::iter::once(SENTINEL)
        .chain(chunk.iter().copied())
        .take(chunk.len())
        .collect();
    Sequence {
        inputs,
        targets: chunk.to_vec(),
    }
}

/// Dense one-hot encoding of `byte`.
///
/// Panics if `byte` is not below `vocab_size`; use [`SampleSet::check_vocabulary`]
/// before encoding untrusted data.
pub fn one_hot(byte: u8, vocab_size: usize) -> Vec<f32> {
    let mut v = vec![0f32; vocab_size];
    v[byte as usize] = 1.0;
    v
}

fn vocab_index(byte: u8, vocab_size: usize) -> Result<usize> {
    let idx = byte as usize;
    if idx >= vocab_size {
        return Err(Error::OutOfVocabulary { byte, vocab_size });
    }
    Ok(idx)
}

#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    sequences: Vec<Sequence>,
}

impl SampleSet {
    pub fn new(sequences: Vec<Sequence>) -> Self {
        Self { sequences }
    }

    pub fn push(&mut self, seq: Sequence) {
        self.sequences.push(seq);
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Sequence> {
        self.sequences.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sequence> {
        self.sequences.iter()
    }

    /// Total number of characters across all sequences.
    pub fn char_count(&self) -> usize {
        self.sequences.iter().map(Sequence::len).sum()
    }

    /// Fails on the first byte that cannot be one-hot encoded with `vocab_size`
    /// entries.
    pub fn check_vocabulary(&self, vocab_size: usize) -> Result<()> {
        for seq in &self.sequences {
            for &byte in seq.targets.iter().chain(&seq.inputs) {
                vocab_index(byte, vocab_size)?;
            }
        }
        Ok(())
    }
}

/// Reads every visible regular file in `dir` (in file-name order) and splits
/// it into [`TEXT_CHUNK_SIZE`] windows. Chunks never span two files.
pub fn read_sequences(dir: impl AsRef<Path>) -> Result<SampleSet> {
    let dir = dir.as_ref();
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::io(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::io(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    let mut result = SampleSet::default();
    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let meta = fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
        if !meta.is_file() {
            debug!(path = %path.display(), "skipping non-regular entry");
            continue;
        }
        let contents = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        for chunk in contents.chunks(TEXT_CHUNK_SIZE) {
            result.push(seq_for_chunk(chunk));
        }
        debug!(path = %path.display(), bytes = contents.len(), "read training file");
    }
    Ok(result)
}

/// A padded mini-batch of one-hot sequences, shaped `(batch, steps, vocab)`.
///
/// Sequences shorter than the longest one are padded with all-zero rows in
/// both tensors, so padded steps contribute nothing to a dot-product cost.
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
    size: usize,
    steps: usize,
}

impl Batch {
    pub fn new(sequences: &[&Sequence], vocab_size: usize, device: &Device) -> Result<Self> {
        let size = sequences.len();
        let steps = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut inputs = vec![0f32; size * steps * vocab_size];
        let mut targets = vec![0f32; size * steps * vocab_size];
        for (b, seq) in sequences.iter().enumerate() {
            for (t, (&x, &y)) in seq.inputs.iter().zip(&seq.targets).enumerate() {
                let base = (b * steps + t) * vocab_size;
                inputs[base + vocab_index(x, vocab_size)?] = 1.0;
                targets[base + vocab_index(y, vocab_size)?] = 1.0;
            }
        }
        let inputs = Tensor::from_vec(inputs, (size, steps, vocab_size), device)?;
        let targets = Tensor::from_vec(targets, (size, steps, vocab_size), device)?;
        Ok(Self {
            inputs,
            targets,
            size,
            steps,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Sorts each consecutive group of `sort_batch_size` indices by sequence
/// length, shortest first. Equal lengths keep their relative order.
pub fn sort_within_batches(order: &mut [usize], lengths: &[usize], sort_batch_size: usize) {
    for group in order.chunks_mut(sort_batch_size.max(1)) {
        group.sort_by_key(|&i| lengths[i]);
    }
}

/// Hands out mini-batches of sample indices. Every epoch the order is
/// reshuffled and then length-sorted within sort batches, so consecutive
/// mini-batches hold sequences of similar length.
pub struct SortSampler {
    lengths: Vec<usize>,
    order: Vec<usize>,
    batch_size: usize,
    sort_batch_size: usize,
    cursor: usize,
    rng: StdRng,
}

impl SortSampler {
    pub fn new(samples: &SampleSet, batch_size: usize, sort_batch_size: usize, seed: u64) -> Self {
        let lengths: Vec<usize> = samples.iter().map(Sequence::len).collect();
        let order = (0..lengths.len()).collect();
        let mut sampler = Self {
            lengths,
            order,
            batch_size: batch_size.max(1),
            sort_batch_size,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.reshuffle();
        sampler
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        sort_within_batches(&mut self.order, &self.lengths, self.sort_batch_size);
        self.cursor = 0;
    }

    /// Indices of the next mini-batch. Only empty when there are no samples.
    pub fn next_batch(&mut self) -> Vec<usize> {
        if self.order.is_empty() {
            return Vec::new();
        }
        if self.cursor >= self.order.len() {
            self.reshuffle();
        }
        let start = self.cursor;
        self.cursor = (start + self.batch_size).min(self.order.len());
        self.order[start..self.cursor].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use std::collections::HashSet;

    fn write(dir: &Path, name: &str, contents: &[u8]) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn abcd_file_yields_one_shifted_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "text.txt", b"abcd");

        let samples = read_sequences(dir.path()).unwrap();
        assert_eq!(samples.len(), 1);
        let seq = samples.get(0).unwrap();
        assert_eq!(seq.targets(), b"abcd");
        assert_eq!(seq.inputs(), &[SENTINEL, b'a', b'b', b'c']);
    }

    #[test]
    fn small_files_give_one_sequence_each() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", &[b'x'; 10]);
        write(dir.path(), "b.txt", &[b'y'; 300]);
        write(dir.path(), "c.txt", &[b'z'; TEXT_CHUNK_SIZE - 1]);

        let samples = read_sequences(dir.path()).unwrap();
        let lens: Vec<usize> = samples.iter().map(Sequence::len).collect();
        assert_eq!(lens, vec![10, 300, TEXT_CHUNK_SIZE - 1]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.txt", &vec![b'q'; TEXT_CHUNK_SIZE * 3]);

        let samples = read_sequences(dir.path()).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.len() == TEXT_CHUNK_SIZE));
    }

    #[test]
    fn chunks_do_not_span_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1.txt", &vec![b'a'; TEXT_CHUNK_SIZE + 5]);
        write(dir.path(), "2.txt", &[b'b'; 7]);

        let samples = read_sequences(dir.path()).unwrap();
        let lens: Vec<usize> = samples.iter().map(Sequence::len).collect();
        assert_eq!(lens, vec![TEXT_CHUNK_SIZE, 5, 7]);
        // a new chunk restarts from the sentinel rather than the previous byte
        assert_eq!(samples.get(1).unwrap().inputs()[0], SENTINEL);
        assert_eq!(samples.get(2).unwrap().targets(), &[b'b'; 7]);
    }

    #[test]
    fn hidden_files_and_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".hidden", b"secret");
        fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), "seen.txt", b"hi");
        write(dir.path(), "empty.txt", b"");

        let samples = read_sequences(dir.path()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples.get(0).unwrap().targets(), b"hi");
    }

    #[test]
    fn empty_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let samples = read_sequences(dir.path()).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_sequences(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn inputs_are_targets_shifted_right() {
        let text: Vec<u8> = (0..200u32).map(|i| (i * 7 % 127) as u8).collect();
        let seq = seq_for_chunk(&text);
        assert_eq!(seq.len(), text.len());
        assert_eq!(one_hot(seq.inputs()[0], ASCII_COUNT), one_hot(SENTINEL, ASCII_COUNT));
        for i in 1..seq.len() {
            assert_eq!(
                one_hot(seq.inputs()[i], ASCII_COUNT),
                one_hot(seq.targets()[i - 1], ASCII_COUNT)
            );
        }
    }

    #[test]
    fn one_hot_sets_a_single_entry() {
        let v = one_hot(5, 8);
        assert_eq!(v.iter().filter(|&&x| x == 1.0).count(), 1);
        assert_eq!(v[5], 1.0);
        assert_eq!(v.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn vocabulary_check_rejects_wide_bytes() {
        let samples = SampleSet::new(vec![seq_for_chunk(&[b'a', 200])]);
        assert!(samples.check_vocabulary(256).is_ok());
        match samples.check_vocabulary(ASCII_COUNT) {
            Err(Error::OutOfVocabulary { byte, vocab_size }) => {
                assert_eq!(byte, 200);
                assert_eq!(vocab_size, ASCII_COUNT);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn batch_pads_short_sequences_with_zero_rows() -> anyhow::Result<()> {
        let long = seq_for_chunk(b"hello");
        let short = seq_for_chunk(b"hi");
        let batch = Batch::new(&[&long, &short], ASCII_COUNT, &Device::Cpu)?;
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.steps(), 5);
        assert_eq!(batch.inputs.dims(), &[2, 5, ASCII_COUNT]);

        let short_targets = batch.targets.i(1)?.sum(1)?.to_vec1::<f32>()?;
        assert_eq!(short_targets, vec![1.0, 1.0, 0.0, 0.0, 0.0]);
        let first_input = batch.inputs.i((0, 0))?.to_vec1::<f32>()?;
        assert_eq!(first_input, one_hot(SENTINEL, ASCII_COUNT));
        let last_target = batch.targets.i((0, 4))?.to_vec1::<f32>()?;
        assert_eq!(last_target, one_hot(b'o', ASCII_COUNT));
        Ok(())
    }

    #[test]
    fn sort_within_batches_is_stable_and_grouped() {
        let lengths = vec![5, 3, 5, 1, 9, 2];
        let mut order = vec![0, 1, 2, 3, 4, 5];
        sort_within_batches(&mut order, &lengths, 3);
        // groups [0,1,2] and [3,4,5] are sorted independently; 0 stays before 2
        assert_eq!(order, vec![1, 0, 2, 3, 5, 4]);
    }

    #[test]
    fn sampler_covers_every_sample_each_epoch() {
        let sequences = (1..=10).map(|n| seq_for_chunk(&vec![b'a'; n])).collect();
        let samples = SampleSet::new(sequences);
        let mut sampler = SortSampler::new(&samples, 4, 8, 3);

        for _epoch in 0..3 {
            let mut seen = HashSet::new();
            let sizes: Vec<usize> = (0..3)
                .map(|_| {
                    let batch = sampler.next_batch();
                    seen.extend(batch.iter().copied());
                    batch.len()
                })
                .collect();
            assert_eq!(sizes, vec![4, 4, 2]);
            assert_eq!(seen.len(), 10);
        }
    }

    #[test]
    fn sampler_batches_are_length_sorted_within_sort_batch() {
        let sequences = (1..=16).rev().map(|n| seq_for_chunk(&vec![b'a'; n])).collect();
        let samples = SampleSet::new(sequences);
        let mut sampler = SortSampler::new(&samples, 2, 8, 11);

        let mut order = Vec::new();
        for _ in 0..8 {
            order.extend(sampler.next_batch());
        }
        for group in order.chunks(8) {
            let lens: Vec<usize> = group.iter().map(|&i| samples.get(i).unwrap().len()).collect();
            assert!(lens.windows(2).all(|w| w[0] <= w[1]), "{lens:?}");
        }
    }

    #[test]
    fn sampler_without_samples_yields_nothing() {
        let mut sampler = SortSampler::new(&SampleSet::default(), 4, 8, 0);
        assert!(sampler.next_batch().is_empty());
    }
}
