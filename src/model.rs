use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, lstm, ops, LSTMConfig, Linear, Module, VarBuilder, VarMap, LSTM, RNN};
use safetensors::SafeTensors;
use std::collections::HashMap;

use crate::error::Error;

/// Format tag stored in serialized stacks.
pub const FORMAT: &str = "char-rnn.lstm";

/// Vocabulary entries are raw bytes.
pub const MAX_VOCAB: usize = 256;

/// Structural metadata: everything needed to rebuild a stack of the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub layer_count: usize,
}

impl StackConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.vocab_size == 0 || self.vocab_size > MAX_VOCAB {
            return Err(format!(
                "vocab_size must be in 1..={MAX_VOCAB}, got {}",
                self.vocab_size
            ));
        }
        if self.hidden_size == 0 {
            return Err("hidden_size must be positive".into());
        }
        if self.layer_count == 0 {
            return Err("layer_count must be at least 1".into());
        }
        Ok(())
    }

    /// Name and shape of every learnable tensor, in stack order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let mut shapes = Vec::with_capacity(4 * self.layer_count + 2);
        let mut in_dim = self.vocab_size;
        for i in 0..self.layer_count {
            // candle's lstm() names its tensors after layer index 0
            shapes.push((format!("lstm{i}.bias_hh_l0"), vec![4 * h]));
            shapes.push((format!("lstm{i}.bias_ih_l0"), vec![4 * h]));
            shapes.push((format!("lstm{i}.weight_hh_l0"), vec![4 * h, h]));
            shapes.push((format!("lstm{i}.weight_ih_l0"), vec![4 * h, in_dim]));
            in_dim = h;
        }
        shapes.push(("output.bias".into(), vec![self.vocab_size]));
        shapes.push(("output.weight".into(), vec![self.vocab_size, in_dim]));
        shapes
    }
}

/// Per-block recurrent state. Stepping returns a fresh state and never
/// touches the one passed in, so batch rows stay independent.
#[derive(Debug, Clone)]
pub enum BlockState {
    Lstm(LSTMState),
    Stack(Vec<BlockState>),
    Stateless,
}

/// A stateful transform with a uniform stepping contract.
pub trait Block {
    /// Zero state for `batch_size` independent sequences.
    fn start(&self, batch_size: usize) -> Result<BlockState>;

    /// Advances one time step. `input` is `(batch, in_dim)`.
    fn step(&self, state: &BlockState, input: &Tensor) -> Result<(Tensor, BlockState)>;

    /// Learnable tensors, in a stable order.
    fn parameters(&self) -> &[(String, Var)];
}

fn collect_vars(varmap: &VarMap, prefix: &str) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let prefix = format!("{prefix}.");
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| name.starts_with(&prefix))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Memory-cell layer.
struct LstmBlock {
    cell: LSTM,
    params: Vec<(String, Var)>,
}

impl LstmBlock {
    fn new(in_dim: usize, hidden: usize, name: &str, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let cell = lstm(in_dim, hidden, LSTMConfig::default(), vb.pp(name))?;
        let params = collect_vars(varmap, name)?;
        Ok(Self { cell, params })
    }
}

impl Block for LstmBlock {
    fn start(&self, batch_size: usize) -> Result<BlockState> {
        Ok(BlockState::Lstm(self.cell.zero_state(batch_size)?))
    }

    fn step(&self, state: &BlockState, input: &Tensor) -> Result<(Tensor, BlockState)> {
        let BlockState::Lstm(prev) = state else {
            candle_core::bail!("lstm block stepped with a foreign state")
        };
        let next = self.cell.step(input, prev)?;
        Ok((next.h().clone(), BlockState::Lstm(next)))
    }

    fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }
}

/// Linear projection to the vocabulary followed by log-softmax.
struct OutputBlock {
    proj: Linear,
    params: Vec<(String, Var)>,
}

impl OutputBlock {
    fn new(in_dim: usize, vocab_size: usize, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let proj = linear(in_dim, vocab_size, vb.pp("output"))?;
        let params = collect_vars(varmap, "output")?;
        Ok(Self { proj, params })
    }
}

impl Block for OutputBlock {
    fn start(&self, _batch_size: usize) -> Result<BlockState> {
        Ok(BlockState::Stateless)
    }

    fn step(&self, _state: &BlockState, input: &Tensor) -> Result<(Tensor, BlockState)> {
        let logits = self.proj.forward(input)?;
        Ok((ops::log_softmax(&logits, D::Minus1)?, BlockState::Stateless))
    }

    fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }
}

/// `layer_count` LSTM layers feeding a linear + log-softmax head. Each step
/// maps one one-hot (or distribution) row per batch element to a row of
/// log-probabilities over the vocabulary.
pub struct Stack {
    config: StackConfig,
    device: Device,
    blocks: Vec<Box<dyn Block>>,
    params: Vec<(String, Var)>,
}

impl Stack {
    pub fn new(config: StackConfig, device: &Device) -> Result<Self> {
        if let Err(msg) = config.validate() {
            candle_core::bail!("invalid stack config: {msg}")
        }
        let varmap = VarMap::new();
        let mut blocks: Vec<Box<dyn Block>> = Vec::with_capacity(config.layer_count + 1);
        let mut in_dim = config.vocab_size;
        for i in 0..config.layer_count {
            let name = format!("lstm{i}");
            blocks.push(Box::new(LstmBlock::new(
                in_dim,
                config.hidden_size,
                &name,
                &varmap,
                device,
            )?));
            in_dim = config.hidden_size;
        }
        blocks.push(Box::new(OutputBlock::new(
            in_dim,
            config.vocab_size,
            &varmap,
            device,
        )?));

        let params = blocks
            .iter()
            .flat_map(|b| b.parameters().iter().cloned())
            .collect();
        Ok(Self {
            config,
            device: device.clone(),
            blocks,
            params,
        })
    }

    pub fn config(&self) -> StackConfig {
        self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    #[cfg(test)]
    pub fn parameter_map(&self) -> std::collections::BTreeMap<String, Var> {
        self.params.iter().cloned().collect()
    }

    /// Handles for the optimizer.
    pub fn vars(&self) -> Vec<Var> {
        self.params.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Safetensors blob holding the structure in its metadata and every
    /// parameter tensor.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let info: HashMap<String, String> = [
            ("format".to_string(), FORMAT.to_string()),
            ("vocab_size".to_string(), self.config.vocab_size.to_string()),
            ("hidden_size".to_string(), self.config.hidden_size.to_string()),
            ("layer_count".to_string(), self.config.layer_count.to_string()),
        ]
        .into_iter()
        .collect();
        let tensors = self.params.iter().map(|(n, v)| (n.as_str(), v.as_tensor()));
        safetensors::serialize(tensors, &Some(info))
            .map_err(|e| Error::Serialize(e.to_string()))
    }

    /// Rebuilds a stack from [`Stack::to_bytes`] output. Nothing is returned
    /// unless structure, names and shapes all check out.
    pub fn from_bytes(data: &[u8], device: &Device) -> crate::error::Result<Self> {
        let corrupt = |msg: String| Error::Deserialize(msg);
        let (_, meta) = SafeTensors::read_metadata(data).map_err(|e| corrupt(e.to_string()))?;
        let info = meta
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupt("missing metadata".into()))?;
        match info.get("format") {
            Some(format) if format == FORMAT => {}
            other => return Err(corrupt(format!("unexpected format tag {other:?}"))),
        }
        let field = |key: &str| -> crate::error::Result<usize> {
            info.get(key)
                .ok_or_else(|| corrupt(format!("missing {key}")))?
                .parse::<usize>()
                .map_err(|e| corrupt(format!("{key}: {e}")))
        };
        let config = StackConfig {
            vocab_size: field("vocab_size")?,
            hidden_size: field("hidden_size")?,
            layer_count: field("layer_count")?,
        };
        config.validate().map_err(corrupt)?;

        let tensors = candle_core::safetensors::load_buffer(data, device)
            .map_err(|e| corrupt(e.to_string()))?;
        let expected = config.parameter_shapes();
        if tensors.len() != expected.len() {
            return Err(corrupt(format!(
                "expected {} tensors, found {}",
                expected.len(),
                tensors.len()
            )));
        }
        for (name, shape) in &expected {
            let t = tensors
                .get(name)
                .ok_or_else(|| corrupt(format!("missing tensor {name}")))?;
            if t.dims() != shape.as_slice() {
                return Err(corrupt(format!(
                    "{name}: shape {:?}, expected {shape:?}",
                    t.dims()
                )));
            }
        }

        let stack = Stack::new(config, device)?;
        for (name, var) in &stack.params {
            var.set(&tensors[name].to_dtype(DType::F32)?)?;
        }
        Ok(stack)
    }
}

impl Block for Stack {
    fn start(&self, batch_size: usize) -> Result<BlockState> {
        let states = self
            .blocks
            .iter()
            .map(|b| b.start(batch_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(BlockState::Stack(states))
    }

    fn step(&self, state: &BlockState, input: &Tensor) -> Result<(Tensor, BlockState)> {
        let BlockState::Stack(states) = state else {
            candle_core::bail!("stack stepped with a foreign state")
        };
        if states.len() != self.blocks.len() {
            candle_core::bail!(
                "stack has {} blocks but state has {}",
                self.blocks.len(),
                states.len()
            )
        }
        let mut out = input.clone();
        let mut next = Vec::with_capacity(states.len());
        for (block, s) in self.blocks.iter().zip(states) {
            let (o, ns) = block.step(s, &out)?;
            out = o;
            next.push(ns);
        }
        Ok((out, BlockState::Stack(next)))
    }

    fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }
}
