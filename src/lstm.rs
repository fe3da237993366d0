use candle_core::Device;
use rand::Rng;
use tracing::info;

use crate::data::{SampleSet, ASCII_COUNT};
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::model::{Stack, StackConfig, FORMAT};
use crate::train::{training_loop, CancelToken, IterationStatus, TrainConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub layer_count: usize,
    pub vocab_size: usize,
    pub training: TrainConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            layer_count: 2,
            vocab_size: ASCII_COUNT,
            training: TrainConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            layer_count: self.layer_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stack_config().validate().map_err(Error::Config)?;
        self.training.validate()
    }
}

/// Character-level LSTM language model. The recurrent stack is built lazily
/// on first use unless one was loaded from a serialized artifact.
pub struct Lstm {
    config: ModelConfig,
    device: Device,
    stack: Option<Stack>,
}

impl Lstm {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: device.clone(),
            stack: None,
        })
    }

    /// Restores a model from [`Lstm::to_bytes`] output. The structure comes
    /// from the artifact; `training` supplies the hyperparameters, and the
    /// optimizer starts from fresh moment estimates.
    pub fn from_bytes(data: &[u8], training: TrainConfig, device: &Device) -> Result<Self> {
        training.validate()?;
        let stack = Stack::from_bytes(data, device)?;
        let structure = stack.config();
        Ok(Self {
            config: ModelConfig {
                hidden_size: structure.hidden_size,
                layer_count: structure.layer_count,
                vocab_size: structure.vocab_size,
                training,
            },
            device: device.clone(),
            stack: Some(stack),
        })
    }

    pub fn name(&self) -> &'static str {
        "lstm"
    }

    pub fn serializer_type(&self) -> &'static str {
        FORMAT
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    pub fn ensure_built(&mut self) -> Result<&Stack> {
        let stack = match self.stack.take() {
            Some(stack) => stack,
            None => {
                let stack = Stack::new(self.config.stack_config(), &self.device)?;
                info!(
                    parameters = stack.parameter_count(),
                    layers = self.config.layer_count,
                    hidden = self.config.hidden_size,
                    "created model"
                );
                stack
            }
        };
        Ok(&*self.stack.insert(stack))
    }

    /// Trains until `cancel` fires (or the configured iteration limit).
    /// Returns the number of updates applied.
    pub fn train(
        &mut self,
        samples: &SampleSet,
        cancel: &CancelToken,
        status: impl FnMut(&IterationStatus),
    ) -> Result<usize> {
        let training = self.config.training.clone();
        let stack = self.ensure_built()?;
        training_loop(stack, samples, &training, cancel, status)
    }

    pub fn generate<R: Rng>(&mut self, length: usize, rng: R) -> Result<Generator<'_, R>> {
        let stack = self.ensure_built()?;
        Generator::new(stack, length, rng)
    }

    /// Structure and parameters only; no hyperparameters or optimizer state.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.stack.as_ref().ok_or(Error::NotBuilt)?.to_bytes()
    }
}
