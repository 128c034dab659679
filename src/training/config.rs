use crate::error::Result;
use crate::training::ema::EmaConfig;
use crate::training::optimizer::OptimizerConfig;
use crate::training::scheduler::SchedulerConfig;
use crate::utils::validation;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Unit a stop condition is counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// Training never stops early
    #[default]
    Never,
    /// Count epochs
    Epoch,
    /// Count global optimizer steps
    Step,
}

/// Storage precision of trainable weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightDtype {
    #[default]
    Float32,
    Float16,
    BFloat16,
}

impl WeightDtype {
    /// Bytes per element
    pub fn size_of(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
        }
    }
}

impl std::fmt::Display for WeightDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
        };
        f.write_str(name)
    }
}

/// Per-module training switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Whether the module's adapter is trained
    pub train: bool,
    /// Learning rate, falling back to the global one when unset
    pub learning_rate: Option<f64>,
    /// Stop training the adapter after this many units
    pub stop_training_after: usize,
    /// Unit of `stop_training_after`
    pub stop_training_after_unit: TimeUnit,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            train: true,
            learning_rate: None,
            stop_training_after: 0,
            stop_training_after_unit: TimeUnit::Never,
        }
    }
}

impl ModuleConfig {
    /// Frozen module
    pub fn frozen() -> Self {
        Self {
            train: false,
            ..Default::default()
        }
    }

    /// Trained module that stops after `epochs` epochs
    pub fn stop_after_epochs(epochs: usize) -> Self {
        Self {
            stop_training_after: epochs,
            stop_training_after_unit: TimeUnit::Epoch,
            ..Default::default()
        }
    }
}

/// Configuration for one LoRA training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Global learning rate
    pub learning_rate: f64,
    /// Text encoder switches
    pub text_encoder: ModuleConfig,
    /// Denoiser switches
    pub unet: ModuleConfig,
    /// Train the additional token embedding
    pub train_embedding: bool,
    /// Epoch after which the embedding stops receiving gradients
    pub train_embedding_epochs: usize,
    /// Embedding learning rate, falling back to the global one when unset
    pub embedding_learning_rate: Option<f64>,
    /// Adapter rank
    pub lora_rank: usize,
    /// Adapter scaling factor
    pub lora_alpha: f64,
    /// Adapter dropout probability
    pub dropout_probability: f64,
    /// Adapter storage precision
    pub lora_weight_dtype: WeightDtype,
    /// Embedding matrix storage precision while training
    pub embedding_weight_dtype: WeightDtype,
    /// Seed text for a new embedding
    pub initial_embedding_text: String,
    /// Number of tokens a new embedding occupies
    pub token_count: usize,
    /// Rescale the noise schedule to zero terminal SNR
    pub rescale_noise_scheduler_to_zero_terminal_snr: bool,
    /// Latents and text encoder outputs are cached ahead of time
    pub latent_caching: bool,
    /// Reward fine-tuning through the full sampling chain
    pub align_prop: bool,
    /// Keep every module on the train device for inspection
    pub debug_mode: bool,
    /// Samples per step
    pub batch_size: usize,
    /// Optimizer selection and hyperparameters
    pub optimizer: OptimizerConfig,
    /// Moving-average tracker
    pub ema: EmaConfig,
    /// Learning rate schedule
    pub scheduler: SchedulerConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            text_encoder: ModuleConfig::default(),
            unet: ModuleConfig::default(),
            train_embedding: false,
            train_embedding_epochs: 30,
            embedding_learning_rate: None,
            lora_rank: 16,
            lora_alpha: 1.0,
            dropout_probability: 0.0,
            lora_weight_dtype: WeightDtype::Float32,
            embedding_weight_dtype: WeightDtype::Float32,
            initial_embedding_text: "*".to_string(),
            token_count: 1,
            rescale_noise_scheduler_to_zero_terminal_snr: false,
            latent_caching: true,
            align_prop: false,
            debug_mode: false,
            batch_size: 1,
            optimizer: OptimizerConfig::default(),
            ema: EmaConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load and validate a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        validation::positive(self.learning_rate, "learning_rate")?;
        validation::positive(self.lora_rank, "lora_rank")?;
        validation::positive(self.lora_alpha, "lora_alpha")?;
        validation::in_range(self.dropout_probability, 0.0, 0.99, "dropout_probability")?;
        validation::positive(self.batch_size, "batch_size")?;
        validation::positive(self.token_count, "token_count")?;

        if let Some(lr) = self.text_encoder.learning_rate {
            validation::positive(lr, "text_encoder.learning_rate")?;
        }
        if let Some(lr) = self.unet.learning_rate {
            validation::positive(lr, "unet.learning_rate")?;
        }
        if let Some(lr) = self.embedding_learning_rate {
            validation::positive(lr, "embedding_learning_rate")?;
        }

        self.optimizer.validate()?;
        self.ema.validate()?;
        Ok(())
    }

    /// Text encoder learning rate after fallback
    pub fn text_encoder_learning_rate(&self) -> f64 {
        self.text_encoder.learning_rate.unwrap_or(self.learning_rate)
    }

    /// Denoiser learning rate after fallback
    pub fn unet_learning_rate(&self) -> f64 {
        self.unet.learning_rate.unwrap_or(self.learning_rate)
    }

    /// Embedding learning rate after fallback
    pub fn embedding_learning_rate(&self) -> f64 {
        self.embedding_learning_rate.unwrap_or(self.learning_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_learning_rate_fallback() {
        let config = TrainConfig {
            learning_rate: 1e-4,
            unet: ModuleConfig {
                learning_rate: Some(5e-4),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(config.text_encoder_learning_rate(), 1e-4);
        assert_eq!(config.unet_learning_rate(), 5e-4);
        assert_eq!(config.embedding_learning_rate(), 1e-4);
    }

    #[test]
    fn test_validate_rejects_zero_rank() {
        let config = TrainConfig {
            lora_rank: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lora_rank"));
    }

    #[test]
    fn test_validate_rejects_dropout_of_one() {
        let config = TrainConfig {
            dropout_probability: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = TrainConfig {
            train_embedding: true,
            train_embedding_epochs: 2,
            text_encoder: ModuleConfig::stop_after_epochs(5),
            unet: ModuleConfig::frozen(),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = TrainConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "lora_rank": 4, "train_embedding": true }"#).unwrap();

        let config = TrainConfig::load(&path).unwrap();
        assert_eq!(config.lora_rank, 4);
        assert!(config.train_embedding);
        assert_eq!(config.token_count, 1);
        assert_eq!(config.text_encoder.stop_training_after_unit, TimeUnit::Never);
    }
}
