pub mod embedding;
pub mod lora;
pub mod noise;
pub mod parts;
pub mod tokenizer;

use crate::model::embedding::ModelEmbedding;
use crate::model::lora::LoraModuleWrapper;
use crate::model::noise::NoiseSchedule;
use crate::model::parts::{ClipTextEncoder, FrozenModule, LinearSpec, ModelPart, TextEncoderPart, TokenEmbeddings};
use crate::model::tokenizer::{Vocabulary, WordVocabulary};
use crate::setup::embedding_guard::EmbeddingGuard;
use crate::training::{EmaState, EmaTracker, OptimizerState, TrainOptimizer, TrainProgress};
use burn::prelude::*;

/// Adapter of one base module. Materialized once and reused by later setups.
#[derive(Debug, Clone, Default)]
pub enum AdapterSlot<B: Backend> {
    #[default]
    Uninitialized,
    Materialized(LoraModuleWrapper<B>),
}

impl<B: Backend> AdapterSlot<B> {
    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Materialized(_))
    }

    pub fn as_ref(&self) -> Option<&LoraModuleWrapper<B>> {
        match self {
            Self::Materialized(lora) => Some(lora),
            Self::Uninitialized => None,
        }
    }

    pub fn as_mut(&mut self) -> Option<&mut LoraModuleWrapper<B>> {
        match self {
            Self::Materialized(lora) => Some(lora),
            Self::Uninitialized => None,
        }
    }

    /// Materialize with `create` unless an adapter already exists
    pub fn get_or_materialize(&mut self, create: impl FnOnce() -> LoraModuleWrapper<B>) -> &mut LoraModuleWrapper<B> {
        if let Self::Uninitialized = self {
            *self = Self::Materialized(create());
        }
        match self {
            Self::Materialized(lora) => lora,
            Self::Uninitialized => unreachable!("adapter slot was just materialized"),
        }
    }
}

/// Latent diffusion model plus the training state setup attaches to it
pub struct DiffusionModel<B: Backend> {
    pub tokenizer: Box<dyn Vocabulary>,
    pub text_encoder: Box<dyn TextEncoderPart<B>>,
    pub unet: Box<dyn ModelPart<B>>,
    pub vae: Box<dyn ModelPart<B>>,
    pub depth_estimator: Option<Box<dyn ModelPart<B>>>,
    pub text_encoder_lora: AdapterSlot<B>,
    pub unet_lora: AdapterSlot<B>,
    pub embeddings: Vec<ModelEmbedding<B>>,
    /// Original embedding rows and freeze mask, built by the first setup
    pub embedding_guard: Option<EmbeddingGuard<B>>,
    pub optimizer: Option<TrainOptimizer>,
    /// Loaded optimizer state, consumed by the next setup
    pub optimizer_state: Option<OptimizerState>,
    pub ema: Option<EmaTracker>,
    /// Loaded EMA state, consumed by the next setup
    pub ema_state: Option<EmaState>,
    pub noise_schedule: NoiseSchedule,
    pub train_progress: TrainProgress,
}

impl<B: Backend> DiffusionModel<B> {
    pub fn new(
        tokenizer: Box<dyn Vocabulary>,
        text_encoder: Box<dyn TextEncoderPart<B>>,
        unet: Box<dyn ModelPart<B>>,
        vae: Box<dyn ModelPart<B>>,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            unet,
            vae,
            depth_estimator: None,
            text_encoder_lora: AdapterSlot::Uninitialized,
            unet_lora: AdapterSlot::Uninitialized,
            embeddings: Vec::new(),
            embedding_guard: None,
            optimizer: None,
            optimizer_state: None,
            ema: None,
            ema_state: None,
            noise_schedule: NoiseSchedule::default(),
            train_progress: TrainProgress::new(),
        }
    }

    pub fn with_depth_estimator(mut self, depth_estimator: Box<dyn ModelPart<B>>) -> Self {
        self.depth_estimator = Some(depth_estimator);
        self
    }

    /// Attach state loaded from a checkpoint
    pub fn with_prior_state(mut self, optimizer: Option<OptimizerState>, ema: Option<EmaState>) -> Self {
        self.optimizer_state = optimizer;
        self.ema_state = ema;
        self
    }

    /// Whether both adapters and the embedding guard exist
    pub fn is_set_up(&self) -> bool {
        self.text_encoder_lora.is_materialized()
            && self.unet_lora.is_materialized()
            && self.embedding_guard.is_some()
    }
}

/// Shape of a small randomly initialized model
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Words in the base vocabulary, including the seed words and `*`
    #[config(default = "64")]
    pub vocab_size: usize,

    /// Token embedding width
    #[config(default = "16")]
    pub embedding_dim: usize,

    /// Transformer layers in the text encoder
    #[config(default = "2")]
    pub text_encoder_layers: usize,

    /// Down blocks in the denoiser, each with an attention and a resnet
    #[config(default = "2")]
    pub unet_blocks: usize,

    /// Channel width of the denoiser
    #[config(default = "32")]
    pub unet_channels: usize,

    /// Attach a depth estimator
    #[config(default = "false")]
    pub depth_estimator: bool,

    /// Seed for all weights
    #[config(default = "42")]
    pub seed: u64,
}

const SEED_WORDS: [&str; 6] = ["*", "a", "photo", "of", "the", "style"];

impl ModelConfig {
    /// Smallest model that still has every part
    pub fn tiny() -> Self {
        Self::new()
            .with_vocab_size(16)
            .with_embedding_dim(4)
            .with_text_encoder_layers(1)
            .with_unet_blocks(1)
            .with_unet_channels(8)
    }

    /// Build the model on `device`
    pub fn init<B: Backend>(&self, device: &B::Device) -> DiffusionModel<B> {
        let mut words: Vec<String> = SEED_WORDS.iter().map(|w| w.to_string()).collect();
        words.extend((words.len()..self.vocab_size).map(|i| format!("word{}", i)));
        let tokenizer = WordVocabulary::new(&words).with_unknown("<|unk|>");

        let dim = self.embedding_dim;
        let text_layers: Vec<LinearSpec> = (0..self.text_encoder_layers)
            .flat_map(|i| {
                ["q_proj", "k_proj", "v_proj", "out_proj"]
                    .into_iter()
                    .map(move |proj| LinearSpec::new(format!("layers.{}.self_attn.{}", i, proj), dim, dim))
                    .chain(std::iter::once(LinearSpec::new(format!("layers.{}.mlp.fc1", i), dim, dim * 4)))
            })
            .collect();
        let text_encoder = ClipTextEncoder::new(
            FrozenModule::seeded("text_encoder", &text_layers, self.seed, device),
            TokenEmbeddings::seeded(tokenizer.len(), dim, self.seed.wrapping_add(1), device),
        );

        let ch = self.unet_channels;
        let unet_layers: Vec<LinearSpec> = (0..self.unet_blocks)
            .flat_map(|i| {
                vec![
                    LinearSpec::new(format!("down_blocks.{}.attentions.0.to_q", i), ch, ch),
                    LinearSpec::new(format!("down_blocks.{}.attentions.0.to_k", i), dim, ch),
                    LinearSpec::new(format!("down_blocks.{}.attentions.0.to_v", i), dim, ch),
                    LinearSpec::new(format!("down_blocks.{}.resnets.0.time_emb_proj", i), ch, ch),
                ]
            })
            .collect();
        let unet = FrozenModule::seeded("unet", &unet_layers, self.seed.wrapping_add(2), device);

        let vae_layers = [
            LinearSpec::new("encoder.conv_in", 3, ch),
            LinearSpec::new("decoder.conv_out", ch, 3),
        ];
        let vae = FrozenModule::seeded("vae", &vae_layers, self.seed.wrapping_add(3), device);

        let model = DiffusionModel::new(
            Box::new(tokenizer),
            Box::new(text_encoder),
            Box::new(unet),
            Box::new(vae),
        );

        if self.depth_estimator {
            let layers = [LinearSpec::new("head.depth", ch, 1)];
            model.with_depth_estimator(Box::new(FrozenModule::seeded(
                "depth_estimator",
                &layers,
                self.seed.wrapping_add(4),
                device,
            )))
        } else {
            model
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_init_tiny_model() {
        let model = ModelConfig::tiny().init::<TestBackend>(&Default::default());
        // seed words and fillers plus the unknown token
        assert_eq!(model.tokenizer.len(), 17);
        assert_eq!(model.text_encoder.token_embeddings().num_tokens(), 17);
        assert_eq!(model.text_encoder.linear_layers().len(), 5);
        assert_eq!(model.unet.linear_layers().len(), 4);
        assert!(model.depth_estimator.is_none());
        assert!(!model.is_set_up());
    }

    #[test]
    fn test_depth_estimator_optional() {
        let model = ModelConfig::tiny()
            .with_depth_estimator(true)
            .init::<TestBackend>(&Default::default());
        assert!(model.depth_estimator.is_some());
    }

    #[test]
    fn test_adapter_slot_materializes_once() {
        let model = ModelConfig::tiny().init::<TestBackend>(&Default::default());
        let mut slot = AdapterSlot::<TestBackend>::Uninitialized;
        assert!(slot.as_ref().is_none());

        let make = |prefix: &str| LoraModuleWrapper::new(model.unet.as_ref(), 2, prefix, 1.0, None, &Default::default());
        slot.get_or_materialize(|| make("first"));
        slot.get_or_materialize(|| make("second"));

        assert!(slot.is_materialized());
        assert_eq!(slot.as_ref().map(|lora| lora.prefix()), Some("first"));
    }
}
