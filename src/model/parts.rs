//! Base modules of the diffusion model as seen by the setup code.
//!
//! Forward and backward passes live in the training backend. Setup only needs
//! to move modules between devices, switch train/eval behavior, toggle
//! gradient tracking and enumerate the linear layers adapters attach to.

use crate::error::Result;
use crate::training::WeightDtype;
use crate::utils::random;
use burn::prelude::*;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Memory tier a module resides on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast device used for the training step
    Train,
    /// Slow device used for idle storage
    Temp,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Temp => f.write_str("temp"),
        }
    }
}

/// Devices backing the two tiers
#[derive(Debug, Clone)]
pub struct SetupDevices<B: Backend> {
    pub train: B::Device,
    pub temp: B::Device,
}

impl<B: Backend> SetupDevices<B> {
    pub fn new(train: B::Device, temp: B::Device) -> Self {
        Self { train, temp }
    }

    /// Device backing `tier`
    pub fn device(&self, tier: Tier) -> &B::Device {
        match tier {
            Tier::Train => &self.train,
            Tier::Temp => &self.temp,
        }
    }
}

/// Layer behavior mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleMode {
    Train,
    #[default]
    Eval,
}

/// Name and shape of a trainable tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamRef {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParamRef {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A linear sublayer an adapter can attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearSpec {
    /// Dotted path inside the module, e.g. `down.0.attentions.0.to_q`
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl LinearSpec {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize) -> Self {
        Self {
            name: name.into(),
            in_features,
            out_features,
        }
    }
}

/// Operations setup performs on a base module
pub trait ModelPart<B: Backend> {
    /// Module name used in logs
    fn name(&self) -> &str;

    /// Linear sublayers, in a stable order
    fn linear_layers(&self) -> Vec<LinearSpec>;

    /// Tier the module currently resides on, `None` before the first placement
    fn tier(&self) -> Option<Tier>;

    /// Move every tensor to `device` and record `tier`. Blocks until done.
    fn to_tier(&mut self, tier: Tier, device: &B::Device) -> Result<()>;

    fn mode(&self) -> ModuleMode;

    fn set_mode(&mut self, mode: ModuleMode);

    /// Whether the base weights track gradients
    fn grad_enabled(&self) -> bool;

    /// Enable or disable gradient tracking on the base weights
    fn requires_grad(&mut self, enabled: bool);
}

/// Text encoder owning the token-embedding matrix
pub trait TextEncoderPart<B: Backend>: ModelPart<B> {
    fn token_embeddings(&self) -> &TokenEmbeddings<B>;

    fn token_embeddings_mut(&mut self) -> &mut TokenEmbeddings<B>;
}

/// Dense token-embedding matrix, one row per token id
#[derive(Debug, Clone)]
pub struct TokenEmbeddings<B: Backend> {
    weight: Tensor<B, 2>,
    requires_grad: bool,
    dtype: WeightDtype,
}

impl<B: Backend> TokenEmbeddings<B> {
    pub fn new(weight: Tensor<B, 2>) -> Self {
        Self {
            weight,
            requires_grad: false,
            dtype: WeightDtype::Float32,
        }
    }

    /// Matrix with `num_tokens` rows of seeded uniform values
    pub fn seeded(num_tokens: usize, dim: usize, seed: u64, device: &B::Device) -> Self {
        let values = random::random_vector(num_tokens * dim, 0.02, seed);
        Self::new(Tensor::from_data(TensorData::new(values, [num_tokens, dim]), device))
    }

    pub fn weight(&self) -> &Tensor<B, 2> {
        &self.weight
    }

    /// Replace the matrix, e.g. after an optimizer update
    pub fn set_weight(&mut self, weight: Tensor<B, 2>) {
        self.weight = weight;
    }

    pub fn num_tokens(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn grad_enabled(&self) -> bool {
        self.requires_grad
    }

    pub fn requires_grad(&mut self, enabled: bool) {
        self.requires_grad = enabled;
    }

    pub fn dtype(&self) -> WeightDtype {
        self.dtype
    }

    /// Record the storage precision used while training
    pub fn to_dtype(&mut self, dtype: WeightDtype) {
        self.dtype = dtype;
    }

    pub fn parameters(&self) -> Vec<ParamRef> {
        vec![ParamRef::new("token_embedding.weight", self.weight.dims())]
    }

    /// Rows for `ids`, stacked in order
    pub fn rows(&self, ids: &[u32]) -> Tensor<B, 2> {
        let dim = self.dim();
        let rows = ids
            .iter()
            .map(|&id| {
                let id = id as usize;
                self.weight.clone().slice([id..id + 1, 0..dim])
            })
            .collect();
        Tensor::cat(rows, 0)
    }

    /// Overwrite row `id` with `row` of shape `[1, dim]`
    pub fn write_row(&mut self, id: u32, row: Tensor<B, 2>) {
        let id = id as usize;
        let dim = self.dim();
        self.weight = self.weight.clone().slice_assign([id..id + 1, 0..dim], row);
    }

    /// Grow to `num_tokens` rows, new rows zero-initialized
    pub fn resize(&mut self, num_tokens: usize) {
        let current = self.num_tokens();
        if num_tokens <= current {
            return;
        }
        let extra = Tensor::zeros([num_tokens - current, self.dim()], &self.weight.device());
        self.weight = Tensor::cat(vec![self.weight.clone(), extra], 0);
    }

    pub fn to_device(&mut self, device: &B::Device) {
        self.weight = self.weight.clone().to_device(device);
    }
}

/// Named weight of a linear layer, `[out_features, in_features]`
#[derive(Debug, Clone)]
pub struct DenseLayer<B: Backend> {
    pub name: String,
    pub weight: Tensor<B, 2>,
}

/// Frozen base module made of linear layers
#[derive(Debug, Clone)]
pub struct FrozenModule<B: Backend> {
    name: String,
    layers: Vec<DenseLayer<B>>,
    tier: Option<Tier>,
    mode: ModuleMode,
    grad_enabled: bool,
}

impl<B: Backend> FrozenModule<B> {
    pub fn new(name: impl Into<String>, layers: Vec<DenseLayer<B>>) -> Self {
        Self {
            name: name.into(),
            layers,
            tier: None,
            mode: ModuleMode::Eval,
            grad_enabled: true,
        }
    }

    /// Module with seeded weights for every spec
    pub fn seeded(name: impl Into<String>, specs: &[LinearSpec], seed: u64, device: &B::Device) -> Self {
        let layers = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let values = random::random_vector(
                    spec.in_features * spec.out_features,
                    0.02,
                    seed.wrapping_add(i as u64),
                );
                DenseLayer {
                    name: spec.name.clone(),
                    weight: Tensor::from_data(
                        TensorData::new(values, [spec.out_features, spec.in_features]),
                        device,
                    ),
                }
            })
            .collect();
        Self::new(name, layers)
    }

    pub fn layers(&self) -> &[DenseLayer<B>] {
        &self.layers
    }
}

impl<B: Backend> ModelPart<B> for FrozenModule<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn linear_layers(&self) -> Vec<LinearSpec> {
        self.layers
            .iter()
            .map(|layer| {
                let [out_features, in_features] = layer.weight.dims();
                LinearSpec::new(layer.name.clone(), in_features, out_features)
            })
            .collect()
    }

    fn tier(&self) -> Option<Tier> {
        self.tier
    }

    fn to_tier(&mut self, tier: Tier, device: &B::Device) -> Result<()> {
        for layer in &mut self.layers {
            layer.weight = layer.weight.clone().to_device(device);
        }
        self.tier = Some(tier);
        debug!("Moved {} to the {} device", self.name, tier);
        Ok(())
    }

    fn mode(&self) -> ModuleMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        self.mode = mode;
    }

    fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    fn requires_grad(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }
}

/// CLIP-style text encoder: a transformer body plus the token embedding
#[derive(Debug, Clone)]
pub struct ClipTextEncoder<B: Backend> {
    body: FrozenModule<B>,
    embeddings: TokenEmbeddings<B>,
}

impl<B: Backend> ClipTextEncoder<B> {
    pub fn new(body: FrozenModule<B>, embeddings: TokenEmbeddings<B>) -> Self {
        Self { body, embeddings }
    }
}

impl<B: Backend> ModelPart<B> for ClipTextEncoder<B> {
    fn name(&self) -> &str {
        self.body.name()
    }

    fn linear_layers(&self) -> Vec<LinearSpec> {
        self.body.linear_layers()
    }

    fn tier(&self) -> Option<Tier> {
        self.body.tier()
    }

    fn to_tier(&mut self, tier: Tier, device: &B::Device) -> Result<()> {
        self.embeddings.to_device(device);
        self.body.to_tier(tier, device)
    }

    fn mode(&self) -> ModuleMode {
        self.body.mode()
    }

    fn set_mode(&mut self, mode: ModuleMode) {
        self.body.set_mode(mode);
    }

    fn grad_enabled(&self) -> bool {
        self.body.grad_enabled()
    }

    fn requires_grad(&mut self, enabled: bool) {
        self.body.requires_grad(enabled);
        self.embeddings.requires_grad(enabled);
    }
}

impl<B: Backend> TextEncoderPart<B> for ClipTextEncoder<B> {
    fn token_embeddings(&self) -> &TokenEmbeddings<B> {
        &self.embeddings
    }

    fn token_embeddings_mut(&mut self) -> &mut TokenEmbeddings<B> {
        &mut self.embeddings
    }
}
