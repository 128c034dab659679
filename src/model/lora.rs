use crate::model::parts::{LinearSpec, ModelPart, ParamRef, Tier};
use crate::training::WeightDtype;
use burn::prelude::*;
use burn::tensor::Distribution;
use tracing::debug;

/// Low-rank delta for one linear layer: `up · down · alpha / rank`
#[derive(Debug, Clone)]
pub struct LoraLayer<B: Backend> {
    /// Path of the wrapped layer inside the host module
    pub name: String,
    /// `[rank, in_features]`, random init
    pub down: Tensor<B, 2>,
    /// `[out_features, rank]`, zero init so the delta starts at zero
    pub up: Tensor<B, 2>,
    scale: f64,
}

impl<B: Backend> LoraLayer<B> {
    pub fn new(spec: &LinearSpec, rank: usize, alpha: f64, device: &B::Device) -> Self {
        let std = 1.0 / rank as f64;
        Self {
            name: spec.name.clone(),
            down: Tensor::random([rank, spec.in_features], Distribution::Normal(0.0, std), device),
            up: Tensor::zeros([spec.out_features, rank], device),
            scale: alpha / rank as f64,
        }
    }

    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    /// Delta added to the host layer's output for `input` of shape `[batch, in_features]`
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        input
            .matmul(self.down.clone().transpose())
            .matmul(self.up.clone().transpose())
            .mul_scalar(self.scale)
    }

    fn to_device(&mut self, device: &B::Device) {
        self.down = self.down.clone().to_device(device);
        self.up = self.up.clone().to_device(device);
    }
}

/// Set of adapters injected into the linear layers of one base module
#[derive(Debug, Clone)]
pub struct LoraModuleWrapper<B: Backend> {
    prefix: String,
    layers: Vec<LoraLayer<B>>,
    dropout: f64,
    requires_grad: bool,
    dtype: WeightDtype,
    hooked: bool,
    tier: Option<Tier>,
}

impl<B: Backend> LoraModuleWrapper<B> {
    /// Create adapters for every linear layer of `base` whose path contains one
    /// of `targets`, or for every layer when `targets` is `None`.
    pub fn new<M: ModelPart<B> + ?Sized>(
        base: &M,
        rank: usize,
        prefix: impl Into<String>,
        alpha: f64,
        targets: Option<&[&str]>,
        device: &B::Device,
    ) -> Self {
        let prefix = prefix.into();
        let layers: Vec<LoraLayer<B>> = base
            .linear_layers()
            .iter()
            .filter(|spec| match targets {
                Some(targets) => targets.iter().any(|t| spec.name.contains(t)),
                None => true,
            })
            .map(|spec| LoraLayer::new(spec, rank, alpha, device))
            .collect();

        debug!(
            "Created {} with {} adapted layers of rank {}",
            prefix,
            layers.len(),
            rank
        );

        Self {
            prefix,
            layers,
            dropout: 0.0,
            requires_grad: true,
            dtype: WeightDtype::Float32,
            hooked: false,
            tier: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn layers(&self) -> &[LoraLayer<B>] {
        &self.layers
    }

    /// Trainable tensors, named `<prefix>.<layer>.lora_down|lora_up`
    pub fn parameters(&self) -> Vec<ParamRef> {
        self.layers
            .iter()
            .flat_map(|layer| {
                [
                    ParamRef::new(format!("{}.{}.lora_down", self.prefix, layer.name), layer.down.dims()),
                    ParamRef::new(format!("{}.{}.lora_up", self.prefix, layer.name), layer.up.dims()),
                ]
            })
            .collect()
    }

    pub fn dropout(&self) -> f64 {
        self.dropout
    }

    pub fn set_dropout(&mut self, probability: f64) {
        self.dropout = probability;
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

    /// Record the storage precision of the adapter weights
    pub fn to_dtype(&mut self, dtype: WeightDtype) {
        self.dtype = dtype;
    }

    /// Make the deltas part of the host module's forward pass. Idempotent.
    pub fn hook_to_module(&mut self) {
        if !self.hooked {
            self.hooked = true;
            debug!("Hooked {} into its host module", self.prefix);
        }
    }

    pub fn is_hooked(&self) -> bool {
        self.hooked
    }

    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    pub fn to_tier(&mut self, tier: Tier, device: &B::Device) {
        for layer in &mut self.layers {
            layer.to_device(device);
        }
        self.tier = Some(tier);
    }

    /// Bytes the adapter weights occupy at their storage precision
    pub fn size_in_bytes(&self) -> usize {
        let elements: usize = self.parameters().iter().map(ParamRef::num_elements).sum();
        elements * self.dtype.size_of()
    }
}
