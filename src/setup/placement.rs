use crate::error::Result;
use crate::model::parts::{ModelPart, ModuleMode, SetupDevices, Tier};
use crate::model::DiffusionModel;
use crate::training::TrainConfig;
use burn::prelude::*;
use tracing::{debug, info};

/// Configuration switches placement depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlacementFlags {
    pub debug_mode: bool,
    pub align_prop: bool,
    pub latent_caching: bool,
    pub train_text_encoder: bool,
    pub train_embedding: bool,
}

impl PlacementFlags {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            debug_mode: config.debug_mode,
            align_prop: config.align_prop,
            latent_caching: config.latent_caching,
            train_text_encoder: config.text_encoder.train,
            train_embedding: config.train_embedding,
        }
    }
}

/// Tier of every base module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub text_encoder: Tier,
    pub vae: Tier,
    pub unet: Tier,
    pub depth_estimator: Tier,
}

impl Placement {
    /// Tier assignment for `flags`. Pure.
    pub fn resolve(flags: &PlacementFlags) -> Self {
        let tier = |on_train: bool| if on_train { Tier::Train } else { Tier::Temp };

        let text_encoder_live = flags.train_text_encoder
            || flags.train_embedding
            || flags.align_prop
            || !flags.latent_caching;

        Self {
            text_encoder: tier(text_encoder_live),
            vae: tier(flags.debug_mode || flags.align_prop),
            unet: Tier::Train,
            depth_estimator: Tier::Temp,
        }
    }
}

fn mode(train: bool) -> ModuleMode {
    if train {
        ModuleMode::Train
    } else {
        ModuleMode::Eval
    }
}

/// Move every module to its tier and set train/eval behavior.
///
/// Adapters and the embedding snapshot follow their host module.
pub fn apply<B: Backend>(
    model: &mut DiffusionModel<B>,
    config: &TrainConfig,
    devices: &SetupDevices<B>,
) -> Result<Placement> {
    let placement = Placement::resolve(&PlacementFlags::from_config(config));

    let te_device = devices.device(placement.text_encoder);
    model.text_encoder.to_tier(placement.text_encoder, te_device)?;
    if let Some(lora) = model.text_encoder_lora.as_mut() {
        lora.to_tier(placement.text_encoder, te_device);
    }
    if let Some(guard) = model.embedding_guard.as_mut() {
        guard.to_device(te_device);
    }

    model.vae.to_tier(placement.vae, devices.device(placement.vae))?;

    let unet_device = devices.device(placement.unet);
    model.unet.to_tier(placement.unet, unet_device)?;
    if let Some(lora) = model.unet_lora.as_mut() {
        lora.to_tier(placement.unet, unet_device);
    }

    if let Some(depth_estimator) = model.depth_estimator.as_mut() {
        depth_estimator.to_tier(placement.depth_estimator, devices.device(placement.depth_estimator))?;
        depth_estimator.set_mode(ModuleMode::Eval);
    }

    model.text_encoder.set_mode(mode(config.text_encoder.train));
    model.vae.set_mode(ModuleMode::Eval);
    model.unet.set_mode(mode(config.unet.train));

    debug!("Placement: {:?}", placement);
    info!(
        "Text encoder on {}, vae on {}, unet on {}",
        placement.text_encoder, placement.vae, placement.unet
    );
    Ok(placement)
}
