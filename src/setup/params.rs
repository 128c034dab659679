use crate::error::{Result, SetupError};
use crate::model::lora::LoraModuleWrapper;
use crate::model::parts::{ParamRef, TextEncoderPart};
use crate::model::{AdapterSlot, DiffusionModel};
use crate::training::{ParamGroup, TrainConfig};
use burn::prelude::*;

pub const TEXT_ENCODER_GROUP: &str = "te";
pub const EMBEDDING_GROUP: &str = "embedding";
pub const UNET_GROUP: &str = "unet";

/// Names of the active groups, in the order groups and rates are built
pub fn group_names(config: &TrainConfig) -> Vec<&'static str> {
    let mut names = Vec::with_capacity(3);
    if config.text_encoder.train {
        names.push(TEXT_ENCODER_GROUP);
    }
    if config.train_embedding {
        names.push(EMBEDDING_GROUP);
    }
    if config.unet.train {
        names.push(UNET_GROUP);
    }
    names
}

fn adapter<'a, B: Backend>(
    slot: &'a AdapterSlot<B>,
    operation: &'static str,
    missing: &'static str,
) -> Result<&'a LoraModuleWrapper<B>> {
    slot.as_ref().ok_or(SetupError::NotSetUp { operation, missing })
}

/// Every trainable tensor of the configured modules, for the EMA tracker.
///
/// Depends on the configuration only, not on stop conditions.
pub fn create_parameters<B: Backend>(model: &DiffusionModel<B>, config: &TrainConfig) -> Result<Vec<ParamRef>> {
    let mut params = Vec::new();
    for group in create_parameter_groups(model, config)? {
        params.extend(group.params);
    }
    Ok(params)
}

/// One learning-rate tagged group per active module: te, embedding, unet
pub fn create_parameter_groups<B: Backend>(model: &DiffusionModel<B>, config: &TrainConfig) -> Result<Vec<ParamGroup>> {
    const OPERATION: &str = "create_parameter_groups";

    group_names(config)
        .into_iter()
        .map(|name| {
            let group = match name {
                TEXT_ENCODER_GROUP => {
                    let lora = adapter(&model.text_encoder_lora, OPERATION, "text encoder adapter")?;
                    ParamGroup::new(name, lora.parameters(), config.text_encoder_learning_rate())
                }
                EMBEDDING_GROUP => ParamGroup::new(
                    name,
                    model.text_encoder.token_embeddings().parameters(),
                    config.embedding_learning_rate(),
                ),
                _ => {
                    let lora = adapter(&model.unet_lora, OPERATION, "unet adapter")?;
                    ParamGroup::new(name, lora.parameters(), config.unet_learning_rate())
                }
            };
            Ok::<_, SetupError>(group)
        })
        .collect()
}
