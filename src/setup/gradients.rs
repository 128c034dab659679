use crate::model::parts::TextEncoderPart;
use crate::model::DiffusionModel;
use crate::setup::phase;
use crate::training::{TrainConfig, TrainProgress};
use burn::prelude::*;
use tracing::{debug, warn};

/// Set adapter and embedding gradient tracking for `progress`. Idempotent.
pub fn apply<B: Backend>(model: &mut DiffusionModel<B>, config: &TrainConfig, progress: &TrainProgress) {
    if let Some(lora) = model.text_encoder_lora.as_mut() {
        let train = config.text_encoder.train && !phase::stop_elapsed(&config.text_encoder, progress);
        lora.requires_grad(train);
        debug!("Text encoder adapter gradients: {}", train);
    }

    if let Some(lora) = model.unet_lora.as_mut() {
        let train = config.unet.train && !phase::stop_elapsed(&config.unet, progress);
        lora.requires_grad(train);
        debug!("Unet adapter gradients: {}", train);
    }

    if config.train_embedding && !phase::embedding_window_open(config, progress) {
        let embeddings = model.text_encoder.token_embeddings_mut();
        if embeddings.grad_enabled() {
            warn!(
                "Embedding training window closed at epoch {}, freezing the embedding matrix",
                progress.epoch
            );
        }
        embeddings.requires_grad(false);
    }
}

/// Turn embedding gradients on while inside the training window.
///
/// Returns whether the embedding trains.
pub fn enable_embedding<B: Backend>(
    model: &mut DiffusionModel<B>,
    config: &TrainConfig,
    progress: &TrainProgress,
) -> bool {
    let train = config.train_embedding && phase::embedding_window_open(config, progress);
    if train {
        let embeddings = model.text_encoder.token_embeddings_mut();
        embeddings.requires_grad(true);
        embeddings.to_dtype(config.embedding_weight_dtype);
        debug!("Embedding gradients enabled at {}", config.embedding_weight_dtype);
    }
    train
}
