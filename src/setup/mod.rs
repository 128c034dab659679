//! LoRA training setup for a latent diffusion model.
//!
//! [`LoraSetup`] is the entry point the training loop drives:
//! [`setup_model`](LoraSetup::setup_model) once at the start of a run,
//! [`setup_train_device`](LoraSetup::setup_train_device) to place modules,
//! [`after_optimizer_step`](LoraSetup::after_optimizer_step) after every step
//! and [`report_learning_rates`](LoraSetup::report_learning_rates) whenever
//! rates are logged.

pub mod embedding_guard;
pub mod gradients;
pub mod lr_report;
pub mod params;
pub mod phase;
pub mod placement;

use crate::error::{Result, SetupError};
use crate::model::embedding::{add_embeddings_to_text_encoder, create_new_embedding, ModelEmbedding};
use crate::model::lora::LoraModuleWrapper;
use crate::model::parts::{ModelPart, SetupDevices, TextEncoderPart, Tier};
use crate::model::DiffusionModel;
use crate::training::{create_ema, create_optimizer, LrSource, MetricsSink, TrainConfig, TrainProgress};
use burn::prelude::*;
use embedding_guard::EmbeddingGuard;
use placement::Placement;
use tracing::info;

/// Name of the embedding created from seed text
pub const DEFAULT_EMBEDDING_NAME: &str = "embedding";

/// Unet sublayers that receive adapters
pub const UNET_LORA_TARGETS: [&str; 1] = ["attentions"];

/// Orchestrates adapters, gradients, placement and rate reporting for one run
#[derive(Debug, Clone)]
pub struct LoraSetup<B: Backend> {
    devices: SetupDevices<B>,
}

impl<B: Backend> LoraSetup<B> {
    pub fn new(devices: SetupDevices<B>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &SetupDevices<B> {
        &self.devices
    }

    /// Attach adapters and embeddings to `model` and build its optimizer and EMA.
    ///
    /// Safe to call again on a resumed model: adapters, embeddings and the
    /// embedding guard are reused, prior optimizer and EMA states are consumed.
    /// An out-of-range configuration is rejected before the model is touched.
    pub fn setup_model(&self, model: &mut DiffusionModel<B>, config: &TrainConfig) -> Result<()> {
        config.validate()?;

        let progress = model.train_progress;

        let te_device = self.devices.device(model.text_encoder.tier().unwrap_or(Tier::Temp));
        let text_encoder = model.text_encoder.as_ref();
        model.text_encoder_lora.get_or_materialize(|| {
            LoraModuleWrapper::new(text_encoder, config.lora_rank, "lora_te", config.lora_alpha, None, te_device)
        });

        let unet_device = self.devices.device(model.unet.tier().unwrap_or(Tier::Temp));
        let unet = model.unet.as_ref();
        model.unet_lora.get_or_materialize(|| {
            LoraModuleWrapper::new(
                unet,
                config.lora_rank,
                "lora_unet",
                config.lora_alpha,
                Some(&UNET_LORA_TARGETS[..]),
                unet_device,
            )
        });

        for lora in [model.text_encoder_lora.as_mut(), model.unet_lora.as_mut()].into_iter().flatten() {
            lora.set_dropout(config.dropout_probability);
        }

        model.text_encoder.requires_grad(false);
        model.unet.requires_grad(false);
        model.vae.requires_grad(false);

        gradients::apply(model, config, &progress);
        gradients::enable_embedding(model, config, &progress);

        for lora in [model.text_encoder_lora.as_mut(), model.unet_lora.as_mut()].into_iter().flatten() {
            lora.to_dtype(config.lora_weight_dtype);
            lora.hook_to_module();
        }

        if model.embeddings.is_empty() {
            let vector = create_new_embedding(
                model.tokenizer.as_ref(),
                model.text_encoder.as_ref(),
                &config.initial_embedding_text,
                config.token_count,
            )?;
            model.embeddings.push(ModelEmbedding::new(DEFAULT_EMBEDDING_NAME, vector));
            info!(
                "Created embedding '{}' from '{}' with {} tokens",
                DEFAULT_EMBEDDING_NAME, config.initial_embedding_text, config.token_count
            );
        }

        if model.embedding_guard.is_none() {
            let trainable_ids = add_embeddings_to_text_encoder(
                model.tokenizer.as_mut(),
                model.text_encoder.as_mut(),
                &mut model.embeddings,
            )?;
            let guard = EmbeddingGuard::snapshot(model.text_encoder.token_embeddings().weight(), &trainable_ids);
            model.embedding_guard = Some(guard);
        }

        if config.rescale_noise_scheduler_to_zero_terminal_snr {
            model.noise_schedule.rescale_to_zero_terminal_snr();
            model.noise_schedule.force_v_prediction();
            info!("Noise schedule rescaled to zero terminal SNR with v-prediction");
        }

        let groups = params::create_parameter_groups(model, config)?;
        let optimizer = create_optimizer(groups, model.optimizer_state.take(), &config.optimizer)?;
        model.optimizer = Some(optimizer);

        let ema_params = params::create_parameters(model, config)?;
        model.ema = create_ema(ema_params, model.ema_state.take(), &config.ema)?;

        info!(
            "LoRA setup complete: groups {:?}, {} embeddings, EMA {}",
            params::group_names(config),
            model.embeddings.len(),
            if model.ema.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    /// Move every module to the tier the configuration calls for
    pub fn setup_train_device(&self, model: &mut DiffusionModel<B>, config: &TrainConfig) -> Result<Placement> {
        placement::apply(model, config, &self.devices)
    }

    /// Update gradient modes for `progress` and restore frozen embedding rows
    pub fn after_optimizer_step(
        &self,
        model: &mut DiffusionModel<B>,
        config: &TrainConfig,
        progress: &TrainProgress,
    ) -> Result<()> {
        const OPERATION: &str = "after_optimizer_step";

        if !model.text_encoder_lora.is_materialized() {
            return Err(SetupError::NotSetUp {
                operation: OPERATION,
                missing: "text encoder adapter",
            });
        }
        if !model.unet_lora.is_materialized() {
            return Err(SetupError::NotSetUp {
                operation: OPERATION,
                missing: "unet adapter",
            });
        }

        gradients::apply(model, config, progress);

        let guard = model.embedding_guard.as_ref().ok_or(SetupError::NotSetUp {
            operation: OPERATION,
            missing: "embedding guard",
        })?;
        guard.restore(model.text_encoder.token_embeddings_mut())
    }

    /// Record the current rate of every active group as `lr/<group>`
    pub fn report_learning_rates(
        &self,
        model: &DiffusionModel<B>,
        config: &TrainConfig,
        scheduler: &dyn LrSource,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let optimizer = model.optimizer.as_ref().ok_or(SetupError::NotSetUp {
            operation: "report_learning_rates",
            missing: "optimizer",
        })?;

        lr_report::report(
            &params::group_names(config),
            scheduler.get_last_lr(),
            |lrs| config.optimizer.optimizer.maybe_adjust_lrs(lrs, optimizer),
            sink,
            model.train_progress.global_step,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::noise::PredictionType;
    use crate::model::ModelConfig;
    use crate::training::{
        EmaConfig, EmaMode, GroupScheduler, MemoryMetricsSink, ModuleConfig, OptimizerKind, OptimizerState,
        SchedulerConfig,
    };
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn setup() -> LoraSetup<TestBackend> {
        let device = Default::default();
        LoraSetup::new(SetupDevices::new(device, device))
    }

    fn model() -> DiffusionModel<TestBackend> {
        ModelConfig::tiny().init::<TestBackend>(&Default::default())
    }

    fn config() -> TrainConfig {
        TrainConfig {
            lora_rank: 2,
            initial_embedding_text: "a photo".to_string(),
            token_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_text_encoder_only_reports_one_rate() {
        let config = TrainConfig {
            unet: ModuleConfig::frozen(),
            train_embedding: false,
            ..config()
        };
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config).unwrap();

        let optimizer = model.optimizer.as_ref().unwrap();
        let names: Vec<_> = optimizer.param_groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["te"]);

        let scheduler = GroupScheduler::for_optimizer(SchedulerConfig::default(), optimizer);
        let mut sink = MemoryMetricsSink::new();
        setup.report_learning_rates(&model, &config, &scheduler, &mut sink).unwrap();

        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].name, "lr/te");
        assert_eq!(sink.records()[0].value, config.learning_rate);
    }

    #[test]
    fn test_embedding_window_closes_but_guard_keeps_restoring() {
        let config = TrainConfig {
            train_embedding: true,
            train_embedding_epochs: 2,
            ..config()
        };
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config).unwrap();

        setup.after_optimizer_step(&mut model, &config, &TrainProgress::at_epoch(1)).unwrap();
        assert!(model.text_encoder.token_embeddings().grad_enabled());

        let perturbed = model.text_encoder.token_embeddings().weight().clone().add_scalar(1.0);
        model.text_encoder.token_embeddings_mut().set_weight(perturbed);

        setup.after_optimizer_step(&mut model, &config, &TrainProgress::at_epoch(2)).unwrap();
        assert!(!model.text_encoder.token_embeddings().grad_enabled());

        let guard = model.embedding_guard.as_ref().unwrap();
        let weight = model.text_encoder.token_embeddings().weight();
        assert!(guard.frozen_rows_intact(weight).unwrap());
    }

    #[test]
    fn test_guard_restores_only_frozen_rows() {
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config()).unwrap();

        let trainable = model.embeddings[0].token_ids.clone();
        let before = model.text_encoder.token_embeddings().weight().clone();
        let updated = before.clone().add_scalar(0.25);
        model.text_encoder.token_embeddings_mut().set_weight(updated);

        setup.after_optimizer_step(&mut model, &config(), &TrainProgress::new()).unwrap();

        let embeddings = model.text_encoder.token_embeddings();
        let dim = embeddings.dim();
        let before = before.to_data().to_vec::<f32>().unwrap();
        let after = embeddings.weight().to_data().to_vec::<f32>().unwrap();
        let changed: Vec<u32> = before
            .chunks(dim)
            .zip(after.chunks(dim))
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i as u32)
            .collect();
        assert_eq!(changed, trainable);
    }

    #[test]
    fn test_align_prop_placement() {
        for latent_caching in [true, false] {
            let config = TrainConfig {
                align_prop: true,
                debug_mode: false,
                latent_caching,
                text_encoder: ModuleConfig::frozen(),
                ..config()
            };
            let setup = setup();
            let mut model = model();
            setup.setup_model(&mut model, &config).unwrap();
            let placement = setup.setup_train_device(&mut model, &config).unwrap();

            assert_eq!(placement.vae, Tier::Train);
            assert_eq!(placement.text_encoder, Tier::Train);
            assert_eq!(model.vae.tier(), Some(Tier::Train));
            assert_eq!(model.text_encoder.tier(), Some(Tier::Train));
            assert_eq!(model.text_encoder_lora.as_ref().and_then(|l| l.tier()), Some(Tier::Train));
        }
    }

    #[test]
    fn test_first_setup_creates_one_embedding() {
        let setup = setup();
        let mut model = model();
        let vocab_before = model.tokenizer.len();
        assert!(model.embeddings.is_empty());

        setup.setup_model(&mut model, &config()).unwrap();

        assert_eq!(model.embeddings.len(), 1);
        let embedding = &model.embeddings[0];
        assert_eq!(embedding.name, DEFAULT_EMBEDDING_NAME);
        assert_eq!(embedding.token_count(), 2);
        assert_eq!(embedding.token_ids, vec![vocab_before as u32, vocab_before as u32 + 1]);
        assert_eq!(model.tokenizer.len(), vocab_before + 2);

        let guard = model.embedding_guard.as_ref().unwrap();
        assert_eq!(guard.trainable_ids(), embedding.token_ids);
        assert!(model.is_set_up());
    }

    #[test]
    fn test_setup_twice_reuses_adapters_and_guard() {
        let setup = setup();
        let mut model = model();
        let config = config();
        setup.setup_model(&mut model, &config).unwrap();
        let down = model.unet_lora.as_ref().unwrap().layers()[0].down.to_data().to_vec::<f32>().unwrap();
        let vocab = model.tokenizer.len();

        setup.setup_model(&mut model, &config).unwrap();

        let again = model.unet_lora.as_ref().unwrap().layers()[0].down.to_data().to_vec::<f32>().unwrap();
        assert_eq!(down, again);
        assert_eq!(model.tokenizer.len(), vocab);
        assert_eq!(model.embeddings.len(), 1);
    }

    #[test]
    fn test_adapters_configured() {
        let config = TrainConfig {
            dropout_probability: 0.1,
            lora_weight_dtype: crate::training::WeightDtype::Float16,
            unet: ModuleConfig::frozen(),
            ..config()
        };
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config).unwrap();

        let te = model.text_encoder_lora.as_ref().unwrap();
        let unet = model.unet_lora.as_ref().unwrap();
        assert!(te.grad_enabled() && te.is_hooked());
        assert!(!unet.grad_enabled() && unet.is_hooked());
        assert_eq!(te.dropout(), 0.1);
        assert_eq!(unet.dtype(), crate::training::WeightDtype::Float16);
        assert!(unet.layers().iter().all(|l| l.name.contains("attentions")));
        assert!(!model.text_encoder.grad_enabled());
        assert!(!model.unet.grad_enabled());
        assert!(!model.vae.grad_enabled());
    }

    #[test]
    fn test_after_optimizer_step_requires_setup() {
        let err = setup()
            .after_optimizer_step(&mut model(), &config(), &TrainProgress::new())
            .unwrap_err();
        assert!(matches!(err, SetupError::NotSetUp { operation: "after_optimizer_step", .. }));
    }

    #[test]
    fn test_report_requires_optimizer() {
        let scheduler = GroupScheduler::new(SchedulerConfig::default(), vec![1e-4, 1e-4]);
        let err = setup()
            .report_learning_rates(&model(), &config(), &scheduler, &mut MemoryMetricsSink::new())
            .unwrap_err();
        assert!(matches!(err, SetupError::NotSetUp { missing: "optimizer", .. }));
    }

    #[test]
    fn test_report_rejects_rate_count_mismatch() {
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config()).unwrap();

        let scheduler = GroupScheduler::new(SchedulerConfig::default(), vec![1e-4]);
        let err = setup
            .report_learning_rates(&model, &config(), &scheduler, &mut MemoryMetricsSink::new())
            .unwrap_err();
        assert!(matches!(err, SetupError::LearningRateMismatch { rates: 1, .. }));
    }

    #[test]
    fn test_adaptive_optimizer_rates_are_adjusted() {
        let mut config = config();
        config.optimizer.optimizer = OptimizerKind::Prodigy;
        config.optimizer.d0 = 0.5;
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config).unwrap();

        let scheduler = GroupScheduler::for_optimizer(SchedulerConfig::default(), model.optimizer.as_ref().unwrap());
        let mut sink = MemoryMetricsSink::new();
        setup.report_learning_rates(&model, &config, &scheduler, &mut sink).unwrap();

        let values: Vec<_> = sink.records().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![config.learning_rate * 0.5; 2]);
    }

    #[test]
    fn test_prior_states_consumed_once() {
        let config = TrainConfig {
            ema: EmaConfig {
                mode: EmaMode::Cpu,
                ..Default::default()
            },
            ..config()
        };
        let setup = setup();
        let mut model = model();
        setup.setup_model(&mut model, &config).unwrap();
        let optimizer_state = model.optimizer.as_ref().unwrap().state();
        let ema_state = model.ema.as_ref().unwrap().state();

        let mut resumed = self::model().with_prior_state(Some(optimizer_state), Some(ema_state));
        setup.setup_model(&mut resumed, &config).unwrap();
        assert!(resumed.optimizer_state.is_none());
        assert!(resumed.ema_state.is_none());
        assert!(resumed.ema.is_some());
    }

    #[test]
    fn test_misaligned_prior_state_is_rejected() {
        let mut model = model();
        model.optimizer_state = Some(OptimizerState {
            kind: OptimizerKind::AdamW,
            groups: Vec::new(),
        });
        let err = setup().setup_model(&mut model, &config()).unwrap_err();
        assert!(matches!(err, SetupError::StateMismatch { kind: "optimizer", .. }));
        assert!(model.optimizer_state.is_none());
    }

    #[test]
    fn test_out_of_range_config_is_rejected_before_setup() {
        let config = TrainConfig {
            token_count: 0,
            ..config()
        };
        let mut model = model();
        let err = setup().setup_model(&mut model, &config).unwrap_err();
        assert!(matches!(err, SetupError::InvalidConfig { ref field, .. } if field == "token_count"));
        assert!(err.is_config_error());
        assert!(model.embeddings.is_empty());
        assert!(!model.text_encoder_lora.is_materialized());
        assert!(model.optimizer.is_none());
    }

    #[test]
    fn test_zero_ema_interval_is_rejected() {
        let config = TrainConfig {
            ema: EmaConfig {
                mode: EmaMode::Gpu,
                update_step_interval: 0,
                ..Default::default()
            },
            ..config()
        };
        let err = setup().setup_model(&mut model(), &config).unwrap_err();
        assert!(
            matches!(err, SetupError::InvalidConfig { ref field, .. } if field == "ema.update_step_interval")
        );
    }

    #[test]
    fn test_noise_rescale() {
        let config = TrainConfig {
            rescale_noise_scheduler_to_zero_terminal_snr: true,
            ..config()
        };
        let mut model = model();
        setup().setup_model(&mut model, &config).unwrap();
        assert_eq!(model.noise_schedule.prediction_type(), PredictionType::VPrediction);
        assert_eq!(model.noise_schedule.terminal_snr(), 0.0);
    }
}
