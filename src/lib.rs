//! # diffusion-lora: LoRA training setup for latent diffusion models
//!
//! Decides, for every step of a parameter-efficient fine-tuning run, which
//! parts of a text encoder / denoiser / autoencoder model train, which device
//! tier each part lives on and how per-group learning rates are reported.
//!
//! ## Features
//!
//! - Low-rank adapters on the text encoder and the denoiser's attention blocks
//! - A learned token embedding whose frozen neighbours are restored every step
//! - Epoch or step based stop conditions per module
//! - Optimizer and EMA construction with resumable state
//! - Zero-terminal-SNR noise schedule rescaling
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use diffusion_lora::model::parts::SetupDevices;
//! use diffusion_lora::model::ModelConfig;
//! use diffusion_lora::setup::LoraSetup;
//! use diffusion_lora::training::{GroupScheduler, TracingMetricsSink, TrainConfig, TrainProgress};
//! use diffusion_lora::DefaultBackend;
//!
//! let device = Default::default();
//! let config = TrainConfig::default();
//! let mut model = ModelConfig::new().init::<DefaultBackend>(&device);
//!
//! let setup = LoraSetup::new(SetupDevices::new(device, device));
//! setup.setup_model(&mut model, &config).unwrap();
//! setup.setup_train_device(&mut model, &config).unwrap();
//!
//! let optimizer = model.optimizer.as_ref().unwrap();
//! let scheduler = GroupScheduler::for_optimizer(config.scheduler.clone(), optimizer);
//!
//! let mut progress = TrainProgress::new();
//! progress.next_step(config.batch_size);
//! setup.after_optimizer_step(&mut model, &config, &progress).unwrap();
//! setup
//!     .report_learning_rates(&model, &config, &scheduler, &mut TracingMetricsSink)
//!     .unwrap();
//! ```

pub mod cli;
pub mod error;
pub mod model;
pub mod setup;
pub mod training;
pub mod utils;

use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Re-export commonly used types
pub use error::{Result, SetupError};
pub use model::{AdapterSlot, DiffusionModel, ModelConfig};
pub use setup::LoraSetup;
pub use training::{TrainConfig, TrainProgress};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!("{} v{} - LoRA training setup for latent diffusion models", NAME, VERSION)
}
