pub mod config;
pub mod ema;
pub mod metrics;
pub mod optimizer;
pub mod progress;
pub mod scheduler;

pub use config::{ModuleConfig, TimeUnit, TrainConfig, WeightDtype};
pub use ema::{create_ema, EmaConfig, EmaMode, EmaState, EmaTracker};
pub use metrics::{CsvMetricsSink, MemoryMetricsSink, MetricsSink, TracingMetricsSink};
pub use optimizer::{
    create_optimizer, OptimizerConfig, OptimizerKind, OptimizerState, ParamGroup, TrainOptimizer,
};
pub use progress::TrainProgress;
pub use scheduler::{GroupScheduler, LearningRateScheduler, LrSource, SchedulerConfig};
