use crate::error::{Result, SetupError};
use crate::model::parts::{ParamRef, Tier};
use crate::utils::validation;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Where the moving average lives, if anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmaMode {
    #[default]
    Off,
    /// Shadow weights on the train device
    Gpu,
    /// Shadow weights on the temp device
    Cpu,
}

/// Moving-average configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub mode: EmaMode,
    /// Upper bound on the decay factor
    pub decay: f64,
    /// Update the average every this many optimizer steps
    pub update_step_interval: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            mode: EmaMode::Off,
            decay: 0.999,
            update_step_interval: 5,
        }
    }
}

impl EmaConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        validation::in_range(self.decay, 0.0, 1.0, "ema.decay")?;
        validation::positive(self.update_step_interval, "ema.update_step_interval")?;
        Ok(())
    }
}

/// Serializable tracker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub param_names: Vec<String>,
    pub decay: f64,
    pub updates: u64,
}

/// Moving-average shadow of the trainable parameters
#[derive(Debug, Clone)]
pub struct EmaTracker {
    params: Vec<ParamRef>,
    decay: f64,
    update_step_interval: usize,
    updates: u64,
    tier: Tier,
}

impl EmaTracker {
    /// Tracked parameters
    pub fn params(&self) -> &[ParamRef] {
        &self.params
    }

    /// Tier holding the shadow weights
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Number of averaging updates applied
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Whether the average is due at `global_step`
    pub fn should_update(&self, global_step: usize) -> bool {
        global_step % self.update_step_interval == 0
    }

    /// Decay for the next update, warmed up over the first updates
    pub fn effective_decay(&self) -> f64 {
        let n = self.updates as f64;
        self.decay.min((1.0 + n) / (10.0 + n))
    }

    /// Record an averaging update and return the decay it used
    pub fn record_update(&mut self) -> f64 {
        let decay = self.effective_decay();
        self.updates += 1;
        decay
    }

    /// Snapshot of the resumable state
    pub fn state(&self) -> EmaState {
        EmaState {
            param_names: self.params.iter().map(|p| p.name.clone()).collect(),
            decay: self.decay,
            updates: self.updates,
        }
    }
}

/// Build the tracker over `params`, or `None` when averaging is off.
pub fn create_ema(
    params: Vec<ParamRef>,
    prior_state: Option<EmaState>,
    config: &EmaConfig,
) -> Result<Option<EmaTracker>> {
    let tier = match config.mode {
        EmaMode::Off => return Ok(None),
        EmaMode::Gpu => Tier::Train,
        EmaMode::Cpu => Tier::Temp,
    };
    config.validate()?;

    let updates = match prior_state {
        Some(state) => {
            let names = params.iter().map(|p| p.name.as_str());
            if !names.eq(state.param_names.iter().map(String::as_str)) {
                return Err(SetupError::StateMismatch {
                    kind: "ema",
                    message: format!(
                        "{} saved parameters do not match {} current parameters",
                        state.param_names.len(),
                        params.len()
                    ),
                });
            }
            info!("Resuming EMA after {} updates", state.updates);
            state.updates
        }
        None => 0,
    };

    Ok(Some(EmaTracker {
        params,
        decay: config.decay,
        update_step_interval: config.update_step_interval,
        updates,
        tier,
    }))
}
