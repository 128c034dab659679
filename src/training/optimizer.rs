use crate::error::{Result, SetupError};
use crate::model::parts::ParamRef;
use crate::utils::validation;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Optimizer algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Adam,
    Sgd,
    Adafactor,
    /// Learning-rate free, reports `lr * d`
    Prodigy,
    /// Learning-rate free, reports `lr * d`
    DAdaptAdam,
}

impl OptimizerKind {
    /// Whether the raw group rates are scaled by an internal step-size estimate
    pub fn is_adaptive(self) -> bool {
        matches!(self, Self::Prodigy | Self::DAdaptAdam)
    }

    /// Map scheduler rates to the rates the optimizer actually applies
    pub fn maybe_adjust_lrs(self, lrs: Vec<f64>, optimizer: &TrainOptimizer) -> Vec<f64> {
        if !self.is_adaptive() {
            return lrs;
        }
        lrs.into_iter()
            .zip(optimizer.group_states())
            .map(|(lr, state)| lr * state.d)
            .collect()
    }
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Algorithm
    pub optimizer: OptimizerKind,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// First moment decay
    pub beta1: f64,
    /// Second moment decay
    pub beta2: f64,
    /// Numerical stability term
    pub eps: f64,
    /// Momentum for SGD
    pub momentum: f64,
    /// Initial step-size estimate for adaptive optimizers
    pub d0: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::AdamW,
            weight_decay: 1e-2,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            momentum: 0.0,
            d0: 1e-6,
        }
    }
}

impl OptimizerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        validation::in_range(self.weight_decay, 0.0, 1.0, "optimizer.weight_decay")?;
        validation::in_range(self.beta1, 0.0, 1.0, "optimizer.beta1")?;
        validation::in_range(self.beta2, 0.0, 1.0, "optimizer.beta2")?;
        validation::positive(self.eps, "optimizer.eps")?;
        validation::positive(self.d0, "optimizer.d0")?;
        Ok(())
    }
}

/// Parameters sharing one learning rate
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// Group name used for reporting
    pub name: String,
    /// Parameters in the group
    pub params: Vec<ParamRef>,
    /// Current learning rate
    pub lr: f64,
    /// Learning rate the schedule starts from
    pub initial_lr: f64,
}

impl ParamGroup {
    /// Create a group starting at `lr`
    pub fn new(name: impl Into<String>, params: Vec<ParamRef>, lr: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr,
            initial_lr: lr,
        }
    }

    /// Number of scalar weights in the group
    pub fn num_elements(&self) -> usize {
        self.params.iter().map(ParamRef::num_elements).sum()
    }
}

/// Per-group optimizer bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    /// Group name at save time
    pub name: String,
    /// Parameter names in positional order
    pub param_names: Vec<String>,
    /// Steps taken
    pub step: u64,
    /// Step-size estimate of adaptive optimizers
    pub d: f64,
}

/// Serializable optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub groups: Vec<GroupState>,
}

/// Optimizer over named parameter groups.
///
/// The update math runs in the training backend. This type owns the groups,
/// the hyperparameters and the resumable per-group state.
#[derive(Debug, Clone)]
pub struct TrainOptimizer {
    config: OptimizerConfig,
    groups: Vec<ParamGroup>,
    states: Vec<GroupState>,
}

impl TrainOptimizer {
    /// Parameter groups in construction order
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Per-group state, aligned with `param_groups`
    pub fn group_states(&self) -> &[GroupState] {
        &self.states
    }

    /// Algorithm
    pub fn kind(&self) -> OptimizerKind {
        self.config.optimizer
    }

    /// Hyperparameters
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Record a finished step and the backend's updated step-size estimates
    pub fn record_step(&mut self, d_estimates: Option<&[f64]>) {
        for (i, state) in self.states.iter_mut().enumerate() {
            state.step += 1;
            if let Some(d) = d_estimates.and_then(|d| d.get(i)) {
                state.d = *d;
            }
        }
    }

    /// Set the current learning rate of every group
    pub fn set_lrs(&mut self, lrs: &[f64]) {
        for (group, lr) in self.groups.iter_mut().zip(lrs) {
            group.lr = *lr;
        }
    }

    /// Snapshot of the resumable state
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.config.optimizer,
            groups: self.states.clone(),
        }
    }
}

/// Build an optimizer over `groups`, resuming from `prior_state` when given.
///
/// The prior state must line up with `groups` position by position.
pub fn create_optimizer(
    groups: Vec<ParamGroup>,
    prior_state: Option<OptimizerState>,
    config: &OptimizerConfig,
) -> Result<TrainOptimizer> {
    let states = match prior_state {
        Some(state) => {
            check_alignment(&groups, &state, config.optimizer)?;
            info!(
                "Resuming {:?} optimizer state for {} groups",
                state.kind,
                state.groups.len()
            );
            state.groups
        }
        None => groups
            .iter()
            .map(|group| GroupState {
                name: group.name.clone(),
                param_names: group.params.iter().map(|p| p.name.clone()).collect(),
                step: 0,
                d: config.d0,
            })
            .collect(),
    };

    for group in &groups {
        debug!(
            "Optimizer group '{}': {} tensors, {} weights, lr {}",
            group.name,
            group.params.len(),
            group.num_elements(),
            group.lr
        );
    }

    Ok(TrainOptimizer {
        config: config.clone(),
        groups,
        states,
    })
}

fn check_alignment(groups: &[ParamGroup], state: &OptimizerState, kind: OptimizerKind) -> Result<()> {
    let mismatch = |message: String| SetupError::StateMismatch {
        kind: "optimizer",
        message,
    };

    if state.kind != kind {
        return Err(mismatch(format!(
            "saved with {:?}, configured {:?}",
            state.kind, kind
        )));
    }
    if state.groups.len() != groups.len() {
        return Err(mismatch(format!(
            "{} saved groups, {} current groups",
            state.groups.len(),
            groups.len()
        )));
    }
    for (i, (group, saved)) in groups.iter().zip(&state.groups).enumerate() {
        let names = group.params.iter().map(|p| p.name.as_str());
        if !names.eq(saved.param_names.iter().map(String::as_str)) {
            return Err(mismatch(format!(
                "group {} ('{}') parameters differ from saved group '{}'",
                i, group.name, saved.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<ParamGroup> {
        vec![
            ParamGroup::new("te", vec![ParamRef::new("lora_te.q.lora_down", [4, 8])], 1e-4),
            ParamGroup::new("unet", vec![ParamRef::new("lora_unet.q.lora_down", [4, 16])], 2e-4),
        ]
    }

    #[test]
    fn test_create_fresh() {
        let optimizer = create_optimizer(groups(), None, &OptimizerConfig::default()).unwrap();
        assert_eq!(optimizer.param_groups().len(), 2);
        assert_eq!(optimizer.group_states()[1].param_names, vec!["lora_unet.q.lora_down"]);
        assert_eq!(optimizer.param_groups()[0].initial_lr, 1e-4);
    }

    #[test]
    fn test_resume_keeps_steps() {
        let config = OptimizerConfig::default();
        let mut optimizer = create_optimizer(groups(), None, &config).unwrap();
        optimizer.record_step(None);
        optimizer.record_step(None);

        let resumed = create_optimizer(groups(), Some(optimizer.state()), &config).unwrap();
        assert_eq!(resumed.group_states()[0].step, 2);
    }

    #[test]
    fn test_resume_rejects_reordered_groups() {
        let config = OptimizerConfig::default();
        let state = create_optimizer(groups(), None, &config).unwrap().state();

        let mut reordered = groups();
        reordered.reverse();
        let err = create_optimizer(reordered, Some(state), &config).unwrap_err();
        assert!(matches!(err, SetupError::StateMismatch { kind: "optimizer", .. }));
    }

    #[test]
    fn test_resume_rejects_other_kind() {
        let state = create_optimizer(groups(), None, &OptimizerConfig::default())
            .unwrap()
            .state();
        let config = OptimizerConfig {
            optimizer: OptimizerKind::Sgd,
            ..Default::default()
        };
        assert!(create_optimizer(groups(), Some(state), &config).is_err());
    }

    #[test]
    fn test_adaptive_lrs_scaled_by_d() {
        let config = OptimizerConfig {
            optimizer: OptimizerKind::Prodigy,
            ..Default::default()
        };
        let mut optimizer = create_optimizer(groups(), None, &config).unwrap();
        optimizer.record_step(Some(&[0.5, 0.25]));

        let adjusted = OptimizerKind::Prodigy.maybe_adjust_lrs(vec![1.0, 1.0], &optimizer);
        assert_eq!(adjusted, vec![0.5, 0.25]);

        let raw = OptimizerKind::AdamW.maybe_adjust_lrs(vec![1.0, 1.0], &optimizer);
        assert_eq!(raw, vec![1.0, 1.0]);
    }
}
