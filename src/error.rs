use crate::model::parts::Tier;
use thiserror::Error;

/// Result type alias for setup operations
pub type Result<T> = std::result::Result<T, SetupError>;

/// Errors raised while setting up or stepping a LoRA training run.
///
/// None of these are retried. They are configuration or programmer errors and
/// the run must be restarted after fixing the cause.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Scheduler returned a different number of rates than there are active groups.
    #[error("learning rate count mismatch: {rates} rates for {} parameter groups {names:?}", names.len())]
    LearningRateMismatch { names: Vec<String>, rates: usize },

    /// An operation needs state that only `setup_model` materializes.
    #[error("{operation} called before setup_model materialized the {missing}")]
    NotSetUp {
        operation: &'static str,
        missing: &'static str,
    },

    /// A device-tier transfer failed. `ModelPart::to_tier` implementations
    /// return this when a module cannot be moved.
    #[error("failed to move {module} to the {tier} device: {message}")]
    Transfer {
        module: String,
        tier: Tier,
        message: String,
    },

    /// Configuration value is out of range or inconsistent.
    #[error("invalid configuration value for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// Prior optimizer or EMA state does not line up with the current parameters.
    #[error("prior {kind} state does not match the current parameters: {message}")]
    StateMismatch { kind: &'static str, message: String },

    /// Tokenizer rejected a text or token.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Tensor data could not be read back from the backend.
    #[error("tensor data error: {0}")]
    TensorData(String),

    /// Metrics sink failed to record a value.
    #[error("metrics sink error: {0}")]
    Metrics(#[from] std::io::Error),
}

impl SetupError {
    pub(crate) fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error comes from a mismatch between configuration and state.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::LearningRateMismatch { .. } | Self::InvalidConfig { .. } | Self::StateMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message_lists_groups() {
        let err = SetupError::LearningRateMismatch {
            names: vec!["te".to_string(), "unet".to_string()],
            rates: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("1 rates for 2 parameter groups"));
        assert!(msg.contains("unet"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_not_set_up_is_not_config_error() {
        let err = SetupError::NotSetUp {
            operation: "after_optimizer_step",
            missing: "embedding guard",
        };
        assert!(!err.is_config_error());
        assert!(err.to_string().contains("after_optimizer_step"));
    }
}
