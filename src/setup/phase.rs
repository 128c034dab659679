//! Time-boxed training predicates.
//!
//! Progress only moves forward, so once a limit has elapsed it stays elapsed
//! for the rest of the run.

use crate::training::{ModuleConfig, TimeUnit, TrainConfig, TrainProgress};

/// Whether `current` has reached `limit`
pub fn elapsed(limit: usize, current: usize) -> bool {
    current >= limit
}

/// Whether `current` is still before `limit`
pub fn within_window(limit: usize, current: usize) -> bool {
    current < limit
}

/// Whether the module's stop condition has been reached
pub fn stop_elapsed(module: &ModuleConfig, progress: &TrainProgress) -> bool {
    match module.stop_training_after_unit {
        TimeUnit::Never => false,
        TimeUnit::Epoch => elapsed(module.stop_training_after, progress.epoch),
        TimeUnit::Step => elapsed(module.stop_training_after, progress.global_step),
    }
}

/// Whether the embedding still receives gradients at `progress`
pub fn embedding_window_open(config: &TrainConfig, progress: &TrainProgress) -> bool {
    within_window(config.train_embedding_epochs, progress.epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_elapsed_boundary() {
        assert!(!elapsed(2, 1));
        assert!(elapsed(2, 2));
        assert!(elapsed(0, 0));
        assert!(within_window(2, 1));
        assert!(!within_window(2, 2));
    }

    #[test]
    fn test_stop_elapsed_units() {
        let mut progress = TrainProgress::at_epoch(3);
        progress.global_step = 40;

        assert!(!stop_elapsed(&ModuleConfig::default(), &progress));
        assert!(stop_elapsed(&ModuleConfig::stop_after_epochs(3), &progress));
        assert!(!stop_elapsed(&ModuleConfig::stop_after_epochs(4), &progress));

        let by_step = ModuleConfig {
            stop_training_after: 50,
            stop_training_after_unit: TimeUnit::Step,
            ..Default::default()
        };
        assert!(!stop_elapsed(&by_step, &progress));
        progress.global_step = 50;
        assert!(stop_elapsed(&by_step, &progress));
    }

    #[test]
    fn test_embedding_window() {
        let config = TrainConfig {
            train_embedding_epochs: 2,
            ..Default::default()
        };
        assert!(embedding_window_open(&config, &TrainProgress::at_epoch(1)));
        assert!(!embedding_window_open(&config, &TrainProgress::at_epoch(2)));
    }

    proptest! {
        #[test]
        fn prop_elapsed_matches_comparison(limit in 0usize..1000, epoch in 0usize..1000) {
            prop_assert_eq!(elapsed(limit, epoch), epoch >= limit);
            prop_assert_eq!(within_window(limit, epoch), !elapsed(limit, epoch));
        }

        #[test]
        fn prop_elapsed_is_monotone(limit in 0usize..1000, e1 in 0usize..1000, delta in 1usize..1000) {
            let e2 = e1 + delta;
            prop_assert!(!elapsed(limit, e1) || elapsed(limit, e2));
        }
    }
}
