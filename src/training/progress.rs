use serde::{Deserialize, Serialize};

/// Position of a run, advanced only by the training loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainProgress {
    /// Current epoch
    pub epoch: usize,
    /// Step within the current epoch
    pub epoch_step: usize,
    /// Samples seen within the current epoch
    pub epoch_sample: usize,
    /// Optimizer steps since the run started
    pub global_step: usize,
}

impl TrainProgress {
    /// Fresh run
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress at the start of `epoch`
    pub fn at_epoch(epoch: usize) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    /// Record one optimizer step over `batch_size` samples
    pub fn next_step(&mut self, batch_size: usize) {
        self.epoch_step += 1;
        self.epoch_sample += batch_size;
        self.global_step += 1;
    }

    /// Move to the next epoch
    pub fn next_epoch(&mut self) {
        self.epoch += 1;
        self.epoch_step = 0;
        self.epoch_sample = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_advances() {
        let mut progress = TrainProgress::new();
        progress.next_step(4);
        progress.next_step(4);
        assert_eq!(progress.epoch_step, 2);
        assert_eq!(progress.epoch_sample, 8);
        assert_eq!(progress.global_step, 2);

        progress.next_epoch();
        assert_eq!(progress.epoch, 1);
        assert_eq!(progress.epoch_step, 0);
        assert_eq!(progress.epoch_sample, 0);
        assert_eq!(progress.global_step, 2);
    }
}
