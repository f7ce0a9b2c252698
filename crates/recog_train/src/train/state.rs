//! Training State - iteration counter, best metrics and running loss

use crate::metrics::Averager;

/// Mutable run state owned by the trainer and passed by reference.
/// Best metrics only move in their improving direction.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub iteration: usize,
    best_accuracy: f64,
    best_norm_ed: f64,
    pub running_loss: Averager,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            best_accuracy: -1.0,
            best_norm_ed: f64::INFINITY,
            running_loss: Averager::new(),
        }
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn best_norm_ed(&self) -> f64 {
        self.best_norm_ed
    }

    /// Records `accuracy` if it beats the best so far. Returns whether it did.
    pub(crate) fn offer_accuracy(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            true
        } else {
            false
        }
    }

    /// Records `norm_ed` if it is below the best so far. Returns whether it was.
    pub(crate) fn offer_norm_ed(&mut self, norm_ed: f64) -> bool {
        if norm_ed < self.best_norm_ed {
            self.best_norm_ed = norm_ed;
            true
        } else {
            false
        }
    }

    /// Restores bests read from a checkpoint; absent values keep the current ones.
    pub(crate) fn restore_bests(&mut self, accuracy: Option<f64>, norm_ed: Option<f64>) {
        if let Some(a) = accuracy {
            self.best_accuracy = a;
        }
        if let Some(n) = norm_ed {
            self.best_norm_ed = n;
        }
    }
}
