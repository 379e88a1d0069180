use crate::error::{Result, RnnError};

/// Learning rate scheduler trait for adjusting the learning rate between epochs
pub trait LearningRateScheduler {
    /// Get the learning rate for the current epoch
    fn get_lr(&mut self, epoch: usize, base_lr: f64) -> f64;

    /// Reset the scheduler state (useful for multiple training runs)
    fn reset(&mut self);

    /// Get the name of the scheduler for logging
    fn name(&self) -> &'static str;
}

/// Constant learning rate (no scheduling)
#[derive(Clone, Debug)]
pub struct ConstantLR;

impl LearningRateScheduler for ConstantLR {
    fn get_lr(&mut self, _epoch: usize, base_lr: f64) -> f64 {
        base_lr
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "ConstantLR"
    }
}

/// Harmonic annealing: lr = lr_0 / ((epoch + a) / a)
///
/// A larger `anneal` means a slower decay. Epoch 0 always uses `lr_0`.
#[derive(Clone, Debug)]
pub struct HarmonicAnnealingLR {
    anneal: f64,
}

impl HarmonicAnnealingLR {
    /// `anneal` must be positive and finite.
    pub fn new(anneal: f64) -> Result<Self> {
        if !(anneal > 0.0 && anneal.is_finite()) {
            return Err(RnnError::Configuration(format!(
                "annealing rate must be positive, got {}",
                anneal
            )));
        }
        Ok(HarmonicAnnealingLR { anneal })
    }
}

impl LearningRateScheduler for HarmonicAnnealingLR {
    fn get_lr(&mut self, epoch: usize, base_lr: f64) -> f64 {
        base_lr / ((epoch as f64 + self.anneal) / self.anneal)
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "HarmonicAnnealingLR"
    }
}

/// Scheduler for an annealing rate: constant when `anneal == 0`.
pub fn scheduler_for(anneal: f64) -> Box<dyn LearningRateScheduler> {
    match HarmonicAnnealingLR::new(anneal) {
        Ok(scheduler) => Box::new(scheduler),
        Err(_) => Box::new(ConstantLR),
    }
}
