use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, RnnError};
use crate::loss::{sequence_loss, single_label_accuracy, single_label_loss};
use crate::models::{HiddenTrace, OutputTrace, RecurrentModel};
use crate::schedulers::{scheduler_for, LearningRateScheduler};

/// Configuration for training hyperparameters
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    /// Maximum number of passes over the training set.
    pub epochs: usize,
    /// Initial learning rate.
    pub learning_rate: f64,
    /// Harmonic annealing rate; 0 keeps the learning rate constant.
    pub anneal: f64,
    /// Extra timesteps for BPTT; 0 selects plain backpropagation.
    pub back_steps: usize,
    /// Instances per weight update.
    pub batch_size: usize,
    /// Stop once the dev loss moves less than this for more than 2 epochs in a row.
    pub min_change: f64,
    /// Emit progress through `tracing`.
    pub log: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 10,
            learning_rate: 0.5,
            anneal: 5.0,
            back_steps: 0,
            batch_size: 100,
            min_change: 0.0001,
            log: true,
        }
    }
}

impl TrainingConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_anneal(mut self, anneal: f64) -> Self {
        self.anneal = anneal;
        self
    }

    pub fn with_back_steps(mut self, back_steps: usize) -> Self {
        self.back_steps = back_steps;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_min_change(mut self, min_change: f64) -> Self {
        self.min_change = min_change;
        self
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RnnError::Configuration("batch size must be positive".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(RnnError::Configuration(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.anneal >= 0.0) {
            return Err(RnnError::Configuration(format!(
                "anneal rate must be non-negative, got {}",
                self.anneal
            )));
        }
        Ok(())
    }

    pub fn scheduler(&self) -> Box<dyn LearningRateScheduler> {
        scheduler_for(self.anneal)
    }
}

/// Training metrics tracked per epoch
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub dev_loss: f64,
    pub dev_accuracy: Option<f64>,
    pub diverged: bool,
    pub time_elapsed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxEpochs,
    MinimalChange,
}

/// Outcome of one training run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub initial_loss: f64,
    pub best_loss: f64,
    /// Epoch whose parameters were restored; `None` when no epoch beat the initial loss.
    pub best_epoch: Option<usize>,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
}

/// Desired outputs for a training or dev corpus.
#[derive(Clone, Copy)]
enum Targets<'a> {
    /// One label per timestep (language modeling).
    Sequences(&'a [Vec<usize>]),
    /// One label for the final timestep (number prediction).
    Labels(&'a [usize]),
}

impl<'a> Targets<'a> {
    fn len(&self) -> usize {
        match self {
            Targets::Sequences(d) => d.len(),
            Targets::Labels(d) => d.len(),
        }
    }

    fn accumulate<M: RecurrentModel>(
        &self,
        model: &mut M,
        x: &[usize],
        index: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
        back_steps: usize,
    ) -> Result<()> {
        match (self, back_steps) {
            (Targets::Sequences(d), 0) => model.accumulate_deltas(x, &d[index], y, s),
            (Targets::Sequences(d), steps) => {
                model.accumulate_deltas_bptt(x, &d[index], y, s, steps)
            }
            (Targets::Labels(d), 0) => model.accumulate_deltas_single_label(x, d[index], y, s),
            (Targets::Labels(d), steps) => {
                model.accumulate_deltas_bptt_single_label(x, d[index], y, s, steps)
            }
        }
    }
}

struct Evaluation {
    loss: f64,
    accuracy: Option<f64>,
}

/// Drives training of a recurrent model and computes losses against it.
pub struct Runner<M: RecurrentModel> {
    pub model: M,
    metrics_history: Vec<TrainingMetrics>,
    summary: Option<TrainingSummary>,
}

impl<M: RecurrentModel> Runner<M> {
    pub fn new(model: M) -> Self {
        Runner {
            model,
            metrics_history: Vec::new(),
            summary: None,
        }
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Summed negative log-likelihood of `d` given `x`.
    pub fn compute_loss(&self, x: &[usize], d: &[usize]) -> Result<f64> {
        let (y, _) = self.model.predict(x)?;
        sequence_loss(&y, d)
    }

    /// Negative log-likelihood of the label `d` at the final timestep.
    pub fn compute_loss_single_label(&self, x: &[usize], d: usize) -> Result<f64> {
        let (y, _) = self.model.predict(x)?;
        single_label_loss(&y, d)
    }

    /// 1 if the final prediction's argmax is `d`, else 0.
    pub fn compute_accuracy_single_label(&self, x: &[usize], d: usize) -> Result<u32> {
        if d >= self.model.out_vocab_size() {
            return Err(RnnError::Domain(format!(
                "label {} out of range for output of size {}",
                d,
                self.model.out_vocab_size()
            )));
        }
        let (y, _) = self.model.predict(x)?;
        let last = y.nrows() - 1;
        Ok(single_label_accuracy(y.row(last), d))
    }

    /// Average loss per desired word over a corpus.
    pub fn compute_mean_loss(&self, x: &[Vec<usize>], d: &[Vec<usize>]) -> Result<f64> {
        check_corpus(x.len(), d.len())?;
        let mut loss = 0.0;
        let mut word_count = 0;
        for (xi, di) in x.iter().zip(d.iter()) {
            loss += self.compute_loss(xi, di)?;
            word_count += di.len();
        }
        if word_count == 0 {
            return Err(RnnError::Domain("corpus has no words".to_string()));
        }
        Ok(loss / word_count as f64)
    }

    /// Average single-label loss per instance.
    pub fn compute_mean_loss_single_label(&self, x: &[Vec<usize>], d: &[usize]) -> Result<f64> {
        check_corpus(x.len(), d.len())?;
        let mut loss = 0.0;
        for (xi, &di) in x.iter().zip(d.iter()) {
            loss += self.compute_loss_single_label(xi, di)?;
        }
        Ok(loss / x.len() as f64)
    }

    /// Fraction of instances whose final prediction is correct.
    pub fn compute_mean_accuracy_single_label(&self, x: &[Vec<usize>], d: &[usize]) -> Result<f64> {
        check_corpus(x.len(), d.len())?;
        let mut correct = 0;
        for (xi, &di) in x.iter().zip(d.iter()) {
            correct += self.compute_accuracy_single_label(xi, di)?;
        }
        Ok(correct as f64 / x.len() as f64)
    }

    /// Train for language modeling, optimizing per-word loss on the dev set.
    ///
    /// Returns the best dev loss; the model is left holding the parameters
    /// from that epoch.
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        x: &[Vec<usize>],
        d: &[Vec<usize>],
        x_dev: &[Vec<usize>],
        d_dev: &[Vec<usize>],
        config: &TrainingConfig,
        rng: &mut R,
    ) -> Result<f64> {
        self.run(x, Targets::Sequences(d), x_dev, Targets::Sequences(d_dev), config, rng)
    }

    /// Train for single-label prediction, optimizing per-instance loss on the dev set.
    pub fn train_single_label<R: Rng + ?Sized>(
        &mut self,
        x: &[Vec<usize>],
        d: &[usize],
        x_dev: &[Vec<usize>],
        d_dev: &[usize],
        config: &TrainingConfig,
        rng: &mut R,
    ) -> Result<f64> {
        self.run(x, Targets::Labels(d), x_dev, Targets::Labels(d_dev), config, rng)
    }

    fn evaluate(&self, x: &[Vec<usize>], d: Targets<'_>) -> Result<Evaluation> {
        match d {
            Targets::Sequences(d) => Ok(Evaluation {
                loss: self.compute_mean_loss(x, d)?,
                accuracy: None,
            }),
            Targets::Labels(d) => Ok(Evaluation {
                loss: self.compute_mean_loss_single_label(x, d)?,
                accuracy: Some(self.compute_mean_accuracy_single_label(x, d)?),
            }),
        }
    }

    fn run<R: Rng + ?Sized>(
        &mut self,
        x: &[Vec<usize>],
        d: Targets<'_>,
        x_dev: &[Vec<usize>],
        d_dev: Targets<'_>,
        config: &TrainingConfig,
        rng: &mut R,
    ) -> Result<f64> {
        config.validate()?;
        check_corpus(x.len(), d.len())?;
        check_corpus(x_dev.len(), d_dev.len())?;

        let mut scheduler = config.scheduler();
        scheduler.reset();
        self.metrics_history.clear();
        self.summary = None;

        if config.log {
            info!(
                epochs = config.epochs,
                train_size = x.len(),
                batch_size = config.batch_size,
                dev_size = x_dev.len(),
                vocab_size = self.model.vocab_size(),
                hidden_dims = self.model.hidden_dims(),
                back_steps = config.back_steps,
                learning_rate = config.learning_rate,
                anneal = config.anneal,
                scheduler = scheduler.name(),
                "Starting training"
            );
        }

        let start_time = Instant::now();
        let initial = self.evaluate(x_dev, d_dev)?;
        if config.log {
            info!(loss = initial.loss, accuracy = ?initial.accuracy, "Initial dev evaluation");
        }

        let mut prev_loss = initial.loss;
        let mut best_loss = initial.loss;
        let mut best_epoch = None;
        let mut min_change_count = 0;
        let mut stop_reason = StopReason::MaxEpochs;
        let mut epochs_run = 0;
        self.model.save_params();

        let mut order: Vec<usize> = (0..x.len()).collect();

        for epoch in 0..config.epochs {
            let epoch_start = Instant::now();
            let learning_rate = scheduler.get_lr(epoch, config.learning_rate);

            // visit instances in a fresh random order each epoch
            order.shuffle(rng);
            let evaluation = match self
                .run_epoch(x, d, &order, config, learning_rate)
                .and_then(|()| self.evaluate(x_dev, d_dev))
            {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    // leave the model as it was at the best epoch so far
                    self.model.parameters_mut().reset_deltas();
                    self.model.set_best_params()?;
                    return Err(e);
                }
            };
            let loss = evaluation.loss;
            let diverged = !loss.is_finite();
            if diverged {
                warn!(epoch = epoch + 1, loss, "DivergenceWarning: dev loss is not finite, continuing");
            }

            let metrics = TrainingMetrics {
                epoch,
                learning_rate,
                dev_loss: loss,
                dev_accuracy: evaluation.accuracy,
                diverged,
                time_elapsed: epoch_start.elapsed().as_secs_f64(),
            };
            if config.log {
                info!(
                    epoch = epoch + 1,
                    learning_rate,
                    loss,
                    accuracy = ?metrics.dev_accuracy,
                    seconds = metrics.time_elapsed,
                    "Epoch done"
                );
            }
            self.metrics_history.push(metrics);
            epochs_run = epoch + 1;

            if loss < best_loss {
                best_loss = loss;
                best_epoch = Some(epoch);
                self.model.save_params();
            }

            if (prev_loss - loss).abs() < config.min_change {
                min_change_count += 1;
            } else {
                min_change_count = 0;
            }
            if min_change_count > 2 {
                stop_reason = StopReason::MinimalChange;
                break;
            }

            prev_loss = loss;
        }

        self.model.set_best_params()?;

        if config.log {
            match stop_reason {
                StopReason::MinimalChange => info!(
                    epochs = epochs_run,
                    "Training finished due to minimal change in loss"
                ),
                StopReason::MaxEpochs => info!(
                    epochs = config.epochs,
                    "Training finished after reaching maximum epochs"
                ),
            }
            info!(
                best_loss,
                best_epoch = best_epoch.map(|e| e + 1).unwrap_or(0),
                seconds = start_time.elapsed().as_secs_f64(),
                "Restored parameters from best epoch"
            );
        }

        self.summary = Some(TrainingSummary {
            initial_loss: initial.loss,
            best_loss,
            best_epoch,
            epochs_run,
            stop_reason,
        });

        Ok(best_loss)
    }

    /// One pass over the training set in `order`, applying a weight update per batch.
    fn run_epoch(
        &mut self,
        x: &[Vec<usize>],
        d: Targets<'_>,
        order: &[usize],
        config: &TrainingConfig,
        learning_rate: f64,
    ) -> Result<()> {
        let mut pending = 0;
        for &p in order {
            let (y, s) = self.model.predict(&x[p])?;
            d.accumulate(&mut self.model, &x[p], p, &y, &s, config.back_steps)?;
            pending += 1;

            if pending == config.batch_size {
                self.model.scale_gradients_for_batch(pending)?;
                self.model.apply_deltas(learning_rate);
                pending = 0;
            }
        }
        if pending > 0 {
            self.model.scale_gradients_for_batch(pending)?;
            self.model.apply_deltas(learning_rate);
        }
        Ok(())
    }

    pub fn get_latest_metrics(&self) -> Option<&TrainingMetrics> {
        self.metrics_history.last()
    }

    pub fn get_metrics_history(&self) -> &[TrainingMetrics] {
        &self.metrics_history
    }

    pub fn summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }
}

fn check_corpus(inputs: usize, targets: usize) -> Result<()> {
    if inputs != targets {
        return Err(RnnError::Domain(format!(
            "{} input sequences but {} targets",
            inputs, targets
        )));
    }
    if inputs == 0 {
        return Err(RnnError::Domain("corpus is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rnn::RNN;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn runner(seed: u64) -> Runner<RNN> {
        let mut rng = StdRng::seed_from_u64(seed);
        Runner::new(RNN::new(4, 3, 4, &mut rng).unwrap())
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 10);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.back_steps, 0);
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler().name(), "HarmonicAnnealingLR");
        assert_eq!(
            config.with_anneal(0.0).scheduler().name(),
            "ConstantLR"
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(TrainingConfig::default().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::default().with_learning_rate(0.0).validate().is_err());
    }

    #[test]
    fn test_compute_loss_matches_prediction() {
        let runner = runner(1);
        let x = [0, 1, 2];
        let d = [1, 2, 3];
        let (y, _) = runner.model.predict(&x).unwrap();
        let expected: f64 = (0..3).map(|t| -y[[t, d[t]]].ln()).sum();
        assert!((runner.compute_loss(&x, &d).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_mean_loss_is_per_word() {
        let runner = runner(2);
        let x = vec![vec![0, 1], vec![2, 3, 0]];
        let d = vec![vec![1, 2], vec![3, 0, 1]];
        let total = runner.compute_loss(&x[0], &d[0]).unwrap() + runner.compute_loss(&x[1], &d[1]).unwrap();
        let mean = runner.compute_mean_loss(&x, &d).unwrap();
        assert!((mean - total / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_is_zero_or_one() {
        let runner = runner(3);
        let x = [0, 1, 2];
        let (y, _) = runner.model.predict(&x).unwrap();
        let best = crate::utils::argmax(y.row(2));
        for label in 0..4 {
            let acc = runner.compute_accuracy_single_label(&x, label).unwrap();
            assert_eq!(acc, if label == best { 1 } else { 0 });
        }
        assert!(runner.compute_accuracy_single_label(&x, 4).is_err());
    }

    #[test]
    fn test_mismatched_corpus_rejected() {
        let runner = runner(4);
        let x = vec![vec![0, 1]];
        assert!(matches!(
            runner.compute_mean_loss(&x, &[]),
            Err(RnnError::Domain(_))
        ));
    }

    #[test]
    fn test_training_restores_best_parameters() {
        let mut runner = runner(5);
        let mut rng = StdRng::seed_from_u64(5);
        let x = vec![vec![0, 1, 2], vec![1, 2, 3], vec![2, 3, 0]];
        let d = vec![vec![1, 2, 3], vec![2, 3, 0], vec![3, 0, 1]];
        let config = TrainingConfig::default()
            .with_epochs(4)
            .with_batch_size(2)
            .with_back_steps(2)
            .with_log(false);

        let best = runner.train(&x, &d, &x, &d, &config, &mut rng).unwrap();
        let summary = runner.summary().unwrap().clone();

        assert_eq!(summary.best_loss, best);
        assert!(best <= summary.initial_loss);
        assert_eq!(runner.get_metrics_history().len(), summary.epochs_run);
        assert_eq!(
            runner.get_latest_metrics().map(|m| m.epoch),
            Some(summary.epochs_run - 1)
        );
        // the restored parameters reproduce the best loss
        let now = runner.compute_mean_loss(&x, &d).unwrap();
        assert!((now - best).abs() < 1e-12);
    }

    #[test]
    fn test_minimal_change_stops_early() {
        let mut runner = runner(6);
        let mut rng = StdRng::seed_from_u64(6);
        let x = vec![vec![0, 1], vec![2, 3]];
        let d = vec![vec![1, 2], vec![3, 0]];
        let config = TrainingConfig::default()
            .with_epochs(20)
            .with_learning_rate(1e-9)
            .with_min_change(1.0)
            .with_log(false);

        runner.train(&x, &d, &x, &d, &config, &mut rng).unwrap();
        let summary = runner.summary().unwrap();
        assert_eq!(summary.stop_reason, StopReason::MinimalChange);
        assert_eq!(summary.epochs_run, 3);
    }

    #[test]
    fn test_single_label_training_reports_accuracy() {
        let mut runner = runner(7);
        let mut rng = StdRng::seed_from_u64(7);
        let x = vec![vec![0, 1, 2], vec![3, 2, 1], vec![0, 0, 1], vec![3, 3, 2]];
        let d = vec![0, 1, 0, 1];
        let config = TrainingConfig::default()
            .with_epochs(3)
            .with_batch_size(1)
            .with_back_steps(1)
            .with_log(false);

        runner.train_single_label(&x, &d, &x, &d, &config, &mut rng).unwrap();
        for metrics in runner.get_metrics_history() {
            let acc = metrics.dev_accuracy.unwrap();
            assert!((0.0..=1.0).contains(&acc));
        }
    }

    #[test]
    fn test_failed_epoch_leaves_model_clean() {
        let x = vec![vec![0, 1], vec![1, 2], vec![2, 3], vec![3, 0], vec![0, 2]];
        let bad_labels = vec![1, 2, 9, 3, 0];
        let dev_labels = vec![1, 2, 3, 3, 0];

        for batch_size in [1, 100] {
            let mut runner = runner(11);
            let mut rng = StdRng::seed_from_u64(11);
            let before: Vec<_> = runner
                .model
                .parameters()
                .iter()
                .map(|p| p.value.clone())
                .collect();
            let config = TrainingConfig::default()
                .with_epochs(3)
                .with_batch_size(batch_size)
                .with_log(false);

            let result =
                runner.train_single_label(&x, &bad_labels, &x, &dev_labels, &config, &mut rng);

            assert!(matches!(result, Err(RnnError::Domain(_))));
            assert!(runner.model.parameters().is_zeroed());
            for (param, saved) in runner.model.parameters().iter().zip(before.iter()) {
                assert_eq!(&param.value, saved);
            }
        }
    }
}
