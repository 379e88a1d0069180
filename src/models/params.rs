use ndarray::Array2;

use crate::error::{Result, RnnError};

/// Gradient contributions for one instance, one matrix per registered parameter,
/// in registration order.
pub type Gradients = Vec<Array2<f64>>;

/// A trainable matrix paired with its gradient accumulator.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: &'static str,
    pub value: Array2<f64>,
    pub delta: Array2<f64>,
}

impl Parameter {
    fn new(name: &'static str, value: Array2<f64>) -> Self {
        let delta = Array2::zeros(value.raw_dim());
        Parameter { name, value, delta }
    }
}

/// Registry of named parameters with their accumulators and the best-epoch snapshot.
///
/// Shapes are fixed at construction. Accumulators always have the shape of
/// their parameter.
#[derive(Clone, Debug)]
pub struct ParameterSet {
    entries: Vec<Parameter>,
    best: Option<Vec<Array2<f64>>>,
}

impl ParameterSet {
    pub fn new(entries: Vec<(&'static str, Array2<f64>)>) -> Self {
        ParameterSet {
            entries: entries
                .into_iter()
                .map(|(name, value)| Parameter::new(name, value))
                .collect(),
            best: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|p| p.name).collect()
    }

    pub fn value(&self, index: usize) -> &Array2<f64> {
        &self.entries[index].value
    }

    #[cfg(test)]
    pub(crate) fn value_mut(&mut self, index: usize) -> &mut Array2<f64> {
        &mut self.entries[index].value
    }

    pub fn delta(&self, index: usize) -> &Array2<f64> {
        &self.entries[index].delta
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.iter().find(|p| p.name == name)
    }

    /// Zeroed gradient buffers matching every parameter's shape.
    pub fn zero_gradients(&self) -> Gradients {
        self.entries
            .iter()
            .map(|p| Array2::zeros(p.value.raw_dim()))
            .collect()
    }

    /// Add instance gradients into the accumulators.
    pub fn accumulate(&mut self, gradients: &Gradients) -> Result<()> {
        self.check_shapes(gradients)?;
        for (param, grad) in self.entries.iter_mut().zip(gradients.iter()) {
            param.delta += grad;
        }
        Ok(())
    }

    /// Overwrite the accumulators with instance gradients.
    pub fn assign(&mut self, gradients: Gradients) -> Result<()> {
        self.check_shapes(&gradients)?;
        for (param, grad) in self.entries.iter_mut().zip(gradients.into_iter()) {
            param.delta = grad;
        }
        Ok(())
    }

    /// parameter += learning_rate * accumulator, then reset every accumulator.
    pub fn apply_deltas(&mut self, learning_rate: f64) {
        for param in self.entries.iter_mut() {
            param.value.scaled_add(learning_rate, &param.delta);
            param.delta.fill(0.0);
        }
    }

    /// Divide every accumulator by the batch size so a batch averages its instances.
    pub fn scale_deltas(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(RnnError::Configuration(
                "batch size must be positive".to_string(),
            ));
        }
        let scale = batch_size as f64;
        for param in self.entries.iter_mut() {
            param.delta.mapv_inplace(|x| x / scale);
        }
        Ok(())
    }

    /// Discard pending gradients without touching the values.
    pub fn reset_deltas(&mut self) {
        for param in self.entries.iter_mut() {
            param.delta.fill(0.0);
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.entries
            .iter()
            .all(|p| p.delta.iter().all(|&x| x == 0.0))
    }

    /// Deep copy of every parameter value.
    pub fn save_params(&mut self) {
        self.best = Some(self.entries.iter().map(|p| p.value.clone()).collect());
    }

    pub fn has_snapshot(&self) -> bool {
        self.best.is_some()
    }

    /// Replace current values with the last snapshot.
    pub fn set_best_params(&mut self) -> Result<()> {
        let best = self.best.as_ref().ok_or_else(|| {
            RnnError::InvariantViolation("no parameter snapshot to restore".to_string())
        })?;
        for (param, saved) in self.entries.iter_mut().zip(best.iter()) {
            param.value.assign(saved);
        }
        Ok(())
    }

    /// Builds a set from loaded weights, checking them against the expected
    /// names and shapes before anything is allocated.
    pub fn from_values(
        layout: &[(&'static str, (usize, usize))],
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self> {
        if values.len() != layout.len() {
            return Err(RnnError::InvariantViolation(format!(
                "expected {} parameters, got {}",
                layout.len(),
                values.len()
            )));
        }
        for (&(name, shape), (got, value)) in layout.iter().zip(values.iter()) {
            if name != got {
                return Err(RnnError::InvariantViolation(format!(
                    "expected parameter {}, got {}",
                    name, got
                )));
            }
            if value.dim() != shape {
                return Err(RnnError::InvariantViolation(format!(
                    "parameter {} has shape {:?}, expected {:?}",
                    name,
                    value.dim(),
                    shape
                )));
            }
        }
        Ok(ParameterSet::new(
            layout
                .iter()
                .zip(values)
                .map(|(&(name, _), (_, value))| (name, value))
                .collect(),
        ))
    }

    fn check_shapes(&self, gradients: &Gradients) -> Result<()> {
        if gradients.len() != self.entries.len() {
            return Err(RnnError::InvariantViolation(format!(
                "expected {} gradient matrices, got {}",
                self.entries.len(),
                gradients.len()
            )));
        }
        for (param, grad) in self.entries.iter().zip(gradients.iter()) {
            if param.value.shape() != grad.shape() {
                return Err(RnnError::InvariantViolation(format!(
                    "gradient for {} has shape {:?}, expected {:?}",
                    param.name,
                    grad.shape(),
                    param.value.shape()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn sample() -> ParameterSet {
        ParameterSet::new(vec![
            ("A", arr2(&[[1.0, 2.0], [3.0, 4.0]])),
            ("B", arr2(&[[0.5, -0.5, 1.0]])),
        ])
    }

    #[test]
    fn test_accumulators_start_zeroed() {
        let params = sample();
        assert!(params.is_zeroed());
        assert_eq!(params.delta(1).shape(), &[1, 3]);
    }

    #[test]
    fn test_accumulate_adds_and_assign_overwrites() {
        let mut params = sample();
        let mut grads = params.zero_gradients();
        grads[0].fill(1.0);

        params.accumulate(&grads).unwrap();
        params.accumulate(&grads).unwrap();
        assert_eq!(params.delta(0)[[0, 0]], 2.0);

        params.assign(grads.clone()).unwrap();
        assert_eq!(params.delta(0)[[0, 0]], 1.0);
    }

    #[test]
    fn test_shape_mismatch_is_invariant_violation() {
        let mut params = sample();
        let grads = vec![Array2::zeros((2, 2)), Array2::zeros((3, 1))];
        assert!(matches!(
            params.accumulate(&grads),
            Err(RnnError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_apply_deltas_updates_and_resets() {
        let mut params = sample();
        let mut grads = params.zero_gradients();
        grads[1].fill(2.0);
        params.accumulate(&grads).unwrap();
        params.scale_deltas(2).unwrap();
        params.apply_deltas(0.5);

        assert_eq!(params.value(1), &arr2(&[[1.0, 0.0, 1.5]]));
        assert!(params.is_zeroed());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut params = sample();
        assert!(matches!(
            params.scale_deltas(0),
            Err(RnnError::Configuration(_))
        ));
    }

    #[test]
    fn test_snapshot_restore_is_a_deep_copy() {
        let mut params = sample();
        assert!(!params.has_snapshot());
        assert!(params.set_best_params().is_err());

        params.save_params();
        assert!(params.has_snapshot());
        let mut grads = params.zero_gradients();
        grads[0].fill(10.0);
        params.accumulate(&grads).unwrap();
        params.apply_deltas(1.0);
        assert_eq!(params.value(0)[[0, 0]], 11.0);

        params.set_best_params().unwrap();
        assert_eq!(params.value(0), &arr2(&[[1.0, 2.0], [3.0, 4.0]]));
    }

    #[test]
    fn test_reset_deltas_keeps_values() {
        let mut params = sample();
        let mut grads = params.zero_gradients();
        grads[0].fill(3.0);
        params.accumulate(&grads).unwrap();
        assert!(!params.is_zeroed());

        params.reset_deltas();
        assert!(params.is_zeroed());
        assert_eq!(params.value(0), &arr2(&[[1.0, 2.0], [3.0, 4.0]]));
    }

    #[test]
    fn test_from_values_checks_layout() {
        let layout = [("A", (2, 2)), ("B", (1, 3))];
        let good = vec![
            ("A".to_string(), arr2(&[[1.0, 2.0], [3.0, 4.0]])),
            ("B".to_string(), arr2(&[[0.5, -0.5, 1.0]])),
        ];
        let params = ParameterSet::from_values(&layout, good.clone()).unwrap();
        assert_eq!(params.names(), vec!["A", "B"]);
        assert!(params.is_zeroed());
        assert_eq!(params.value(1), &good[1].1);

        let mut renamed = good.clone();
        renamed[1].0 = "C".to_string();
        assert!(matches!(
            ParameterSet::from_values(&layout, renamed),
            Err(RnnError::InvariantViolation(_))
        ));

        let wrong_shape = [("A", (2, 2)), ("B", (3, 1))];
        assert!(matches!(
            ParameterSet::from_values(&wrong_shape, good.clone()),
            Err(RnnError::InvariantViolation(_))
        ));

        assert!(matches!(
            ParameterSet::from_values(&layout[..1], good),
            Err(RnnError::InvariantViolation(_))
        ));
    }
}
