pub mod params;
pub mod rnn;
pub mod gru;

use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;

use crate::error::{Result, RnnError};
use params::ParameterSet;

/// One probability distribution over the output vocabulary per timestep (rows).
pub type OutputTrace = Array2<f64>;

/// Hidden states produced by one forward pass.
///
/// Holds `sequence_len + 1` rows: row 0 is the zero state that precedes the
/// first token, row `t + 1` is the state after consuming token `t`.
#[derive(Clone, Debug, PartialEq)]
pub struct HiddenTrace {
    states: Array2<f64>,
}

impl HiddenTrace {
    pub(crate) fn new(sequence_len: usize, hidden_dims: usize) -> Self {
        HiddenTrace {
            states: Array2::zeros((sequence_len + 1, hidden_dims)),
        }
    }

    /// Hidden state after timestep `t`.
    pub fn state(&self, t: usize) -> ArrayView1<'_, f64> {
        self.states.row(t + 1)
    }

    /// Hidden state feeding timestep `t`; the zero vector for `t == 0`.
    pub fn previous(&self, t: usize) -> ArrayView1<'_, f64> {
        self.states.row(t)
    }

    pub fn initial(&self) -> ArrayView1<'_, f64> {
        self.states.row(0)
    }

    pub(crate) fn set(&mut self, t: usize, state: &Array1<f64>) {
        self.states.row_mut(t + 1).assign(state);
    }

    /// Number of stored states, including the initial one.
    pub fn len(&self) -> usize {
        self.states.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.states.nrows() == 0
    }

    pub fn sequence_len(&self) -> usize {
        self.states.nrows().saturating_sub(1)
    }

    pub fn hidden_dims(&self) -> usize {
        self.states.ncols()
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.states
    }
}

/// Capability shared by the RNN and GRU cells.
///
/// The `accumulate_*` methods turn one forward pass into gradient contributions.
/// Sequence-labeling variants add to the accumulators; single-label variants
/// overwrite them.
pub trait RecurrentModel {
    fn vocab_size(&self) -> usize;
    fn hidden_dims(&self) -> usize;
    fn out_vocab_size(&self) -> usize;
    fn parameters(&self) -> &ParameterSet;
    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Run the sequence forward, returning per-timestep outputs and hidden states.
    fn predict(&self, x: &[usize]) -> Result<(OutputTrace, HiddenTrace)>;

    /// Single-step backpropagation for every timestep.
    fn accumulate_deltas(
        &mut self,
        x: &[usize],
        d: &[usize],
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<()>;

    /// Single-step backpropagation from the final timestep only.
    fn accumulate_deltas_single_label(
        &mut self,
        x: &[usize],
        d: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<()>;

    /// Truncated backpropagation through time, `steps` extra steps back.
    fn accumulate_deltas_bptt(
        &mut self,
        x: &[usize],
        d: &[usize],
        y: &OutputTrace,
        s: &HiddenTrace,
        steps: usize,
    ) -> Result<()>;

    /// Truncated BPTT from the final timestep only.
    fn accumulate_deltas_bptt_single_label(
        &mut self,
        x: &[usize],
        d: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
        steps: usize,
    ) -> Result<()>;

    fn apply_deltas(&mut self, learning_rate: f64) {
        self.parameters_mut().apply_deltas(learning_rate);
    }

    fn scale_gradients_for_batch(&mut self, batch_size: usize) -> Result<()> {
        self.parameters_mut().scale_deltas(batch_size)
    }

    fn save_params(&mut self) {
        self.parameters_mut().save_params();
    }

    fn set_best_params(&mut self) -> Result<()> {
        self.parameters_mut().set_best_params()
    }
}

pub(crate) fn check_dimensions(
    vocab_size: usize,
    hidden_dims: usize,
    out_vocab_size: usize,
) -> Result<()> {
    if vocab_size == 0 || hidden_dims == 0 || out_vocab_size == 0 {
        return Err(RnnError::Configuration(format!(
            "dimensions must be positive (vocab_size={}, hidden_dims={}, out_vocab_size={})",
            vocab_size, hidden_dims, out_vocab_size
        )));
    }
    Ok(())
}

/// Gaussian noise scaled by sqrt(0.1).
pub(crate) fn gaussian<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f64> {
    Array2::random_using(shape, StandardNormal, rng) * 0.1f64.sqrt()
}

pub(crate) fn check_sequence(x: &[usize]) -> Result<()> {
    if x.is_empty() {
        return Err(RnnError::Domain("input sequence is empty".to_string()));
    }
    Ok(())
}

/// Column of an input matrix selected by a token, equal to `matrix · one_hot(token)`.
pub(crate) fn embed(matrix: &Array2<f64>, token: usize) -> Result<ArrayView1<'_, f64>> {
    if token >= matrix.ncols() {
        return Err(RnnError::Domain(format!(
            "token {} out of range for vocabulary of size {}",
            token,
            matrix.ncols()
        )));
    }
    Ok(matrix.column(token))
}

/// Adds `delta ⊗ one_hot(token)` into an input-side gradient.
pub(crate) fn add_to_column(grad: &mut Array2<f64>, token: usize, delta: &Array1<f64>) -> Result<()> {
    if token >= grad.ncols() {
        return Err(RnnError::Domain(format!(
            "token {} out of range for vocabulary of size {}",
            token,
            grad.ncols()
        )));
    }
    let mut column: ArrayViewMut1<f64> = grad.column_mut(token);
    column += delta;
    Ok(())
}

/// Checks that traces came from a forward pass over `x`.
pub(crate) fn check_traces<M: RecurrentModel + ?Sized>(
    model: &M,
    x: &[usize],
    y: &OutputTrace,
    s: &HiddenTrace,
) -> Result<()> {
    check_sequence(x)?;
    if y.nrows() != x.len() || y.ncols() != model.out_vocab_size() {
        return Err(RnnError::InvariantViolation(format!(
            "output trace has shape {:?}, expected ({}, {})",
            y.shape(),
            x.len(),
            model.out_vocab_size()
        )));
    }
    if s.sequence_len() != x.len() || s.hidden_dims() != model.hidden_dims() {
        return Err(RnnError::InvariantViolation(format!(
            "hidden trace has shape {:?}, expected ({}, {})",
            s.as_array().shape(),
            x.len() + 1,
            model.hidden_dims()
        )));
    }
    Ok(())
}

pub(crate) fn check_labels(d: &[usize], x: &[usize]) -> Result<()> {
    if d.len() != x.len() {
        return Err(RnnError::Domain(format!(
            "desired sequence has length {}, input has length {}",
            d.len(),
            x.len()
        )));
    }
    Ok(())
}
