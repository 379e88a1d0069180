use ndarray::{Array1, Array2};
use rand::Rng;

use crate::error::Result;
use crate::loss::final_step;
use crate::models::params::{Gradients, ParameterSet};
use crate::models::{
    add_to_column, check_dimensions, check_labels, check_sequence, check_traces, embed, gaussian,
    HiddenTrace, OutputTrace, RecurrentModel,
};
use crate::utils::{one_hot, outer, sigmoid_grad, sigmoid_vec, softmax};

const U: usize = 0;
const V: usize = 1;
const W: usize = 2;

/// Elman recurrent network with a sigmoid hidden layer and softmax output.
///
/// Parameters:
/// - `U`: hidden -> hidden, `(hidden_dims, hidden_dims)`
/// - `V`: input -> hidden, `(hidden_dims, vocab_size)`
/// - `W`: hidden -> output, `(out_vocab_size, hidden_dims)`
#[derive(Clone, Debug)]
pub struct RNN {
    pub vocab_size: usize,
    pub hidden_dims: usize,
    pub out_vocab_size: usize,
    params: ParameterSet,
}

impl RNN {
    /// Creates a new RNN with Gaussian weights scaled by sqrt(0.1).
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        check_dimensions(vocab_size, hidden_dims, out_vocab_size)?;

        let u = gaussian((hidden_dims, hidden_dims), rng);
        let v = gaussian((hidden_dims, vocab_size), rng);
        let w = gaussian((out_vocab_size, hidden_dims), rng);

        Ok(RNN {
            vocab_size,
            hidden_dims,
            out_vocab_size,
            params: ParameterSet::new(vec![("U", u), ("V", v), ("W", w)]),
        })
    }

    /// Rebuilds an RNN from named matrices in `U`, `V`, `W` order.
    pub fn from_parameters(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self> {
        check_dimensions(vocab_size, hidden_dims, out_vocab_size)?;

        let params = ParameterSet::from_values(
            &[
                ("U", (hidden_dims, hidden_dims)),
                ("V", (hidden_dims, vocab_size)),
                ("W", (out_vocab_size, hidden_dims)),
            ],
            values,
        )?;

        Ok(RNN {
            vocab_size,
            hidden_dims,
            out_vocab_size,
            params,
        })
    }

    pub fn u(&self) -> &Array2<f64> {
        self.params.value(U)
    }

    pub fn v(&self) -> &Array2<f64> {
        self.params.value(V)
    }

    pub fn w(&self) -> &Array2<f64> {
        self.params.value(W)
    }

    /// Output-layer step shared by every backward variant. Returns the
    /// hidden-layer error at `t`.
    fn output_error(
        &self,
        grads: &mut Gradients,
        t: usize,
        desired: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<Array1<f64>> {
        let delta_out = one_hot(desired, self.out_vocab_size)? - &y.row(t);
        grads[W] += &outer(&delta_out, s.state(t));
        Ok(self.w().t().dot(&delta_out) * sigmoid_grad(s.state(t)))
    }

    fn backprop_step(
        &self,
        grads: &mut Gradients,
        x: &[usize],
        t: usize,
        desired: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<()> {
        let delta_in = self.output_error(grads, t, desired, y, s)?;
        add_to_column(&mut grads[V], x[t], &delta_in)?;
        grads[U] += &outer(&delta_in, s.previous(t));
        Ok(())
    }

    /// Unrolls `iterations` steps back from `t`, starting with the output-layer error.
    #[allow(clippy::too_many_arguments)]
    fn bptt_step(
        &self,
        grads: &mut Gradients,
        x: &[usize],
        t: usize,
        desired: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
        iterations: usize,
    ) -> Result<()> {
        let mut delta_in = self.output_error(grads, t, desired, y, s)?;
        for k in 0..iterations {
            let step = t - k;
            if k > 0 {
                delta_in = self.u().t().dot(&delta_in) * sigmoid_grad(s.state(step));
            }
            add_to_column(&mut grads[V], x[step], &delta_in)?;
            grads[U] += &outer(&delta_in, s.previous(step));
        }
        Ok(())
    }
}

impl RecurrentModel for RNN {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_dims(&self) -> usize {
        self.hidden_dims
    }

    fn out_vocab_size(&self) -> usize {
        self.out_vocab_size
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn predict(&self, x: &[usize]) -> Result<(OutputTrace, HiddenTrace)> {
        check_sequence(x)?;

        let mut s = HiddenTrace::new(x.len(), self.hidden_dims);
        let mut y = Array2::zeros((x.len(), self.out_vocab_size));

        for (t, &token) in x.iter().enumerate() {
            // s_t = σ(V x_t + U s_{t-1})
            let net_in = &embed(self.v(), token)? + &self.u().dot(&s.previous(t));
            let state = sigmoid_vec(&net_in);
            // y_t = softmax(W s_t)
            y.row_mut(t).assign(&softmax(&self.w().dot(&state)));
            s.set(t, &state);
        }

        Ok((y, s))
    }

    fn accumulate_deltas(
        &mut self,
        x: &[usize],
        d: &[usize],
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<()> {
        check_traces(self, x, y, s)?;
        check_labels(d, x)?;

        let mut grads = self.params.zero_gradients();
        for t in (0..x.len()).rev() {
            self.backprop_step(&mut grads, x, t, d[t], y, s)?;
        }
        self.params.accumulate(&grads)
    }

    fn accumulate_deltas_single_label(
        &mut self,
        x: &[usize],
        d: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
    ) -> Result<()> {
        check_traces(self, x, y, s)?;

        let t = final_step(y)?;
        let mut grads = self.params.zero_gradients();
        self.backprop_step(&mut grads, x, t, d, y, s)?;
        self.params.assign(grads)
    }

    fn accumulate_deltas_bptt(
        &mut self,
        x: &[usize],
        d: &[usize],
        y: &OutputTrace,
        s: &HiddenTrace,
        steps: usize,
    ) -> Result<()> {
        check_traces(self, x, y, s)?;
        check_labels(d, x)?;

        let mut grads = self.params.zero_gradients();
        for t in (0..x.len()).rev() {
            let iterations = steps.min(t) + 1;
            self.bptt_step(&mut grads, x, t, d[t], y, s, iterations)?;
        }
        self.params.accumulate(&grads)
    }

    fn accumulate_deltas_bptt_single_label(
        &mut self,
        x: &[usize],
        d: usize,
        y: &OutputTrace,
        s: &HiddenTrace,
        steps: usize,
    ) -> Result<()> {
        check_traces(self, x, y, s)?;

        let t = final_step(y)?;
        let iterations = (steps + 1).min(t);
        let mut grads = self.params.zero_gradients();
        self.bptt_step(&mut grads, x, t, d, y, s, iterations)?;
        self.params.assign(grads)
    }
}
