use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;

use crate::error::Result;
use crate::loss::final_step;
use crate::models::params::{Gradients, ParameterSet};
use crate::models::{
    add_to_column, check_dimensions, check_labels, check_sequence, check_traces, embed, gaussian,
    HiddenTrace, OutputTrace, RecurrentModel,
};
use crate::utils::{one_hot, outer, sigmoid_grad, sigmoid_vec, softmax};

const UR: usize = 0;
const VR: usize = 1;
const UZ: usize = 2;
const VZ: usize = 3;
const UH: usize = 4;
const VH: usize = 5;
const W: usize = 6;

/// Gate activations for one timestep, recomputed from the hidden trace
/// during the backward pass.
#[derive(Clone, Debug)]
pub struct GRUGates {
    pub reset_gate: Array1<f64>,
    pub update_gate: Array1<f64>,
    pub candidate: Array1<f64>,
    pub reset_hidden: Array1<f64>,
}

/// Gated recurrent unit with sigmoid gates, a sigmoid candidate state and a
/// softmax output layer.
#[derive(Clone, Debug)]
pub struct GRU {
    pub vocab_size: usize,
    pub hidden_dims: usize,
    pub out_vocab_size: usize,
    params: ParameterSet,
}

impl GRU {
    /// Creates a new GRU with Gaussian weights scaled by sqrt(0.1).
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        check_dimensions(vocab_size, hidden_dims, out_vocab_size)?;

        // Reset gate
        let ur = gaussian((hidden_dims, hidden_dims), rng);
        let vr = gaussian((hidden_dims, vocab_size), rng);
        // Update gate
        let uz = gaussian((hidden_dims, hidden_dims), rng);
        let vz = gaussian((hidden_dims, vocab_size), rng);
        // Candidate state
        let uh = gaussian((hidden_dims, hidden_dims), rng);
        let vh = gaussian((hidden_dims, vocab_size), rng);
        // Output
        let w = gaussian((out_vocab_size, hidden_dims), rng);

        Ok(GRU {
            vocab_size,
            hidden_dims,
            out_vocab_size,
            params: ParameterSet::new(vec![
                ("Ur", ur),
                ("Vr", vr),
                ("Uz", uz),
                ("Vz", vz),
                ("Uh", uh),
                ("Vh", vh),
                ("W", w),
            ]),
        })
    }

    /// Rebuilds a GRU from named matrices in registration order.
    pub fn from_parameters(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self> {
        check_dimensions(vocab_size, hidden_dims, out_vocab_size)?;

        let recurrent = (hidden_dims, hidden_dims);
        let input = (hidden_dims, vocab_size);
        let params = ParameterSet::from_values(
            &[
                ("Ur", recurrent),
                ("Vr", input),
                ("Uz", recurrent),
                ("Vz", input),
                ("Uh", recurrent),
                ("Vh", input),
                ("W", (out_vocab_size, hidden_dims)),
            ],
            values,
        )?;

        Ok(GRU {
            vocab_size,
            hidden_dims,
            out_vocab_size,
            params,
        })
    }

    fn p(&self, index: usize) -> &Array2<f64> {
        self.params.value(index)
    }

    pub fn w(&self) -> &Array2<f64> {
        self.params.value(W)
    }

    /// Gate activations for `token` given the previous hidden state.
    pub fn gates(&self, token: usize, prev: ArrayView1<f64>) -> Result<GRUGates> {
        // r_t = σ(Vr x_t + Ur s_{t-1})
        let reset_gate = sigmoid_vec(&(&embed(self.p(VR), token)? + &self.p(UR).dot(&prev)));
        // z_t = σ(Vz x_t + Uz s_{t-1})
        let update_gate = sigmoid_vec(&(&embed(self.p(VZ), token)? + &self.p(UZ).dot(&prev)));
        // h_t = σ(Vh x_t + Uh (r_t ⊙ s_{t-1}))
        let reset_hidden = &reset_gate * &prev;
        let candidate =
            sigmoid_vec(&(&embed(self.p(VH), token)? + &self.p(UH).dot(&reset_hidden)));

        Ok(GRUGates {
            reset_gate,
            update_gate,
            candidate,
            reset_hidden,
        })
    }

    /// s_t = z_t ⊙ s_{t-1} + (1 - z_t) ⊙ h_t
    fn blend(gates: &GRUGates, prev: ArrayView1<f64>) -> Array1<f64> {
        &gates.update_gate * &prev + &gates.update_gate.mapv(|z| 1.0 - z) * &gates.candidate
    }

    /// Output-layer step: accumulates into W and returns the error on s_t.
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
        Ok(self.w().t().dot(&delta_out))
    }

    /// Pushes the error on s_t through the candidate, update gate and reset gate
    /// of timestep `t`. Returns the error on s_{t-1}.
    fn backward_step(
        &self,
        grads: &mut Gradients,
        token: usize,
        prev: ArrayView1<f64>,
        delta_state: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        let gates = self.gates(token, prev)?;

        // candidate: ∂s/∂h = 1 - z
        let delta_candidate = delta_state
            * &gates.update_gate.mapv(|z| 1.0 - z)
            * sigmoid_grad(gates.candidate.view());
        // update gate: ∂s/∂z = s_{t-1} - h
        let delta_update =
            delta_state * &(&prev - &gates.candidate) * sigmoid_grad(gates.update_gate.view());
        // reset gate, through r ⊙ s_{t-1}
        let delta_reset_hidden = self.p(UH).t().dot(&delta_candidate);
        let delta_reset =
            &delta_reset_hidden * &prev * sigmoid_grad(gates.reset_gate.view());

        add_to_column(&mut grads[VH], token, &delta_candidate)?;
        grads[UH] += &outer(&delta_candidate, gates.reset_hidden.view());
        add_to_column(&mut grads[VZ], token, &delta_update)?;
        grads[UZ] += &outer(&delta_update, prev);
        add_to_column(&mut grads[VR], token, &delta_reset)?;
        grads[UR] += &outer(&delta_reset, prev);

        let delta_prev = delta_state * &gates.update_gate
            + self.p(UZ).t().dot(&delta_update)
            + self.p(UR).t().dot(&delta_reset)
            + &delta_reset_hidden * &gates.reset_gate;
        Ok(delta_prev)
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
        let delta_state = self.output_error(grads, t, desired, y, s)?;
        self.backward_step(grads, x[t], s.previous(t), &delta_state)?;
        Ok(())
    }

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
        let mut delta_state = self.output_error(grads, t, desired, y, s)?;
        for k in 0..iterations {
            let step = t - k;
            delta_state = self.backward_step(grads, x[step], s.previous(step), &delta_state)?;
        }
        Ok(())
    }
}

impl RecurrentModel for GRU {
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
            let gates = self.gates(token, s.previous(t))?;
            let state = GRU::blend(&gates, s.previous(t));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RnnError;
    use crate::loss::sequence_loss;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(seed: u64) -> GRU {
        let mut rng = StdRng::seed_from_u64(seed);
        GRU::new(4, 3, 4, &mut rng).unwrap()
    }

    #[test]
    fn test_gru_parameter_shapes() {
        let gru = model(1);
        let params = gru.parameters();
        assert_eq!(params.len(), 7);
        assert_eq!(params.get("Ur").unwrap().value.shape(), &[3, 3]);
        assert_eq!(params.get("Vz").unwrap().value.shape(), &[3, 4]);
        assert_eq!(params.get("W").unwrap().value.shape(), &[4, 3]);
        assert!(params.is_zeroed());
    }

    #[test]
    fn test_gru_predict() {
        let gru = model(2);
        let (y, s) = gru.predict(&[0, 3, 1, 2]).unwrap();

        assert_eq!(y.shape(), &[4, 4]);
        assert_eq!(s.len(), 5);
        assert!(s.initial().iter().all(|&v| v == 0.0));
        for row in y.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        // blended states stay inside (0, 1)
        assert!(s.as_array().iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_gru_first_state_from_zero_history() {
        let gru = model(3);
        let (_, s) = gru.predict(&[1]).unwrap();

        let gates = gru.gates(1, s.initial()).unwrap();
        let expected = gates.update_gate.mapv(|z| 1.0 - z) * &gates.candidate;
        for (a, b) in s.state(0).iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gru_full_depth_bptt_matches_numerical_gradient() {
        let mut gru = model(31);
        let x = vec![0, 2, 3, 1];
        let d = vec![2, 3, 1, 0];
        let (y, s) = gru.predict(&x).unwrap();
        gru.accumulate_deltas_bptt(&x, &d, &y, &s, x.len()).unwrap();

        let eps = 1e-6;
        for index in 0..gru.parameters().len() {
            let shape = gru.parameters().value(index).dim();
            for row in 0..shape.0 {
                for col in 0..shape.1 {
                    let original = gru.parameters().value(index)[[row, col]];
                    gru.parameters_mut().value_mut(index)[[row, col]] = original + eps;
                    let plus = sequence_loss(&gru.predict(&x).unwrap().0, &d).unwrap();
                    gru.parameters_mut().value_mut(index)[[row, col]] = original - eps;
                    let minus = sequence_loss(&gru.predict(&x).unwrap().0, &d).unwrap();
                    gru.parameters_mut().value_mut(index)[[row, col]] = original;

                    let numeric = (plus - minus) / (2.0 * eps);
                    let analytic = gru.parameters().delta(index)[[row, col]];
                    assert!(
                        (analytic + numeric).abs() < 1e-5,
                        "{} [{}, {}]: analytic {} numeric {}",
                        gru.parameters().names()[index],
                        row,
                        col,
                        analytic,
                        -numeric
                    );
                }
            }
        }
    }

    #[test]
    fn test_gru_plain_backprop_accumulates() {
        let mut gru = model(4);
        let x = [1, 2];
        let d = [2, 3];
        let (y, s) = gru.predict(&x).unwrap();

        gru.accumulate_deltas(&x, &d, &y, &s).unwrap();
        let once: Vec<_> = gru.parameters().iter().map(|p| p.delta.clone()).collect();
        gru.accumulate_deltas(&x, &d, &y, &s).unwrap();

        for (p, first) in gru.parameters().iter().zip(once.iter()) {
            for (a, b) in first.iter().zip(p.delta.iter()) {
                assert!((2.0 * a - b).abs() < 1e-12);
            }
        }
        assert!(gru.parameters().get("Vh").unwrap().delta.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_gru_single_label_overwrites() {
        let mut twice = model(5);
        let (y1, s1) = twice.predict(&[0, 1, 2]).unwrap();
        let (y2, s2) = twice.predict(&[3, 2]).unwrap();
        let mut once = twice.clone();

        twice.accumulate_deltas_bptt_single_label(&[0, 1, 2], 1, &y1, &s1, 3).unwrap();
        twice.accumulate_deltas_bptt_single_label(&[3, 2], 0, &y2, &s2, 3).unwrap();
        once.accumulate_deltas_bptt_single_label(&[3, 2], 0, &y2, &s2, 3).unwrap();

        for (a, b) in twice.parameters().iter().zip(once.parameters().iter()) {
            assert_eq!(a.delta, b.delta);
        }

        twice.accumulate_deltas_single_label(&[0, 1, 2], 1, &y1, &s1).unwrap();
        twice.accumulate_deltas_single_label(&[3, 2], 0, &y2, &s2).unwrap();
        once.accumulate_deltas_single_label(&[3, 2], 0, &y2, &s2).unwrap();
        for (a, b) in twice.parameters().iter().zip(once.parameters().iter()) {
            assert_eq!(a.delta, b.delta);
        }
    }

    #[test]
    fn test_gru_bptt_single_label_never_reaches_first_position() {
        let mut gru = model(9);
        let x = [0, 1, 2];
        let (y, s) = gru.predict(&x).unwrap();
        gru.accumulate_deltas_bptt_single_label(&x, 3, &y, &s, 10).unwrap();

        for index in [VR, VZ, VH] {
            let delta = gru.parameters().delta(index);
            assert!(delta.column(0).iter().all(|&v| v == 0.0));
            assert!(delta.column(1).iter().any(|&v| v != 0.0));
        }
    }

    #[test]
    fn test_gru_from_parameters_rejects_oversized_dimensions() {
        let gru = model(10);
        let values: Vec<(String, Array2<f64>)> = gru
            .parameters()
            .iter()
            .map(|p| (p.name.to_string(), p.value.clone()))
            .collect();

        assert!(matches!(
            GRU::from_parameters(4, 1usize << 40, 4, values),
            Err(RnnError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_gru_training_step_lowers_loss() {
        let mut gru = model(6);
        let x = [0, 1, 2, 3];
        let d = [1, 2, 3, 0];
        let before = sequence_loss(&gru.predict(&x).unwrap().0, &d).unwrap();

        for _ in 0..20 {
            let (y, s) = gru.predict(&x).unwrap();
            gru.accumulate_deltas_bptt(&x, &d, &y, &s, 3).unwrap();
            gru.apply_deltas(0.5);
        }

        let after = sequence_loss(&gru.predict(&x).unwrap().0, &d).unwrap();
        assert!(after < before);
        assert!(gru.parameters().is_zeroed());
    }
}
