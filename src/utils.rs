//! Numeric primitives shared by the recurrent cells.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{Result, RnnError};

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Elementwise sigmoid over a vector.
pub fn sigmoid_vec(v: &Array1<f64>) -> Array1<f64> {
    v.mapv(sigmoid)
}

/// Derivative of the sigmoid expressed through its output: s * (1 - s).
///
/// Takes the already activated value, which is what the hidden traces store.
pub fn sigmoid_grad(s: ArrayView1<f64>) -> Array1<f64> {
    s.mapv(|x| x * (1.0 - x))
}

/// Numerically stable softmax over a vector.
pub fn softmax(v: &Array1<f64>) -> Array1<f64> {
    let max_val = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp_vals = v.mapv(|x| (x - max_val).exp());
    let sum_exp = exp_vals.sum();
    exp_vals / sum_exp
}

/// One-hot vector of length `size` with a 1 at `index`.
pub fn one_hot(index: usize, size: usize) -> Result<Array1<f64>> {
    if index >= size {
        return Err(RnnError::Domain(format!(
            "index {} out of range for one-hot of size {}",
            index, size
        )));
    }
    let mut v = Array1::zeros(size);
    v[index] = 1.0;
    Ok(v)
}

/// Outer product a ⊗ b.
pub fn outer(a: &Array1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    col.dot(&row)
}

/// Index of the largest entry. Ties go to the lowest index.
pub fn argmax(v: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if x > v[best] {
            best = i;
        }
    }
    best
}
