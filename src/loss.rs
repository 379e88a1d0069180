use ndarray::ArrayView1;

use crate::error::{Result, RnnError};
use crate::models::OutputTrace;
use crate::utils::argmax;

/// Negative log-likelihood of one desired index under one distribution.
pub fn negative_log_likelihood(distribution: ArrayView1<f64>, desired: usize) -> Result<f64> {
    let p = distribution.get(desired).ok_or_else(|| {
        RnnError::Domain(format!(
            "desired index {} out of range for output of size {}",
            desired,
            distribution.len()
        ))
    })?;
    Ok(-p.ln())
}

/// Summed negative log-likelihood of a desired sequence, one term per timestep.
pub fn sequence_loss(y: &OutputTrace, d: &[usize]) -> Result<f64> {
    if d.len() != y.nrows() {
        return Err(RnnError::Domain(format!(
            "desired sequence has length {}, output trace has {} steps",
            d.len(),
            y.nrows()
        )));
    }
    let mut loss = 0.0;
    for (t, &desired) in d.iter().enumerate() {
        loss += negative_log_likelihood(y.row(t), desired)?;
    }
    Ok(loss)
}

/// Negative log-likelihood of the single label under the final distribution.
pub fn single_label_loss(y: &OutputTrace, d: usize) -> Result<f64> {
    let last = final_step(y)?;
    negative_log_likelihood(y.row(last), d)
}

/// 1 if the argmax of `distribution` equals `desired`, 0 otherwise.
pub fn single_label_accuracy(distribution: ArrayView1<f64>, desired: usize) -> u32 {
    if argmax(distribution) == desired {
        1
    } else {
        0
    }
}

pub(crate) fn final_step(y: &OutputTrace) -> Result<usize> {
    y.nrows()
        .checked_sub(1)
        .ok_or_else(|| RnnError::Domain("output trace is empty".to_string()))
}
