//! # Rust RNN Library
//!
//! Recurrent (RNN) and gated recurrent (GRU) networks over token sequences,
//! trained with hand-written backpropagation and truncated backpropagation
//! through time.
//!
//! ## Core Components
//!
//! - **Models**: `RNN` and `GRU` behind the `RecurrentModel` trait, with forward
//!   prediction and four gradient accumulation variants each
//! - **Parameters**: a registry pairing each weight matrix with its accumulator,
//!   plus best-epoch snapshot and restore
//! - **Training**: the `Runner` epoch loop with batching, annealing and early stopping
//! - **Persistence**: JSON and binary model files
//!
//! ## Quick Start
//!
//! ```rust
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use rust_rnn::{Runner, TrainingConfig, RNN};
//!
//! let mut rng = StdRng::seed_from_u64(2018);
//! let rnn = RNN::new(10, 8, 10, &mut rng).unwrap();
//! let mut runner = Runner::new(rnn);
//!
//! let x = vec![vec![0, 1, 2], vec![3, 4, 5]];
//! let d = vec![vec![1, 2, 3], vec![4, 5, 6]];
//! let config = TrainingConfig::default().with_epochs(2).with_log(false);
//! let best_loss = runner.train(&x, &d, &x, &d, &config, &mut rng).unwrap();
//! assert!(best_loss.is_finite());
//! ```

pub mod error;
pub mod utils;
pub mod models;
pub mod loss;
pub mod schedulers;
pub mod training;
pub mod persistence;

// Re-export commonly used items
pub use error::{Result, RnnError};
pub use models::gru::GRU;
pub use models::params::{Parameter, ParameterSet};
pub use models::rnn::RNN;
pub use models::{HiddenTrace, OutputTrace, RecurrentModel};
pub use persistence::{ModelMetadata, ModelPersistence, PersistentModel, SavedModel};
pub use schedulers::{ConstantLR, HarmonicAnnealingLR, LearningRateScheduler};
pub use training::{Runner, StopReason, TrainingConfig, TrainingMetrics, TrainingSummary};
