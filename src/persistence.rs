use ndarray::{Array2, Dimension};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, RnnError};
use crate::models::gru::GRU;
use crate::models::rnn::RNN;
use crate::models::RecurrentModel;

/// Serializable version of Array2<f64> for persistence
#[derive(Serialize, Deserialize, Clone, Debug)]
struct SerializableArray2 {
    data: Vec<f64>,
    shape: (usize, usize),
}

impl From<&Array2<f64>> for SerializableArray2 {
    fn from(array: &Array2<f64>) -> Self {
        Self {
            data: array.iter().cloned().collect(),
            shape: array.raw_dim().into_pattern(),
        }
    }
}

impl TryFrom<SerializableArray2> for Array2<f64> {
    type Error = RnnError;

    fn try_from(array: SerializableArray2) -> Result<Self> {
        Array2::from_shape_vec(array.shape, array.data)
            .map_err(|e| RnnError::Serialization(format!("bad matrix data: {}", e)))
    }
}

/// A parameter matrix with the name it is registered under.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NamedMatrix {
    name: String,
    matrix: SerializableArray2,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    Rnn,
    Gru,
}

/// Model metadata for tracking training information
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelMetadata {
    pub model_name: String,
    pub version: String,
    pub created_at: String,
    pub total_epochs: usize,
    pub best_loss: Option<f64>,
    pub description: Option<String>,
}

impl ModelMetadata {
    pub fn new(model_name: impl Into<String>) -> Self {
        ModelMetadata {
            model_name: model_name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            total_epochs: 0,
            best_loss: None,
            description: None,
        }
    }
}

/// Complete saved model: dimensions, weights and metadata
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SavedModel {
    pub architecture: Architecture,
    pub vocab_size: usize,
    pub hidden_dims: usize,
    pub out_vocab_size: usize,
    pub parameters: Vec<NamedMatrix>,
    pub metadata: ModelMetadata,
}

impl SavedModel {
    fn into_values(self) -> Result<Vec<(String, Array2<f64>)>> {
        self.parameters
            .into_iter()
            .map(|p| -> Result<(String, Array2<f64>)> { Ok((p.name, p.matrix.try_into()?)) })
            .collect()
    }
}

/// Models that can be written to and rebuilt from a `SavedModel`.
pub trait Architectured: RecurrentModel + Sized {
    const ARCHITECTURE: Architecture;

    fn from_parameters(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self>;
}

impl Architectured for RNN {
    const ARCHITECTURE: Architecture = Architecture::Rnn;

    fn from_parameters(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self> {
        RNN::from_parameters(vocab_size, hidden_dims, out_vocab_size, values)
    }
}

impl Architectured for GRU {
    const ARCHITECTURE: Architecture = Architecture::Gru;

    fn from_parameters(
        vocab_size: usize,
        hidden_dims: usize,
        out_vocab_size: usize,
        values: Vec<(String, Array2<f64>)>,
    ) -> Result<Self> {
        GRU::from_parameters(vocab_size, hidden_dims, out_vocab_size, values)
    }
}

/// Model persistence operations
pub struct ModelPersistence;

impl ModelPersistence {
    /// Save model to JSON format (human-readable)
    pub fn save_to_json<P: AsRef<Path>>(model: &SavedModel, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(model)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Load model from JSON format
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<SavedModel> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let model = serde_json::from_str(&contents)?;
        Ok(model)
    }

    /// Save model to binary format (compact and fast)
    pub fn save_to_binary<P: AsRef<Path>>(model: &SavedModel, path: P) -> Result<()> {
        let encoded = bincode::serialize(model)?;
        let mut file = File::create(path)?;
        file.write_all(&encoded)?;
        Ok(())
    }

    /// Load model from binary format
    pub fn load_from_binary<P: AsRef<Path>>(path: P) -> Result<SavedModel> {
        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let model = bincode::deserialize(&contents)?;
        Ok(model)
    }

    /// Snapshot a model's current weights together with metadata
    pub fn create_saved_model<M: Architectured>(model: &M, metadata: ModelMetadata) -> SavedModel {
        SavedModel {
            architecture: M::ARCHITECTURE,
            vocab_size: model.vocab_size(),
            hidden_dims: model.hidden_dims(),
            out_vocab_size: model.out_vocab_size(),
            parameters: model
                .parameters()
                .iter()
                .map(|p| NamedMatrix {
                    name: p.name.to_string(),
                    matrix: (&p.value).into(),
                })
                .collect(),
            metadata,
        }
    }

    /// Rebuild a model, checking the architecture and every matrix shape
    pub fn restore_model<M: Architectured>(saved: SavedModel) -> Result<(M, ModelMetadata)> {
        if saved.architecture != M::ARCHITECTURE {
            return Err(RnnError::InvariantViolation(format!(
                "saved model is {:?}, expected {:?}",
                saved.architecture,
                M::ARCHITECTURE
            )));
        }
        let (vocab_size, hidden_dims, out_vocab_size) =
            (saved.vocab_size, saved.hidden_dims, saved.out_vocab_size);
        let metadata = saved.metadata.clone();
        let values = saved.into_values()?;
        let model = M::from_parameters(vocab_size, hidden_dims, out_vocab_size, values)?;
        Ok((model, metadata))
    }
}

/// Convenience trait for easy model saving/loading
pub trait PersistentModel {
    /// Save model to file (format determined by file extension)
    fn save<P: AsRef<Path>>(&self, path: P, metadata: ModelMetadata) -> Result<()>;

    /// Load model from file (format determined by file extension)
    fn load<P: AsRef<Path>>(path: P) -> Result<(Self, ModelMetadata)>
    where
        Self: Sized;
}

impl<M: Architectured> PersistentModel for M {
    fn save<P: AsRef<Path>>(&self, path: P, metadata: ModelMetadata) -> Result<()> {
        let saved_model = ModelPersistence::create_saved_model(self, metadata);

        match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => ModelPersistence::save_to_json(&saved_model, path),
            _ => ModelPersistence::save_to_binary(&saved_model, path),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<(Self, ModelMetadata)> {
        let saved_model = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => ModelPersistence::load_from_json(path)?,
            _ => ModelPersistence::load_from_binary(path)?,
        };

        ModelPersistence::restore_model(saved_model)
    }
}
