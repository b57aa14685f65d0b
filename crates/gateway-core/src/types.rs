//! Prediction request and response types.
//!
//! Wire types for the prediction endpoints plus the per-item shapes the
//! gateway exchanges with a model backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Free-form prediction parameters
pub type Parameters = Map<String, Value>;

/// Parameter toggling inclusion of class probabilities
pub const RETURN_PROBABILITY_PARAM: &str = "return_probability";

/// Input shape errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    /// A feature vector was empty
    #[error("Feature vector at index {index} is empty")]
    EmptyFeatures {
        /// Position of the offending input
        index: usize,
    },

    /// A feature vector exceeded the configured size
    #[error("Feature vector at index {index} has {len} values, maximum is {max}")]
    TooManyFeatures {
        /// Position of the offending input
        index: usize,
        /// Actual length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// A value was NaN or infinite
    #[error("Feature vector at index {index} contains a non-finite value")]
    NonFiniteValue {
        /// Position of the offending input
        index: usize,
    },

    /// A batch carried no inputs
    #[error("Batch must contain at least one input")]
    EmptyBatch,

    /// A batch exceeded the configured size
    #[error("Batch size ({len}) exceeds maximum allowed ({max})")]
    BatchTooLarge {
        /// Actual size
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Rows of one request had different lengths
    #[error("Feature vector at index {index} has {found} values, expected {expected}")]
    InconsistentLength {
        /// Position of the offending input
        index: usize,
        /// Length of the first input
        expected: usize,
        /// Length of the offending input
        found: usize,
    },
}

/// Size bounds enforced on incoming inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    /// Maximum values per feature vector
    pub max_features: usize,
    /// Maximum inputs per request
    pub max_batch_size: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_features: 1024,
            max_batch_size: 100,
        }
    }
}

impl InputLimits {
    /// Validate a set of feature vectors belonging to one request
    ///
    /// # Errors
    /// Returns the first shape violation found
    pub fn check<'a, I>(&self, rows: I) -> Result<(), InputError>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut expected = None;
        let mut count = 0;

        for (index, row) in rows.into_iter().enumerate() {
            count += 1;
            if row.is_empty() {
                return Err(InputError::EmptyFeatures { index });
            }
            if row.len() > self.max_features {
                return Err(InputError::TooManyFeatures {
                    index,
                    len: row.len(),
                    max: self.max_features,
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(InputError::NonFiniteValue { index });
            }
            match expected {
                None => expected = Some(row.len()),
                Some(len) if len != row.len() => {
                    return Err(InputError::InconsistentLength {
                        index,
                        expected: len,
                        found: row.len(),
                    });
                }
                Some(_) => {}
            }
        }

        if count == 0 {
            return Err(InputError::EmptyBatch);
        }
        if count > self.max_batch_size {
            return Err(InputError::BatchTooLarge {
                len: count,
                max: self.max_batch_size,
            });
        }
        Ok(())
    }
}

/// Feature payload: one vector or several
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Features {
    /// A single feature vector
    Single(Vec<f64>),
    /// Several feature vectors
    Multiple(Vec<Vec<f64>>),
}

impl Features {
    /// Borrow every feature vector in order
    #[must_use]
    pub fn rows(&self) -> Vec<&[f64]> {
        match self {
            Self::Single(row) => vec![row.as_slice()],
            Self::Multiple(rows) => rows.iter().map(Vec::as_slice).collect(),
        }
    }

    /// Number of feature vectors
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multiple(rows) => rows.len(),
        }
    }

    /// Whether there are no feature vectors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of `POST /predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Feature vector(s)
    pub features: Features,
    /// Optional prediction parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl PredictionRequest {
    /// Validate input shape
    ///
    /// # Errors
    /// Returns the first shape violation found
    pub fn validate(&self, limits: &InputLimits) -> Result<(), InputError> {
        limits.check(self.features.rows())
    }

    /// Split into one backend input per feature vector
    #[must_use]
    pub fn to_inputs(&self) -> Vec<InferenceInput> {
        let parameters = self.parameters.clone().unwrap_or_default();
        self.features
            .rows()
            .into_iter()
            .map(|row| InferenceInput::new(row.to_vec(), parameters.clone()))
            .collect()
    }
}

/// Body of `POST /batch-predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionRequest {
    /// Feature vectors, answered independently
    pub inputs: Vec<Vec<f64>>,
    /// Optional prediction parameters shared by all inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl BatchPredictionRequest {
    /// Validate input shape
    ///
    /// # Errors
    /// Returns the first shape violation found
    pub fn validate(&self, limits: &InputLimits) -> Result<(), InputError> {
        limits.check(self.inputs.iter().map(Vec::as_slice))
    }

    /// Split into one backend input per feature vector
    #[must_use]
    pub fn to_inputs(&self) -> Vec<InferenceInput> {
        let parameters = self.parameters.clone().unwrap_or_default();
        self.inputs
            .iter()
            .map(|row| InferenceInput::new(row.clone(), parameters.clone()))
            .collect()
    }
}

/// One unit of work sent to the model backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceInput {
    /// Feature vector
    pub features: Vec<f64>,
    /// Prediction parameters
    #[serde(default)]
    pub parameters: Parameters,
}

impl InferenceInput {
    /// Create a new input
    #[must_use]
    pub fn new(features: Vec<f64>, parameters: Parameters) -> Self {
        Self {
            features,
            parameters,
        }
    }

    /// Whether the caller asked for class probabilities (default: yes)
    #[must_use]
    pub fn return_probability(&self) -> bool {
        self.parameters
            .get(RETURN_PROBABILITY_PARAM)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// Raw answer from the model backend for one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Model output (class label, regression value, ...)
    pub output: Value,
    /// Class probabilities, if the model produces them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
}

/// Identity of the served model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Model name
    pub name: String,
    /// Model version
    pub version: String,
}

impl ModelIdentity {
    /// Create a new model identity
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A single normalized prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Prediction id (`pred_` + 8 hex chars)
    pub id: String,
    /// Model output
    pub output: Value,
    /// Class probabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
    /// Confidence score (highest probability)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Prediction {
    /// Normalize a backend answer into a prediction
    #[must_use]
    pub fn from_output(output: BackendOutput, return_probability: bool) -> Self {
        let score = output
            .probabilities
            .as_deref()
            .and_then(|probs| probs.iter().copied().reduce(f64::max));

        Self {
            id: new_prediction_id(),
            output: output.output,
            probabilities: output.probabilities.filter(|_| return_probability),
            score,
        }
    }
}

/// Generate a fresh prediction id
#[must_use]
pub fn new_prediction_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("pred_{}", &hex[..8])
}

/// Body returned by `POST /predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// Predictions, one per input, in input order
    pub predictions: Vec<Prediction>,
    /// Model version
    pub model_version: String,
    /// Model name
    pub model_name: String,
    /// Time spent serving the request
    pub processing_time_ms: f64,
}

/// Outcome status of one batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Item succeeded
    Ok,
    /// Item failed
    Error,
}

/// Failure description for one batch item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// Result for one batch item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Position of the item in the request
    pub index: usize,
    /// Outcome
    pub status: ItemStatus,
    /// Prediction on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    /// Error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl BatchItemResult {
    /// Successful item
    #[must_use]
    pub fn ok(index: usize, prediction: Prediction) -> Self {
        Self {
            index,
            status: ItemStatus::Ok,
            prediction: Some(prediction),
            error: None,
        }
    }

    /// Failed item
    #[must_use]
    pub fn failed(index: usize, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            status: ItemStatus::Error,
            prediction: None,
            error: Some(ItemError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Body returned by `POST /batch-predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionResponse {
    /// Per-item results in input order
    pub results: Vec<BatchItemResult>,
    /// Model name
    pub model_name: String,
    /// Model version
    pub model_version: String,
    /// Time spent serving the request
    pub processing_time_ms: f64,
    /// Number of successful items
    pub succeeded: usize,
    /// Number of failed items
    pub failed: usize,
}
