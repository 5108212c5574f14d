//! In-memory model of a checkpoint blob
//!
//! A checkpoint is an ordered map of top-level fields. Field names are the
//! compatibility surface other tools rely on, so they live in [`keys`].

use runtime_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level field names of a checkpoint blob
pub mod keys {
    pub const CHECKPOINT_VERSION: &str = "checkpoint_version";
    pub const ITERATION: &str = "iteration";
    /// Older checkpoints stored the iteration under this name
    pub const LEGACY_ITERATION: &str = "total_iters";
    /// Iteration field names, in the order they are tried on load
    pub const ITERATION_FIELDS: &[&str] = &[ITERATION, LEGACY_ITERATION];
    pub const EPOCH: &str = "epoch";
    pub const MODEL: &str = "model";
    pub const OPTIMIZER: &str = "optimizer";
    pub const LR_SCHEDULER: &str = "lr_scheduler";
    pub const ARGS: &str = "args";

    pub const RANDOM_RNG_STATE: &str = "random_rng_state";
    pub const NUMERIC_RNG_STATE: &str = "numeric_rng_state";
    pub const HOST_RNG_STATE: &str = "host_rng_state";
    pub const DEVICE_RNG_STATE: &str = "device_rng_state";
    pub const RNG_TRACKER_STATES: &str = "rng_tracker_states";

    /// Key for model chunk `index` out of `count`.
    ///
    /// A single model is stored as `model`; chunks of a virtual-pipeline
    /// model as `model0`, `model1`, ...
    pub fn model_key(index: usize, count: usize) -> String {
        if count == 1 {
            MODEL.to_string()
        } else {
            format!("{}{}", MODEL, index)
        }
    }
}

/// Element storage of a tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            TensorData::F32(_) => "f32",
            TensorData::F64(_) => "f64",
            TensorData::I64(_) => "i64",
            TensorData::U8(_) => "u8",
        }
    }
}

/// Dense row-major tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::StateDict {
                message: format!(
                    "tensor shape {:?} needs {} elements, got {}",
                    shape,
                    numel,
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A value inside a checkpoint: scalars, tensors and nested containers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tensor(Tensor),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Non-negative integer view of the value
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StateValue::UInt(v) => Some(*v),
            StateValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StateValue>> {
        match self {
            StateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key if this value is a map
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Shape-level JSON rendering: tensors and byte strings are reduced to
    /// their dtype and size so large payloads stay readable
    pub fn to_json_summary(&self) -> serde_json::Value {
        use serde_json::{json, Value};

        match self {
            StateValue::Null => Value::Null,
            StateValue::Bool(v) => json!(v),
            StateValue::Int(v) => json!(v),
            StateValue::UInt(v) => json!(v),
            StateValue::Float(v) => json!(v),
            StateValue::Str(v) => json!(v),
            StateValue::Bytes(v) => json!({ "bytes": v.len() }),
            StateValue::Tensor(t) => json!({ "dtype": t.data.dtype(), "shape": t.shape }),
            StateValue::List(items) => {
                Value::Array(items.iter().map(StateValue::to_json_summary).collect())
            }
            StateValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_summary()))
                    .collect(),
            ),
        }
    }
}

impl From<&serde_json::Value> for StateValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => StateValue::Null,
            Value::Bool(v) => StateValue::Bool(*v),
            Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    StateValue::UInt(v)
                } else if let Some(v) = n.as_i64() {
                    StateValue::Int(v)
                } else {
                    StateValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => StateValue::Str(s.clone()),
            Value::Array(items) => StateValue::List(items.iter().map(StateValue::from).collect()),
            Value::Object(map) => StateValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), StateValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<u64> for StateValue {
    fn from(v: u64) -> Self {
        StateValue::UInt(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Str(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Str(v)
    }
}

impl From<Tensor> for StateValue {
    fn from(v: Tensor) -> Self {
        StateValue::Tensor(v)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(v: Vec<StateValue>) -> Self {
        StateValue::List(v)
    }
}

impl From<BTreeMap<String, StateValue>> for StateValue {
    fn from(v: BTreeMap<String, StateValue>) -> Self {
        StateValue::Map(v)
    }
}

/// The full checkpoint blob for one shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    fields: BTreeMap<String, StateValue>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First of `candidates` present in the blob, with the name that matched
    pub fn first_present<'k>(&self, candidates: &[&'k str]) -> Option<(&'k str, &StateValue)> {
        candidates
            .iter()
            .find_map(|key| self.fields.get(*key).map(|value| (*key, value)))
    }

    /// JSON summary of every field, for inspection tooling
    pub fn to_json_summary(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json_summary()))
                .collect(),
        )
    }
}

/// States of every RNG source a rank uses.
///
/// All sources must be restored together; restoring some but not others
/// would desynchronize stochastic parallel operations across ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct RngBundle {
    /// General-purpose PRNG
    pub random: StateValue,
    /// Vectorized numeric PRNG
    pub numeric: StateValue,
    /// Device-agnostic (host) PRNG
    pub host: StateValue,
    /// Device-local PRNG
    pub device: StateValue,
    /// Named generators used by tensor-parallel dropout and similar ops
    pub tracker_states: BTreeMap<String, StateValue>,
}

impl RngBundle {
    /// Store the bundle as top-level checkpoint fields
    pub fn insert_into(self, state: &mut CheckpointState) {
        state.insert(keys::RANDOM_RNG_STATE, self.random);
        state.insert(keys::NUMERIC_RNG_STATE, self.numeric);
        state.insert(keys::HOST_RNG_STATE, self.host);
        state.insert(keys::DEVICE_RNG_STATE, self.device);
        state.insert(keys::RNG_TRACKER_STATES, StateValue::Map(self.tracker_states));
    }

    /// Read the bundle back, reporting the first missing field.
    ///
    /// An empty tracker-states map counts as missing.
    pub fn extract(state: &CheckpointState) -> std::result::Result<Self, &'static str> {
        let field = |key: &'static str| state.get(key).cloned().ok_or(key);

        let random = field(keys::RANDOM_RNG_STATE)?;
        let numeric = field(keys::NUMERIC_RNG_STATE)?;
        let host = field(keys::HOST_RNG_STATE)?;
        let device = field(keys::DEVICE_RNG_STATE)?;
        let tracker_states = match state.get(keys::RNG_TRACKER_STATES) {
            Some(StateValue::Map(map)) if !map.is_empty() => map.clone(),
            _ => return Err(keys::RNG_TRACKER_STATES),
        };

        Ok(Self {
            random,
            numeric,
            host,
            device,
            tracker_states,
        })
    }
}
