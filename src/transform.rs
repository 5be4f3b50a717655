use crate::error::{GovError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PASSTHROUGH_TRANSFORMER_ID: Uuid =
    Uuid::from_u128(0x7c2a_90d1_4e35_4b8a_9f60_18c4_5a2e_0001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    PassThrough,
    Transform,
    TokenizeByValue,
    /// One token stands for every value of the column.
    TokenizeByReference,
}

/// Function applied by [`BuiltinTransformerExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformFunction {
    Identity,
    Lowercase,
    Uppercase,
    Trim,
    /// Replaces every character except the last `n` with `*`.
    MaskAllButLast(usize),
    /// Stable opaque token derived from the input.
    Token { prefix: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformer {
    pub id: Uuid,
    pub name: String,
    pub transform_type: TransformType,
    pub function: TransformFunction,
}

impl Transformer {
    pub fn new(name: &str, transform_type: TransformType, function: TransformFunction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            transform_type,
            function,
        }
    }

    pub fn passthrough() -> Self {
        Self {
            id: PASSTHROUGH_TRANSFORMER_ID,
            name: "PassthroughUnchangedData".into(),
            transform_type: TransformType::PassThrough,
            function: TransformFunction::Identity,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.transform_type == TransformType::PassThrough
    }
}

/// Where a transformed value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub user_id: Option<Uuid>,
    pub column_id: Uuid,
    pub token_access_policy_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub transformer: Transformer,
    pub input: String,
    pub provenance: Provenance,
}

/// Runs transformers in bulk. Output `i` belongs to request `i`.
pub trait TransformerExecutor: Send + Sync {
    fn execute(&self, requests: &[TransformRequest]) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTransformerExecutor;

impl TransformerExecutor for BuiltinTransformerExecutor {
    fn execute(&self, requests: &[TransformRequest]) -> Result<Vec<String>> {
        requests
            .iter()
            .map(|req| apply_function(&req.transformer.function, &req.input))
            .collect()
    }
}

fn apply_function(function: &TransformFunction, input: &str) -> Result<String> {
    Ok(match function {
        TransformFunction::Identity => input.to_string(),
        TransformFunction::Lowercase => input.to_lowercase(),
        TransformFunction::Uppercase => input.to_uppercase(),
        TransformFunction::Trim => input.trim().to_string(),
        TransformFunction::MaskAllButLast(keep) => {
            let total = input.chars().count();
            input
                .chars()
                .enumerate()
                .map(|(i, c)| if i + keep < total { '*' } else { c })
                .collect()
        }
        TransformFunction::Token { prefix } => {
            if prefix.is_empty() {
                return Err(GovError::invalid_config("token transformer needs a prefix"));
            }
            let digest = input.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
            format!("{prefix}_{digest:016x}")
        }
    })
}

/// Collects transformer inputs from many values so they run in one executor call.
///
/// Each `push` returns a slot; `run` hands back outputs indexed by slot.
/// Passthrough transformers never reach the executor.
#[derive(Debug, Default)]
pub struct TransformBatch {
    requests: Vec<TransformRequest>,
    slots: Vec<Slot>,
}

#[derive(Debug)]
enum Slot {
    Local(String),
    Remote(usize),
}

impl TransformBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transformer: &Transformer, input: String, provenance: Provenance) -> usize {
        let slot = if transformer.is_passthrough() {
            Slot::Local(input)
        } else {
            self.requests.push(TransformRequest {
                transformer: transformer.clone(),
                input,
                provenance,
            });
            Slot::Remote(self.requests.len() - 1)
        };
        self.slots.push(slot);
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn remote_len(&self) -> usize {
        self.requests.len()
    }

    pub fn run(self, executor: &dyn TransformerExecutor) -> Result<Vec<String>> {
        let mut remote = if self.requests.is_empty() {
            Vec::new()
        } else {
            executor.execute(&self.requests)?
        };
        if remote.len() != self.requests.len() {
            return Err(GovError::Internal(format!(
                "transformer executor returned {} outputs for {} inputs",
                remote.len(),
                self.requests.len()
            )));
        }
        let mut outputs = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Slot::Local(value) => outputs.push(value),
                Slot::Remote(idx) => outputs.push(std::mem::take(&mut remote[idx])),
            }
        }
        Ok(outputs)
    }
}
