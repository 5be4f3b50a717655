use crate::catalog::types::{ConcreteType, CoercionError, Value, ValueKey, json_kind};
use crate::error::{GovError, Result};
use crate::query::plan::Selector;
use crate::retention::DataLifeCycleState;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const STRING_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0001);
pub const BOOLEAN_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0002);
pub const INTEGER_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0003);
pub const TIMESTAMP_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0004);
pub const DATE_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0005);
pub const UUID_TYPE_ID: Uuid = Uuid::from_u128(0xd26b_6d52_a8d7_4c2c_9d02_0c1f_8a61_0006);

pub const ID_COLUMN_ID: Uuid = Uuid::from_u128(0x5e1f_0c3a_27b4_4d6e_8f11_3a0c_77d2_0001);
pub const CREATED_COLUMN_ID: Uuid = Uuid::from_u128(0x5e1f_0c3a_27b4_4d6e_8f11_3a0c_77d2_0002);
pub const UPDATED_COLUMN_ID: Uuid = Uuid::from_u128(0x5e1f_0c3a_27b4_4d6e_8f11_3a0c_77d2_0003);
pub const ORGANIZATION_COLUMN_ID: Uuid =
    Uuid::from_u128(0x5e1f_0c3a_27b4_4d6e_8f11_3a0c_77d2_0004);

pub const OPERATIONAL_PURPOSE_ID: Uuid =
    Uuid::from_u128(0x9a4c_51e0_6b2d_4f87_a3c5_e1d0_4b7f_0001);

/// Field of a composite data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeField {
    pub name: String,
    pub concrete: ConcreteType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub ignore_for_uniqueness: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataType {
    pub id: Uuid,
    pub name: String,
    pub concrete: ConcreteType,
    #[serde(default)]
    pub fields: Vec<CompositeField>,
    /// Composite values carry a required string `id` field usable as a unique key.
    #[serde(default)]
    pub include_id: bool,
}

impl DataType {
    pub fn native(id: Uuid, name: &str, concrete: ConcreteType) -> Self {
        Self {
            id,
            name: name.to_string(),
            concrete,
            fields: Vec::new(),
            include_id: false,
        }
    }

    pub fn composite(name: &str, fields: Vec<CompositeField>, include_id: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            concrete: ConcreteType::Composite,
            fields,
            include_id,
        }
    }

    pub fn natives() -> Vec<DataType> {
        vec![
            DataType::native(STRING_TYPE_ID, "string", ConcreteType::String),
            DataType::native(BOOLEAN_TYPE_ID, "boolean", ConcreteType::Boolean),
            DataType::native(INTEGER_TYPE_ID, "integer", ConcreteType::Integer),
            DataType::native(TIMESTAMP_TYPE_ID, "timestamp", ConcreteType::Timestamp),
            DataType::native(DATE_TYPE_ID, "date", ConcreteType::Date),
            DataType::native(UUID_TYPE_ID, "uuid", ConcreteType::Uuid),
        ]
    }

    pub fn is_composite(&self) -> bool {
        self.concrete == ConcreteType::Composite
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GovError::Validation("data type name must be set".into()));
        }
        if !self.is_composite() {
            if !self.fields.is_empty() || self.include_id {
                return Err(GovError::Validation(format!(
                    "data type '{}' is not composite and cannot declare fields",
                    self.name
                )));
            }
            return Ok(());
        }
        if self.fields.is_empty() {
            return Err(GovError::Validation(format!(
                "composite data type '{}' needs at least one field",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if field.concrete == ConcreteType::Composite {
                return Err(GovError::Validation(format!(
                    "field '{}' of data type '{}' cannot be composite",
                    field.name, self.name
                )));
            }
            if !seen.insert(field.name.to_lowercase()) {
                return Err(GovError::Validation(format!(
                    "duplicate field '{}' in data type '{}'",
                    field.name, self.name
                )));
            }
        }
        if self.include_id
            && !self
                .fields
                .iter()
                .any(|f| f.name == "id" && f.concrete == ConcreteType::String && f.required)
        {
            return Err(GovError::Validation(format!(
                "data type '{}' includes an id and must declare a required string field 'id'",
                self.name
            )));
        }
        Ok(())
    }

    pub fn coerce_json(&self, raw: &JsonValue) -> std::result::Result<Value, CoercionError> {
        if !self.is_composite() {
            return self.concrete.coerce_json(raw);
        }
        let object = match raw {
            JsonValue::Object(object) => object,
            JsonValue::String(s) => return self.parse_str(s),
            other => {
                return Err(CoercionError {
                    expected: format!("{} object", self.name),
                    got: json_kind(other).to_string(),
                });
            }
        };
        for key in object.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(CoercionError {
                    expected: format!("fields of {}", self.name),
                    got: format!("unknown field '{key}'"),
                });
            }
        }
        let mut fields = BTreeMap::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(JsonValue::Null) if field.required => {
                    return Err(CoercionError {
                        expected: format!("required field '{}'", field.name),
                        got: "nothing".into(),
                    });
                }
                None | Some(JsonValue::Null) => {}
                Some(value) => {
                    fields.insert(field.name.clone(), field.concrete.coerce_json(value)?);
                }
            }
        }
        Ok(Value::Composite(fields))
    }

    pub fn parse_str(&self, raw: &str) -> std::result::Result<Value, CoercionError> {
        if !self.is_composite() {
            return self.concrete.parse_str(raw);
        }
        let json: JsonValue = serde_json::from_str(raw).map_err(|e| CoercionError {
            expected: format!("{} JSON object", self.name),
            got: e.to_string(),
        })?;
        match json {
            JsonValue::Object(_) => self.coerce_json(&json),
            other => Err(CoercionError {
                expected: format!("{} JSON object", self.name),
                got: json_kind(&other).to_string(),
            }),
        }
    }

    /// Key under which two values count as the same value.
    ///
    /// Composite fields flagged `ignore_for_uniqueness` do not take part.
    pub fn comparable_key(&self, value: &Value) -> ValueKey {
        match value {
            Value::Composite(fields) => {
                let relevant: BTreeMap<&str, JsonValue> = fields
                    .iter()
                    .filter(|(name, _)| {
                        !self
                            .fields
                            .iter()
                            .any(|f| &f.name == *name && f.ignore_for_uniqueness)
                    })
                    .map(|(name, v)| (name.as_str(), v.to_json()))
                    .collect();
                let rendered = serde_json::to_string(&relevant).unwrap_or_default();
                ValueKey::new(format!("composite:{rendered}"))
            }
            other => ValueKey::new(format!(
                "{}:{}",
                other.concrete_type(),
                other.to_plain_string()
            )),
        }
    }

    /// Key used to match values when a column requires unique members.
    pub fn unique_key(&self, value: &Value, unique_id_required: bool) -> Result<ValueKey> {
        if !unique_id_required {
            return Ok(self.comparable_key(value));
        }
        match value {
            Value::Composite(fields) => match fields.get("id") {
                Some(id) => Ok(ValueKey::new(format!("id:{}", id.to_plain_string()))),
                None => Err(GovError::Validation(format!(
                    "value of data type '{}' is missing its id",
                    self.name
                ))),
            },
            _ => Err(GovError::invalid_config(format!(
                "data type '{}' has no id field for unique id matching",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConstraints {
    #[serde(default)]
    pub partial_updates: bool,
    #[serde(default)]
    pub unique_required: bool,
    #[serde(default)]
    pub unique_id_required: bool,
    #[serde(default)]
    pub immutable_required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnAttributes {
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub constraints: ColumnConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: Uuid,
    pub name: String,
    pub data_type_id: Uuid,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub default_value: Option<JsonValue>,
    #[serde(default)]
    pub default_transformer_id: Option<Uuid>,
    #[serde(default)]
    pub default_token_access_policy_id: Option<Uuid>,
    #[serde(default)]
    pub access_policy_id: Option<Uuid>,
    #[serde(default)]
    pub search_indexed: bool,
    #[serde(default)]
    pub attributes: ColumnAttributes,
}

impl Column {
    pub fn new(name: &str, data_type_id: Uuid, is_array: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            data_type_id,
            is_array,
            default_value: None,
            default_transformer_id: None,
            default_token_access_policy_id: None,
            access_policy_id: None,
            search_indexed: false,
            attributes: ColumnAttributes::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: ColumnConstraints) -> Self {
        self.attributes.constraints = constraints;
        self
    }

    pub fn with_default_value(mut self, value: JsonValue) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_access_policy(mut self, policy_id: Uuid) -> Self {
        self.access_policy_id = Some(policy_id);
        self
    }

    pub fn with_default_transformer(mut self, transformer_id: Uuid) -> Self {
        self.default_transformer_id = Some(transformer_id);
        self
    }

    pub fn searchable(mut self) -> Self {
        self.search_indexed = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.attributes.immutable = true;
        self
    }

    pub fn system(id: Uuid, name: &str, data_type_id: Uuid) -> Self {
        let mut column = Self::new(name, data_type_id, false);
        column.id = id;
        column.attributes.system = true;
        column.attributes.immutable = true;
        column
    }

    pub fn system_columns() -> Vec<Column> {
        vec![
            Column::system(ID_COLUMN_ID, "id", UUID_TYPE_ID),
            Column::system(CREATED_COLUMN_ID, "created", TIMESTAMP_TYPE_ID),
            Column::system(UPDATED_COLUMN_ID, "updated", TIMESTAMP_TYPE_ID),
            Column::system(ORGANIZATION_COLUMN_ID, "organization_id", UUID_TYPE_ID),
        ]
    }

    pub fn is_system(&self) -> bool {
        self.attributes.system
    }

    pub fn constraints(&self) -> ColumnConstraints {
        self.attributes.constraints
    }

    pub fn validate(&self, data_type: &DataType) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GovError::Validation("column name must be set".into()));
        }
        let c = self.attributes.constraints;
        let any_unique = c.unique_required || c.unique_id_required || c.immutable_required;
        if (c.partial_updates || any_unique) && !self.is_array {
            return Err(GovError::Validation(format!(
                "column '{}': partial updates and uniqueness constraints require an array column",
                self.name
            )));
        }
        if c.partial_updates && !c.unique_required && !c.unique_id_required {
            return Err(GovError::Validation(format!(
                "column '{}': partial updates require unique values or unique ids",
                self.name
            )));
        }
        if (c.unique_id_required || c.immutable_required) && !data_type.include_id {
            return Err(GovError::Validation(format!(
                "column '{}': unique id and immutability constraints require a data type with an id",
                self.name
            )));
        }
        if let Some(default) = &self.default_value {
            let values: Vec<&JsonValue> = match (self.is_array, default) {
                (true, JsonValue::Array(items)) => items.iter().collect(),
                (true, _) => {
                    return Err(GovError::Validation(format!(
                        "column '{}': default value of an array column must be an array",
                        self.name
                    )));
                }
                (false, single) => vec![single],
            };
            for value in values {
                data_type.coerce_json(value).map_err(|e| {
                    GovError::Validation(format!(
                        "column '{}': invalid default value: {e}",
                        self.name
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purpose {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_system: bool,
}

impl Purpose {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            is_system: false,
        }
    }

    pub fn operational() -> Self {
        Self {
            id: OPERATIONAL_PURPOSE_ID,
            name: "operational".into(),
            description: "Data needed to operate the service".into(),
            is_system: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorColumn {
    pub column_id: Uuid,
    #[serde(default)]
    pub transformer_id: Option<Uuid>,
    #[serde(default)]
    pub token_access_policy_id: Option<Uuid>,
}

impl AccessorColumn {
    pub fn new(column_id: Uuid) -> Self {
        Self {
            column_id,
            transformer_id: None,
            token_access_policy_id: None,
        }
    }

    pub fn with_transformer(mut self, transformer_id: Uuid) -> Self {
        self.transformer_id = Some(transformer_id);
        self
    }
}

/// Governed read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessor {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub data_life_cycle_state: DataLifeCycleState,
    pub selector: Selector,
    pub columns: Vec<AccessorColumn>,
    pub purpose_ids: Vec<Uuid>,
    pub access_policy_id: Uuid,
    #[serde(default)]
    pub are_column_access_policies_overridden: bool,
    #[serde(default)]
    pub use_search_index: bool,
}

impl Accessor {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GovError::Validation("accessor name must be set".into()));
        }
        if self.columns.is_empty() {
            return Err(GovError::Validation(format!(
                "accessor '{}' must select at least one column",
                self.name
            )));
        }
        if self.purpose_ids.is_empty() {
            return Err(GovError::Validation(format!(
                "accessor '{}' must name at least one purpose",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.column_id) {
                return Err(GovError::Validation(format!(
                    "accessor '{}' selects column {} twice",
                    self.name, column.column_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatorColumn {
    pub column_id: Uuid,
    pub normalizer_id: Uuid,
}

/// Governed write API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutator {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub selector: Selector,
    pub columns: Vec<MutatorColumn>,
    pub access_policy_id: Uuid,
}

impl Mutator {
    /// A mutator can seed a new user only if it targets exactly one user by id.
    pub fn usable_for_create(&self) -> bool {
        self.selector.is_single_id_lookup()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GovError::Validation("mutator name must be set".into()));
        }
        if self.columns.is_empty() {
            return Err(GovError::Validation(format!(
                "mutator '{}' must write at least one column",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.column_id) {
                return Err(GovError::Validation(format!(
                    "mutator '{}' writes column {} twice",
                    self.name, column.column_id
                )));
            }
        }
        Ok(())
    }
}
