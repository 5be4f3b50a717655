pub mod schema;
pub mod types;

use crate::catalog::schema::{Accessor, Column, DataType, Mutator, Purpose};
use crate::error::{GovError, ResourceType, Result};
use crate::policy::{
    ALLOW_ALL_POLICY_ID, AccessPolicy, DENY_ALL_POLICY_ID, GLOBAL_ACCESSOR_POLICY_ID,
    GLOBAL_MUTATOR_POLICY_ID, PolicyRule,
};
use crate::retention::RetentionDurationOverride;
use crate::transform::{PASSTHROUGH_TRANSFORMER_ID, Transformer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// What a lookup does when a referenced id is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingReference {
    #[default]
    Fail,
    /// Drop the reference; used on best-effort display paths.
    Skip,
}

/// Columns, purposes and data types of one tenant, indexed by id and by
/// lower-cased name. Built once per execution.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    columns: Vec<Column>,
    column_by_id: HashMap<Uuid, usize>,
    column_by_name: HashMap<String, usize>,
    purposes: HashMap<Uuid, Purpose>,
    purpose_by_name: HashMap<String, Uuid>,
    data_types: HashMap<Uuid, DataType>,
}

impl Registry {
    pub fn load(store: &dyn ConfigStore) -> Result<Self> {
        Ok(Self::from_parts(
            store.list_columns()?,
            store.list_purposes()?,
            store.list_data_types()?,
        ))
    }

    pub fn from_parts(columns: Vec<Column>, purposes: Vec<Purpose>, data_types: Vec<DataType>) -> Self {
        let column_by_id = columns.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let column_by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_lowercase(), i))
            .collect();
        let purpose_by_name = purposes
            .iter()
            .map(|p| (p.name.to_lowercase(), p.id))
            .collect();
        Self {
            columns,
            column_by_id,
            column_by_name,
            purposes: purposes.into_iter().map(|p| (p.id, p)).collect(),
            purpose_by_name,
            data_types: data_types.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    /// Every column, system columns first.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn find_column(&self, id: Uuid) -> Option<&Column> {
        self.column_by_id.get(&id).map(|&i| &self.columns[i])
    }

    pub fn find_column_by_name(&self, name: &str) -> Option<&Column> {
        self.column_by_name
            .get(&name.to_lowercase())
            .map(|&i| &self.columns[i])
    }

    pub fn column(&self, id: Uuid) -> Result<&Column> {
        self.find_column(id)
            .ok_or_else(|| GovError::not_found(ResourceType::Column, id))
    }

    pub fn column_by_name(&self, name: &str) -> Result<&Column> {
        self.find_column_by_name(name)
            .ok_or_else(|| GovError::not_found(ResourceType::Column, name))
    }

    pub fn purpose(&self, id: Uuid) -> Result<&Purpose> {
        self.purposes
            .get(&id)
            .ok_or_else(|| GovError::not_found(ResourceType::Purpose, id))
    }

    pub fn find_purpose_by_name(&self, name: &str) -> Option<&Purpose> {
        self.purpose_by_name
            .get(&name.to_lowercase())
            .and_then(|id| self.purposes.get(id))
    }

    /// Resolves a purpose given either its id or its name.
    pub fn resolve_purpose(&self, reference: &str) -> Result<&Purpose> {
        let by_id = Uuid::parse_str(reference)
            .ok()
            .and_then(|id| self.purposes.get(&id));
        by_id
            .or_else(|| self.find_purpose_by_name(reference))
            .ok_or_else(|| GovError::invalid_config(format!("purpose '{reference}' not found")))
    }

    /// Resolves configuration references to columns. Unknown ids are a
    /// configuration error unless `missing` is [`MissingReference::Skip`].
    pub fn resolve_columns(&self, ids: &[Uuid], missing: MissingReference) -> Result<Vec<&Column>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match (self.find_column(*id), missing) {
                (Some(column), _) => out.push(column),
                (None, MissingReference::Skip) => debug!(column_id = %id, "skipping unknown column"),
                (None, MissingReference::Fail) => {
                    return Err(GovError::invalid_config(format!("column '{id}' not found")));
                }
            }
        }
        Ok(out)
    }

    pub fn resolve_purposes(&self, ids: &[Uuid], missing: MissingReference) -> Result<Vec<&Purpose>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match (self.purposes.get(id), missing) {
                (Some(purpose), _) => out.push(purpose),
                (None, MissingReference::Skip) => debug!(purpose_id = %id, "skipping unknown purpose"),
                (None, MissingReference::Fail) => {
                    return Err(GovError::invalid_config(format!("purpose '{id}' not found")));
                }
            }
        }
        Ok(out)
    }

    pub fn data_type(&self, id: Uuid) -> Result<&DataType> {
        self.data_types
            .get(&id)
            .ok_or_else(|| GovError::not_found(ResourceType::DataType, id))
    }

    pub fn column_data_type(&self, column: &Column) -> Result<&DataType> {
        self.data_types.get(&column.data_type_id).ok_or_else(|| {
            GovError::invalid_config(format!(
                "data type '{}' of column '{}' not found",
                column.data_type_id, column.name
            ))
        })
    }
}

/// Read side of tenant configuration.
///
/// Accessors, mutators and access policies are versioned; `version: None`
/// returns the latest one.
pub trait ConfigStore: Send + Sync {
    fn list_columns(&self) -> Result<Vec<Column>>;

    fn list_purposes(&self) -> Result<Vec<Purpose>>;

    fn list_data_types(&self) -> Result<Vec<DataType>>;

    fn list_retention_durations(&self) -> Result<Vec<RetentionDurationOverride>>;

    fn accessor(&self, id: Uuid, version: Option<u32>) -> Result<Option<Accessor>>;

    fn mutator(&self, id: Uuid, version: Option<u32>) -> Result<Option<Mutator>>;

    fn access_policy(&self, id: Uuid, version: Option<u32>) -> Result<Option<AccessPolicy>>;

    fn transformer(&self, id: Uuid) -> Result<Option<Transformer>>;
}

/// Administrative change to tenant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigOperation {
    CreateDataType { data_type: DataType },
    DeleteDataType { data_type_id: Uuid },
    CreateColumn { column: Column },
    UpdateColumn { column: Column },
    DeleteColumn { column_id: Uuid },
    CreatePurpose { purpose: Purpose },
    UpdatePurpose { purpose: Purpose },
    DeletePurpose { purpose_id: Uuid },
    CreateAccessor { accessor: Accessor },
    UpdateAccessor { accessor: Accessor },
    DeleteAccessor { accessor_id: Uuid },
    CreateMutator { mutator: Mutator },
    UpdateMutator { mutator: Mutator },
    DeleteMutator { mutator_id: Uuid },
    CreateAccessPolicy { policy: AccessPolicy },
    UpdateAccessPolicy { policy: AccessPolicy },
    DeleteAccessPolicy { policy_id: Uuid },
    CreateTransformer { transformer: Transformer },
    DeleteTransformer { transformer_id: Uuid },
    PutRetentionDuration { entry: RetentionDurationOverride },
    DeleteRetentionDuration { id: Uuid },
}

#[derive(Debug, Clone, Default)]
struct ConfigState {
    data_types: Vec<DataType>,
    columns: Vec<Column>,
    purposes: Vec<Purpose>,
    accessors: HashMap<Uuid, Vec<Accessor>>,
    mutators: HashMap<Uuid, Vec<Mutator>>,
    access_policies: HashMap<Uuid, Vec<AccessPolicy>>,
    transformers: HashMap<Uuid, Transformer>,
    retention: Vec<RetentionDurationOverride>,
}

/// Versioned configuration held in memory, seeded with the built-in data
/// types, system columns, the operational purpose, built-in policies and the
/// passthrough transformer.
#[derive(Debug)]
pub struct InMemoryConfigStore {
    state: RwLock<ConfigState>,
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        let mut state = ConfigState {
            data_types: DataType::natives(),
            columns: Column::system_columns(),
            purposes: vec![Purpose::operational()],
            ..ConfigState::default()
        };
        let global_accessor = AccessPolicy {
            id: GLOBAL_ACCESSOR_POLICY_ID,
            ..AccessPolicy::new("GlobalAccessorPolicy", PolicyRule::AllowAll)
        };
        let global_mutator = AccessPolicy {
            id: GLOBAL_MUTATOR_POLICY_ID,
            ..AccessPolicy::new("GlobalMutatorPolicy", PolicyRule::AllowAll)
        };
        for mut policy in [
            AccessPolicy::allow_all(),
            AccessPolicy::deny_all(),
            global_accessor,
            global_mutator,
        ] {
            policy.version = 1;
            state.access_policies.insert(policy.id, vec![policy]);
        }
        let passthrough = Transformer::passthrough();
        state.transformers.insert(passthrough.id, passthrough);
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn apply(&self, op: ConfigOperation) -> Result<()> {
        let mut state = self.state.write();
        match op {
            ConfigOperation::CreateDataType { data_type } => state.create_data_type(data_type),
            ConfigOperation::DeleteDataType { data_type_id } => state.delete_data_type(data_type_id),
            ConfigOperation::CreateColumn { column } => state.create_column(column),
            ConfigOperation::UpdateColumn { column } => state.update_column(column),
            ConfigOperation::DeleteColumn { column_id } => state.delete_column(column_id),
            ConfigOperation::CreatePurpose { purpose } => state.create_purpose(purpose),
            ConfigOperation::UpdatePurpose { purpose } => state.update_purpose(purpose),
            ConfigOperation::DeletePurpose { purpose_id } => state.delete_purpose(purpose_id),
            ConfigOperation::CreateAccessor { accessor } => state.put_accessor(accessor, true),
            ConfigOperation::UpdateAccessor { accessor } => state.put_accessor(accessor, false),
            ConfigOperation::DeleteAccessor { accessor_id } => state
                .accessors
                .remove(&accessor_id)
                .map(|_| ())
                .ok_or_else(|| GovError::not_found(ResourceType::Accessor, accessor_id)),
            ConfigOperation::CreateMutator { mutator } => state.put_mutator(mutator, true),
            ConfigOperation::UpdateMutator { mutator } => state.put_mutator(mutator, false),
            ConfigOperation::DeleteMutator { mutator_id } => state
                .mutators
                .remove(&mutator_id)
                .map(|_| ())
                .ok_or_else(|| GovError::not_found(ResourceType::Mutator, mutator_id)),
            ConfigOperation::CreateAccessPolicy { policy } => state.put_access_policy(policy, true),
            ConfigOperation::UpdateAccessPolicy { policy } => state.put_access_policy(policy, false),
            ConfigOperation::DeleteAccessPolicy { policy_id } => state.delete_access_policy(policy_id),
            ConfigOperation::CreateTransformer { transformer } => {
                if state.transformers.contains_key(&transformer.id)
                    || state
                        .transformers
                        .values()
                        .any(|t| t.name.eq_ignore_ascii_case(&transformer.name))
                {
                    return Err(already_exists(ResourceType::Transformer, &transformer.name));
                }
                state.transformers.insert(transformer.id, transformer);
                Ok(())
            }
            ConfigOperation::DeleteTransformer { transformer_id } => {
                state.delete_transformer(transformer_id)
            }
            ConfigOperation::PutRetentionDuration { entry } => {
                entry.validate()?;
                state.retention.retain(|e| {
                    (e.state, e.column_id, e.purpose_id)
                        != (entry.state, entry.column_id, entry.purpose_id)
                });
                state.retention.push(entry);
                Ok(())
            }
            ConfigOperation::DeleteRetentionDuration { id } => {
                let before = state.retention.len();
                state.retention.retain(|e| e.id != id);
                if state.retention.len() == before {
                    return Err(GovError::not_found(ResourceType::RetentionDuration, id));
                }
                Ok(())
            }
        }
    }

    pub fn create_data_type(&self, data_type: DataType) -> Result<()> {
        self.apply(ConfigOperation::CreateDataType { data_type })
    }

    pub fn create_column(&self, column: Column) -> Result<()> {
        self.apply(ConfigOperation::CreateColumn { column })
    }

    pub fn create_purpose(&self, purpose: Purpose) -> Result<()> {
        self.apply(ConfigOperation::CreatePurpose { purpose })
    }

    pub fn delete_purpose(&self, purpose_id: Uuid) -> Result<()> {
        self.apply(ConfigOperation::DeletePurpose { purpose_id })
    }

    pub fn create_accessor(&self, accessor: Accessor) -> Result<()> {
        self.apply(ConfigOperation::CreateAccessor { accessor })
    }

    pub fn update_accessor(&self, accessor: Accessor) -> Result<()> {
        self.apply(ConfigOperation::UpdateAccessor { accessor })
    }

    pub fn create_mutator(&self, mutator: Mutator) -> Result<()> {
        self.apply(ConfigOperation::CreateMutator { mutator })
    }

    pub fn create_access_policy(&self, policy: AccessPolicy) -> Result<()> {
        self.apply(ConfigOperation::CreateAccessPolicy { policy })
    }

    pub fn update_access_policy(&self, policy: AccessPolicy) -> Result<()> {
        self.apply(ConfigOperation::UpdateAccessPolicy { policy })
    }

    pub fn create_transformer(&self, transformer: Transformer) -> Result<()> {
        self.apply(ConfigOperation::CreateTransformer { transformer })
    }

    pub fn put_retention_duration(&self, entry: RetentionDurationOverride) -> Result<()> {
        self.apply(ConfigOperation::PutRetentionDuration { entry })
    }
}

fn already_exists(resource_type: ResourceType, id: impl ToString) -> GovError {
    GovError::AlreadyExists {
        resource_type,
        resource_id: id.to_string(),
    }
}

fn is_builtin_policy(id: Uuid) -> bool {
    [
        ALLOW_ALL_POLICY_ID,
        DENY_ALL_POLICY_ID,
        GLOBAL_ACCESSOR_POLICY_ID,
        GLOBAL_MUTATOR_POLICY_ID,
    ]
    .contains(&id)
}

impl ConfigState {
    fn data_type(&self, id: Uuid) -> Result<&DataType> {
        self.data_types
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| GovError::invalid_config(format!("data type '{id}' not found")))
    }

    fn latest_accessors(&self) -> impl Iterator<Item = &Accessor> {
        self.accessors.values().filter_map(|v| v.last())
    }

    fn latest_mutators(&self) -> impl Iterator<Item = &Mutator> {
        self.mutators.values().filter_map(|v| v.last())
    }

    fn require_policy(&self, id: Uuid) -> Result<()> {
        if self.access_policies.contains_key(&id) {
            Ok(())
        } else {
            Err(GovError::invalid_config(format!("access policy '{id}' not found")))
        }
    }

    fn require_transformer(&self, id: Uuid) -> Result<()> {
        if self.transformers.contains_key(&id) {
            Ok(())
        } else {
            Err(GovError::invalid_config(format!("transformer '{id}' not found")))
        }
    }

    fn create_data_type(&mut self, data_type: DataType) -> Result<()> {
        data_type.validate()?;
        if self
            .data_types
            .iter()
            .any(|d| d.id == data_type.id || d.name.eq_ignore_ascii_case(&data_type.name))
        {
            return Err(already_exists(ResourceType::DataType, &data_type.name));
        }
        self.data_types.push(data_type);
        Ok(())
    }

    fn delete_data_type(&mut self, id: Uuid) -> Result<()> {
        if self.columns.iter().any(|c| c.data_type_id == id) {
            return Err(GovError::Conflict(format!(
                "data type '{id}' is used by a column"
            )));
        }
        let before = self.data_types.len();
        self.data_types.retain(|d| d.id != id);
        if self.data_types.len() == before {
            return Err(GovError::not_found(ResourceType::DataType, id));
        }
        Ok(())
    }

    fn check_column(&self, column: &Column) -> Result<()> {
        column.validate(self.data_type(column.data_type_id)?)?;
        if let Some(policy) = column.access_policy_id {
            self.require_policy(policy)?;
        }
        if let Some(policy) = column.default_token_access_policy_id {
            self.require_policy(policy)?;
        }
        if let Some(transformer) = column.default_transformer_id {
            self.require_transformer(transformer)?;
        }
        if self
            .columns
            .iter()
            .any(|c| c.id != column.id && c.name.eq_ignore_ascii_case(&column.name))
        {
            return Err(already_exists(ResourceType::Column, &column.name));
        }
        Ok(())
    }

    fn create_column(&mut self, column: Column) -> Result<()> {
        if column.is_system() {
            return Err(GovError::Validation("system columns cannot be created".into()));
        }
        if self.columns.iter().any(|c| c.id == column.id) {
            return Err(already_exists(ResourceType::Column, column.id));
        }
        self.check_column(&column)?;
        self.columns.push(column);
        Ok(())
    }

    fn update_column(&mut self, column: Column) -> Result<()> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.id == column.id)
            .ok_or_else(|| GovError::not_found(ResourceType::Column, column.id))?;
        let existing = &self.columns[idx];
        if existing.is_system() || column.is_system() {
            return Err(GovError::Validation("system columns cannot be changed".into()));
        }
        if existing.data_type_id != column.data_type_id || existing.is_array != column.is_array {
            return Err(GovError::Validation(format!(
                "column '{}': data type and array flag cannot change",
                existing.name
            )));
        }
        self.check_column(&column)?;
        self.columns[idx] = column;
        Ok(())
    }

    fn delete_column(&mut self, column_id: Uuid) -> Result<()> {
        let column = self
            .columns
            .iter()
            .find(|c| c.id == column_id)
            .ok_or_else(|| GovError::not_found(ResourceType::Column, column_id))?;
        if column.is_system() {
            return Err(GovError::Validation("system columns cannot be deleted".into()));
        }
        let in_accessor = self
            .latest_accessors()
            .any(|a| a.columns.iter().any(|c| c.column_id == column_id));
        let in_mutator = self
            .latest_mutators()
            .any(|m| m.columns.iter().any(|c| c.column_id == column_id));
        if in_accessor || in_mutator {
            return Err(GovError::Conflict(format!(
                "column '{}' is referenced by an accessor or mutator",
                column.name
            )));
        }
        self.columns.retain(|c| c.id != column_id);
        self.retention.retain(|e| e.column_id != Some(column_id));
        Ok(())
    }

    fn create_purpose(&mut self, purpose: Purpose) -> Result<()> {
        if purpose.name.trim().is_empty() {
            return Err(GovError::Validation("purpose name must be set".into()));
        }
        if purpose.is_system {
            return Err(GovError::Validation("system purposes cannot be created".into()));
        }
        if self
            .purposes
            .iter()
            .any(|p| p.id == purpose.id || p.name.eq_ignore_ascii_case(&purpose.name))
        {
            return Err(already_exists(ResourceType::Purpose, &purpose.name));
        }
        self.purposes.push(purpose);
        Ok(())
    }

    fn update_purpose(&mut self, purpose: Purpose) -> Result<()> {
        if self
            .purposes
            .iter()
            .any(|p| p.id != purpose.id && p.name.eq_ignore_ascii_case(&purpose.name))
        {
            return Err(already_exists(ResourceType::Purpose, &purpose.name));
        }
        let existing = self
            .purposes
            .iter_mut()
            .find(|p| p.id == purpose.id)
            .ok_or_else(|| GovError::not_found(ResourceType::Purpose, purpose.id))?;
        if existing.is_system {
            return Err(GovError::Validation("system purposes cannot be changed".into()));
        }
        existing.name = purpose.name;
        existing.description = purpose.description;
        Ok(())
    }

    fn delete_purpose(&mut self, purpose_id: Uuid) -> Result<()> {
        let purpose = self
            .purposes
            .iter()
            .find(|p| p.id == purpose_id)
            .ok_or_else(|| GovError::not_found(ResourceType::Purpose, purpose_id))?;
        if purpose.is_system {
            return Err(GovError::Validation(format!(
                "system purpose '{}' cannot be deleted",
                purpose.name
            )));
        }
        if self
            .latest_accessors()
            .any(|a| a.purpose_ids.contains(&purpose_id))
        {
            return Err(GovError::Conflict(format!(
                "purpose '{}' is referenced by an accessor",
                purpose.name
            )));
        }
        self.purposes.retain(|p| p.id != purpose_id);
        self.retention.retain(|e| e.purpose_id != Some(purpose_id));
        Ok(())
    }

    fn put_accessor(&mut self, mut accessor: Accessor, create: bool) -> Result<()> {
        accessor.validate()?;
        for column in &accessor.columns {
            if !self.columns.iter().any(|c| c.id == column.column_id) {
                return Err(GovError::invalid_config(format!(
                    "column '{}' not found",
                    column.column_id
                )));
            }
            if let Some(transformer) = column.transformer_id {
                self.require_transformer(transformer)?;
            }
            if let Some(policy) = column.token_access_policy_id {
                self.require_policy(policy)?;
            }
        }
        for purpose in &accessor.purpose_ids {
            if !self.purposes.iter().any(|p| p.id == *purpose) {
                return Err(GovError::invalid_config(format!("purpose '{purpose}' not found")));
            }
        }
        self.require_policy(accessor.access_policy_id)?;
        if self
            .latest_accessors()
            .any(|a| a.id != accessor.id && a.name.eq_ignore_ascii_case(&accessor.name))
        {
            return Err(already_exists(ResourceType::Accessor, &accessor.name));
        }
        let latest = self.accessors.get(&accessor.id).and_then(|v| v.last()).map(|a| a.version);
        match (create, latest) {
            (true, Some(_)) => return Err(already_exists(ResourceType::Accessor, accessor.id)),
            (false, None) => return Err(GovError::not_found(ResourceType::Accessor, accessor.id)),
            (_, latest) => accessor.version = latest.map_or(1, |v| v + 1),
        }
        debug!(accessor = %accessor.name, version = accessor.version, "stored accessor");
        self.accessors.entry(accessor.id).or_default().push(accessor);
        Ok(())
    }

    fn put_mutator(&mut self, mut mutator: Mutator, create: bool) -> Result<()> {
        mutator.validate()?;
        for column in &mutator.columns {
            let found = self
                .columns
                .iter()
                .find(|c| c.id == column.column_id)
                .ok_or_else(|| {
                    GovError::invalid_config(format!("column '{}' not found", column.column_id))
                })?;
            if found.is_system() {
                return Err(GovError::Validation(format!(
                    "mutator cannot write system column '{}'",
                    found.name
                )));
            }
            self.require_transformer(column.normalizer_id)?;
        }
        self.require_policy(mutator.access_policy_id)?;
        if self
            .latest_mutators()
            .any(|m| m.id != mutator.id && m.name.eq_ignore_ascii_case(&mutator.name))
        {
            return Err(already_exists(ResourceType::Mutator, &mutator.name));
        }
        let latest = self.mutators.get(&mutator.id).and_then(|v| v.last()).map(|m| m.version);
        match (create, latest) {
            (true, Some(_)) => return Err(already_exists(ResourceType::Mutator, mutator.id)),
            (false, None) => return Err(GovError::not_found(ResourceType::Mutator, mutator.id)),
            (_, latest) => mutator.version = latest.map_or(1, |v| v + 1),
        }
        debug!(mutator = %mutator.name, version = mutator.version, "stored mutator");
        self.mutators.entry(mutator.id).or_default().push(mutator);
        Ok(())
    }

    fn put_access_policy(&mut self, mut policy: AccessPolicy, create: bool) -> Result<()> {
        if policy.name.trim().is_empty() {
            return Err(GovError::Validation("access policy name must be set".into()));
        }
        if !create && [ALLOW_ALL_POLICY_ID, DENY_ALL_POLICY_ID].contains(&policy.id) {
            return Err(GovError::Validation(format!(
                "built-in access policy '{}' cannot be changed",
                policy.name
            )));
        }
        let latest = self.access_policies.get(&policy.id).and_then(|v| v.last()).map(|p| p.version);
        match (create, latest) {
            (true, Some(_)) => return Err(already_exists(ResourceType::AccessPolicy, policy.id)),
            (false, None) => {
                return Err(GovError::not_found(ResourceType::AccessPolicy, policy.id));
            }
            (_, latest) => policy.version = latest.map_or(1, |v| v + 1),
        }
        self.access_policies.entry(policy.id).or_default().push(policy);
        Ok(())
    }

    fn delete_access_policy(&mut self, policy_id: Uuid) -> Result<()> {
        if is_builtin_policy(policy_id) {
            return Err(GovError::Validation("built-in access policies cannot be deleted".into()));
        }
        let referenced = self.latest_accessors().any(|a| a.access_policy_id == policy_id)
            || self.latest_mutators().any(|m| m.access_policy_id == policy_id)
            || self.columns.iter().any(|c| c.access_policy_id == Some(policy_id));
        if referenced {
            return Err(GovError::Conflict(format!(
                "access policy '{policy_id}' is still referenced"
            )));
        }
        self.access_policies
            .remove(&policy_id)
            .map(|_| ())
            .ok_or_else(|| GovError::not_found(ResourceType::AccessPolicy, policy_id))
    }

    fn delete_transformer(&mut self, transformer_id: Uuid) -> Result<()> {
        if transformer_id == PASSTHROUGH_TRANSFORMER_ID {
            return Err(GovError::Validation("the passthrough transformer cannot be deleted".into()));
        }
        let referenced = self
            .latest_mutators()
            .any(|m| m.columns.iter().any(|c| c.normalizer_id == transformer_id))
            || self.latest_accessors().any(|a| {
                a.columns
                    .iter()
                    .any(|c| c.transformer_id == Some(transformer_id))
            })
            || self
                .columns
                .iter()
                .any(|c| c.default_transformer_id == Some(transformer_id));
        if referenced {
            return Err(GovError::Conflict(format!(
                "transformer '{transformer_id}' is still referenced"
            )));
        }
        self.transformers
            .remove(&transformer_id)
            .map(|_| ())
            .ok_or_else(|| GovError::not_found(ResourceType::Transformer, transformer_id))
    }
}

fn pick_version<T: Clone>(versions: Option<&Vec<T>>, version: Option<u32>, of: impl Fn(&T) -> u32) -> Option<T> {
    let versions = versions?;
    match version {
        None => versions.last().cloned(),
        Some(v) => versions.iter().find(|x| of(x) == v).cloned(),
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn list_columns(&self) -> Result<Vec<Column>> {
        Ok(self.state.read().columns.clone())
    }

    fn list_purposes(&self) -> Result<Vec<Purpose>> {
        Ok(self.state.read().purposes.clone())
    }

    fn list_data_types(&self) -> Result<Vec<DataType>> {
        Ok(self.state.read().data_types.clone())
    }

    fn list_retention_durations(&self) -> Result<Vec<RetentionDurationOverride>> {
        Ok(self.state.read().retention.clone())
    }

    fn accessor(&self, id: Uuid, version: Option<u32>) -> Result<Option<Accessor>> {
        Ok(pick_version(self.state.read().accessors.get(&id), version, |a| a.version))
    }

    fn mutator(&self, id: Uuid, version: Option<u32>) -> Result<Option<Mutator>> {
        Ok(pick_version(self.state.read().mutators.get(&id), version, |m| m.version))
    }

    fn access_policy(&self, id: Uuid, version: Option<u32>) -> Result<Option<AccessPolicy>> {
        Ok(pick_version(
            self.state.read().access_policies.get(&id),
            version,
            |p| p.version,
        ))
    }

    fn transformer(&self, id: Uuid) -> Result<Option<Transformer>> {
        Ok(self.state.read().transformers.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{AccessorColumn, OPERATIONAL_PURPOSE_ID, STRING_TYPE_ID};
    use crate::query::plan::Selector;
    use crate::retention::{DataLifeCycleState, RetentionDuration};

    fn accessor(column: &Column, purpose: &Purpose) -> Accessor {
        Accessor {
            id: Uuid::new_v4(),
            name: "profile_reader".into(),
            version: 0,
            data_life_cycle_state: DataLifeCycleState::Live,
            selector: Selector::All,
            columns: vec![AccessorColumn::new(column.id)],
            purpose_ids: vec![purpose.id],
            access_policy_id: ALLOW_ALL_POLICY_ID,
            are_column_access_policies_overridden: false,
            use_search_index: false,
        }
    }

    #[test]
    fn registry_lookups_are_case_insensitive() {
        let store = InMemoryConfigStore::new();
        store
            .create_column(Column::new("Email", STRING_TYPE_ID, false))
            .expect("column");
        store.create_purpose(Purpose::new("Marketing")).expect("purpose");

        let registry = Registry::load(&store).expect("registry");
        assert_eq!(registry.column_by_name("email").expect("email").name, "Email");
        assert!(registry.find_column_by_name("id").is_some_and(Column::is_system));
        let marketing = registry.resolve_purpose("MARKETING").expect("by name");
        assert_eq!(
            registry
                .resolve_purpose(&marketing.id.to_string())
                .expect("by id")
                .name,
            "Marketing"
        );
        assert_eq!(registry.column_by_name("nope").expect_err("missing").status(), 404);
    }

    #[test]
    fn missing_references_fail_or_skip() {
        let registry = Registry::load(&InMemoryConfigStore::new()).expect("registry");
        let ids = [OPERATIONAL_PURPOSE_ID, Uuid::new_v4()];
        assert_eq!(
            registry
                .resolve_purposes(&ids, MissingReference::Fail)
                .expect_err("fail")
                .status(),
            400
        );
        assert_eq!(
            registry
                .resolve_purposes(&ids, MissingReference::Skip)
                .expect("skip")
                .len(),
            1
        );
    }

    #[test]
    fn names_are_unique_case_insensitively() {
        let store = InMemoryConfigStore::new();
        store
            .create_column(Column::new("nickname", STRING_TYPE_ID, false))
            .expect("first");
        let err = store
            .create_column(Column::new("NickName", STRING_TYPE_ID, false))
            .expect_err("duplicate");
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn accessors_are_versioned() {
        let store = InMemoryConfigStore::new();
        let column = Column::new("nickname", STRING_TYPE_ID, false);
        store.create_column(column.clone()).expect("column");
        let mut reader = accessor(&column, &Purpose::operational());
        store.create_accessor(reader.clone()).expect("create");
        reader.use_search_index = true;
        store.update_accessor(reader.clone()).expect("update");

        let latest = store.accessor(reader.id, None).expect("read").expect("latest");
        assert_eq!(latest.version, 2);
        assert!(latest.use_search_index);
        let first = store.accessor(reader.id, Some(1)).expect("read").expect("v1");
        assert!(!first.use_search_index);
        assert!(store.accessor(reader.id, Some(9)).expect("read").is_none());
    }

    #[test]
    fn purpose_deletion_rules() {
        let store = InMemoryConfigStore::new();
        assert_eq!(
            store
                .delete_purpose(OPERATIONAL_PURPOSE_ID)
                .expect_err("system")
                .status(),
            400
        );

        let column = Column::new("nickname", STRING_TYPE_ID, false);
        store.create_column(column.clone()).expect("column");
        let marketing = Purpose::new("marketing");
        store.create_purpose(marketing.clone()).expect("purpose");
        store
            .put_retention_duration(RetentionDurationOverride {
                id: Uuid::new_v4(),
                state: DataLifeCycleState::Live,
                column_id: None,
                purpose_id: Some(marketing.id),
                duration: RetentionDuration::days(30),
            })
            .expect("override");
        let reader = accessor(&column, &marketing);
        store.create_accessor(reader.clone()).expect("accessor");
        assert_eq!(
            store.delete_purpose(marketing.id).expect_err("referenced").status(),
            409
        );

        store
            .apply(ConfigOperation::DeleteAccessor {
                accessor_id: reader.id,
            })
            .expect("delete accessor");
        store.delete_purpose(marketing.id).expect("delete purpose");
        assert!(store.list_retention_durations().expect("list").is_empty());
    }

    #[test]
    fn retention_overrides_replace_same_key() {
        let store = InMemoryConfigStore::new();
        for days in [10, 20] {
            store
                .put_retention_duration(RetentionDurationOverride {
                    id: Uuid::new_v4(),
                    state: DataLifeCycleState::SoftDeleted,
                    column_id: None,
                    purpose_id: None,
                    duration: RetentionDuration::days(days),
                })
                .expect("put");
        }
        let entries = store.list_retention_durations().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].duration, RetentionDuration::days(20));
    }
}
