use crate::error::{GovError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

pub const ALLOW_ALL_POLICY_ID: Uuid = Uuid::from_u128(0x3f38_0e42_0c6b_4a95_b1b6_7e6f_2d4c_0001);
pub const DENY_ALL_POLICY_ID: Uuid = Uuid::from_u128(0x3f38_0e42_0c6b_4a95_b1b6_7e6f_2d4c_0002);
pub const GLOBAL_ACCESSOR_POLICY_ID: Uuid =
    Uuid::from_u128(0x3f38_0e42_0c6b_4a95_b1b6_7e6f_2d4c_0003);
pub const GLOBAL_MUTATOR_POLICY_ID: Uuid =
    Uuid::from_u128(0x3f38_0e42_0c6b_4a95_b1b6_7e6f_2d4c_0004);

/// Boolean rule evaluated against a [`PolicyContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyRule {
    AllowAll,
    DenyAll,
    /// Client-supplied context key must equal `value`.
    ClientContextEquals { key: String, value: JsonValue },
    /// User profile column must equal `value`, or contain it for array columns.
    UserColumnEquals { column: String, value: JsonValue },
    /// Every accessor purpose name must be in `purposes`.
    PurposesWithin { purposes: Vec<String> },
    And(Vec<PolicyRule>),
    Or(Vec<PolicyRule>),
    Not(Box<PolicyRule>),
}

impl PolicyRule {
    pub fn is_allow_all(&self) -> bool {
        matches!(self, PolicyRule::AllowAll)
    }

    fn evaluate(&self, ctx: &PolicyContext, console: &mut Vec<String>) -> bool {
        match self {
            PolicyRule::AllowAll => true,
            PolicyRule::DenyAll => {
                console.push("deny all".into());
                false
            }
            PolicyRule::ClientContextEquals { key, value } => {
                let ok = ctx.client.get(key) == Some(value);
                if !ok {
                    console.push(format!("client context '{key}' does not match"));
                }
                ok
            }
            PolicyRule::UserColumnEquals { column, value } => {
                let ok = match ctx.user.as_ref().and_then(|u| u.get(column)) {
                    Some(JsonValue::Array(items)) => items.contains(value),
                    Some(found) => found == value,
                    None => false,
                };
                if !ok {
                    console.push(format!("user column '{column}' does not match"));
                }
                ok
            }
            PolicyRule::PurposesWithin { purposes } => {
                let ok = ctx.purposes.iter().all(|p| {
                    purposes.iter().any(|allowed| allowed.eq_ignore_ascii_case(p))
                });
                if !ok {
                    console.push("purpose not permitted".into());
                }
                ok
            }
            PolicyRule::And(rules) => rules.iter().all(|r| r.evaluate(ctx, console)),
            PolicyRule::Or(rules) => rules.iter().any(|r| r.evaluate(ctx, console)),
            PolicyRule::Not(inner) => {
                let mut scratch = Vec::new();
                !inner.evaluate(ctx, &mut scratch)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    #[serde(default)]
    pub max_executions: Option<u32>,
    #[serde(default)]
    pub max_execution_window_secs: u64,
    #[serde(default)]
    pub announce_max_execution_failure: bool,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub announce_max_result_failure: bool,
}

impl PolicyThresholds {
    pub fn with_rate_limit(mut self, max_executions: u32, window_secs: u64, announce: bool) -> Self {
        self.max_executions = Some(max_executions);
        self.max_execution_window_secs = window_secs;
        self.announce_max_execution_failure = announce;
        self
    }

    pub fn with_result_limit(mut self, max_results: usize, announce: bool) -> Self {
        self.max_results = Some(max_results);
        self.announce_max_result_failure = announce;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub rule: PolicyRule,
    #[serde(default)]
    pub thresholds: PolicyThresholds,
}

impl AccessPolicy {
    pub fn new(name: &str, rule: PolicyRule) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version: 0,
            rule,
            thresholds: PolicyThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PolicyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn allow_all() -> Self {
        Self {
            id: ALLOW_ALL_POLICY_ID,
            ..Self::new("AllowAll", PolicyRule::AllowAll)
        }
    }

    pub fn deny_all() -> Self {
        Self {
            id: DENY_ALL_POLICY_ID,
            ..Self::new("DenyAll", PolicyRule::DenyAll)
        }
    }

    pub fn is_allow_all(&self) -> bool {
        self.id == ALLOW_ALL_POLICY_ID || self.rule.is_allow_all()
    }

    /// AND of `components`, carrying the identity and thresholds of `primary`.
    pub fn composite_and(primary: &AccessPolicy, components: Vec<AccessPolicy>) -> AccessPolicy {
        let rules: Vec<PolicyRule> = components
            .into_iter()
            .filter(|p| !p.is_allow_all())
            .map(|p| p.rule)
            .collect();
        let rule = match rules.len() {
            0 => PolicyRule::AllowAll,
            _ => PolicyRule::And(rules),
        };
        AccessPolicy {
            id: primary.id,
            name: format!("composite({})", primary.name),
            version: primary.version,
            rule,
            thresholds: primary.thresholds.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Read,
    Write,
}

/// Row-scoped input to a policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub action: PolicyAction,
    pub client: Map<String, JsonValue>,
    pub purposes: Vec<String>,
    #[serde(default)]
    pub user: Option<Map<String, JsonValue>>,
}

impl PolicyContext {
    pub fn new(action: PolicyAction, client: Map<String, JsonValue>, purposes: Vec<String>) -> Self {
        Self {
            action,
            client,
            purposes,
            user: None,
        }
    }

    pub fn for_user(&self, profile: Map<String, JsonValue>) -> Self {
        Self {
            user: Some(profile),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub console: String,
}

/// Evaluates access policies and owns their rate-threshold counters.
pub trait AccessPolicyEvaluator: Send + Sync {
    fn evaluate(&self, policy: &AccessPolicy, ctx: &PolicyContext) -> Result<PolicyDecision>;

    /// Records one execution of `resource_id` under `policy` and reports whether
    /// it stays within the policy's rate threshold.
    fn check_rate_threshold(
        &self,
        policy: &AccessPolicy,
        resource_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// In-process evaluator for [`PolicyRule`] trees with sliding-window rate counters.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    executions: Mutex<HashMap<(Uuid, Uuid), VecDeque<DateTime<Utc>>>>,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccessPolicyEvaluator for RuleEvaluator {
    fn evaluate(&self, policy: &AccessPolicy, ctx: &PolicyContext) -> Result<PolicyDecision> {
        let mut console = Vec::new();
        let allowed = policy.rule.evaluate(ctx, &mut console);
        Ok(PolicyDecision {
            allowed,
            console: console.join("; "),
        })
    }

    fn check_rate_threshold(
        &self,
        policy: &AccessPolicy,
        resource_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(max) = policy.thresholds.max_executions else {
            return Ok(true);
        };
        let window_secs = i64::try_from(policy.thresholds.max_execution_window_secs)
            .map_err(|_| GovError::invalid_config("rate threshold window is too large"))?;
        let cutoff = now - Duration::seconds(window_secs);

        let mut executions = self.executions.lock();
        let window = executions.entry((policy.id, resource_id)).or_default();
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        if window.len() >= max as usize {
            return Ok(false);
        }
        window.push_back(now);
        Ok(true)
    }
}
