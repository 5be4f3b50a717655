use chrono::{DateTime, Duration, Utc};
use consentdb::GovernanceEngine;
use consentdb::catalog::InMemoryConfigStore;
use consentdb::catalog::schema::{
    Column, ColumnConstraints, Mutator, MutatorColumn, Purpose, STRING_TYPE_ID,
};
use consentdb::commit::{CreateUserRequest, MutatorRequest};
use consentdb::config::EngineConfig;
use consentdb::error::GovError;
use consentdb::mutation::{RequestValueSet, ValueAndPurposes};
use consentdb::policy::{
    ALLOW_ALL_POLICY_ID, DENY_ALL_POLICY_ID, AccessPolicy, PolicyRule, PolicyThresholds,
};
use consentdb::query::Selector;
use consentdb::retention::{
    DataLifeCycleState, RetentionDuration, RetentionDurationOverride, RetentionTimeout,
};
use consentdb::storage::{
    ColumnConsentedValue, MemoryUserStore, NewUser, UserQuery, UserRecord, UserStore,
};
use consentdb::transform::{
    PASSTHROUGH_TRANSFORMER_ID, TransformFunction, TransformType, Transformer,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

struct Tenant {
    config: Arc<InMemoryConfigStore>,
    store: Arc<MemoryUserStore>,
    engine: GovernanceEngine,
    marketing: Purpose,
    support: Purpose,
    nickname: Column,
    roles: Column,
    nickname_mutator: Uuid,
    roles_mutator: Uuid,
}

fn mutator(name: &str, selector: Selector, columns: &[&Column], normalizer: Uuid) -> Mutator {
    Mutator {
        id: Uuid::new_v4(),
        name: name.into(),
        version: 0,
        selector,
        columns: columns
            .iter()
            .map(|c| MutatorColumn {
                column_id: c.id,
                normalizer_id: normalizer,
            })
            .collect(),
        access_policy_id: ALLOW_ALL_POLICY_ID,
    }
}

fn tenant() -> Tenant {
    let config = Arc::new(InMemoryConfigStore::new());
    let marketing = Purpose::new("marketing");
    let support = Purpose::new("support");
    config.create_purpose(marketing.clone()).expect("marketing");
    config.create_purpose(support.clone()).expect("support");
    let nickname = Column::new("nickname", STRING_TYPE_ID, false);
    let roles = Column::new("roles", STRING_TYPE_ID, true).with_constraints(ColumnConstraints {
        partial_updates: true,
        unique_required: true,
        ..ColumnConstraints::default()
    });
    config.create_column(nickname.clone()).expect("nickname");
    config.create_column(roles.clone()).expect("roles");
    config
        .put_retention_duration(RetentionDurationOverride {
            id: Uuid::new_v4(),
            state: DataLifeCycleState::SoftDeleted,
            column_id: None,
            purpose_id: Some(marketing.id),
            duration: RetentionDuration::days(30),
        })
        .expect("marketing shadow retention");

    let nickname_mutator = mutator(
        "set_nickname",
        Selector::by_id(),
        &[&nickname],
        PASSTHROUGH_TRANSFORMER_ID,
    );
    let roles_mutator = mutator("edit_roles", Selector::by_id(), &[&roles], PASSTHROUGH_TRANSFORMER_ID);
    config.create_mutator(nickname_mutator.clone()).expect("nickname mutator");
    config.create_mutator(roles_mutator.clone()).expect("roles mutator");

    let store = Arc::new(MemoryUserStore::new("eu"));
    let engine = GovernanceEngine::open(
        EngineConfig::development().with_primary_region("eu"),
        config.clone(),
        vec![store.clone() as Arc<dyn UserStore>],
    )
    .expect("open");
    Tenant {
        config,
        store,
        engine,
        marketing,
        support,
        nickname,
        roles,
        nickname_mutator: nickname_mutator.id,
        roles_mutator: roles_mutator.id,
    }
}

impl Tenant {
    async fn create(&self, nickname: &str) -> Uuid {
        self.engine
            .create_user_with_mutator(CreateUserRequest {
                user_id: None,
                organization_id: None,
                mutator: MutatorRequest::new(self.nickname_mutator, vec![]).set(
                    "nickname",
                    ValueAndPurposes::value(json!(nickname)).adding_purposes(&["marketing"]),
                ),
            })
            .await
            .expect("create")
            .user_id
    }

    fn user(&self, id: Uuid) -> UserRecord {
        self.store.get_user(id).expect("get").expect("user")
    }

    fn live(&self, id: Uuid, column: &Column) -> Vec<(String, BTreeSet<Uuid>)> {
        self.user(id)
            .values_for(DataLifeCycleState::Live, column.id)
            .iter()
            .map(|v| (v.value.to_plain_string(), v.purpose_ids()))
            .collect()
    }

    fn soft(&self, id: Uuid, column: &Column) -> Vec<(String, BTreeSet<Uuid>)> {
        self.user(id)
            .values_for(DataLifeCycleState::SoftDeleted, column.id)
            .iter()
            .map(|v| (v.value.to_plain_string(), v.purpose_ids()))
            .collect()
    }
}

#[tokio::test]
async fn replacing_a_scalar_carries_shared_purposes_forward() {
    let t = tenant();
    let user = t.create("Bob").await;

    let response = t
        .engine
        .execute_mutator(
            MutatorRequest::new(t.nickname_mutator, vec![json!(user.to_string())])
                .set("nickname", ValueAndPurposes::value(json!("Bob2"))),
        )
        .await
        .expect("rename");
    assert_eq!(response.matched_users, 1);
    assert_eq!(response.updated_users, 1);

    let marketing = BTreeSet::from([t.marketing.id]);
    assert_eq!(t.live(user, &t.nickname), vec![("Bob2".to_string(), marketing.clone())]);
    assert_eq!(t.soft(user, &t.nickname), vec![("Bob".to_string(), marketing)]);
}

#[tokio::test]
async fn partial_updates_add_and_remove_members_independently() {
    let t = tenant();
    let user = t.create("Bob").await;
    t.engine
        .execute_mutator(
            MutatorRequest::new(t.roles_mutator, vec![json!(user.to_string())]).set(
                "roles",
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["admin", "editor"])))
                    .adding_purposes(&["marketing"]),
            ),
        )
        .await
        .expect("seed roles");

    t.engine
        .execute_mutator(
            MutatorRequest::new(t.roles_mutator, vec![json!(user.to_string())]).set(
                "roles",
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["viewer"])))
                    .with_deletions(RequestValueSet::Json(json!(["editor"])))
                    .adding_purposes(&["support"]),
            ),
        )
        .await
        .expect("edit roles");

    let mut live = t.live(user, &t.roles);
    live.sort();
    assert_eq!(
        live,
        vec![
            ("admin".to_string(), BTreeSet::from([t.marketing.id])),
            ("viewer".to_string(), BTreeSet::from([t.support.id])),
        ]
    );
    assert_eq!(
        t.soft(user, &t.roles),
        vec![("editor".to_string(), BTreeSet::from([t.marketing.id]))]
    );
}

#[tokio::test]
async fn purposes_can_be_named_by_id_or_any_case() {
    let t = tenant();
    let user = t.create("Bob").await;
    let support_id = t.support.id.to_string();
    t.engine
        .execute_mutator(
            MutatorRequest::new(t.nickname_mutator, vec![json!(user.to_string())]).set(
                "NICKNAME",
                ValueAndPurposes::keep_current().adding_purposes(&[support_id.as_str(), "SUPPORT"]),
            ),
        )
        .await
        .expect_err("the same purpose named twice");

    t.engine
        .execute_mutator(
            MutatorRequest::new(t.nickname_mutator, vec![json!(user.to_string())]).set(
                "NICKNAME",
                ValueAndPurposes::keep_current().adding_purposes(&[support_id.as_str()]),
            ),
        )
        .await
        .expect("add support");
    assert_eq!(
        t.live(user, &t.nickname),
        vec![(
            "Bob".to_string(),
            BTreeSet::from([t.marketing.id, t.support.id])
        )]
    );
}

#[tokio::test]
async fn unique_violations_reject_the_whole_mutation() {
    let t = tenant();
    let user = t.create("Bob").await;
    let err = t
        .engine
        .execute_mutator(
            MutatorRequest::new(t.roles_mutator, vec![json!(user.to_string())]).set(
                "roles",
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["admin", "admin"])))
                    .adding_purposes(&["marketing"]),
            ),
        )
        .await
        .expect_err("duplicate member");
    assert_eq!(err.status(), 400);
    assert!(t.live(user, &t.roles).is_empty());
}

#[tokio::test]
async fn malformed_row_data_is_rejected_before_any_write() {
    let t = tenant();
    let user = t.create("Bob").await;

    let missing = t
        .engine
        .execute_mutator(MutatorRequest::new(t.nickname_mutator, vec![json!(user.to_string())]))
        .await
        .expect_err("no row data");
    assert!(matches!(missing, GovError::Validation(_)));

    let array_for_scalar = t
        .engine
        .execute_mutator(
            MutatorRequest::new(t.nickname_mutator, vec![json!(user.to_string())]).set(
                "nickname",
                ValueAndPurposes::value(json!(["a", "b"])).adding_purposes(&["marketing"]),
            ),
        )
        .await
        .expect_err("array for scalar");
    assert_eq!(array_for_scalar.status(), 400);
    assert_eq!(
        t.live(user, &t.nickname),
        vec![("Bob".to_string(), BTreeSet::from([t.marketing.id]))]
    );
}

#[tokio::test]
async fn normalizers_run_before_values_are_stored() {
    let t = tenant();
    let lower = Transformer::new("lowercase", TransformType::Transform, TransformFunction::Lowercase);
    t.config.create_transformer(lower.clone()).expect("lowercase");
    let lowering = mutator("set_nickname_lower", Selector::by_id(), &[&t.nickname], lower.id);
    t.config.create_mutator(lowering.clone()).expect("mutator");
    let user = t.create("Bob").await;

    t.engine
        .execute_mutator(
            MutatorRequest::new(lowering.id, vec![json!(user.to_string())])
                .set("nickname", ValueAndPurposes::value(json!("ROBERT"))),
        )
        .await
        .expect("normalized write");
    assert_eq!(t.live(user, &t.nickname)[0].0, "robert");
}

#[tokio::test]
async fn create_requires_an_id_selector_mutator() {
    let t = tenant();
    let broad = mutator("set_everyone", Selector::All, &[&t.nickname], PASSTHROUGH_TRANSFORMER_ID);
    t.config.create_mutator(broad.clone()).expect("mutator");
    let err = t
        .engine
        .create_user_with_mutator(CreateUserRequest {
            user_id: None,
            organization_id: None,
            mutator: MutatorRequest::new(broad.id, vec![]).set(
                "nickname",
                ValueAndPurposes::value(json!("x")).adding_purposes(&["marketing"]),
            ),
        })
        .await
        .expect_err("not usable for create");
    assert_eq!(err.status(), 400);
    assert!(t.store.is_empty());
}

#[tokio::test]
async fn denied_creation_is_compensated() {
    let t = tenant();
    let guarded = Mutator {
        access_policy_id: DENY_ALL_POLICY_ID,
        ..mutator("guarded", Selector::by_id(), &[&t.nickname], PASSTHROUGH_TRANSFORMER_ID)
    };
    t.config.create_mutator(guarded.clone()).expect("mutator");
    let id = Uuid::new_v4();
    let err = t
        .engine
        .create_user_with_mutator(CreateUserRequest {
            user_id: Some(id),
            organization_id: None,
            mutator: MutatorRequest::new(guarded.id, vec![]).set(
                "nickname",
                ValueAndPurposes::value(json!("x")).adding_purposes(&["marketing"]),
            ),
        })
        .await
        .expect_err("denied");
    assert!(matches!(err, GovError::Forbidden(_)));
    assert!(t.store.get_user(id).expect("get").is_none());
}

#[tokio::test]
async fn failed_creation_is_compensated() {
    let t = tenant();
    let id = Uuid::new_v4();
    let err = t
        .engine
        .create_user_with_mutator(CreateUserRequest {
            user_id: Some(id),
            organization_id: None,
            mutator: MutatorRequest::new(t.nickname_mutator, vec![]).set(
                "nickname",
                ValueAndPurposes::value(json!("x")).adding_purposes(&["no_such_purpose"]),
            ),
        })
        .await
        .expect_err("unknown purpose");
    assert_eq!(err.status(), 400);
    assert!(t.store.get_user(id).expect("get").is_none());
}

#[tokio::test]
async fn mutator_policies_skip_users_they_deny() {
    let t = tenant();
    let bob = t.create("Bob").await;
    let eve = t.create("Eve").await;
    let only_bob = AccessPolicy::new(
        "only_bob",
        PolicyRule::UserColumnEquals {
            column: "nickname".into(),
            value: json!("Bob"),
        },
    );
    t.config.create_access_policy(only_bob.clone()).expect("policy");
    let everyone = Mutator {
        access_policy_id: only_bob.id,
        ..mutator("tag_everyone", Selector::All, &[&t.nickname], PASSTHROUGH_TRANSFORMER_ID)
    };
    t.config.create_mutator(everyone.clone()).expect("mutator");

    let response = t
        .engine
        .execute_mutator(
            MutatorRequest::new(everyone.id, vec![])
                .set("nickname", ValueAndPurposes::keep_current().adding_purposes(&["support"])),
        )
        .await
        .expect("mutate");
    assert_eq!(response.matched_users, 2);
    assert_eq!(response.approved_users, 1);
    assert_eq!(response.updated_users, 1);
    assert_eq!(t.live(bob, &t.nickname)[0].1, BTreeSet::from([t.marketing.id, t.support.id]));
    assert_eq!(t.live(eve, &t.nickname)[0].1, BTreeSet::from([t.marketing.id]));
}

#[tokio::test]
async fn deleting_a_user_revokes_everything_first() {
    let t = tenant();
    let user = t.create("Bob").await;
    t.engine
        .execute_mutator(
            MutatorRequest::new(t.roles_mutator, vec![json!(user.to_string())]).set(
                "roles",
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["admin"])))
                    .adding_purposes(&["support"]),
            ),
        )
        .await
        .expect("roles");

    t.engine.delete_user(user, None).await.expect("delete");
    let record = t.user(user);
    assert!(record.is_deleted());
    assert!(record.all_values(DataLifeCycleState::Live).next().is_none());
    // Only marketing has a soft-deleted retention; support shadows are dropped.
    assert_eq!(
        t.soft(user, &t.nickname),
        vec![("Bob".to_string(), BTreeSet::from([t.marketing.id]))]
    );
    assert!(t.soft(user, &t.roles).is_empty());

    let again = t.engine.delete_user(user, None).await.expect_err("already deleted");
    assert_eq!(again.status(), 404);
    let unknown = t
        .engine
        .delete_user(Uuid::new_v4(), None)
        .await
        .expect_err("unknown");
    assert_eq!(unknown.code_str(), "user_not_found");
}

#[tokio::test]
async fn consented_purposes_are_reported_per_column() {
    let t = tenant();
    let user = t.create("Bob").await;
    t.engine
        .execute_mutator(
            MutatorRequest::new(t.roles_mutator, vec![json!(user.to_string())]).set(
                "roles",
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["admin", "editor"])))
                    .adding_purposes(&["support", "marketing"]),
            ),
        )
        .await
        .expect("roles");

    let all = t
        .engine
        .consented_purposes_for_user(user, None)
        .await
        .expect("purposes");
    assert_eq!(
        all["roles"],
        BTreeSet::from(["marketing".to_string(), "support".to_string()])
    );
    assert_eq!(all["nickname"], BTreeSet::from(["marketing".to_string()]));

    let only_nickname = t
        .engine
        .consented_purposes_for_user(user, Some(&["Nickname".to_string()]))
        .await
        .expect("filtered");
    assert_eq!(only_nickname.len(), 1);
    assert!(only_nickname.contains_key("nickname"));
}

#[tokio::test]
async fn sweeping_demotes_expired_purposes() {
    let t = tenant();
    t.config
        .put_retention_duration(RetentionDurationOverride {
            id: Uuid::new_v4(),
            state: DataLifeCycleState::Live,
            column_id: Some(t.nickname.id),
            purpose_id: Some(t.marketing.id),
            duration: RetentionDuration::days(7),
        })
        .expect("live retention");
    let user = t.create("Bob").await;
    let timeout = t.user(user).values_for(DataLifeCycleState::Live, t.nickname.id)[0]
        .consented_purposes[0]
        .retention_timeout;
    assert!(matches!(timeout, RetentionTimeout::At(_)));

    let early = t.engine.sweep_expired(Utc::now() + Duration::days(1)).await.expect("early");
    assert_eq!(early.users_scanned, 1);
    assert_eq!(early.users_updated, 0);

    let later = t.engine.sweep_expired(Utc::now() + Duration::days(8)).await.expect("later");
    assert_eq!(later.regions, 1);
    assert_eq!(later.users_updated, 1);
    assert!(t.live(user, &t.nickname).is_empty());
    assert_eq!(
        t.soft(user, &t.nickname),
        vec![("Bob".to_string(), BTreeSet::from([t.marketing.id]))]
    );

    let much_later = t
        .engine
        .sweep_expired(Utc::now() + Duration::days(60))
        .await
        .expect("shadow expiry");
    assert_eq!(much_later.users_updated, 1);
    assert!(t.soft(user, &t.nickname).is_empty());
}

/// Region store whose value writes start failing on demand.
struct FlakyStore {
    inner: MemoryUserStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new(region: &str) -> Self {
        Self {
            inner: MemoryUserStore::new(region),
            failing: AtomicBool::new(false),
        }
    }

    fn check(&self) -> consentdb::error::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GovError::Storage(format!("{} is read-only", self.inner.region())));
        }
        Ok(())
    }
}

impl UserStore for FlakyStore {
    fn region(&self) -> &str {
        self.inner.region()
    }

    fn select_users(&self, query: &UserQuery) -> consentdb::error::Result<Vec<UserRecord>> {
        self.inner.select_users(query)
    }

    fn get_user(&self, id: Uuid) -> consentdb::error::Result<Option<UserRecord>> {
        self.inner.get_user(id)
    }

    fn list_user_ids(&self) -> consentdb::error::Result<Vec<Uuid>> {
        self.inner.list_user_ids()
    }

    fn insert_user(&self, user: NewUser) -> consentdb::error::Result<()> {
        self.inner.insert_user(user)
    }

    fn delete_user(&self, id: Uuid, at: DateTime<Utc>) -> consentdb::error::Result<bool> {
        self.inner.delete_user(id, at)
    }

    fn purge_user(&self, id: Uuid) -> consentdb::error::Result<bool> {
        self.inner.purge_user(id)
    }

    fn insert_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> consentdb::error::Result<()> {
        self.check()?;
        self.inner.insert_values(user_id, state, values)
    }

    fn update_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> consentdb::error::Result<()> {
        self.check()?;
        self.inner.update_values(user_id, state, values)
    }

    fn delete_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> consentdb::error::Result<()> {
        self.check()?;
        self.inner.delete_values(user_id, state, values)
    }

    fn mark_user_updated(&self, user_id: Uuid, at: DateTime<Utc>) -> consentdb::error::Result<()> {
        self.inner.mark_user_updated(user_id, at)
    }
}

fn tag_everyone(t: &Tenant, name: &str, thresholds: PolicyThresholds) -> Uuid {
    let policy = AccessPolicy::new(&format!("{name}_policy"), PolicyRule::AllowAll)
        .with_thresholds(thresholds);
    t.config.create_access_policy(policy.clone()).expect("policy");
    let everyone = Mutator {
        access_policy_id: policy.id,
        ..mutator(name, Selector::All, &[&t.nickname], PASSTHROUGH_TRANSFORMER_ID)
    };
    t.config.create_mutator(everyone.clone()).expect("mutator");
    everyone.id
}

fn add_support(mutator_id: Uuid) -> MutatorRequest {
    MutatorRequest::new(mutator_id, vec![])
        .set("nickname", ValueAndPurposes::keep_current().adding_purposes(&["support"]))
}

#[tokio::test]
async fn result_threshold_aborts_before_any_write() {
    let t = tenant();
    let bob = t.create("Bob").await;
    let eve = t.create("Eve").await;
    let marketing = BTreeSet::from([t.marketing.id]);

    let loud = tag_everyone(&t, "tag_loud", PolicyThresholds::default().with_result_limit(1, true));
    let err = t
        .engine
        .execute_mutator(add_support(loud))
        .await
        .expect_err("too many users");
    assert!(matches!(err, GovError::ResultThresholdExceeded { .. }));
    assert_eq!(err.status(), 400);

    let quiet = tag_everyone(&t, "tag_quiet", PolicyThresholds::default().with_result_limit(1, false));
    let response = t
        .engine
        .execute_mutator(add_support(quiet))
        .await
        .expect("swallowed");
    assert_eq!(response.matched_users, 2);
    assert_eq!(response.updated_users, 0);

    for user in [bob, eve] {
        assert_eq!(t.live(user, &t.nickname)[0].1, marketing);
    }
}

#[tokio::test]
async fn rate_threshold_counts_executions_not_users() {
    let t = tenant();
    let bob = t.create("Bob").await;
    let eve = t.create("Eve").await;
    let loud = tag_everyone(&t, "tag_loud", PolicyThresholds::default().with_rate_limit(1, 3600, true));

    let first = t
        .engine
        .execute_mutator(add_support(loud))
        .await
        .expect("first execution");
    assert_eq!(first.updated_users, 2);

    let err = t
        .engine
        .execute_mutator(
            MutatorRequest::new(loud, vec![])
                .set("nickname", ValueAndPurposes::keep_current().deleting_purposes(&["support"])),
        )
        .await
        .expect_err("rate limited");
    assert_eq!(err.status(), 429);
    let both = BTreeSet::from([t.marketing.id, t.support.id]);
    for user in [bob, eve] {
        assert_eq!(t.live(user, &t.nickname)[0].1, both);
    }

    let quiet = tag_everyone(&t, "tag_quiet", PolicyThresholds::default().with_rate_limit(1, 3600, false));
    t.engine.execute_mutator(add_support(quiet)).await.expect("first quiet");
    let swallowed = t
        .engine
        .execute_mutator(add_support(quiet))
        .await
        .expect("swallowed");
    assert_eq!(swallowed, consentdb::commit::MutatorResponse::default());
}

#[tokio::test]
async fn failing_region_reports_its_error_and_others_keep_their_writes() {
    let t = tenant();
    let eu = Arc::new(FlakyStore::new("eu"));
    let us = Arc::new(FlakyStore::new("us"));
    let engine = GovernanceEngine::open(
        EngineConfig::development().with_primary_region("eu"),
        t.config.clone(),
        vec![eu.clone() as Arc<dyn UserStore>, us.clone() as Arc<dyn UserStore>],
    )
    .expect("open");

    let mut users = Vec::new();
    for region in ["eu", "us"] {
        let created = engine
            .create_user_with_mutator(CreateUserRequest {
                user_id: None,
                organization_id: None,
                mutator: MutatorRequest::new(t.nickname_mutator, vec![])
                    .in_region(region)
                    .set(
                        "nickname",
                        ValueAndPurposes::value(json!(region)).adding_purposes(&["marketing"]),
                    ),
            })
            .await
            .expect("create");
        assert_eq!(created.region, region);
        users.push(created.user_id);
    }

    us.failing.store(true, Ordering::SeqCst);
    let everyone = tag_everyone(&t, "tag_everyone", PolicyThresholds::default());
    let err = engine
        .execute_mutator(add_support(everyone))
        .await
        .expect_err("us region fails");
    assert!(matches!(&err, GovError::Storage(message) if message.contains("us")));
    assert_eq!(err.status(), 500);

    let purposes = |store: &FlakyStore, id: Uuid| {
        store.get_user(id).expect("get").expect("user").values_for(DataLifeCycleState::Live, t.nickname.id)[0]
            .purpose_ids()
    };
    assert_eq!(purposes(&eu, users[0]), BTreeSet::from([t.marketing.id, t.support.id]));
    assert_eq!(purposes(&us, users[1]), BTreeSet::from([t.marketing.id]));
}
