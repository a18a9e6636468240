//! User domain shared by the engine integration tests.
//!
//! Users are added, renamed, given an email and removed; the `LoginNames`
//! projection keeps one row per user with its current login name and email.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use iamstore::{
    AggregateRef, AggregateType, CommandError, DomainEvent, EntityId, EventLog, EventRegistry,
    EventType, Projection, ProjectionName, ReduceError, RetryPolicy, Statement, StoredEvent,
    TenantId, execute,
};
use iamstore_testing::fixtures;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAdded {
    pub login_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRenamed {
    pub login_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailChanged {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Added(UserAdded),
    Renamed(UserRenamed),
    EmailChanged(EmailChanged),
    Removed,
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> EventType {
        let tag = match self {
            Self::Added(_) => "user.added",
            Self::Renamed(_) => "user.renamed",
            Self::EmailChanged(_) => "user.email_changed",
            Self::Removed => "user.removed",
        };
        fixtures::event_type(tag)
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::Added(added) => serde_json::to_value(added),
            Self::Renamed(renamed) => serde_json::to_value(renamed),
            Self::EmailChanged(changed) => serde_json::to_value(changed),
            Self::Removed => Ok(Value::Null),
        }
    }
}

/// Row document of [`LoginNames`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginNameRow {
    pub login_name: String,
    pub resource_owner: String,
}

pub fn user_type() -> AggregateType {
    AggregateType::try_new("user").expect("valid aggregate type")
}

/// One row per user, keyed by aggregate id.
///
/// Each kind of event can be switched to fail, which simulates a handler bug
/// that is fixed later.
pub struct LoginNames {
    name: ProjectionName,
    registry: EventRegistry<UserEvent>,
    reject_adds: Arc<AtomicBool>,
    reject_renames: Arc<AtomicBool>,
    reject_emails: Arc<AtomicBool>,
}

impl LoginNames {
    pub fn new() -> Self {
        Self::named(fixtures::projection("login_names"))
    }

    /// Same projection under a fixed name, for engines that must share rows.
    pub fn named(name: ProjectionName) -> Self {
        let registry = EventRegistry::builder()
            .register("user.added", UserEvent::Added)
            .and_then(|builder| builder.register("user.renamed", UserEvent::Renamed))
            .and_then(|builder| builder.register("user.email_changed", UserEvent::EmailChanged))
            .and_then(|builder| builder.register_unit("user.removed", || UserEvent::Removed))
            .expect("valid registry")
            .build();

        Self {
            name,
            registry,
            reject_adds: Arc::new(AtomicBool::new(false)),
            reject_renames: Arc::new(AtomicBool::new(false)),
            reject_emails: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Switch that makes the handler fail on additions while set.
    pub fn add_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reject_adds)
    }

    /// Switch that makes the handler fail on renames while set.
    pub fn rename_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reject_renames)
    }

    /// Switch that makes the handler fail on email changes while set.
    pub fn email_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reject_emails)
    }
}

impl Default for LoginNames {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for LoginNames {
    type Event = UserEvent;

    fn name(&self) -> ProjectionName {
        self.name.clone()
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        vec![user_type()]
    }

    fn registry(&self) -> &EventRegistry<UserEvent> {
        &self.registry
    }

    fn reduce(
        &self,
        event: UserEvent,
        stored: &StoredEvent,
    ) -> Result<Vec<Statement>, ReduceError> {
        let entity_id = EntityId::from(&stored.aggregate_id);
        match event {
            UserEvent::Added(added) => {
                if self.reject_adds.load(Ordering::SeqCst) {
                    return Err(ReduceError::new("additions are rejected"));
                }
                Ok(vec![Statement::Upsert {
                    entity_id,
                    data: json!({
                        "login_name": added.login_name,
                        "resource_owner": stored.resource_owner.to_string(),
                    }),
                }])
            }
            UserEvent::Renamed(renamed) => {
                if self.reject_renames.load(Ordering::SeqCst) {
                    return Err(ReduceError::new("renames are rejected"));
                }
                let mut fields = Map::new();
                let _ = fields.insert("login_name".to_string(), json!(renamed.login_name));
                Ok(vec![Statement::Merge { entity_id, fields }])
            }
            UserEvent::EmailChanged(changed) => {
                if self.reject_emails.load(Ordering::SeqCst) {
                    return Err(ReduceError::new("email changes are rejected"));
                }
                let mut fields = Map::new();
                let _ = fields.insert("email".to_string(), json!(changed.email));
                Ok(vec![Statement::Merge { entity_id, fields }])
            }
            UserEvent::Removed => Ok(vec![Statement::Delete { entity_id }]),
        }
    }
}

/// Business rule failures of the user commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user does not exist")]
    NotFound,
}

pub fn policy() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(10))
}

/// Adds a user claiming `login_name` in `tenant`.
pub async fn add_user<L: EventLog + Sync>(
    log: &L,
    tenant: &TenantId,
    login_name: &str,
) -> Result<AggregateRef, CommandError<UserError>> {
    let user = fixtures::user();
    let _ = execute(
        log,
        &policy(),
        &CancellationToken::new(),
        tenant,
        &user,
        |history, request| {
            if !history.is_new() {
                return Err(UserError::AlreadyExists);
            }
            Ok(request
                .with_event(
                    &fixtures::editor(),
                    &UserEvent::Added(UserAdded {
                        login_name: login_name.to_string(),
                    }),
                )
                .claim_unique(fixtures::login_name(login_name)))
        },
    )
    .await?;
    Ok(user)
}

/// Renames a user, moving the login name claim.
pub async fn rename_user<L: EventLog + Sync>(
    log: &L,
    tenant: &TenantId,
    user: &AggregateRef,
    from: &str,
    to: &str,
) -> Result<Vec<StoredEvent>, CommandError<UserError>> {
    execute(
        log,
        &policy(),
        &CancellationToken::new(),
        tenant,
        user,
        |history, request| {
            if history.is_new() {
                return Err(UserError::NotFound);
            }
            Ok(request
                .with_event(
                    &fixtures::editor(),
                    &UserEvent::Renamed(UserRenamed {
                        login_name: to.to_string(),
                    }),
                )
                .release_unique(fixtures::login_name(from))
                .claim_unique(fixtures::login_name(to)))
        },
    )
    .await
}

/// Sets a user's email.
pub async fn change_email<L: EventLog + Sync>(
    log: &L,
    tenant: &TenantId,
    user: &AggregateRef,
    email: &str,
) -> Result<Vec<StoredEvent>, CommandError<UserError>> {
    execute(
        log,
        &policy(),
        &CancellationToken::new(),
        tenant,
        user,
        |history, request| {
            if history.is_new() {
                return Err(UserError::NotFound);
            }
            Ok(request.with_event(
                &fixtures::editor(),
                &UserEvent::EmailChanged(EmailChanged {
                    email: email.to_string(),
                }),
            ))
        },
    )
    .await
}

/// Removes a user and frees its login name.
pub async fn remove_user<L: EventLog + Sync>(
    log: &L,
    tenant: &TenantId,
    user: &AggregateRef,
    login_name: &str,
) -> Result<Vec<StoredEvent>, CommandError<UserError>> {
    execute(
        log,
        &policy(),
        &CancellationToken::new(),
        tenant,
        user,
        |history, request| {
            if history.is_new() {
                return Err(UserError::NotFound);
            }
            Ok(request
                .with_event(&fixtures::editor(), &UserEvent::Removed)
                .release_unique(fixtures::login_name(login_name)))
        },
    )
    .await
}

pub fn entity(user: &AggregateRef) -> EntityId {
    EntityId::from(&user.aggregate_id)
}
