//! Activity events.
//!
//! Handlers record what happened (cipher edits, membership changes,
//! emergency transitions, billing changes) as [`ActivityEvent`]s. Every
//! event goes to the barrier-backed store, which serves the per-team and
//! per-user feeds, and to any extra sinks such as a JSON-lines file.
//!
//! Recording never fails the caller: sink errors are logged and dropped.
//!
//! Storage layout:
//!
//! - `events/team/{team_id}/{micros}-{event_id}`
//! - `events/user/{user_id}/{micros}-{event_id}`
//!
//! `micros` is zero-padded so lexical key order is chronological.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::error::EventError;

const TEAM_EVENTS_PREFIX: &str = "events/team/";
const USER_EVENTS_PREFIX: &str = "events/user/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoginSucceeded,
    LoginFailed,
    PasswordChanged,
    AccountDeleted,

    CipherCreated,
    CipherUpdated,
    CipherTrashed,
    CipherRestored,
    CipherDeleted,
    CipherShared,
    CipherCollectionsChanged,
    FolderCreated,
    FolderUpdated,
    FolderDeleted,

    TeamCreated,
    TeamUpdated,
    TeamDeleted,
    MemberInvited,
    MemberAccepted,
    MemberConfirmed,
    MemberUpdated,
    MemberRemoved,
    MemberLeft,
    CollectionCreated,
    CollectionUpdated,
    CollectionDeleted,
    CollectionAccessChanged,
    PolicyUpdated,

    EmergencyInvited,
    EmergencyAccepted,
    EmergencyConfirmed,
    EmergencyRecoveryInitiated,
    EmergencyRecoveryApproved,
    EmergencyRecoveryRejected,
    EmergencyRecoveryAutoApproved,
    EmergencyReminderSent,
    EmergencyViewed,
    EmergencyTakeover,
    EmergencyDeleted,

    SubscriptionUpgraded,
    PaymentConfirmed,
    PaymentRejected,
    SubscriptionCanceled,
    SubscriptionReactivated,
    SubscriptionRenewed,
    SubscriptionDowngraded,

    RelayAliasCreated,
    RelayAliasUpdated,
    RelayAliasDeleted,
}

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Who did it; `None` for scheduled jobs.
    pub actor_id: Option<Uuid>,
    /// Whose feed the event belongs to.
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    /// The cipher, member, grant, alias, ... acted on.
    pub target_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEvent {
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor_id: None,
            user_id: None,
            team_id: None,
            target_id: None,
            created_at: Utc::now(),
        }
    }

    /// Set the actor, who also owns the event unless [`user`](Self::user)
    /// says otherwise.
    #[must_use]
    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self.user_id.get_or_insert(actor_id);
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn team(mut self, team_id: Uuid) -> Self {
        self.team_id = Some(team_id);
        self
    }

    #[must_use]
    pub fn target(mut self, target_id: Uuid) -> Self {
        self.target_id = Some(target_id);
        self
    }

    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    fn sort_key(&self) -> String {
        format!("{:020}-{}", self.created_at.timestamp_micros().max(0), self.id)
    }
}

/// Destination for activity events.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be persisted.
    async fn record(&self, event: &ActivityEvent) -> Result<(), EventError>;
}

/// Events stored through the barrier, queryable per team and per user.
#[derive(Clone)]
pub struct StoreEventSink {
    barrier: Arc<Barrier>,
}

impl StoreEventSink {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Newest-first events of a team.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Barrier`] if storage fails.
    pub async fn list_team(&self, team_id: Uuid, limit: usize) -> Result<Vec<ActivityEvent>, EventError> {
        self.newest(&format!("{TEAM_EVENTS_PREFIX}{team_id}/"), limit).await
    }

    /// Newest-first events of a user.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Barrier`] if storage fails.
    pub async fn list_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<ActivityEvent>, EventError> {
        self.newest(&format!("{USER_EVENTS_PREFIX}{user_id}/"), limit).await
    }

    /// Drop a team's feed.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Barrier`] if storage fails.
    pub async fn purge_team(&self, team_id: Uuid) -> Result<usize, EventError> {
        Ok(self
            .barrier
            .delete_prefix(&format!("{TEAM_EVENTS_PREFIX}{team_id}/"))
            .await?)
    }

    /// Drop a user's feed.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Barrier`] if storage fails.
    pub async fn purge_user(&self, user_id: Uuid) -> Result<usize, EventError> {
        Ok(self
            .barrier
            .delete_prefix(&format!("{USER_EVENTS_PREFIX}{user_id}/"))
            .await?)
    }

    async fn newest(&self, prefix: &str, limit: usize) -> Result<Vec<ActivityEvent>, EventError> {
        let mut keys = self.barrier.list(prefix).await?;
        keys.sort_unstable_by(|a, b| b.cmp(a));
        let mut events = Vec::with_capacity(limit.min(keys.len()));
        for key in keys.into_iter().take(limit) {
            if let Some(event) = self.barrier.get_json(&key).await? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[async_trait::async_trait]
impl EventSink for StoreEventSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "store"
    }

    async fn record(&self, event: &ActivityEvent) -> Result<(), EventError> {
        let key = event.sort_key();
        if let Some(team_id) = event.team_id {
            self.barrier
                .put_json(&format!("{TEAM_EVENTS_PREFIX}{team_id}/{key}"), event)
                .await?;
        }
        if let Some(user_id) = event.user_id {
            self.barrier
                .put_json(&format!("{USER_EVENTS_PREFIX}{user_id}/{key}"), event)
                .await?;
        }
        Ok(())
    }
}

/// Appends one JSON object per line. The file is opened lazily, in append
/// mode, on the first event.
pub struct FileEventSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileEventSink {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> EventError {
        EventError::Sink {
            name: self.name().to_owned(),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl EventSink for FileEventSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn record(&self, event: &ActivityEvent) -> Result<(), EventError> {
        let mut line = serde_json::to_vec(event).map_err(|e| EventError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure(format!("cannot open '{}': {e}", self.path.display())))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(self.failure("file handle missing after open".to_owned()));
        };
        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Fans events out to the store and any extra sinks.
#[derive(Clone)]
pub struct EventLog {
    store: StoreEventSink,
    extra: Vec<Arc<dyn EventSink>>,
}

impl EventLog {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            store: StoreEventSink::new(barrier),
            extra: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.extra.push(sink);
        self
    }

    #[must_use]
    pub fn store(&self) -> &StoreEventSink {
        &self.store
    }

    /// Record an event everywhere. Failures are logged, never returned.
    pub async fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.store.record(&event).await {
            warn!(sink = self.store.name(), kind = ?event.kind, error = %e, "event sink failed");
        }
        self.record_external(&event).await;
    }

    /// Record an event in the extra sinks only, for subjects whose stored
    /// feed has just been purged.
    pub async fn record_external(&self, event: &ActivityEvent) {
        for sink in &self.extra {
            if let Err(e) = sink.record(event).await {
                warn!(sink = sink.name(), kind = ?event.kind, error = %e, "event sink failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::user::tests::barrier;

    struct BrokenSink;

    #[async_trait::async_trait]
    impl EventSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn record(&self, _event: &ActivityEvent) -> Result<(), EventError> {
            Err(EventError::Sink {
                name: "broken".to_owned(),
                reason: "disk full".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn feeds_are_newest_first_and_limited() {
        let log = EventLog::new(barrier()).with_sink(Arc::new(BrokenSink));
        let team = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let start = Utc::now();
        for minutes in 0..3 {
            log.record(
                ActivityEvent::new(EventKind::CipherCreated)
                    .actor(actor)
                    .team(team)
                    .at(start + Duration::minutes(minutes)),
            )
            .await;
        }

        let feed = log.store().list_team(team, 2).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].created_at > feed[1].created_at);
        assert_eq!(log.store().list_user(actor, 10).await.unwrap().len(), 3);
        assert!(log.store().list_user(Uuid::new_v4(), 10).await.unwrap().is_empty());

        assert_eq!(log.store().purge_team(team).await.unwrap(), 3);
        assert!(log.store().list_team(team, 10).await.unwrap().is_empty());
    }

    #[test]
    fn explicit_user_survives_actor() {
        let owner = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let event = ActivityEvent::new(EventKind::EmergencyTakeover).user(owner).actor(actor);
        assert_eq!(event.user_id, Some(owner));
        assert_eq!(event.actor_id, Some(actor));
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = FileEventSink::new(&path);
        sink.record(&ActivityEvent::new(EventKind::LoginSucceeded)).await.unwrap();
        sink.record(&ActivityEvent::new(EventKind::LoginFailed)).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let kinds: Vec<EventKind> = contents
            .lines()
            .map(|line| serde_json::from_str::<ActivityEvent>(line).unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::LoginSucceeded, EventKind::LoginFailed]);
    }
}
