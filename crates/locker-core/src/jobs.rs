//! Scheduled maintenance.
//!
//! Each job is a function of `now`, so a pass can be replayed or tested at
//! any instant. The server calls [`Scheduler::run_all`] for every tenant on
//! a fixed interval; one failing job does not stop the others.

use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::RefreshTokenStore;
use crate::billing::{BillingService, RenewalOutcome};
use crate::emergency::EmergencyService;
use crate::event::{ActivityEvent, EventKind, EventLog};
use crate::locker::subscriber_event;
use crate::team::TeamService;
use crate::vault::{TRASH_RETENTION_DAYS, VaultService};

/// Team and emergency invitations older than this are dropped.
pub const INVITATION_TTL_DAYS: i64 = 7;

/// Outcome of one job in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    /// Records changed by the job.
    pub affected: usize,
    pub error: Option<String>,
}

impl JobReport {
    fn from_result<E: Display>(job: &'static str, result: Result<usize, E>) -> Self {
        match result {
            Ok(affected) => {
                if affected > 0 {
                    info!(job, affected, "maintenance job finished");
                }
                Self { job, affected, error: None }
            }
            Err(e) => {
                warn!(job, error = %e, "maintenance job failed");
                Self {
                    job,
                    affected: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Maintenance jobs of one tenant.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) emergency: EmergencyService,
    pub(crate) vault: VaultService,
    pub(crate) billing: BillingService,
    pub(crate) teams: TeamService,
    pub(crate) refresh: RefreshTokenStore,
    pub(crate) events: EventLog,
}

impl Scheduler {
    /// Run every job once, in a fixed order.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Vec<JobReport> {
        vec![
            self.emergency_auto_approve(now).await,
            self.emergency_reminders(now).await,
            self.purge_trash(now).await,
            self.expire_subscriptions(now).await,
            self.purge_expired_tokens(now).await,
            self.expire_invitations(now).await,
        ]
    }

    pub async fn emergency_auto_approve(&self, now: DateTime<Utc>) -> JobReport {
        let result = match self.emergency.auto_approve_due(now).await {
            Ok(grants) => {
                for grant in &grants {
                    self.events
                        .record(
                            ActivityEvent::new(EventKind::EmergencyRecoveryAutoApproved)
                                .user(grant.grantor_id)
                                .target(grant.id)
                                .at(now),
                        )
                        .await;
                }
                Ok(grants.len())
            }
            Err(e) => Err(e),
        };
        JobReport::from_result("emergency_auto_approve", result)
    }

    pub async fn emergency_reminders(&self, now: DateTime<Utc>) -> JobReport {
        let result = match self.emergency.send_reminders(now).await {
            Ok(grants) => {
                for grant in &grants {
                    self.events
                        .record(
                            ActivityEvent::new(EventKind::EmergencyReminderSent)
                                .user(grant.grantor_id)
                                .target(grant.id)
                                .at(now),
                        )
                        .await;
                }
                Ok(grants.len())
            }
            Err(e) => Err(e),
        };
        JobReport::from_result("emergency_reminders", result)
    }

    pub async fn purge_trash(&self, now: DateTime<Utc>) -> JobReport {
        let retention = Duration::days(TRASH_RETENTION_DAYS);
        JobReport::from_result("purge_trash", self.vault.purge_trash(now, retention).await)
    }

    pub async fn expire_subscriptions(&self, now: DateTime<Utc>) -> JobReport {
        let result = match self.billing.expire_due(now).await {
            Ok(outcomes) => {
                for (subscriber, outcome) in &outcomes {
                    let kind = match outcome {
                        RenewalOutcome::Renewed => EventKind::SubscriptionRenewed,
                        RenewalOutcome::Downgraded => EventKind::SubscriptionDowngraded,
                        RenewalOutcome::AwaitingPayment => continue,
                    };
                    self.events.record(subscriber_event(kind, *subscriber).at(now)).await;
                }
                Ok(outcomes.len())
            }
            Err(e) => Err(e),
        };
        JobReport::from_result("expire_subscriptions", result)
    }

    pub async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> JobReport {
        JobReport::from_result("purge_expired_tokens", self.refresh.purge_expired(now).await)
    }

    /// Team and emergency invitations share one report.
    pub async fn expire_invitations(&self, now: DateTime<Utc>) -> JobReport {
        let ttl = Duration::days(INVITATION_TTL_DAYS);
        let teams = match self.teams.expire_invitations(now, ttl).await {
            Ok(n) => n,
            Err(e) => return JobReport::from_result("expire_invitations", Err::<usize, _>(e)),
        };
        let result = self
            .emergency
            .expire_invitations(now, ttl)
            .await
            .map(|n| n.saturating_add(teams));
        JobReport::from_result("expire_invitations", result)
    }
}
