//! Plans, subscriptions, promo codes, and payments.
//!
//! Charging is delegated to a [`PaymentGateway`]. A charge either succeeds
//! at once (card), stays pending until an operator confirms it (wallet,
//! bank transfer, or [`ManualGateway`]), or is declined. Only a paid
//! payment changes a subscription's plan.
//!
//! Storage layout:
//!
//! - `billing/subscriptions/{subscriber}`: [`Subscription`]; absent means
//!   the free plan of the subscriber's kind.
//! - `billing/payments/{payment_id}`: [`Payment`].
//! - `billing/subscriber-payments/{subscriber}/{payment_id}`: index.
//! - `billing/promos/{CODE}`: [`PromoCode`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::error::{BarrierError, BillingError, TeamError};
use crate::team::TeamService;

const SUBSCRIPTION_PREFIX: &str = "billing/subscriptions/";
const PAYMENT_PREFIX: &str = "billing/payments/";
const SUBSCRIBER_PAYMENTS_PREFIX: &str = "billing/subscriber-payments/";
const PROMO_PREFIX: &str = "billing/promos/";

/// How long an unpaid renewal keeps the paid plan alive.
pub const RENEWAL_GRACE_DAYS: i64 = 7;

/// Upper bound on seats bought in one go.
const MAX_SEATS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Premium,
    Family,
    TeamsFree,
    Teams,
    Enterprise,
}

impl Plan {
    /// Price per billing period in USD cents; per seat for per-seat plans.
    #[must_use]
    pub const fn price_cents(self, period: BillingPeriod) -> u64 {
        match (self, period) {
            (Self::Free | Self::TeamsFree, _) => 0,
            (Self::Premium, BillingPeriod::Monthly) => 300,
            (Self::Premium, BillingPeriod::Yearly) => 3_000,
            (Self::Family, BillingPeriod::Monthly) => 500,
            (Self::Family, BillingPeriod::Yearly) => 5_000,
            (Self::Teams, BillingPeriod::Monthly) => 400,
            (Self::Teams, BillingPeriod::Yearly) => 4_000,
            (Self::Enterprise, BillingPeriod::Monthly) => 600,
            (Self::Enterprise, BillingPeriod::Yearly) => 6_000,
        }
    }

    /// Plans sold to teams rather than individual users.
    #[must_use]
    pub const fn is_team_plan(self) -> bool {
        matches!(self, Self::TeamsFree | Self::Teams | Self::Enterprise)
    }

    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free | Self::TeamsFree)
    }

    /// Plans priced per seat.
    #[must_use]
    pub const fn per_seat(self) -> bool {
        matches!(self, Self::Teams | Self::Enterprise)
    }

    /// Members included without buying seats.
    #[must_use]
    pub const fn included_seats(self) -> u32 {
        match self {
            Self::Free | Self::Premium | Self::Teams | Self::Enterprise => 1,
            Self::TeamsFree => 2,
            Self::Family => 6,
        }
    }

    /// Premium features: emergency access, unlimited and custom relay aliases.
    #[must_use]
    pub const fn premium_features(self) -> bool {
        !self.is_free()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    #[must_use]
    pub const fn months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
        }
    }
}

/// Who pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subscriber {
    User(Uuid),
    Team(Uuid),
}

impl Subscriber {
    #[must_use]
    pub const fn is_team(self) -> bool {
        matches!(self, Self::Team(_))
    }

    fn storage_id(self) -> String {
        match self {
            Self::User(id) => format!("user-{id}"),
            Self::Team(id) => format!("team-{id}"),
        }
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Wallet,
    BankTransfer,
}

impl PaymentMethod {
    /// Whether the gateway can charge this method without the payer.
    #[must_use]
    pub const fn can_auto_renew(self) -> bool {
        matches!(self, Self::Card)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber: Subscriber,
    pub plan: Plan,
    pub period: Option<BillingPeriod>,
    pub seats: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub cancel_at_period_end: bool,
    pub payment_method: Option<PaymentMethod>,
    pub promo_code: Option<String>,
    /// Renewal or upgrade payment awaiting confirmation.
    pub pending_payment: Option<Uuid>,
}

impl Subscription {
    /// The implicit subscription of someone who never paid.
    #[must_use]
    pub fn free(subscriber: Subscriber) -> Self {
        let plan = if subscriber.is_team() { Plan::TeamsFree } else { Plan::Free };
        Self {
            subscriber,
            plan,
            period: None,
            seats: plan.included_seats(),
            started_at: None,
            current_period_end: None,
            auto_renew: false,
            cancel_at_period_end: false,
            payment_method: None,
            promo_code: None,
            pending_payment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    /// Percentage off, 1-100.
    Percent(u8),
    /// Fixed amount off, in cents.
    Fixed(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    /// Upper-case code.
    pub code: String,
    pub discount: Discount,
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` for unlimited.
    pub remaining_uses: Option<u32>,
    /// Restrict to one billing period.
    pub only_period: Option<BillingPeriod>,
}

impl PromoCode {
    /// Check that the code can be applied right now to `period`.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InvalidPromo`] explaining why not.
    pub fn check(&self, period: BillingPeriod, now: DateTime<Utc>) -> Result<(), BillingError> {
        let reject = |reason: &str| {
            Err(BillingError::InvalidPromo {
                reason: reason.to_owned(),
            })
        };
        if self.expires_at.is_some_and(|at| at <= now) {
            return reject("expired");
        }
        if self.remaining_uses == Some(0) {
            return reject("no uses left");
        }
        if self.only_period.is_some_and(|p| p != period) {
            return reject("not valid for this billing period");
        }
        Ok(())
    }
}

/// Itemised cost of a plan change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub plan: Plan,
    pub period: BillingPeriod,
    pub seats: u32,
    pub subtotal_cents: u64,
    pub discount_cents: u64,
    pub total_cents: u64,
    pub currency: &'static str,
    pub promo_code: Option<String>,
}

/// Price a plan. Per-seat plans multiply by `seats`; others ignore it.
///
/// # Errors
///
/// Returns [`BillingError::InvalidPromo`] if `promo` cannot be applied.
pub fn quote(
    plan: Plan,
    period: BillingPeriod,
    seats: u32,
    promo: Option<&PromoCode>,
    now: DateTime<Utc>,
) -> Result<Quote, BillingError> {
    let seats = if plan.per_seat() { seats.max(1) } else { plan.included_seats() };
    let subtotal = if plan.per_seat() {
        plan.price_cents(period).saturating_mul(u64::from(seats))
    } else {
        plan.price_cents(period)
    };

    let discount = match promo {
        None => 0,
        Some(promo) => {
            promo.check(period, now)?;
            match promo.discount {
                Discount::Percent(pct) => subtotal.saturating_mul(u64::from(pct.min(100))) / 100,
                Discount::Fixed(cents) => cents,
            }
        }
    }
    .min(subtotal);

    Ok(Quote {
        plan,
        period,
        seats,
        subtotal_cents: subtotal,
        discount_cents: discount,
        total_cents: subtotal.saturating_sub(discount),
        currency: "USD",
        promo_code: promo.map(|p| p.code.clone()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

/// An invoice and its settlement state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub subscriber: Subscriber,
    pub plan: Plan,
    pub period: BillingPeriod,
    pub seats: u32,
    pub amount_cents: u64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub promo_code: Option<String>,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// What the gateway is asked to collect.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub subscriber: Subscriber,
    pub amount_cents: u64,
    pub currency: String,
    pub method: PaymentMethod,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded { reference: String },
    Pending { reference: String },
    Declined { reason: String },
}

/// A payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Attempt to collect a payment.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Gateway`] if the provider cannot be reached.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, BillingError>;
}

/// Gateway for invoiced billing: every non-zero charge stays pending until
/// an operator confirms it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualGateway;

#[async_trait]
impl PaymentGateway for ManualGateway {
    fn name(&self) -> &str {
        "manual"
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, BillingError> {
        let reference = format!("manual-{}", request.payment_id.simple());
        if request.amount_cents == 0 {
            Ok(ChargeOutcome::Succeeded { reference })
        } else {
            Ok(ChargeOutcome::Pending { reference })
        }
    }
}

/// Requested plan change.
#[derive(Debug, Clone, Deserialize)]
pub struct UpgradeRequest {
    pub plan: Plan,
    pub period: BillingPeriod,
    #[serde(default)]
    pub seats: Option<u32>,
    pub method: PaymentMethod,
    #[serde(default)]
    pub promo_code: Option<String>,
}

/// Result of the expiry job for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed,
    AwaitingPayment,
    Downgraded,
}

/// Read access to subscriptions, shared with services that check plan
/// entitlements.
#[derive(Clone)]
pub struct SubscriptionStore {
    barrier: Arc<Barrier>,
}

impl SubscriptionStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// The subscriber's subscription, or the free one if none was bought.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] if storage fails.
    pub async fn get(&self, subscriber: Subscriber) -> Result<Subscription, BarrierError> {
        Ok(self
            .barrier
            .get_json(&subscription_key(subscriber))
            .await?
            .unwrap_or_else(|| Subscription::free(subscriber)))
    }

    /// The subscriber's current plan.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] if storage fails.
    pub async fn plan(&self, subscriber: Subscriber) -> Result<Plan, BarrierError> {
        Ok(self.get(subscriber).await?.plan)
    }

    async fn save(&self, subscription: &Subscription) -> Result<(), BarrierError> {
        self.barrier
            .put_json(&subscription_key(subscription.subscriber), subscription)
            .await
    }

    async fn all(&self) -> Result<Vec<Subscription>, BarrierError> {
        self.barrier.values_json(SUBSCRIPTION_PREFIX).await
    }
}

fn subscription_key(subscriber: Subscriber) -> String {
    format!("{SUBSCRIPTION_PREFIX}{}", subscriber.storage_id())
}

/// Billing for one tenant.
#[derive(Clone)]
pub struct BillingService {
    barrier: Arc<Barrier>,
    subscriptions: SubscriptionStore,
    teams: TeamService,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingService {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            subscriptions: SubscriptionStore::new(Arc::clone(&barrier)),
            teams: TeamService::new(Arc::clone(&barrier)),
            barrier,
            gateway,
        }
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    /// # Errors
    ///
    /// Returns [`BillingError::Barrier`] if storage fails.
    pub async fn subscription(&self, subscriber: Subscriber) -> Result<Subscription, BillingError> {
        Ok(self.subscriptions.get(subscriber).await?)
    }

    /// Price a plan change without committing to it.
    ///
    /// # Errors
    ///
    /// - [`BillingError::InvalidInput`] if the plan does not fit the subscriber.
    /// - [`BillingError::InvalidPromo`] / [`BillingError::NotFound`] for a bad promo code.
    pub async fn quote(&self, subscriber: Subscriber, request: &UpgradeRequest) -> Result<Quote, BillingError> {
        let seats = self.validate(subscriber, request).await?;
        let promo = self.find_promo(request.promo_code.as_deref()).await?;
        quote(request.plan, request.period, seats, promo.as_ref(), Utc::now())
    }

    /// Buy a plan. The subscription changes only once the payment is paid.
    ///
    /// # Errors
    ///
    /// - [`BillingError::Conflict`] while an earlier payment is pending.
    /// - [`BillingError::PaymentDeclined`] if the gateway declines.
    /// - [`BillingError::Gateway`] if the gateway fails.
    pub async fn upgrade(&self, subscriber: Subscriber, request: UpgradeRequest) -> Result<Payment, BillingError> {
        let now = Utc::now();
        let seats = self.validate(subscriber, &request).await?;
        let mut subscription = self.subscriptions.get(subscriber).await?;
        if subscription.pending_payment.is_some() {
            return Err(BillingError::Conflict {
                reason: "a payment is already awaiting confirmation".to_owned(),
            });
        }

        let mut promo = self.find_promo(request.promo_code.as_deref()).await?;
        let quote = quote(request.plan, request.period, seats, promo.as_ref(), now)?;
        let payment = self.charge(subscriber, &quote, request.method, now).await?;

        if payment.status != PaymentStatus::Failed {
            if let Some(promo) = promo.as_mut() {
                promo.remaining_uses = promo.remaining_uses.map(|n| n.saturating_sub(1));
                self.save_promo(promo).await?;
            }
        }

        match payment.status {
            PaymentStatus::Paid => {
                self.activate(&payment, now).await?;
            }
            PaymentStatus::Pending => {
                subscription.pending_payment = Some(payment.id);
                self.subscriptions.save(&subscription).await?;
            }
            PaymentStatus::Failed => {
                return Err(BillingError::PaymentDeclined {
                    reason: payment.failure_reason.unwrap_or_default(),
                });
            }
        }
        info!(subscriber = %subscriber, plan = ?payment.plan, status = ?payment.status, "plan purchase recorded");
        Ok(payment)
    }

    /// Mark a pending payment as paid and apply it.
    ///
    /// # Errors
    ///
    /// - [`BillingError::NotFound`] for an unknown payment.
    /// - [`BillingError::Conflict`] unless the payment is pending.
    pub async fn confirm_payment(&self, payment_id: Uuid) -> Result<Subscription, BillingError> {
        let mut payment = self.pending(payment_id).await?;
        let now = Utc::now();
        payment.status = PaymentStatus::Paid;
        payment.settled_at = Some(now);
        self.save_payment(&payment).await?;
        info!(payment_id = %payment_id, subscriber = %payment.subscriber, "payment confirmed");
        self.activate(&payment, now).await
    }

    /// Mark a pending payment as failed. The subscription is unchanged.
    ///
    /// # Errors
    ///
    /// - [`BillingError::NotFound`] for an unknown payment.
    /// - [`BillingError::Conflict`] unless the payment is pending.
    pub async fn reject_payment(&self, payment_id: Uuid, reason: &str) -> Result<Payment, BillingError> {
        let mut payment = self.pending(payment_id).await?;
        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_owned());
        payment.settled_at = Some(Utc::now());
        self.save_payment(&payment).await?;
        if let Some(code) = payment.promo_code.as_deref() {
            self.release_promo(code).await?;
        }

        let mut subscription = self.subscriptions.get(payment.subscriber).await?;
        if subscription.pending_payment == Some(payment_id) {
            subscription.pending_payment = None;
            self.subscriptions.save(&subscription).await?;
        }
        warn!(payment_id = %payment_id, reason, "payment rejected");
        Ok(payment)
    }

    /// Stop renewing at the end of the current period.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Conflict`] on a free plan.
    pub async fn cancel(&self, subscriber: Subscriber) -> Result<Subscription, BillingError> {
        let mut subscription = self.subscriptions.get(subscriber).await?;
        if subscription.plan.is_free() {
            return Err(BillingError::Conflict {
                reason: "free plans cannot be cancelled".to_owned(),
            });
        }
        subscription.cancel_at_period_end = true;
        subscription.auto_renew = false;
        self.subscriptions.save(&subscription).await?;
        info!(subscriber = %subscriber, "subscription set to cancel at period end");
        Ok(subscription)
    }

    /// Undo a pending cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Conflict`] unless a cancellation is pending.
    pub async fn reactivate(&self, subscriber: Subscriber) -> Result<Subscription, BillingError> {
        let mut subscription = self.subscriptions.get(subscriber).await?;
        if !subscription.cancel_at_period_end {
            return Err(BillingError::Conflict {
                reason: "subscription is not cancelled".to_owned(),
            });
        }
        subscription.cancel_at_period_end = false;
        subscription.auto_renew = subscription.payment_method.is_some_and(PaymentMethod::can_auto_renew);
        self.subscriptions.save(&subscription).await?;
        Ok(subscription)
    }

    /// Payment history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Barrier`] if storage fails.
    pub async fn payments(&self, subscriber: Subscriber) -> Result<Vec<Payment>, BillingError> {
        let prefix = format!("{SUBSCRIBER_PAYMENTS_PREFIX}{}/", subscriber.storage_id());
        let mut out = Vec::new();
        for key in self.barrier.list(&prefix).await? {
            let Some(id) = key.strip_prefix(&prefix) else { continue };
            if let Some(payment) = self.barrier.get_json::<Payment>(&format!("{PAYMENT_PREFIX}{id}")).await? {
                out.push(payment);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Payments awaiting operator confirmation, across all subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Barrier`] if storage fails.
    pub async fn pending_payments(&self) -> Result<Vec<Payment>, BillingError> {
        Ok(self
            .barrier
            .values_json::<Payment>(PAYMENT_PREFIX)
            .await?
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Pending)
            .collect())
    }

    /// Register or replace a promo code.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InvalidInput`] for an empty code or a
    /// percentage outside 1-100.
    pub async fn create_promo(&self, mut promo: PromoCode) -> Result<PromoCode, BillingError> {
        promo.code = promo.code.trim().to_uppercase();
        if promo.code.is_empty() || !promo.code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(BillingError::InvalidInput {
                reason: "promo code must be alphanumeric".to_owned(),
            });
        }
        if matches!(promo.discount, Discount::Percent(p) if p == 0 || p > 100) {
            return Err(BillingError::InvalidInput {
                reason: "percentage discount must be 1-100".to_owned(),
            });
        }
        self.save_promo(&promo).await?;
        Ok(promo)
    }

    /// Renew or downgrade every subscription whose period has ended.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Barrier`] if storage fails. Gateway failures
    /// downgrade the subscription instead of failing the run.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<(Subscriber, RenewalOutcome)>, BillingError> {
        let mut outcomes = Vec::new();
        for subscription in self.subscriptions.all().await? {
            let Some(end) = subscription.current_period_end else { continue };
            if subscription.plan.is_free() || end > now {
                continue;
            }
            let subscriber = subscription.subscriber;
            let outcome = if subscription.pending_payment.is_some() {
                if end + Duration::days(RENEWAL_GRACE_DAYS) > now {
                    continue;
                }
                self.downgrade(subscription).await?
            } else if subscription.auto_renew && !subscription.cancel_at_period_end {
                self.renew(subscription, now).await?
            } else {
                self.downgrade(subscription).await?
            };
            outcomes.push((subscriber, outcome));
        }
        Ok(outcomes)
    }

    /// Drop a subscriber's subscription and payment history.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Barrier`] if storage fails.
    pub async fn forget(&self, subscriber: Subscriber) -> Result<(), BillingError> {
        for payment in self.payments(subscriber).await? {
            self.barrier.delete(&format!("{PAYMENT_PREFIX}{}", payment.id)).await?;
        }
        self.barrier
            .delete_prefix(&format!("{SUBSCRIBER_PAYMENTS_PREFIX}{}/", subscriber.storage_id()))
            .await?;
        self.barrier.delete(&subscription_key(subscriber)).await?;
        Ok(())
    }

    async fn renew(&self, subscription: Subscription, now: DateTime<Utc>) -> Result<RenewalOutcome, BillingError> {
        let (Some(period), Some(method)) = (subscription.period, subscription.payment_method) else {
            return self.downgrade(subscription).await;
        };
        let quote = quote(subscription.plan, period, subscription.seats, None, now)?;
        match self.charge(subscription.subscriber, &quote, method, now).await {
            Ok(payment) if payment.status == PaymentStatus::Paid => {
                self.activate(&payment, now).await?;
                Ok(RenewalOutcome::Renewed)
            }
            Ok(payment) if payment.status == PaymentStatus::Pending => {
                let mut subscription = subscription;
                subscription.pending_payment = Some(payment.id);
                self.subscriptions.save(&subscription).await?;
                Ok(RenewalOutcome::AwaitingPayment)
            }
            Ok(_) => self.downgrade(subscription).await,
            Err(e) => {
                warn!(subscriber = %subscription.subscriber, error = %e, "renewal charge failed");
                self.downgrade(subscription).await
            }
        }
    }

    async fn downgrade(&self, subscription: Subscription) -> Result<RenewalOutcome, BillingError> {
        let subscriber = subscription.subscriber;
        let free = Subscription::free(subscriber);
        self.subscriptions.save(&free).await?;
        if let Subscriber::Team(team_id) = subscriber {
            self.set_team_seats(team_id, free.seats).await?;
        }
        info!(subscriber = %subscriber, from = ?subscription.plan, "subscription downgraded to free plan");
        Ok(RenewalOutcome::Downgraded)
    }

    /// Returns the number of seats to buy.
    async fn validate(&self, subscriber: Subscriber, request: &UpgradeRequest) -> Result<u32, BillingError> {
        if request.plan.is_team_plan() != subscriber.is_team() {
            return Err(BillingError::InvalidInput {
                reason: "plan does not apply to this kind of subscriber".to_owned(),
            });
        }
        if request.plan.is_free() {
            return Err(BillingError::InvalidInput {
                reason: "cancel the subscription to return to the free plan".to_owned(),
            });
        }
        if !request.plan.per_seat() {
            return Ok(request.plan.included_seats());
        }
        let seats = request.seats.unwrap_or(1);
        if seats == 0 || seats > MAX_SEATS {
            return Err(BillingError::InvalidInput {
                reason: format!("seats must be between 1 and {MAX_SEATS}"),
            });
        }
        if let Subscriber::Team(team_id) = subscriber {
            let occupied = self.teams.member_count(team_id).await.map_err(team_error)?;
            if u32::try_from(occupied).unwrap_or(u32::MAX) > seats {
                return Err(BillingError::InvalidInput {
                    reason: format!("team already has {occupied} members"),
                });
            }
        }
        Ok(seats)
    }

    async fn charge(
        &self,
        subscriber: Subscriber,
        quote: &Quote,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Payment, BillingError> {
        let mut payment = Payment {
            id: Uuid::new_v4(),
            subscriber,
            plan: quote.plan,
            period: quote.period,
            seats: quote.seats,
            amount_cents: quote.total_cents,
            currency: quote.currency.to_owned(),
            method,
            status: PaymentStatus::Pending,
            promo_code: quote.promo_code.clone(),
            gateway_reference: None,
            failure_reason: None,
            created_at: now,
            settled_at: None,
        };
        self.save_payment(&payment).await?;
        self.barrier
            .put_json(
                &format!("{SUBSCRIBER_PAYMENTS_PREFIX}{}/{}", subscriber.storage_id(), payment.id),
                &true,
            )
            .await?;

        let request = ChargeRequest {
            payment_id: payment.id,
            subscriber,
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            method,
            description: format!("{:?} plan, {:?}", quote.plan, quote.period),
        };
        let outcome = match self.gateway.charge(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(e.to_string());
                payment.settled_at = Some(now);
                self.save_payment(&payment).await?;
                return Err(e);
            }
        };

        match outcome {
            ChargeOutcome::Succeeded { reference } => {
                payment.status = PaymentStatus::Paid;
                payment.gateway_reference = Some(reference);
                payment.settled_at = Some(now);
            }
            ChargeOutcome::Pending { reference } => {
                payment.gateway_reference = Some(reference);
            }
            ChargeOutcome::Declined { reason } => {
                warn!(gateway = self.gateway.name(), subscriber = %subscriber, %reason, "charge declined");
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(reason);
                payment.settled_at = Some(now);
            }
        }
        self.save_payment(&payment).await?;
        Ok(payment)
    }

    async fn activate(&self, payment: &Payment, now: DateTime<Utc>) -> Result<Subscription, BillingError> {
        let mut subscription = self.subscriptions.get(payment.subscriber).await?;
        // Renewing the same plan continues from the old period end.
        let start = match subscription.current_period_end {
            Some(end) if subscription.plan == payment.plan && end + Duration::days(RENEWAL_GRACE_DAYS) > now => end,
            _ => now,
        };
        let end = start
            .checked_add_months(Months::new(payment.period.months()))
            .unwrap_or_else(|| start + Duration::days(i64::from(payment.period.months()) * 30));

        subscription.plan = payment.plan;
        subscription.period = Some(payment.period);
        subscription.seats = payment.seats;
        if subscription.started_at.is_none() || start == now {
            subscription.started_at = Some(now);
        }
        subscription.current_period_end = Some(end);
        subscription.auto_renew = payment.method.can_auto_renew();
        subscription.cancel_at_period_end = false;
        subscription.payment_method = Some(payment.method);
        subscription.promo_code = payment.promo_code.clone();
        subscription.pending_payment = None;
        self.subscriptions.save(&subscription).await?;

        if let Subscriber::Team(team_id) = payment.subscriber {
            self.set_team_seats(team_id, payment.seats).await?;
        }
        info!(subscriber = %payment.subscriber, plan = ?payment.plan, period_end = %end, "subscription activated");
        Ok(subscription)
    }

    async fn set_team_seats(&self, team_id: Uuid, seats: u32) -> Result<u32, BillingError> {
        self.teams.set_seats(team_id, seats).await.map_err(team_error)
    }

    async fn pending(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        let payment: Payment = self
            .barrier
            .get_json(&format!("{PAYMENT_PREFIX}{payment_id}"))
            .await?
            .ok_or_else(|| BillingError::NotFound {
                kind: "payment",
                id: payment_id.to_string(),
            })?;
        if payment.status == PaymentStatus::Pending {
            Ok(payment)
        } else {
            Err(BillingError::Conflict {
                reason: format!("payment is already {:?}", payment.status).to_lowercase(),
            })
        }
    }

    async fn find_promo(&self, code: Option<&str>) -> Result<Option<PromoCode>, BillingError> {
        let Some(code) = code.map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        self.barrier
            .get_json(&format!("{PROMO_PREFIX}{code}"))
            .await?
            .map(Some)
            .ok_or(BillingError::NotFound { kind: "promo code", id: code })
    }

    /// Give back a use reserved by a payment that never went through. A
    /// promo deleted in the meantime stays deleted.
    async fn release_promo(&self, code: &str) -> Result<(), BillingError> {
        let Some(mut promo) = self.barrier.get_json::<PromoCode>(&format!("{PROMO_PREFIX}{code}")).await? else {
            return Ok(());
        };
        if let Some(uses) = promo.remaining_uses {
            promo.remaining_uses = Some(uses.saturating_add(1));
            self.save_promo(&promo).await?;
        }
        Ok(())
    }

    async fn save_promo(&self, promo: &PromoCode) -> Result<(), BillingError> {
        self.barrier.put_json(&format!("{PROMO_PREFIX}{}", promo.code), promo).await?;
        Ok(())
    }

    async fn save_payment(&self, payment: &Payment) -> Result<(), BillingError> {
        self.barrier
            .put_json(&format!("{PAYMENT_PREFIX}{}", payment.id), payment)
            .await?;
        Ok(())
    }
}

fn team_error(e: TeamError) -> BillingError {
    match e {
        TeamError::Barrier(e) => BillingError::Barrier(e),
        TeamError::NotFound { kind, id } => BillingError::NotFound { kind, id: id.to_string() },
        other => BillingError::InvalidInput {
            reason: other.to_string(),
        },
    }
}
