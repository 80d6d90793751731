//! Subscription types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CustomerId, ExternalSubscriptionId, ParseEnumError, PlanId, PriceId, UserId};

/// Unix timestamp of 2999-12-31T23:59:59Z.
pub const FREE_TIER_PERIOD_END_SECS: i64 = 32_503_679_999;

/// Number of gateway event ids remembered per subscription.
pub const APPLIED_EVENT_HISTORY: usize = 20;

/// Period end used for free-tier subscriptions.
///
/// A fixed far-future instant rather than a sentinel so that period
/// comparisons in sweeps stay plain timestamp comparisons.
pub fn free_tier_period_end() -> DateTime<Utc> {
    DateTime::from_timestamp(FREE_TIER_PERIOD_END_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Unique subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In trial period
    Trialing,
    /// Subscription is active
    Active,
    /// Payment is past due
    PastDue,
    /// Subscription was canceled
    Canceled,
    /// Gateway gave up collecting payment
    Unpaid,
    /// First payment never completed
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Every status, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::Trialing,
        Self::Active,
        Self::PastDue,
        Self::Canceled,
        Self::Unpaid,
        Self::IncompleteExpired,
    ];

    /// Storage/wire representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::IncompleteExpired => "incomplete_expired",
        }
    }

    /// Statuses that make a subscription the user's current one
    pub const fn is_current(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active | Self::PastDue)
    }

    /// Terminal statuses are never left; a new record is created instead
    pub const fn is_terminal(&self) -> bool {
        !self.is_current()
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying in the same status is not a transition and returns false.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use SubscriptionStatus::*;
        match (*self, next) {
            (Trialing, Active) | (Trialing, PastDue) => true,
            (Active, PastDue) => true,
            (PastDue, Active) => true,
            (Trialing | Active | PastDue, Canceled | Unpaid | IncompleteExpired) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

/// Why a subscription stopped being current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// The user asked for it
    UserRequested,
    /// Consecutive payment failures reached the threshold
    PaymentFailed,
    /// Period ended without a renewal event
    PeriodExpired,
    /// Stayed past due longer than the grace window
    PastDueGraceExceeded,
    /// The gateway reported the subscription deleted
    GatewayCanceled,
    /// The gateway reported the subscription unpaid
    Unpaid,
    /// The first payment never completed
    IncompleteExpired,
    /// Superseded by a newer subscription (upgrade or reactivation)
    Replaced,
}

impl CancellationReason {
    /// Storage/metrics label
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::PaymentFailed => "payment_failed",
            Self::PeriodExpired => "period_expired",
            Self::PastDueGraceExceeded => "past_due_grace_exceeded",
            Self::GatewayCanceled => "gateway_canceled",
            Self::Unpaid => "unpaid",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Replaced => "replaced",
        }
    }
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed metadata carried by every subscription record.
///
/// Stored as a single JSON document next to the record. Every key is a
/// named field so transitions can be checked at compile time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionMetadata {
    /// Consecutive failed charge attempts since the last success
    pub payment_failure_count: u32,
    /// First time the subscription went past due in the current failure run
    pub first_past_due_at: Option<DateTime<Utc>>,
    /// Most recent failed charge attempt
    pub last_payment_failure_at: Option<DateTime<Utc>>,
    /// Set when this record was canceled
    pub cancellation_reason: Option<CancellationReason>,
    /// On a free-tier record: why the user was moved here
    pub downgrade_reason: Option<CancellationReason>,
    /// On a free-tier record: the paid plan the user came from
    pub original_plan_id: Option<PlanId>,
    /// On a free-tier record: the paid record that was canceled
    pub downgraded_from: Option<SubscriptionId>,
    /// On a reactivated record: the terminal record it replaces
    pub reactivated_from: Option<SubscriptionId>,
    /// Last reactivation (either path)
    pub reactivated_at: Option<DateTime<Utc>>,
    /// Number of reactivations applied to this record
    pub reactivation_count: u32,
    /// When the trial-ending notice went out
    pub trial_ending_notified_at: Option<DateTime<Utc>>,
    /// Checkout session that created this record
    pub checkout_session_id: Option<String>,
    /// Most recent gateway event ids applied to this record, oldest first
    pub applied_events: Vec<String>,
}

impl SubscriptionMetadata {
    /// Whether the given gateway event has already been applied
    pub fn has_applied(&self, event_id: &str) -> bool {
        self.applied_events.iter().any(|e| e == event_id)
    }

    /// Remember a gateway event id, dropping the oldest past the history size
    pub fn record_event(&mut self, event_id: impl Into<String>) {
        let event_id = event_id.into();
        if self.has_applied(&event_id) {
            return;
        }
        self.applied_events.push(event_id);
        if self.applied_events.len() > APPLIED_EVENT_HISTORY {
            let excess = self.applied_events.len() - APPLIED_EVENT_HISTORY;
            self.applied_events.drain(..excess);
        }
    }

    /// Clear the failure run after a successful charge
    pub fn reset_payment_failures(&mut self) {
        self.payment_failure_count = 0;
        self.first_past_due_at = None;
        self.last_payment_failure_at = None;
    }
}

/// User subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID
    pub id: SubscriptionId,
    /// User who owns the subscription
    pub user_id: UserId,
    /// Plan the subscription grants
    pub plan_id: PlanId,
    /// Subscription status
    pub status: SubscriptionStatus,
    /// Current billing period start
    pub current_period_start: DateTime<Utc>,
    /// Current billing period end
    pub current_period_end: DateTime<Utc>,
    /// Trial start (if the subscription had a trial)
    pub trial_start: Option<DateTime<Utc>>,
    /// Trial end (if the subscription had a trial)
    pub trial_end: Option<DateTime<Utc>>,
    /// Whether the subscription ends at `current_period_end`
    pub cancel_at_period_end: bool,
    /// When the subscription was canceled
    pub canceled_at: Option<DateTime<Utc>>,
    /// Gateway customer handle (None for free tier)
    pub customer_id: Option<CustomerId>,
    /// Gateway subscription handle (None for free tier)
    pub external_subscription_id: Option<ExternalSubscriptionId>,
    /// Gateway price handle (None for free tier)
    pub external_price_id: Option<PriceId>,
    /// Typed metadata
    pub metadata: SubscriptionMetadata,
    /// Optimistic concurrency version, bumped on every write
    pub version: i64,
    /// When the subscription was created
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether this is the user's current subscription
    pub fn is_current(&self) -> bool {
        self.status.is_current()
    }

    /// Whether the subscription is backed by a gateway subscription
    pub fn is_external(&self) -> bool {
        self.external_subscription_id.is_some()
    }

    /// Whether the current period has ended as of `now`
    pub fn period_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.current_period_end < now
    }
}
