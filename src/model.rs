use serde::{Deserialize, Serialize};

/// Unix milliseconds. Every instant in the engine uses this.
pub type Ms = i64;

pub type ResourceId = u64;
pub type IntervalId = u64;
pub type BookingId = u64;
pub type SubscriptionId = u64;
pub type NotificationId = u64;
/// Opaque reference to a user managed outside the engine.
pub type UserId = u64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A bookable parking spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub owner_id: UserId,
    pub label: String,
    pub rate_hour: f64,
    pub rate_day: f64,
    pub active: bool,
}

/// A published availability window. Free until a booking consumes it whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: IntervalId,
    pub resource_id: ResourceId,
    pub span: Span,
    pub booked: bool,
    pub booked_by: Option<UserId>,
    pub booked_at: Option<Ms>,
}

impl Interval {
    pub fn new(id: IntervalId, resource_id: ResourceId, span: Span) -> Self {
        Self {
            id,
            resource_id,
            span,
            booked: false,
            booked_by: None,
            booked_at: None,
        }
    }

    pub fn is_free(&self) -> bool {
        !self.booked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// Recorded on behalf of an external payment collaborator; never acted on here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    /// Non-owning link; the interval outlives the booking.
    pub interval_id: IntervalId,
    pub span: Span,
    pub total_price: f64,
    pub duration_hours: f64,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// Standing "tell me when this frees up" request. Fires at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    /// `None` matches any resource.
    pub resource_id: Option<ResourceId>,
    pub span: Span,
    pub active: bool,
}

impl Subscription {
    /// Half-open overlap, same as every other span test: a freed window that
    /// only touches the subscription's edge does not match.
    pub fn matches(&self, resource_id: ResourceId, freed: &Span) -> bool {
        self.active
            && self.resource_id.is_none_or(|r| r == resource_id)
            && self.span.overlaps(freed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
    pub resource_id: ResourceId,
    pub window: Span,
    pub text: String,
    pub read: bool,
    pub created_at: Ms,
}

/// WAL record format. One record per committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: ResourceId,
        owner_id: UserId,
        label: String,
        rate_hour: f64,
        rate_day: f64,
    },
    RatesUpdated {
        id: ResourceId,
        rate_hour: f64,
        rate_day: f64,
    },
    ResourceActiveSet {
        id: ResourceId,
        active: bool,
    },
    IntervalAdded {
        id: IntervalId,
        resource_id: ResourceId,
        span: Span,
    },
    IntervalRemoved {
        id: IntervalId,
        resource_id: ResourceId,
    },
    /// Interval flip to booked plus the new booking row.
    BookingConfirmed {
        booking: Booking,
    },
    /// Booking flip to cancelled, interval release, and everything the matcher fired.
    BookingCancelled {
        id: BookingId,
        interval_id: IntervalId,
        fired: Vec<Notification>,
    },
    PaymentStatusSet {
        id: BookingId,
        status: PaymentStatus,
    },
    SubscriptionCreated {
        subscription: Subscription,
    },
    SubscriptionDeactivated {
        id: SubscriptionId,
    },
    /// Restores a notification verbatim; written by compaction only.
    NotificationRestored {
        notification: Notification,
    },
    /// Exactly the notifications that were pending when the read was planned.
    NotificationsRead {
        user_id: UserId,
        ids: Vec<NotificationId>,
    },
}

/// Result of the pricing calculator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub amount: f64,
    pub duration_hours: f64,
}
