//! Event envelope: the metadata + payload wrapper attached to every domain
//! event before transmission.
//!
//! An [`Envelope`] is constructed once, serialized, and discarded after
//! transmission. It is never mutated in place; the only sanctioned adjustment
//! is [`Envelope::with_correlation_id`], which produces a new envelope for
//! correlation override at the routing boundary.
//!
//! # Correlation
//!
//! The `correlation_id` is an opaque token propagated across all envelopes
//! produced while handling one originating request. Callers that already hold
//! a correlation id pass it in; otherwise one is generated at construction.
//!
//! # Event kinds
//!
//! Event kinds are a closed set ([`EventKind`]). Adding a new kind means
//! adding an enum variant and a payload variant, not introducing a new
//! generic event class. Each kind carries a stable wire tag and a semantic
//! schema version for its payload shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of domain event kinds Herald knows how to deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A room booking was created.
    BookingCreated,
    /// A room booking was cancelled.
    BookingCancelled,
    /// A reminder for an upcoming booking is due.
    BookingReminder,
    /// A support ticket was opened.
    TicketCreated,
    /// A support ticket moved to a new status.
    TicketStatusChanged,
    /// A comment was added to a support ticket.
    TicketCommentAdded,
    /// A support ticket was assigned to an agent.
    TicketAssigned,
}

impl EventKind {
    /// Every kind, in declaration order. Used by consumers to enumerate
    /// bindings and by the codec registry.
    pub const ALL: [Self; 7] = [
        Self::BookingCreated,
        Self::BookingCancelled,
        Self::BookingReminder,
        Self::TicketCreated,
        Self::TicketStatusChanged,
        Self::TicketCommentAdded,
        Self::TicketAssigned,
    ];

    /// Stable wire tag for this kind.
    ///
    /// Used as the default routing key, the AMQP `type` property, and the
    /// payload discriminator in the JSON body.
    #[must_use]
    pub const fn wire_tag(self) -> &'static str {
        match self {
            Self::BookingCreated => "booking.created",
            Self::BookingCancelled => "booking.cancelled",
            Self::BookingReminder => "booking.reminder",
            Self::TicketCreated => "ticket.created",
            Self::TicketStatusChanged => "ticket.status-changed",
            Self::TicketCommentAdded => "ticket.comment-added",
            Self::TicketAssigned => "ticket.assigned",
        }
    }

    /// Semantic version of this kind's payload shape.
    #[must_use]
    pub const fn schema_version(self) -> &'static str {
        match self {
            Self::TicketStatusChanged => "1.1.0",
            _ => "1.0.0",
        }
    }

    /// Resolve a wire tag back to its kind. Returns `None` for tags outside
    /// the closed set.
    #[must_use]
    pub fn from_wire_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_tag() == tag)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_tag())
    }
}

/// Status values a support ticket can move through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TicketStatus {
    /// Newly opened, not yet picked up.
    Open,
    /// An agent is working on it.
    InProgress,
    /// A fix or answer was provided.
    Resolved,
    /// Closed, no further work expected.
    Closed,
}

/// Variant data specific to each event kind.
///
/// The serialized form is adjacently tagged: the `kind` field carries the
/// wire tag, the `data` field the variant payload. The tag doubles as the
/// payload discriminator on the wire, so the codec never needs a separate
/// kind registry lookup to deserialize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    /// Payload for [`EventKind::BookingCreated`].
    #[serde(rename = "booking.created")]
    BookingCreated {
        /// The new booking.
        booking_id: Uuid,
        /// The room being booked.
        room_id: Uuid,
        /// Where the confirmation notification goes.
        guest_email: String,
        /// Start of the stay.
        starts_at: DateTime<Utc>,
        /// End of the stay.
        ends_at: DateTime<Utc>,
    },

    /// Payload for [`EventKind::BookingCancelled`].
    #[serde(rename = "booking.cancelled")]
    BookingCancelled {
        /// The cancelled booking.
        booking_id: Uuid,
        /// The room freed up.
        room_id: Uuid,
        /// Optional caller-supplied cancellation reason.
        reason: Option<String>,
    },

    /// Payload for [`EventKind::BookingReminder`].
    #[serde(rename = "booking.reminder")]
    BookingReminder {
        /// The booking the reminder is about.
        booking_id: Uuid,
        /// Where the reminder notification goes.
        guest_email: String,
        /// Start of the stay being reminded about.
        starts_at: DateTime<Utc>,
    },

    /// Payload for [`EventKind::TicketCreated`].
    #[serde(rename = "ticket.created")]
    TicketCreated {
        /// The new ticket.
        ticket_id: Uuid,
        /// The user who opened it.
        author_id: Uuid,
        /// Ticket title as entered.
        title: String,
    },

    /// Payload for [`EventKind::TicketStatusChanged`].
    #[serde(rename = "ticket.status-changed")]
    TicketStatusChanged {
        /// The ticket that changed.
        ticket_id: Uuid,
        /// Status before the change.
        old_status: TicketStatus,
        /// Status after the change.
        new_status: TicketStatus,
    },

    /// Payload for [`EventKind::TicketCommentAdded`].
    #[serde(rename = "ticket.comment-added")]
    TicketCommentAdded {
        /// The ticket commented on.
        ticket_id: Uuid,
        /// The new comment.
        comment_id: Uuid,
        /// The comment's author.
        author_id: Uuid,
    },

    /// Payload for [`EventKind::TicketAssigned`].
    #[serde(rename = "ticket.assigned")]
    TicketAssigned {
        /// The ticket being assigned.
        ticket_id: Uuid,
        /// The agent now responsible.
        assignee_id: Uuid,
    },
}

impl EventPayload {
    /// The kind discriminator for this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::BookingCreated { .. } => EventKind::BookingCreated,
            Self::BookingCancelled { .. } => EventKind::BookingCancelled,
            Self::BookingReminder { .. } => EventKind::BookingReminder,
            Self::TicketCreated { .. } => EventKind::TicketCreated,
            Self::TicketStatusChanged { .. } => EventKind::TicketStatusChanged,
            Self::TicketCommentAdded { .. } => EventKind::TicketCommentAdded,
            Self::TicketAssigned { .. } => EventKind::TicketAssigned,
        }
    }
}

/// Immutable metadata + payload wrapper attached to every domain event.
///
/// `event_id` is globally unique per logical occurrence; `correlation_id` is
/// stable across all envelopes produced while handling one originating
/// request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of this logical occurrence. Becomes the AMQP `message-id`.
    pub event_id: Uuid,
    /// Tracing token shared by all envelopes of one originating request.
    pub correlation_id: String,
    /// UTC instant the envelope was constructed.
    pub timestamp: DateTime<Utc>,
    /// Name of the service that produced the event.
    pub source_service: String,
    /// Semantic version of the payload shape, from the kind registry.
    pub schema_version: String,
    /// The event data, discriminated by kind.
    pub payload: EventPayload,
}

impl Envelope {
    /// Construct an envelope for `payload`, generating `event_id` and
    /// `timestamp` now.
    ///
    /// When `correlation_id` is `None` a fresh one is generated; pass the
    /// originating request's id to keep a trace across events.
    #[must_use]
    pub fn new(
        source_service: impl Into<String>,
        correlation_id: Option<String>,
        payload: EventPayload,
    ) -> Self {
        let kind = payload.kind();
        Self {
            event_id: Uuid::new_v4(),
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Utc::now(),
            source_service: source_service.into(),
            schema_version: kind.schema_version().to_string(),
            payload,
        }
    }

    /// The kind discriminator of the wrapped payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Produce a copy of this envelope carrying a different correlation id.
    ///
    /// Used by the delivery router when the caller supplies an explicit
    /// correlation id; everything else, including `event_id`, is unchanged.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}
