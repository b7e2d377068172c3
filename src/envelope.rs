use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Message container moved between the outbox and the queue.
///
/// An `Envelope` bundles an opaque payload with the delivery metadata the
/// queue acts on. Payload encoding and decoding belong to the caller; the
/// queue only ever stores the bytes.
///
/// ## Scheduling
///
/// A message can be held back until a future moment, expressed either as an
/// absolute [`scheduled_time`](Envelope::scheduled_time) or as a
/// [`schedule_delay`](Envelope::schedule_delay) relative to the store's
/// clock at send time. A message with neither becomes visible to consumers
/// immediately.
///
/// ## Expiration
///
/// [`deliver_by`](Envelope::deliver_by) is an absolute deadline. Once the
/// store's clock passes it the message must not be delivered anymore and is
/// removed by [`Queue::delete_expired`](crate::Queue::delete_expired). A
/// message without a deadline never expires.
///
/// ## Example
///
/// ```rust
/// use chrono::Duration;
/// use postbox::Envelope;
///
/// let envelope = Envelope::new("billing", b"invoice-42".to_vec())
///     .schedule_after(Duration::minutes(5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Globally unique message identifier, the natural key for idempotent
    /// insertion.
    pub id: Uuid,
    /// Name of the logical queue the message belongs to.
    pub destination: String,
    /// Opaque serialized body.
    pub payload: Vec<u8>,
    /// Absolute deadline after which the message must not be delivered.
    pub deliver_by: Option<DateTime<Utc>>,
    /// Absolute moment before which the message must not become ready.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Relative hold duration, resolved against the store clock on send.
    pub schedule_delay: Option<Duration>,
}

impl Envelope {
    /// Create an envelope with a fresh identifier and no scheduling
    /// metadata.
    pub fn new(destination: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: destination.into(),
            payload: payload.into(),
            deliver_by: None,
            scheduled_time: None,
            schedule_delay: None,
        }
    }

    /// Set an absolute delivery deadline.
    pub fn deliver_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deadline);
        self
    }

    /// Hold the message until an absolute moment.
    pub fn schedule_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    /// Hold the message for a duration relative to the store clock at send
    /// time.
    pub fn schedule_after(mut self, delay: Duration) -> Self {
        self.schedule_delay = Some(delay);
        self
    }

    /// The moment before which the message must stay invisible, if any.
    ///
    /// An absolute `scheduled_time` wins over a relative `schedule_delay`.
    pub fn scheduled_moment(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.scheduled_time
            .or_else(|| self.schedule_delay.map(|delay| now + delay))
    }

    /// Whether the message must be persisted as scheduled rather than ready.
    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_moment(now)
            .is_some_and(|moment| moment > now)
    }

    /// Whether the delivery deadline has irrevocably passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// Pin the schedule to an absolute moment against the store clock.
    pub(crate) fn resolve_schedule(&mut self, now: DateTime<Utc>) {
        self.scheduled_time = self.scheduled_moment(now);
        self.schedule_delay = None;
    }

    /// State the message takes when entering the queue at `now`.
    pub(crate) fn state_at(&self, now: DateTime<Utc>) -> MessageState {
        if self.is_scheduled_for_later(now) {
            MessageState::Scheduled
        } else {
            MessageState::Ready
        }
    }
}

/// Delivery state of a message.
///
/// A message is in exactly one state at any instant. `Outgoing` messages
/// live in the outbox; queue rows only ever hold `Scheduled` or `Ready`.
/// A `Scheduled` row becomes `Ready` once its scheduled time passes the
/// store clock; a `Ready` row stays visible to consumers until deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Recorded in the outbox, awaiting forwarding into a queue.
    Outgoing,
    /// Held invisible until the scheduled time.
    Scheduled,
    /// Visible to consumers.
    Ready,
}

impl MessageState {
    /// Stable textual form used by the relational backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Outgoing => "outgoing",
            MessageState::Scheduled => "scheduled",
            MessageState::Ready => "ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn message_without_schedule_is_ready() {
        let envelope = Envelope::new("one", b"payload".to_vec());

        assert!(!envelope.is_scheduled_for_later(noon()));
        assert_eq!(envelope.state_at(noon()), MessageState::Ready);
    }

    #[test]
    fn future_delay_resolves_against_the_given_clock() {
        let envelope = Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::hours(1));

        assert_eq!(
            envelope.scheduled_moment(noon()),
            Some(noon() + Duration::hours(1))
        );
        assert!(envelope.is_scheduled_for_later(noon()));
        assert_eq!(envelope.state_at(noon()), MessageState::Scheduled);
    }

    #[test]
    fn absolute_schedule_wins_over_delay() {
        let pinned = noon() + Duration::minutes(10);
        let envelope = Envelope::new("one", b"payload".to_vec())
            .schedule_at(pinned)
            .schedule_after(Duration::hours(5));

        assert_eq!(envelope.scheduled_moment(noon()), Some(pinned));
    }

    #[test]
    fn past_schedule_is_not_scheduled_for_later() {
        let envelope =
            Envelope::new("one", b"payload".to_vec()).schedule_at(noon() - Duration::hours(1));

        assert!(!envelope.is_scheduled_for_later(noon()));
        assert_eq!(envelope.state_at(noon()), MessageState::Ready);
    }

    #[test]
    fn resolve_schedule_pins_the_delay() {
        let mut envelope =
            Envelope::new("one", b"payload".to_vec()).schedule_after(Duration::minutes(30));
        envelope.resolve_schedule(noon());

        assert_eq!(
            envelope.scheduled_time,
            Some(noon() + Duration::minutes(30))
        );
        assert_eq!(envelope.schedule_delay, None);
    }

    #[test]
    fn expiry_requires_a_deadline() {
        let envelope = Envelope::new("one", b"payload".to_vec());
        assert!(!envelope.is_expired(noon() + Duration::days(365)));

        let doomed = envelope.clone().deliver_by(noon() - Duration::hours(1));
        assert!(doomed.is_expired(noon()));

        let alive =
            Envelope::new("one", b"payload".to_vec()).deliver_by(noon() + Duration::hours(1));
        assert!(!alive.is_expired(noon()));
    }
}
