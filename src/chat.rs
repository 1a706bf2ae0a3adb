use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::ParticipantId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Wall clock that never repeats or goes backwards, so `{sender}-{millis}` ids stay unique.
#[derive(Debug, Default)]
pub struct ChatClock {
    last_millis: i64,
}

impl ChatClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> DateTime<Utc> {
        self.tick_from(Utc::now())
    }

    fn tick_from(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let millis = now.timestamp_millis();
        if millis > self.last_millis {
            self.last_millis = millis;
            return now;
        }
        self.last_millis += 1;
        DateTime::from_timestamp_millis(self.last_millis).unwrap_or(now)
    }
}

impl ChatMessage {
    pub(crate) fn outgoing(
        clock: &mut ChatClock,
        sender_id: ParticipantId,
        sender_name: String,
        message: String,
    ) -> Self {
        let timestamp = clock.tick();
        Self {
            id: format!("{}-{}", sender_id, timestamp.timestamp_millis()),
            sender_id,
            sender_name,
            message,
            timestamp,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_clock_is_strictly_increasing() {
        let mut clock = ChatClock::new();
        let now = Utc::now();

        let first = clock.tick_from(now);
        let second = clock.tick_from(now);
        let third = clock.tick_from(now - chrono::Duration::seconds(5));

        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_outgoing_ids_are_unique() {
        let mut clock = ChatClock::new();
        let a = ChatMessage::outgoing(&mut clock, "id-a".into(), "Alice".into(), "hi".into());
        let b = ChatMessage::outgoing(&mut clock, "id-a".into(), "Alice".into(), "hi".into());

        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("id-a-"));
        assert_eq!(a.sender_id, ParticipantId::from("id-a"));
    }
}
