//! Unread accounting: the exact count over a cached thread, and the
//! monotone lower-bound tally used while the thread is not cached.

use chrono::{DateTime, Utc};

use crate::models::Message;

/// Exact unread count: incoming messages strictly past the read cutoff.
/// `last_read = None` means nothing from this peer has been read yet.
pub fn count(messages: &[Message], self_id: &str, last_read: Option<DateTime<Utc>>) -> u32 {
    messages
        .iter()
        .filter(|m| m.sender_id != self_id)
        .filter(|m| match last_read {
            Some(cutoff) => m.timestamp > cutoff,
            None => true,
        })
        .count() as u32
}

/// Unread figure carried by a conversation summary.
///
/// `LowerBound` is the fallback used while the full thread is not cached:
/// bumped once per observed incoming message, raised to a reported floor,
/// and replaced only by an exact recount or by the thread being opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnreadTally {
    Exact(u32),
    LowerBound(u32),
}

impl UnreadTally {
    pub fn get(&self) -> u32 {
        match self {
            UnreadTally::Exact(n) | UnreadTally::LowerBound(n) => *n,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, UnreadTally::Exact(_))
    }

    /// One more observed incoming message while the thread is not cached
    pub fn bump(&mut self) {
        *self = UnreadTally::LowerBound(self.get() + 1);
    }

    /// Raise the lower bound to at least `floor`; an exact tally is left alone
    pub fn raise_to(&mut self, floor: u32) {
        if !self.is_exact() && floor > self.get() {
            *self = UnreadTally::LowerBound(floor);
        }
    }

    /// Replace with an exact recount
    pub fn set_exact(&mut self, n: u32) {
        *self = UnreadTally::Exact(n);
    }

    /// The thread was opened; everything is read
    pub fn clear(&mut self) {
        *self = UnreadTally::Exact(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageContent};
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn msg(id: &str, sender: &str, at: DateTime<Utc>) -> Message {
        Message::confirmed(id, sender, MessageContent::text("hi"), at)
    }

    #[test]
    fn test_count_respects_cutoff_and_sender() {
        let messages = vec![
            msg("m1", "other", ts(10, 0)),
            msg("m2", "self", ts(10, 5)),
            msg("m3", "other", ts(10, 10)),
        ];
        assert_eq!(count(&messages, "self", Some(ts(10, 2))), 1);
    }

    #[test]
    fn test_count_with_no_read_state() {
        let messages = vec![
            msg("m1", "other", ts(10, 0)),
            msg("m2", "self", ts(10, 5)),
            msg("m3", "other", ts(10, 10)),
        ];
        // Nothing read yet: every incoming message counts
        assert_eq!(count(&messages, "self", None), 2);
    }

    #[test]
    fn test_count_ignores_own_messages() {
        let messages = vec![msg("m1", "self", ts(10, 0)), msg("m2", "self", ts(10, 5))];
        assert_eq!(count(&messages, "self", None), 0);
    }

    #[test]
    fn test_cutoff_is_exclusive() {
        let messages = vec![msg("m1", "other", ts(10, 0))];
        assert_eq!(count(&messages, "self", Some(ts(10, 0))), 0);
    }

    #[test]
    fn test_tally_bump_never_decreases() {
        let mut tally = UnreadTally::LowerBound(0);
        tally.bump();
        tally.bump();
        assert_eq!(tally, UnreadTally::LowerBound(2));

        tally.raise_to(1);
        assert_eq!(tally.get(), 2);

        tally.raise_to(5);
        assert_eq!(tally, UnreadTally::LowerBound(5));
    }

    #[test]
    fn test_tally_exact_replacement() {
        let mut tally = UnreadTally::LowerBound(3);
        tally.set_exact(7);
        assert_eq!(tally, UnreadTally::Exact(7));

        // A floor never disturbs an exact figure
        tally.raise_to(10);
        assert_eq!(tally, UnreadTally::Exact(7));
    }

    #[test]
    fn test_tally_clear_on_open() {
        let mut tally = UnreadTally::LowerBound(4);
        tally.clear();
        assert_eq!(tally, UnreadTally::Exact(0));
    }
}
