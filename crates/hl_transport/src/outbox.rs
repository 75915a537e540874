//! Outbound retry queue.
//!
//! Messages wait in `pending` while offline and move to `in_flight` once
//! written to a live connection. The relay's echo (matched by local id)
//! removes them. On connection loss every in-flight entry goes back to the
//! front of `pending`, in original order, so the next flush resends them
//! exactly once and ahead of anything queued later.

use std::collections::VecDeque;

use hl_proto::QueuedMessage;

use crate::{config::QueueLimits, error::TransportError};

#[derive(Debug, Default)]
pub struct Outbox {
    pending: VecDeque<QueuedMessage>,
    in_flight: VecDeque<QueuedMessage>,
    limits: QueueLimits,
}

impl Outbox {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Refuse new entries beyond the global or per-recipient limit.
    pub fn check_capacity(&self, recipient_id: &str) -> Result<(), TransportError> {
        if self.len() >= self.limits.max_total {
            return Err(TransportError::QueueFull(format!(
                "global limit reached: {} >= {}",
                self.len(),
                self.limits.max_total
            )));
        }
        let for_recipient = self
            .pending
            .iter()
            .chain(self.in_flight.iter())
            .filter(|m| m.recipient_id == recipient_id)
            .count();
        if for_recipient >= self.limits.max_per_recipient {
            return Err(TransportError::QueueFull(format!(
                "limit for {recipient_id} reached: {for_recipient} >= {}",
                self.limits.max_per_recipient
            )));
        }
        Ok(())
    }

    pub fn push_pending(&mut self, msg: QueuedMessage) {
        self.pending.push_back(msg);
    }

    pub fn push_in_flight(&mut self, mut msg: QueuedMessage) {
        msg.attempts += 1;
        self.in_flight.push_back(msg);
    }

    /// Drain pending entries in enqueue order.
    pub fn take_pending(&mut self) -> Vec<QueuedMessage> {
        self.pending.drain(..).collect()
    }

    /// Remove an acknowledged entry, wherever it is.
    pub fn ack(&mut self, local_id: &str) -> Option<QueuedMessage> {
        if let Some(pos) = self.in_flight.iter().position(|m| m.local_id == local_id) {
            return self.in_flight.remove(pos);
        }
        let pos = self.pending.iter().position(|m| m.local_id == local_id)?;
        self.pending.remove(pos)
    }

    /// Remove an entry that has not been written to a connection yet.
    pub fn withdraw_pending(&mut self, local_id: &str) -> bool {
        match self.pending.iter().position(|m| m.local_id == local_id) {
            Some(pos) => self.pending.remove(pos).is_some(),
            None => false,
        }
    }

    /// Move in-flight entries back to the head of the pending queue.
    pub fn requeue_in_flight(&mut self) -> usize {
        let n = self.in_flight.len();
        while let Some(msg) = self.in_flight.pop_back() {
            self.pending.push_front(msg);
        }
        n
    }

    /// Everything not yet acknowledged, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.in_flight
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    /// Load a persisted snapshot ahead of anything queued since.
    pub fn restore(&mut self, entries: Vec<QueuedMessage>) {
        for msg in entries.into_iter().rev() {
            let known = self
                .pending
                .iter()
                .chain(self.in_flight.iter())
                .any(|m| m.local_id == msg.local_id);
            if !known {
                self.pending.push_front(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: &str, to: &str) -> QueuedMessage {
        QueuedMessage {
            local_id: id.into(),
            chat_id: "c1".into(),
            recipient_id: to.into(),
            ciphertext: "x".into(),
            iv: "y".into(),
            message_type: Default::default(),
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    fn ids(v: &[QueuedMessage]) -> Vec<&str> {
        v.iter().map(|m| m.local_id.as_str()).collect()
    }

    #[test]
    fn requeue_keeps_original_order_ahead_of_new() {
        let mut ob = Outbox::new(QueueLimits::default());
        ob.push_in_flight(msg("1", "bob"));
        ob.push_in_flight(msg("2", "bob"));
        ob.push_pending(msg("3", "bob"));

        assert_eq!(ob.requeue_in_flight(), 2);
        let drained = ob.take_pending();
        assert_eq!(ids(&drained), vec!["1", "2", "3"]);
        assert_eq!(drained[0].attempts, 1);
    }

    #[test]
    fn ack_removes_from_either_side() {
        let mut ob = Outbox::new(QueueLimits::default());
        ob.push_in_flight(msg("1", "bob"));
        ob.push_pending(msg("2", "bob"));
        assert!(ob.ack("2").is_some());
        assert!(ob.ack("1").is_some());
        assert!(ob.ack("1").is_none());
        assert!(ob.is_empty());

        ob.push_in_flight(msg("3", "bob"));
        assert!(!ob.withdraw_pending("3"));
        ob.push_pending(msg("4", "bob"));
        assert!(ob.withdraw_pending("4"));
    }

    #[test]
    fn limits_are_enforced() {
        let mut ob = Outbox::new(QueueLimits {
            max_total: 3,
            max_per_recipient: 2,
        });
        ob.push_pending(msg("1", "bob"));
        ob.push_pending(msg("2", "bob"));
        assert!(matches!(ob.check_capacity("bob"), Err(TransportError::QueueFull(_))));
        assert!(ob.check_capacity("carol").is_ok());
        ob.push_pending(msg("3", "carol"));
        assert!(matches!(ob.check_capacity("dave"), Err(TransportError::QueueFull(_))));
    }

    #[test]
    fn restore_skips_known_entries() {
        let mut ob = Outbox::new(QueueLimits::default());
        ob.push_pending(msg("3", "bob"));
        ob.restore(vec![msg("1", "bob"), msg("2", "bob"), msg("3", "bob")]);
        assert_eq!(ids(&ob.snapshot()), vec!["1", "2", "3"]);
    }
}
