//! Messages waiting to be forwarded to their destination.
//!
//! A message is retried while its destination is registered but not
//! writable, backing off exponentially between attempts, and dropped once its
//! attempts run out. A message for an unregistered destination is dropped at
//! once. Messages to the same destination are forwarded in the order they
//! were queued, and each destination holds at most
//! [`RetryPolicy::max_queued`] messages.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::protocol::Request;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub sender: String,
    pub destination: String,
    pub text: String,
    pub timestamp: f64,
}

impl PendingMessage {
    /// The `message` frame delivered to the destination.
    pub fn to_request(&self) -> Request {
        Request::Send {
            time: self.timestamp,
            sender: self.sender.clone(),
            destination: self.destination.clone(),
            text: self.text.clone(),
        }
    }
}

/// Result of one forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NotRegistered,
    NotWritable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Messages held per destination; further ones are dropped.
    pub max_queued: usize,
}

impl RetryPolicy {
    fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_queued: 256,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub dropped: usize,
    pub deferred: usize,
}

#[derive(Debug)]
struct Queued {
    message: PendingMessage,
    attempts: u32,
    not_before: Instant,
}

#[derive(Debug)]
pub struct RelayQueue {
    destinations: BTreeMap<String, VecDeque<Queued>>,
    len: usize,
    policy: RetryPolicy,
}

impl RelayQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            destinations: BTreeMap::new(),
            len: 0,
            policy,
        }
    }

    /// Queues `message`, or drops it when its destination is already full.
    /// Returns whether the message was queued.
    pub fn push(&mut self, message: PendingMessage, now: Instant) -> bool {
        let pending = self
            .destinations
            .entry(message.destination.clone())
            .or_default();
        if pending.len() >= self.policy.max_queued {
            warn!(
                sender = %message.sender,
                destination = %message.destination,
                queued = pending.len(),
                "destination backlog is full; message dropped"
            );
            return false;
        }

        pending.push_back(Queued {
            message,
            attempts: 0,
            not_before: now,
        });
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Earliest instant at which a queued message becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.destinations
            .values()
            .flatten()
            .map(|queued| queued.not_before)
            .min()
    }

    /// Drops every queued message, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.destinations.clear();
        self.len = 0;
        dropped
    }

    /// Offers due messages to `attempt`, destination by destination and in
    /// queue order within a destination.
    ///
    /// Once a destination has a message it cannot take (or one still backing
    /// off), later messages for it are not offered this pass; each of them
    /// that is due is still charged an attempt, so every message is dropped
    /// after its own `max_attempts`.
    pub fn drain<F>(&mut self, now: Instant, mut attempt: F) -> DrainReport
    where
        F: FnMut(&PendingMessage) -> Delivery,
    {
        let policy = self.policy;
        let mut report = DrainReport::default();

        self.destinations.retain(|_, pending| {
            let mut blocked = false;
            let mut kept = VecDeque::with_capacity(pending.len());

            for mut queued in pending.drain(..) {
                if queued.not_before > now {
                    blocked = true;
                    report.deferred += 1;
                    kept.push_back(queued);
                    continue;
                }

                let delivery = if blocked {
                    Delivery::NotWritable
                } else {
                    attempt(&queued.message)
                };
                match delivery {
                    Delivery::Delivered => report.delivered += 1,
                    Delivery::NotRegistered => {
                        warn!(
                            sender = %queued.message.sender,
                            destination = %queued.message.destination,
                            "destination is not registered; message dropped"
                        );
                        report.dropped += 1;
                    }
                    Delivery::NotWritable => {
                        blocked = true;
                        queued.attempts += 1;
                        if queued.attempts >= policy.max_attempts {
                            warn!(
                                sender = %queued.message.sender,
                                destination = %queued.message.destination,
                                attempts = queued.attempts,
                                "destination stayed unwritable; message dropped"
                            );
                            report.dropped += 1;
                            continue;
                        }

                        queued.not_before = now + policy.backoff(queued.attempts);
                        report.deferred += 1;
                        kept.push_back(queued);
                    }
                }
            }

            *pending = kept;
            !pending.is_empty()
        });

        self.len = self.destinations.values().map(VecDeque::len).sum();
        report
    }
}
