use std::collections::HashMap;

use time::PrimitiveDateTime;
use tracing::{debug, trace};

use crate::classifier::{LogEvent, Subsystem, collapse_whitespace};

/// Per-recipient delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Sent,
    Forwarded,
    Deferred,
    Bounced,
    Rejected,
    Expired,
    Discarded,
    Held,
}

impl Disposition {
    /// Dispositions that settle a recipient for good. Deferrals do not:
    /// the message stays queued and the same recipient shows up again.
    pub fn settles(self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Forwarded | Self::Bounced | Self::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    pub queue_id: String,
    pub timestamp: PrimitiveDateTime,
    pub daemon: String,
    pub disposition: Disposition,
    pub recipient: Option<String>,
    pub relay: Option<String>,
    pub delay: Option<f64>,
    pub dsn: Option<String>,
    pub reason: Option<String>,
    /// Sender/size attribution merged in from the record, when known.
    pub sender: Option<String>,
    pub size: Option<u64>,
    /// First deferral seen for this queue id, for the distinct-messages
    /// deferred counter.
    pub first_deferral: bool,
}

/// What the correlator hands downstream.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Emitted once per distinct queue id, the first time its size is
    /// known from a queue-manager line.
    Received {
        queue_id: String,
        timestamp: PrimitiveDateTime,
        sender: Option<String>,
        size: u64,
    },
    Recipient(RecipientOutcome),
    /// Emitted at eviction when recipients were delivered but the size
    /// never showed up in the scanned span.
    SizeMissing {
        queue_id: String,
        sender: Option<String>,
        count: u64,
    },
}

/// Transient per-queue-id correlation state.
#[derive(Debug, Default)]
struct MessageRecord {
    sender: Option<String>,
    size: Option<u64>,
    nrcpt: Option<u64>,
    settled: u64,
    sizeless_delivered: u64,
    deferred_seen: bool,
}

impl MessageRecord {
    fn complete(&self) -> bool {
        self.nrcpt.is_some_and(|n| self.settled >= n)
    }

    fn size_missing_outcome(&self, queue_id: &str) -> Option<Outcome> {
        if self.size.is_none() && self.sizeless_delivered > 0 {
            Some(Outcome::SizeMissing {
                queue_id: queue_id.to_string(),
                sender: self.sender.clone(),
                count: self.sizeless_delivered,
            })
        } else {
            None
        }
    }
}

/// Tracks in-flight messages by queue id and merges their fields across
/// lines. Memory is bounded by concurrently unresolved messages, not by
/// log size; queue-id reuse over long spans is an accepted source of
/// minor misattribution since the logs carry no scope-unique id.
#[derive(Debug, Default)]
pub struct Correlator {
    records: HashMap<String, MessageRecord>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    /// Consumes one event and emits zero or more completed sub-events.
    pub fn observe(&mut self, event: &LogEvent) -> Vec<Outcome> {
        let Some(queue_id) = event.queue_id.as_deref() else {
            return Vec::new();
        };

        // hold:/discard: actions land against the queue id without any
        // prior recipient line.
        if let Some(rest) = event.text.strip_prefix("hold: ") {
            return vec![self.direct_outcome(event, Disposition::Held, rest)];
        }
        if let Some(rest) = event.text.strip_prefix("discard: ") {
            return vec![self.direct_outcome(event, Disposition::Discarded, rest)];
        }

        match event.subsystem {
            Subsystem::Qmgr | Subsystem::Cleanup => {
                self.observe_queue_manager(queue_id, event)
            }
            Subsystem::Bounce => {
                vec![self.direct_outcome(event, Disposition::Bounced, &event.text)]
            }
            kind if kind.is_delivery_agent() => {
                self.observe_delivery(queue_id, event)
            }
            _ => Vec::new(),
        }
    }

    /// End of input: flushes stragglers. Sorted by queue id so the
    /// resulting tallies are deterministic.
    pub fn finish(&mut self) -> Vec<Outcome> {
        let mut drained: Vec<(String, MessageRecord)> =
            self.records.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        drained
            .iter()
            .filter_map(|(queue_id, record)| record.size_missing_outcome(queue_id))
            .collect()
    }

    fn observe_queue_manager(
        &mut self,
        queue_id: &str,
        event: &LogEvent,
    ) -> Vec<Outcome> {
        let mut emitted = Vec::new();
        let record = self.records.entry(queue_id.to_string()).or_default();

        if let Some(sender) = event.field("from") {
            if record.sender.is_none() {
                record.sender = Some(sender.to_string());
            }
        }

        if let Some(size) = event.size() {
            if record.size.is_none() {
                record.size = Some(size);
                emitted.push(Outcome::Received {
                    queue_id: queue_id.to_string(),
                    timestamp: event.timestamp,
                    sender: record.sender.clone(),
                    size,
                });
            }
        }

        if let Some(nrcpt) = event.nrcpt() {
            record.nrcpt = Some(nrcpt);
        }

        if event.field("status") == Some("expired") {
            // The queue manager gave up on the whole message.
            let record = self.records.remove(queue_id).unwrap_or_default();
            emitted.push(Outcome::Recipient(RecipientOutcome {
                queue_id: queue_id.to_string(),
                timestamp: event.timestamp,
                daemon: event.daemon.clone(),
                disposition: Disposition::Expired,
                recipient: None,
                relay: None,
                delay: None,
                dsn: None,
                reason: event.field("reason").map(str::to_string),
                sender: record.sender.clone(),
                size: record.size,
                first_deferral: false,
            }));
            if let Some(missing) = record.size_missing_outcome(queue_id) {
                emitted.push(missing);
            }
        } else if self.records.get(queue_id).is_some_and(MessageRecord::complete)
        {
            emitted.extend(self.evict(queue_id));
        }

        emitted
    }

    fn observe_delivery(
        &mut self,
        queue_id: &str,
        event: &LogEvent,
    ) -> Vec<Outcome> {
        let Some(status) = event.field("status") else {
            return Vec::new();
        };

        let reason = event.field("reason");
        let disposition = match status {
            "sent" => {
                if reason.is_some_and(|r| r.starts_with("forwarded as")) {
                    Disposition::Forwarded
                } else {
                    Disposition::Sent
                }
            }
            "deferred" => Disposition::Deferred,
            "bounced" => Disposition::Bounced,
            "expired" => Disposition::Expired,
            other => {
                debug!("unrecognized delivery status: status={other}");
                return Vec::new();
            }
        };

        let record = self.records.entry(queue_id.to_string()).or_default();

        let first_deferral =
            disposition == Disposition::Deferred && !record.deferred_seen;
        if first_deferral {
            record.deferred_seen = true;
        }
        if matches!(disposition, Disposition::Sent | Disposition::Forwarded)
            && record.size.is_none()
        {
            record.sizeless_delivered += 1;
        }
        if disposition.settles() {
            record.settled += 1;
        }

        let mut emitted = vec![Outcome::Recipient(RecipientOutcome {
            queue_id: queue_id.to_string(),
            timestamp: event.timestamp,
            daemon: event.daemon.clone(),
            disposition,
            recipient: event.field("to").map(str::to_string),
            relay: event.field("relay").map(str::to_string),
            delay: event.delay(),
            dsn: event.field("dsn").map(str::to_string),
            reason: reason.map(str::to_string),
            sender: record.sender.clone(),
            size: record.size,
            first_deferral,
        })];

        if record.complete() {
            emitted.extend(self.evict(queue_id));
        }

        emitted
    }

    fn direct_outcome(
        &mut self,
        event: &LogEvent,
        disposition: Disposition,
        reason: &str,
    ) -> Outcome {
        let queue_id = event.queue_id.clone().unwrap_or_default();
        let record = self.records.entry(queue_id.clone()).or_default();
        trace!(
            "direct disposition against queue id: queue_id={queue_id}, \
             disposition={disposition:?}"
        );

        Outcome::Recipient(RecipientOutcome {
            queue_id,
            timestamp: event.timestamp,
            daemon: event.daemon.clone(),
            disposition,
            recipient: None,
            relay: None,
            delay: None,
            dsn: None,
            reason: Some(collapse_whitespace(reason)),
            sender: record.sender.clone(),
            size: record.size,
            first_deferral: false,
        })
    }

    fn evict(&mut self, queue_id: &str) -> Vec<Outcome> {
        let Some(record) = self.records.remove(queue_id) else {
            return Vec::new();
        };
        record.size_missing_outcome(queue_id).into_iter().collect()
    }
}

/// smtpd session tracking: connect time is only computable by pairing
/// the connect and disconnect lines of one smtpd process.
#[derive(Debug, Default)]
pub struct SmtpdTracker {
    sessions: HashMap<u32, (PrimitiveDateTime, String)>,
}

/// One completed smtpd client session.
#[derive(Debug, Clone)]
pub struct SmtpdSession {
    pub host: String,
    pub connected_at: PrimitiveDateTime,
    pub seconds: f64,
}

impl SmtpdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &LogEvent) -> Option<SmtpdSession> {
        let pid = event.pid?;

        if let Some(rest) = event.text.strip_prefix("connect from ") {
            let host = client_hostname(rest);
            self.sessions.insert(pid, (event.timestamp, host));
            return None;
        }

        if event.text.starts_with("disconnect from ") {
            let (connected_at, host) = self.sessions.remove(&pid)?;
            let seconds =
                (event.timestamp - connected_at).as_seconds_f64().max(0.0);
            return Some(SmtpdSession { host, connected_at, seconds });
        }

        None
    }
}

fn client_hostname(client: &str) -> String {
    let end = client
        .find(|c: char| c == '[' || c.is_whitespace())
        .unwrap_or(client.len());
    client[..end].to_ascii_lowercase()
}
