use std::collections::BTreeMap;

use serde::Serialize;
use time::{Date, PrimitiveDateTime};

use crate::classifier::Severity;
use crate::correlator::{Disposition, Outcome, RecipientOutcome, SmtpdSession};
use crate::error::TableError;
use crate::options::VerpLevel;

/// Key used when a sender is unknown or the envelope sender is empty.
pub const NULL_SENDER: &str = "<>";

/// The five per-time-bucket traffic counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    pub received: u64,
    pub delivered: u64,
    /// Deferral events, not distinct messages.
    pub deferred: u64,
    pub bounced: u64,
    pub rejected: u64,
}

impl TrafficCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Exactly 24 slots, hour 0 through 23, accumulated across all days.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyTraffic {
    slots: [TrafficCounters; 24],
}

impl HourlyTraffic {
    /// Ad hoc query boundary: out-of-range hours are a typed failure,
    /// not a panic.
    pub fn get(&self, hour: u8) -> Result<&TrafficCounters, TableError> {
        self.slots
            .get(hour as usize)
            .ok_or(TableError::HourOutOfRange(hour))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &TrafficCounters)> {
        self.slots.iter().enumerate().map(|(hour, slot)| (hour as u8, slot))
    }

    pub fn sum(&self) -> TrafficCounters {
        let mut total = TrafficCounters::default();
        for slot in &self.slots {
            total.received += slot.received;
            total.delivered += slot.delivered;
            total.deferred += slot.deferred;
            total.bounced += slot.bounced;
            total.rejected += slot.rejected;
        }
        total
    }

    fn slot_mut(&mut self, timestamp: PrimitiveDateTime) -> &mut TrafficCounters {
        // time::Time guarantees hour() < 24.
        &mut self.slots[timestamp.hour() as usize]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrandTotals {
    pub received: u64,
    pub delivered: u64,
    pub forwarded: u64,
    /// Distinct messages deferred at least once.
    pub deferred: u64,
    /// Total deferral events.
    pub deferrals: u64,
    pub bounced: u64,
    pub rejected: u64,
    pub reject_warnings: u64,
    pub held: u64,
    pub discarded: u64,
    pub expired: u64,
    pub bytes_received: u64,
    pub bytes_delivered: u64,
}

/// Per-address rollup (senders, recipients).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddressStat {
    pub count: u64,
    pub bytes: u64,
}

/// Per-recipient-domain delivery rollup, delay stats included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct DeliveryDomainStat {
    pub sent: u64,
    pub bytes: u64,
    pub defers: u64,
    pub delay_sum: f64,
    pub delay_max: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct ConnStat {
    pub connections: u64,
    pub seconds: f64,
}

impl ConnStat {
    fn add(&mut self, seconds: f64) {
        self.connections += 1;
        self.seconds += seconds;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SmtpdStats {
    pub total: ConnStat,
    pub per_domain: BTreeMap<String, ConnStat>,
    pub per_hour: [ConnStat; 24],
    pub per_day: BTreeMap<Date, ConnStat>,
}

/// Two-level detail table: group key, then reason text, then count.
pub type GroupedDetail = BTreeMap<String, BTreeMap<String, u64>>;

/// The full rollup set. Append-only during a run, truncation is a
/// render-time concern, so the whole snapshot is serializable for
/// programmatic callers.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub totals: GrandTotals,
    pub first_seen: Option<PrimitiveDateTime>,
    pub last_seen: Option<PrimitiveDateTime>,
    pub lines_total: u64,
    pub lines_considered: u64,
    pub malformed_lines: u64,
    pub senders: BTreeMap<String, AddressStat>,
    pub recipients: BTreeMap<String, AddressStat>,
    pub sending_domains: BTreeMap<String, AddressStat>,
    pub recipient_domains: BTreeMap<String, DeliveryDomainStat>,
    pub per_hour: HourlyTraffic,
    pub per_day: BTreeMap<Date, TrafficCounters>,
    pub smtpd: SmtpdStats,
    /// Delivered recipients whose message size never appeared, keyed by
    /// sender when known, else by queue id.
    pub no_size_data: BTreeMap<String, u64>,
    /// daemon -> reason -> count
    pub deferral_detail: GroupedDetail,
    /// relay -> reason -> count
    pub bounce_detail: GroupedDetail,
    pub reject_detail: BTreeMap<String, u64>,
    pub reject_warning_detail: BTreeMap<String, u64>,
    pub hold_detail: BTreeMap<String, u64>,
    pub discard_detail: BTreeMap<String, u64>,
    pub smtp_failure_detail: BTreeMap<String, u64>,
    /// daemon -> text -> count
    pub warnings: GroupedDetail,
    pub fatals: GroupedDetail,
    pub panics: GroupedDetail,
    pub master_messages: BTreeMap<String, u64>,
    pub unhandled: BTreeMap<String, u64>,
}

impl Stats {
    /// Days with any traffic. At least 1 once anything was seen.
    pub fn days_counted(&self) -> usize {
        self.per_day.len().max(usize::from(self.first_seen.is_some()))
    }

    pub fn spans_multiple_days(&self) -> bool {
        self.per_day.len() > 1
    }
}

enum TrafficKind {
    Received,
    Delivered,
    Deferred,
    Bounced,
    Rejected,
}

/// Applies completed events to the rollups. Every recipient outcome
/// updates exactly one grand-total counter, and the per-hour/per-day
/// tables move in lockstep through a single helper.
#[derive(Debug, Default)]
pub struct Aggregator {
    stats: Stats,
    ignore_case: bool,
    verp_mung: VerpLevel,
}

impl Aggregator {
    pub fn new(ignore_case: bool, verp_mung: VerpLevel) -> Self {
        Self { stats: Stats::default(), ignore_case, verp_mung }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn into_stats(self) -> Stats {
        self.stats
    }

    pub fn note_line(&mut self) {
        self.stats.lines_total += 1;
    }

    pub fn note_malformed(&mut self) {
        self.stats.malformed_lines += 1;
    }

    pub fn note_considered(&mut self, timestamp: PrimitiveDateTime) {
        self.stats.lines_considered += 1;
        if self.stats.first_seen.is_none_or(|seen| timestamp < seen) {
            self.stats.first_seen = Some(timestamp);
        }
        if self.stats.last_seen.is_none_or(|seen| timestamp > seen) {
            self.stats.last_seen = Some(timestamp);
        }
    }

    pub fn observe(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Received { timestamp, sender, size, .. } => {
                self.observe_received(*timestamp, sender.as_deref(), *size);
            }
            Outcome::Recipient(outcome) => self.observe_recipient(outcome),
            Outcome::SizeMissing { queue_id, sender, count } => {
                let key = match sender.as_deref() {
                    Some(sender) => self.sender_key(sender),
                    None => queue_id.clone(),
                };
                *self.stats.no_size_data.entry(key).or_default() += count;
            }
        }
    }

    pub fn observe_reject(
        &mut self,
        warning: bool,
        timestamp: PrimitiveDateTime,
        reason: &str,
    ) {
        let reason = reason.to_string();
        if warning {
            self.stats.totals.reject_warnings += 1;
            *self.stats.reject_warning_detail.entry(reason).or_default() += 1;
        } else {
            self.stats.totals.rejected += 1;
            self.traffic(timestamp, TrafficKind::Rejected);
            *self.stats.reject_detail.entry(reason).or_default() += 1;
        }
    }

    pub fn observe_severity(
        &mut self,
        daemon: &str,
        severity: Severity,
        text: &str,
    ) {
        let table = match severity {
            Severity::Warning => &mut self.stats.warnings,
            Severity::Fatal => &mut self.stats.fatals,
            Severity::Panic => &mut self.stats.panics,
        };
        *table
            .entry(short_daemon(daemon).to_string())
            .or_default()
            .entry(text.to_string())
            .or_default() += 1;
    }

    pub fn observe_master(&mut self, text: &str) {
        *self.stats.master_messages.entry(text.to_string()).or_default() += 1;
    }

    pub fn observe_smtp_failure(&mut self, text: &str) {
        *self.stats.smtp_failure_detail.entry(text.to_string()).or_default() +=
            1;
    }

    pub fn observe_session(&mut self, session: &SmtpdSession) {
        let smtpd = &mut self.stats.smtpd;
        smtpd.total.add(session.seconds);
        smtpd
            .per_domain
            .entry(session.host.clone())
            .or_default()
            .add(session.seconds);
        smtpd.per_hour[session.connected_at.hour() as usize]
            .add(session.seconds);
        smtpd
            .per_day
            .entry(session.connected_at.date())
            .or_default()
            .add(session.seconds);
    }

    pub fn observe_unhandled(&mut self, daemon: &str) {
        *self
            .stats
            .unhandled
            .entry(short_daemon(daemon).to_string())
            .or_default() += 1;
    }

    fn observe_received(
        &mut self,
        timestamp: PrimitiveDateTime,
        sender: Option<&str>,
        size: u64,
    ) {
        self.stats.totals.received += 1;
        self.stats.totals.bytes_received += size;
        self.traffic(timestamp, TrafficKind::Received);

        let key = self.sender_key(sender.unwrap_or(""));
        let domain = domain_key(sender.unwrap_or(""));
        let entry = self.stats.senders.entry(key).or_default();
        entry.count += 1;
        entry.bytes += size;
        let entry = self.stats.sending_domains.entry(domain).or_default();
        entry.count += 1;
        entry.bytes += size;
    }

    fn observe_recipient(&mut self, outcome: &RecipientOutcome) {
        match outcome.disposition {
            Disposition::Sent => {
                self.stats.totals.delivered += 1;
                let size = outcome.size.unwrap_or(0);
                self.stats.totals.bytes_delivered += size;
                self.traffic(outcome.timestamp, TrafficKind::Delivered);

                if let Some(recipient) = outcome.recipient.as_deref() {
                    let key = self.recipient_key(recipient);
                    let entry = self.stats.recipients.entry(key).or_default();
                    entry.count += 1;
                    entry.bytes += size;

                    let entry = self
                        .stats
                        .recipient_domains
                        .entry(domain_key(recipient))
                        .or_default();
                    entry.sent += 1;
                    entry.bytes += size;
                    if let Some(delay) = outcome.delay {
                        entry.delay_sum += delay;
                        if delay > entry.delay_max {
                            entry.delay_max = delay;
                        }
                    }
                }
            }
            Disposition::Forwarded => {
                self.stats.totals.forwarded += 1;
            }
            Disposition::Deferred => {
                self.stats.totals.deferrals += 1;
                if outcome.first_deferral {
                    self.stats.totals.deferred += 1;
                }
                self.traffic(outcome.timestamp, TrafficKind::Deferred);

                if let Some(recipient) = outcome.recipient.as_deref() {
                    self.stats
                        .recipient_domains
                        .entry(domain_key(recipient))
                        .or_default()
                        .defers += 1;
                }
                self.grouped_detail_bump(
                    DetailKind::Deferral,
                    short_daemon(&outcome.daemon).to_string(),
                    outcome.reason.as_deref(),
                );
            }
            Disposition::Bounced => {
                self.stats.totals.bounced += 1;
                self.traffic(outcome.timestamp, TrafficKind::Bounced);
                self.grouped_detail_bump(
                    DetailKind::Bounce,
                    relay_key(outcome.relay.as_deref()),
                    outcome.reason.as_deref(),
                );
            }
            Disposition::Expired => {
                self.stats.totals.expired += 1;
            }
            Disposition::Held => {
                self.stats.totals.held += 1;
                let reason = reason_key(outcome.reason.as_deref());
                *self.stats.hold_detail.entry(reason).or_default() += 1;
            }
            Disposition::Discarded => {
                self.stats.totals.discarded += 1;
                let reason = reason_key(outcome.reason.as_deref());
                *self.stats.discard_detail.entry(reason).or_default() += 1;
            }
            Disposition::Rejected => {
                // Rejects reach the aggregator through observe_reject;
                // a rejected recipient outcome still counts once.
                self.stats.totals.rejected += 1;
                self.traffic(outcome.timestamp, TrafficKind::Rejected);
            }
        }
    }

    fn traffic(&mut self, timestamp: PrimitiveDateTime, kind: TrafficKind) {
        let hour_slot = self.stats.per_hour.slot_mut(timestamp);
        bump_counter(hour_slot, &kind);
        let day_slot =
            self.stats.per_day.entry(timestamp.date()).or_default();
        bump_counter(day_slot, &kind);
    }

    fn grouped_detail_bump(
        &mut self,
        kind: DetailKind,
        group: String,
        reason: Option<&str>,
    ) {
        let table = match kind {
            DetailKind::Deferral => &mut self.stats.deferral_detail,
            DetailKind::Bounce => &mut self.stats.bounce_detail,
        };
        *table
            .entry(group)
            .or_default()
            .entry(reason_key(reason))
            .or_default() += 1;
    }

    fn sender_key(&self, address: &str) -> String {
        if address.is_empty() {
            return NULL_SENDER.to_string();
        }
        let munged = verp_mung(address, self.verp_mung);
        fold_address(&munged, self.ignore_case)
    }

    fn recipient_key(&self, address: &str) -> String {
        if address.is_empty() {
            return NULL_SENDER.to_string();
        }
        fold_address(address, self.ignore_case)
    }
}

enum DetailKind {
    Deferral,
    Bounce,
}

fn bump_counter(slot: &mut TrafficCounters, kind: &TrafficKind) {
    match kind {
        TrafficKind::Received => slot.received += 1,
        TrafficKind::Delivered => slot.delivered += 1,
        TrafficKind::Deferred => slot.deferred += 1,
        TrafficKind::Bounced => slot.bounced += 1,
        TrafficKind::Rejected => slot.rejected += 1,
    }
}

fn reason_key(reason: Option<&str>) -> String {
    match reason {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => "(no reason given)".to_string(),
    }
}

/// The host/domain part of an address: everything after the last `@`,
/// always lower-cased. Addresses without a domain fold whole.
pub fn domain_key(address: &str) -> String {
    if address.is_empty() {
        return NULL_SENDER.to_string();
    }
    match address.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain.to_ascii_lowercase(),
        _ => address.to_ascii_lowercase(),
    }
}

/// Last path component of a syslog daemon tag, `postfix/smtp` to `smtp`.
fn short_daemon(daemon: &str) -> &str {
    daemon.rsplit('/').next().unwrap_or(daemon)
}

/// Host part of a `relay=` value, `host[addr]:port` shape.
fn relay_key(relay: Option<&str>) -> String {
    let Some(relay) = relay else {
        return "none".to_string();
    };
    let end = relay
        .find(|c: char| c == '[' || c == ':' || c.is_whitespace())
        .unwrap_or(relay.len());
    let host = relay[..end].trim();
    if host.is_empty() {
        "none".to_string()
    } else {
        host.to_ascii_lowercase()
    }
}

/// Lower-cases the host/domain part; the local part only under the
/// full-address case-insensitive option.
fn fold_address(address: &str, ignore_case: bool) -> String {
    if ignore_case {
        return address.to_ascii_lowercase();
    }
    match address.rsplit_once('@') {
        Some((local, domain)) => {
            format!("{local}@{}", domain.to_ascii_lowercase())
        }
        None => address.to_ascii_lowercase(),
    }
}

/// VERP address munging, so per-recipient-unique sender addresses
/// aggregate as one logical sender. Level one rewrites the numeric id
/// segment to `ID`; level two collapses down to `prefix@domain`.
/// Detail lists are keyed elsewhere and keep the original address.
pub fn verp_mung(address: &str, level: VerpLevel) -> String {
    if level == VerpLevel::Off {
        return address.to_string();
    }

    let (local, domain) = match address.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (address, None),
    };

    let Some((start, end)) = numeric_segment(local) else {
        return address.to_string();
    };

    let local = if level == VerpLevel::Simple {
        format!("{}-ID-{}", &local[..start], &local[end + 1..])
    } else {
        local[..start].to_string()
    };

    match domain {
        Some(domain) => format!("{local}@{domain}"),
        None => local,
    }
}

/// Byte range of the first `-NNN-` segment: `start` points at the
/// leading dash, `end` at the trailing dash.
fn numeric_segment(local: &str) -> Option<(usize, usize)> {
    let bytes = local.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b'-' {
                return Some((i, j));
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Date, Month, Time};

    fn at(day: u8, hour: u8) -> PrimitiveDateTime {
        let date =
            Date::from_calendar_date(2023, Month::February, day).unwrap();
        PrimitiveDateTime::new(date, Time::from_hms(hour, 0, 0).unwrap())
    }

    fn received(day: u8, hour: u8, sender: &str, size: u64) -> Outcome {
        Outcome::Received {
            queue_id: "AA11BB22".to_string(),
            timestamp: at(day, hour),
            sender: Some(sender.to_string()),
            size,
        }
    }

    fn sent(day: u8, hour: u8, recipient: &str, size: u64, delay: f64) -> Outcome {
        Outcome::Recipient(RecipientOutcome {
            queue_id: "AA11BB22".to_string(),
            timestamp: at(day, hour),
            daemon: "postfix/smtp".to_string(),
            disposition: Disposition::Sent,
            recipient: Some(recipient.to_string()),
            relay: Some("mx.example.net[192.0.2.7]:25".to_string()),
            delay: Some(delay),
            dsn: Some("2.0.0".to_string()),
            reason: Some("250 OK".to_string()),
            sender: Some("a@b.example".to_string()),
            size: Some(size),
            first_deferral: false,
        })
    }

    #[test]
    fn received_updates_every_dimension_exactly_once() {
        let mut aggregator = Aggregator::new(false, VerpLevel::Off);
        aggregator.observe(&received(17, 9, "a@B.Example", 1000));

        let stats = aggregator.stats();
        assert_eq!(stats.totals.received, 1);
        assert_eq!(stats.totals.bytes_received, 1000);
        assert_eq!(stats.per_hour.get(9).unwrap().received, 1);
        assert_eq!(stats.per_hour.sum().received, 1);
        assert_eq!(stats.senders["a@b.example"].bytes, 1000);
        assert_eq!(stats.sending_domains["b.example"].count, 1);
        assert_eq!(stats.per_day.values().next().unwrap().received, 1);
    }

    #[test]
    fn delivery_updates_recipient_and_domain_tables() {
        let mut aggregator = Aggregator::new(false, VerpLevel::Off);
        aggregator.observe(&sent(17, 10, "c@d.example", 1000, 3.2));
        aggregator.observe(&sent(17, 11, "e@d.example", 500, 1.0));

        let stats = aggregator.stats();
        assert_eq!(stats.totals.delivered, 2);
        assert_eq!(stats.totals.bytes_delivered, 1500);
        let domain = &stats.recipient_domains["d.example"];
        assert_eq!(domain.sent, 2);
        assert_eq!(domain.bytes, 1500);
        assert_eq!(domain.delay_sum, 4.2);
        assert_eq!(domain.delay_max, 3.2);
        assert_eq!(stats.per_hour.sum().delivered, 2);
    }

    #[test]
    fn deferred_and_deferrals_count_differently() {
        let mut aggregator = Aggregator::new(false, VerpLevel::Off);
        let mut outcome = match sent(17, 9, "z@w.example", 0, 0.0) {
            Outcome::Recipient(outcome) => outcome,
            _ => unreachable!(),
        };
        outcome.disposition = Disposition::Deferred;
        outcome.reason = Some("connection timed out".to_string());

        outcome.first_deferral = true;
        aggregator.observe(&Outcome::Recipient(outcome.clone()));
        outcome.first_deferral = false;
        aggregator.observe(&Outcome::Recipient(outcome));

        let stats = aggregator.stats();
        assert_eq!(stats.totals.deferred, 1);
        assert_eq!(stats.totals.deferrals, 2);
        assert_eq!(stats.per_hour.sum().deferred, 2);
        assert_eq!(
            stats.deferral_detail["smtp"]["connection timed out"],
            2
        );
        assert_eq!(stats.recipient_domains["w.example"].defers, 2);
    }

    #[test]
    fn hour_out_of_range_is_a_typed_error() {
        let stats = Stats::default();
        assert_eq!(
            stats.per_hour.get(24).unwrap_err(),
            TableError::HourOutOfRange(24)
        );
    }

    #[test]
    fn domain_folds_case_but_local_part_keeps_it_by_default() {
        let aggregator = Aggregator::new(false, VerpLevel::Off);
        assert_eq!(aggregator.sender_key("John.Doe@EXAMPLE.ORG"), "John.Doe@example.org");

        let folding = Aggregator::new(true, VerpLevel::Off);
        assert_eq!(folding.sender_key("John.Doe@EXAMPLE.ORG"), "john.doe@example.org");
    }

    #[test]
    fn verp_munging_levels() {
        let addr = "list-return-36-someuser=some.dom@host.sender.dom";
        assert_eq!(verp_mung(addr, VerpLevel::Off), addr);
        assert_eq!(
            verp_mung(addr, VerpLevel::Simple),
            "list-return-ID-someuser=some.dom@host.sender.dom"
        );
        assert_eq!(
            verp_mung(addr, VerpLevel::Aggressive),
            "list-return@host.sender.dom"
        );
        // No numeric segment: unchanged at any level.
        assert_eq!(
            verp_mung("plain@example.org", VerpLevel::Aggressive),
            "plain@example.org"
        );
    }

    #[test]
    fn smtpd_sessions_roll_up_per_domain_hour_and_day() {
        let mut aggregator = Aggregator::new(false, VerpLevel::Off);
        aggregator.observe_session(&SmtpdSession {
            host: "client.example.net".to_string(),
            connected_at: at(17, 9),
            seconds: 12.0,
        });
        aggregator.observe_session(&SmtpdSession {
            host: "client.example.net".to_string(),
            connected_at: at(18, 9),
            seconds: 8.0,
        });

        let smtpd = &aggregator.stats().smtpd;
        assert_eq!(smtpd.total.connections, 2);
        assert_eq!(smtpd.total.seconds, 20.0);
        assert_eq!(smtpd.per_domain["client.example.net"].connections, 2);
        assert_eq!(smtpd.per_hour[9].connections, 2);
        assert_eq!(smtpd.per_day.len(), 2);
    }
}
