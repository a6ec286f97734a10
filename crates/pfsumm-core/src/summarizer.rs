use time::Date;

use crate::classifier::{LogEvent, Subsystem, collapse_whitespace, parse_line};
use crate::correlator::{Correlator, SmtpdTracker};
use crate::error::OptionsError;
use crate::options::Options;
use crate::stats::{Aggregator, Stats};

/// What one fed line contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Classified and applied to at least one rollup.
    Consumed,
    /// Classified but carried nothing any table reads, or fell outside
    /// the day filter.
    Skipped,
    Malformed,
    /// Past the filtered day on chronologically ordered input. The
    /// caller may stop feeding once this shows up.
    BeyondWindow,
}

/// Single-pass driver: classify, correlate, aggregate, line by line in
/// input order. One instance per run.
#[derive(Debug)]
pub struct Summarizer {
    options: Options,
    wanted: Option<Date>,
    correlator: Correlator,
    smtpd: SmtpdTracker,
    aggregator: Aggregator,
}

impl Summarizer {
    pub fn new(options: Options) -> Result<Self, OptionsError> {
        options.validate()?;
        let wanted = options.wanted_date();
        let aggregator =
            Aggregator::new(options.ignore_case, options.verp_mung);
        Ok(Self {
            options,
            wanted,
            correlator: Correlator::new(),
            smtpd: SmtpdTracker::new(),
            aggregator,
        })
    }

    pub fn stats(&self) -> &Stats {
        self.aggregator.stats()
    }

    pub fn feed_line(&mut self, line: &str) -> LineOutcome {
        self.aggregator.note_line();

        let event = match parse_line(line, self.options.fallback_year) {
            Ok(event) => event,
            Err(_) => {
                self.aggregator.note_malformed();
                return LineOutcome::Malformed;
            }
        };

        if let Some(wanted) = self.wanted {
            let date = event.timestamp.date();
            if date != wanted {
                if date > wanted && self.options.assume_monotonic {
                    return LineOutcome::BeyondWindow;
                }
                return LineOutcome::Skipped;
            }
        }

        self.aggregator.note_considered(event.timestamp);
        self.dispatch(&event)
    }

    /// End of input: flushes messages still in flight and hands the
    /// final snapshot over.
    pub fn finish(mut self) -> Stats {
        for outcome in self.correlator.finish() {
            self.aggregator.observe(&outcome);
        }
        self.aggregator.into_stats()
    }

    fn dispatch(&mut self, event: &LogEvent) -> LineOutcome {
        // Every master line belongs to the master table, severity
        // prefix or not.
        if event.subsystem == Subsystem::Master {
            self.aggregator.observe_master(&event.text);
            return LineOutcome::Consumed;
        }

        if let Some((severity, rest)) = event.severity() {
            self.aggregator.observe_severity(&event.daemon, severity, rest);
            return LineOutcome::Consumed;
        }

        match event.subsystem {
            Subsystem::Smtpd => self.smtpd_line(event),
            Subsystem::Qmgr | Subsystem::Cleanup | Subsystem::Bounce => {
                self.queue_line(event)
            }
            kind if kind.is_delivery_agent() => {
                if event.queue_id.is_none()
                    && event.subsystem == Subsystem::Smtp
                    && event.text.starts_with("connect to ")
                {
                    // Failed outbound connection attempts log without a
                    // queue id.
                    self.aggregator
                        .observe_smtp_failure(&collapse_whitespace(&event.text));
                    return LineOutcome::Consumed;
                }
                self.queue_line(event)
            }
            Subsystem::Anvil | Subsystem::Postdrop => LineOutcome::Skipped,
            Subsystem::Other => {
                self.aggregator.observe_unhandled(&event.daemon);
                LineOutcome::Skipped
            }
            _ => LineOutcome::Skipped,
        }
    }

    fn smtpd_line(&mut self, event: &LogEvent) -> LineOutcome {
        if event.text.starts_with("connect from ")
            || event.text.starts_with("disconnect from ")
        {
            if let Some(session) = self.smtpd.observe(event) {
                self.aggregator.observe_session(&session);
            }
            return LineOutcome::Consumed;
        }

        if self.reject_line(event) {
            return LineOutcome::Consumed;
        }

        // hold:/discard: actions land here with a queue id.
        self.queue_line(event)
    }

    fn queue_line(&mut self, event: &LogEvent) -> LineOutcome {
        if self.reject_line(event) {
            return LineOutcome::Consumed;
        }
        if event.queue_id.is_none() {
            return LineOutcome::Skipped;
        }

        let outcomes = self.correlator.observe(event);
        if outcomes.is_empty() {
            return LineOutcome::Skipped;
        }
        for outcome in &outcomes {
            self.aggregator.observe(outcome);
        }
        LineOutcome::Consumed
    }

    /// `reject:`/`reject_warning:` apply whether or not a queue id was
    /// already assigned (`NOQUEUE` for pre-queue smtpd rejects).
    fn reject_line(&mut self, event: &LogEvent) -> bool {
        if event.queue_id.is_none() {
            return false;
        }
        if let Some(rest) = event.text.strip_prefix("reject: ") {
            self.aggregator.observe_reject(
                false,
                event.timestamp,
                &reject_reason(rest),
            );
            return true;
        }
        if let Some(rest) = event.text.strip_prefix("reject_warning: ") {
            self.aggregator.observe_reject(
                true,
                event.timestamp,
                &reject_reason(rest),
            );
            return true;
        }
        false
    }
}

/// Strips the `CMD from client[addr]: ` preamble and the trailing
/// envelope echo, leaving the server reply as the tally key.
fn reject_reason(text: &str) -> String {
    let rest = match text.split_once("]: ") {
        Some((_, rest)) => rest,
        None => text,
    };
    let rest = rest.split(';').next().unwrap_or(rest);
    collapse_whitespace(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DayFilter, parse_iso_date};

    fn options() -> Options {
        Options::new(parse_iso_date("2023-02-17").expect("valid date"))
    }

    fn run(lines: &[&str]) -> Stats {
        let mut summarizer =
            Summarizer::new(options()).expect("options should validate");
        for line in lines {
            summarizer.feed_line(line);
        }
        summarizer.finish()
    }

    const DELIVERY_CORPUS: &[&str] = &[
        "Feb 17 09:00:00 mail postfix/qmgr[1]: \
         AA11BB22: from=<a@b.example>, size=1000, nrcpt=1 (queue active)",
        "Feb 17 09:10:00 mail postfix/smtp[2]: \
         AA11BB22: to=<z@w.example>, relay=mx.w.example[192.0.2.1]:25, \
         delay=600, dsn=4.4.1, status=deferred (connection timed out)",
        "Feb 17 10:10:00 mail postfix/smtp[2]: \
         AA11BB22: to=<z@w.example>, relay=mx.w.example[192.0.2.1]:25, \
         delay=4200, dsn=4.4.1, status=deferred (connection timed out)",
        "Feb 17 11:10:00 mail postfix/smtp[2]: \
         AA11BB22: to=<z@w.example>, relay=mx.w.example[192.0.2.1]:25, \
         delay=7800, dsn=2.0.0, status=sent (250 OK)",
    ];

    #[test]
    fn deferral_then_success_counts_one_message_deferred() {
        let stats = run(DELIVERY_CORPUS);

        assert_eq!(stats.totals.received, 1);
        assert_eq!(stats.totals.delivered, 1);
        assert_eq!(stats.totals.deferred, 1);
        assert_eq!(stats.totals.deferrals, 2);
        assert_eq!(stats.totals.bytes_delivered, 1000);
        assert_eq!(
            stats.deferral_detail["smtp"]["connection timed out"],
            2
        );
    }

    #[test]
    fn hourly_sums_match_grand_totals() {
        let mut lines: Vec<&str> = DELIVERY_CORPUS.to_vec();
        lines.extend([
            "Feb 17 12:00:00 mail postfix/smtpd[4]: \
             NOQUEUE: reject: RCPT from unknown[192.0.2.9]: \
             554 5.7.1 Relay access denied; from=<s@x.example> to=<t@y.example>",
            "Feb 17 13:00:00 mail postfix/qmgr[1]: \
             CC33DD44: from=<c@d.example>, size=400, nrcpt=1 (queue active)",
            "Feb 17 13:00:05 mail postfix/smtp[2]: \
             CC33DD44: to=<u@v.example>, relay=mx.v.example[192.0.2.2]:25, \
             delay=2, dsn=5.0.0, status=bounced (550 user unknown)",
        ]);
        let stats = run(&lines);

        let hourly = stats.per_hour.sum();
        assert_eq!(hourly.received, stats.totals.received);
        assert_eq!(hourly.delivered, stats.totals.delivered);
        assert_eq!(hourly.deferred, stats.totals.deferrals);
        assert_eq!(hourly.bounced, stats.totals.bounced);
        assert_eq!(hourly.rejected, stats.totals.rejected);

        let daily: u64 = stats.per_day.values().map(|slot| slot.received).sum();
        assert_eq!(daily, stats.totals.received);
    }

    #[test]
    fn feeding_the_corpus_twice_doubles_the_counters() {
        let once = run(DELIVERY_CORPUS);

        let mut twice_lines = DELIVERY_CORPUS.to_vec();
        twice_lines.extend(DELIVERY_CORPUS);
        let twice = run(&twice_lines);

        assert_eq!(twice.totals.received, 2 * once.totals.received);
        assert_eq!(twice.totals.delivered, 2 * once.totals.delivered);
        assert_eq!(twice.totals.deferrals, 2 * once.totals.deferrals);
        assert_eq!(twice.per_hour.sum().delivered, 2);
    }

    #[test]
    fn deliveries_without_a_size_line_skip_byte_totals() {
        let stats = run(&[
            "Feb 17 09:00:00 mail postfix/smtp[2]: \
             CC33DD44: to=<u@v.example>, relay=mx.v.example[192.0.2.2]:25, \
             delay=1.0, dsn=2.0.0, status=sent (250 OK)",
        ]);

        assert_eq!(stats.totals.delivered, 1);
        assert_eq!(stats.totals.received, 0);
        assert_eq!(stats.totals.bytes_delivered, 0);
        assert_eq!(stats.no_size_data["CC33DD44"], 1);
    }

    #[test]
    fn smtpd_rejects_tally_the_server_reply() {
        let stats = run(&[
            "Feb 17 12:00:00 mail postfix/smtpd[4]: \
             NOQUEUE: reject: RCPT from unknown[192.0.2.9]: \
             554 5.7.1 Relay access denied; from=<s@x.example> to=<t@y.example>",
            "Feb 17 12:00:01 mail postfix/smtpd[4]: \
             NOQUEUE: reject_warning: RCPT from unknown[192.0.2.9]: \
             450 4.7.1 greylisted; from=<s@x.example> to=<t@y.example>",
        ]);

        assert_eq!(stats.totals.rejected, 1);
        assert_eq!(stats.totals.reject_warnings, 1);
        assert_eq!(stats.reject_detail["554 5.7.1 Relay access denied"], 1);
        assert_eq!(stats.reject_warning_detail["450 4.7.1 greylisted"], 1);
    }

    #[test]
    fn day_filter_skips_other_days_and_stops_on_monotonic_input() {
        let mut options = options();
        options.day_filter = Some(DayFilter::On(
            parse_iso_date("2023-02-17").expect("valid date"),
        ));

        let mut summarizer =
            Summarizer::new(options.clone()).expect("options should validate");
        assert_eq!(
            summarizer.feed_line(
                "Feb 16 23:59:59 mail postfix/qmgr[1]: \
                 AA11BB22: from=<a@b.example>, size=10, nrcpt=1 (queue active)"
            ),
            LineOutcome::Skipped
        );
        assert_eq!(
            summarizer.feed_line(
                "Feb 18 00:00:01 mail postfix/qmgr[1]: \
                 CC33DD44: from=<a@b.example>, size=10, nrcpt=1 (queue active)"
            ),
            LineOutcome::Skipped
        );
        assert_eq!(summarizer.finish().totals.received, 0);

        options.assume_monotonic = true;
        let mut summarizer =
            Summarizer::new(options).expect("options should validate");
        assert_eq!(
            summarizer.feed_line(
                "Feb 18 00:00:01 mail postfix/qmgr[1]: \
                 CC33DD44: from=<a@b.example>, size=10, nrcpt=1 (queue active)"
            ),
            LineOutcome::BeyondWindow
        );
    }

    #[test]
    fn malformed_lines_are_counted_and_ignored() {
        let stats = run(&[
            "not a syslog line at all",
            "Feb 17 09:00:00 mail postfix/qmgr[1]: \
             AA11BB22: from=<a@b.example>, size=1000, nrcpt=0 (queue active)",
        ]);

        assert_eq!(stats.lines_total, 2);
        assert_eq!(stats.malformed_lines, 1);
        assert_eq!(stats.lines_considered, 1);
        assert_eq!(stats.totals.received, 1);
    }

    #[test]
    fn severity_markers_and_master_lines_land_in_their_tables() {
        let stats = run(&[
            "Feb 17 09:00:00 mail postfix/smtpd[4]: \
             warning: hostname mail.example.invalid does not resolve",
            "Feb 17 09:00:01 mail postfix/master[1]: \
             reload -- version 3.7.3, configuration /etc/postfix",
            "Feb 17 09:00:02 mail postfix/local[6]: \
             fatal: open lock file /var/spool/mail/x.lock: unable to set exclusive lock",
        ]);

        assert_eq!(
            stats.warnings["smtpd"]
                ["hostname mail.example.invalid does not resolve"],
            1
        );
        assert_eq!(stats.fatals["local"].len(), 1);
        assert_eq!(
            stats.master_messages
                ["reload -- version 3.7.3, configuration /etc/postfix"],
            1
        );
    }

    #[test]
    fn master_warnings_stay_in_the_master_table() {
        let stats = run(&[
            "Feb 17 09:00:00 mail postfix/master[1]: \
             warning: process /usr/lib/postfix/smtpd pid 99 exit status 1",
        ]);

        assert_eq!(
            stats.master_messages
                ["warning: process /usr/lib/postfix/smtpd pid 99 exit status 1"],
            1
        );
        assert!(stats.warnings.is_empty());
    }

    #[test]
    fn smtp_connection_failures_are_their_own_table() {
        let stats = run(&[
            "Feb 17 09:00:00 mail postfix/smtp[2]: \
             connect to mx.dead.example[192.0.2.9]:25: Connection timed out",
        ]);
        assert_eq!(
            stats.smtp_failure_detail
                ["connect to mx.dead.example[192.0.2.9]:25: Connection timed out"],
            1
        );
    }

    #[test]
    fn unknown_daemons_are_tallied_not_dropped() {
        let mut summarizer =
            Summarizer::new(options()).expect("options should validate");
        let outcome = summarizer.feed_line(
            "Feb 17 09:00:00 mail postfix/postscreen[9]: \
             CONNECT from [192.0.2.8]:50112 to [198.51.100.1]:25",
        );
        assert_eq!(outcome, LineOutcome::Skipped);
        assert_eq!(summarizer.finish().unhandled["postscreen"], 1);
    }
}
