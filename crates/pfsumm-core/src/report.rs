use std::collections::BTreeMap;
use std::fmt::Write;

use time::{Date, Month};

use crate::options::{DetailLimit, ReportOptions};
use crate::stats::{
    ConnStat, GroupedDetail, Stats, TrafficCounters,
};

const REASON_WIDTH: usize = 66;

/// Renders the full textual report. Pure function of the snapshot and
/// the render options; counting happened upstream.
pub fn render(stats: &Stats, options: &ReportOptions) -> String {
    let mut out = String::new();

    grand_totals(&mut out, stats);

    if options.problems_first {
        problem_sections(&mut out, stats, options);
    }

    traffic_sections(&mut out, stats, options);
    host_sections(&mut out, stats, options);
    user_sections(&mut out, stats, options);

    if options.no_size_section {
        count_section(
            &mut out,
            "Messages with no size data",
            &stats.no_size_data,
            options.limits.other,
            options,
        );
    }

    if options.smtpd_stats {
        smtpd_sections(&mut out, stats, options);
    }

    if !options.problems_first {
        problem_sections(&mut out, stats, options);
    }

    out
}

fn grand_totals(out: &mut String, stats: &Stats) {
    let totals = &stats.totals;
    out.push_str("Grand Totals\n------------\nmessages\n\n");

    let _ = writeln!(out, "{:>7}   received", totals.received);
    let _ = writeln!(out, "{:>7}   delivered", totals.delivered);
    let _ = writeln!(out, "{:>7}   forwarded", totals.forwarded);
    let _ = writeln!(
        out,
        "{:>7}   deferred  ({} deferrals)",
        totals.deferred, totals.deferrals
    );
    let _ = writeln!(out, "{:>7}   bounced", totals.bounced);
    let _ = writeln!(
        out,
        "{:>7}   rejected ({}%)",
        totals.rejected,
        reject_percent(totals.received, totals.rejected)
    );
    let _ = writeln!(out, "{:>7}   reject warnings", totals.reject_warnings);
    let _ = writeln!(out, "{:>7}   held", totals.held);
    let _ = writeln!(out, "{:>7}   discarded", totals.discarded);
    let _ = writeln!(out, "{:>7}   expired", totals.expired);
    out.push('\n');
    let _ = writeln!(
        out,
        "{:>7}   bytes received",
        adj_int_units(totals.bytes_received)
    );
    let _ = writeln!(
        out,
        "{:>7}   bytes delivered",
        adj_int_units(totals.bytes_delivered)
    );
    let _ = writeln!(out, "{:>7}   senders", stats.senders.len());
    let _ = writeln!(
        out,
        "{:>7}   sending hosts/domains",
        stats.sending_domains.len()
    );
    let _ = writeln!(out, "{:>7}   recipients", stats.recipients.len());
    let _ = writeln!(
        out,
        "{:>7}   recipient hosts/domains",
        stats.recipient_domains.len()
    );
}

fn traffic_sections(out: &mut String, stats: &Stats, options: &ReportOptions) {
    if stats.spans_multiple_days() {
        per_day_section(out, stats, options);
    }

    let days = stats.days_counted().max(1) as u64;
    let title = if days > 1 {
        "Per-Hour Traffic Daily Average"
    } else {
        "Per-Hour Traffic Summary"
    };
    heading(out, title);
    traffic_header(out, "time");
    for (hour, slot) in stats.per_hour.iter() {
        if slot.is_zero() && !options.zero_fill {
            continue;
        }
        let _ = writeln!(
            out,
            "    {:<12}{:>10}{:>11}{:>11}{:>11}{:>11}",
            hour_label(hour, options.iso_date),
            slot.received / days,
            slot.delivered / days,
            slot.deferred / days,
            slot.bounced / days,
            slot.rejected / days,
        );
    }
}

fn per_day_section(out: &mut String, stats: &Stats, options: &ReportOptions) {
    heading(out, "Per-Day Traffic Summary");
    traffic_header(out, "date");

    let empty = TrafficCounters::default();
    for day in day_range(stats, options.zero_fill) {
        let slot = stats.per_day.get(&day).unwrap_or(&empty);
        if slot.is_zero() && !options.zero_fill {
            continue;
        }
        let _ = writeln!(
            out,
            "    {:<12}{:>10}{:>11}{:>11}{:>11}{:>11}",
            date_label(day, options.iso_date),
            slot.received,
            slot.delivered,
            slot.deferred,
            slot.bounced,
            slot.rejected,
        );
    }
}

fn traffic_header(out: &mut String, key: &str) {
    let _ = writeln!(
        out,
        "    {key:<12}  received  delivered   deferred    bounced   rejected"
    );
    let _ = writeln!(
        out,
        "    {}",
        "-".repeat(62)
    );
}

fn host_sections(out: &mut String, stats: &Stats, options: &ReportOptions) {
    if !options.host_top.suppresses() {
        let ranked = ranked(&stats.recipient_domains, |stat| stat.sent);
        if render_list_heading(
            out,
            "Host/Domain Summary: Message Delivery",
            ranked.len(),
            options.host_top,
            options.quiet,
        ) {
            let _ = writeln!(
                out,
                " sent cnt    bytes   defers   avg dly  max dly  host/domain"
            );
            let _ = writeln!(out, " {}", "-".repeat(60));
            for (domain, stat) in capped(ranked, options.host_top) {
                let avg = if stat.sent > 0 {
                    stat.delay_sum / stat.sent as f64
                } else {
                    0.0
                };
                let _ = writeln!(
                    out,
                    "{:>9}{:>9}{:>9}{:>10}{:>9}  {domain}",
                    stat.sent,
                    adj_int_units(stat.bytes),
                    stat.defers,
                    fmt_delay(avg),
                    fmt_delay(stat.delay_max),
                );
            }
        }
    }

    if !options.host_top.suppresses() {
        let ranked = ranked(&stats.sending_domains, |stat| stat.count);
        if render_list_heading(
            out,
            "Host/Domain Summary: Messages Received",
            ranked.len(),
            options.host_top,
            options.quiet,
        ) {
            let _ = writeln!(out, " msg cnt    bytes   host/domain");
            let _ = writeln!(out, " {}", "-".repeat(40));
            for (domain, stat) in capped(ranked, options.host_top) {
                let _ = writeln!(
                    out,
                    "{:>8}{:>9}   {domain}",
                    stat.count,
                    adj_int_units(stat.bytes),
                );
            }
        }
    }
}

fn user_sections(out: &mut String, stats: &Stats, options: &ReportOptions) {
    if options.user_top.suppresses() {
        return;
    }

    address_list(out, "Senders by message count", &stats.senders, |s| s.count, false, options);
    address_list(out, "Recipients by message count", &stats.recipients, |s| s.count, false, options);
    address_list(out, "Senders by message size", &stats.senders, |s| s.bytes, true, options);
    address_list(out, "Recipients by message size", &stats.recipients, |s| s.bytes, true, options);
}

fn address_list<F>(
    out: &mut String,
    title: &str,
    table: &BTreeMap<String, crate::stats::AddressStat>,
    metric: F,
    as_bytes: bool,
    options: &ReportOptions,
) where
    F: Fn(&crate::stats::AddressStat) -> u64,
{
    let ranked = ranked(table, &metric);
    if !render_list_heading(out, title, ranked.len(), options.user_top, options.quiet) {
        return;
    }
    for (address, stat) in capped(ranked, options.user_top) {
        if as_bytes {
            let _ = writeln!(out, "{:>9}   {address}", adj_int_units(metric(stat)));
        } else {
            let _ = writeln!(out, "{:>9}   {address}", metric(stat));
        }
    }
}

fn smtpd_sections(out: &mut String, stats: &Stats, options: &ReportOptions) {
    let smtpd = &stats.smtpd;

    if smtpd.per_day.len() > 1 {
        heading(out, "Per-Day SMTPD Connection Summary");
        let _ = writeln!(out, "    {:<12}  connections  time conn.", "date");
        let _ = writeln!(out, "    {}", "-".repeat(40));
        for (day, stat) in &smtpd.per_day {
            let _ = writeln!(
                out,
                "    {:<12}{:>13}  {}",
                date_label(*day, options.iso_date),
                stat.connections,
                fmt_conn_time(stat.seconds),
            );
        }
    }

    let days = stats.days_counted().max(1) as u64;
    let title = if days > 1 {
        "Per-Hour SMTPD Connection Daily Average"
    } else {
        "Per-Hour SMTPD Connection Summary"
    };
    heading(out, title);
    let _ = writeln!(out, "    {:<12}  connections  time conn.", "hour");
    let _ = writeln!(out, "    {}", "-".repeat(40));
    for (hour, stat) in smtpd.per_hour.iter().enumerate() {
        if stat.connections == 0 && !options.zero_fill {
            continue;
        }
        let _ = writeln!(
            out,
            "    {:<12}{:>13}  {}",
            hour_label(hour as u8, options.iso_date),
            stat.connections / days,
            fmt_conn_time(stat.seconds / days as f64),
        );
    }

    let ranked = ranked(&smtpd.per_domain, |stat: &ConnStat| stat.connections);
    if render_list_heading(
        out,
        "Host/Domain Summary: SMTPD Connections",
        ranked.len(),
        options.host_top,
        options.quiet,
    ) {
        let _ = writeln!(
            out,
            " connections  time conn.  avg./conn.  host/domain"
        );
        let _ = writeln!(out, " {}", "-".repeat(50));
        for (host, stat) in capped(ranked, options.host_top) {
            let avg = if stat.connections > 0 {
                stat.seconds / stat.connections as f64
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{:>12}  {:>10}  {:>10}  {host}",
                stat.connections,
                fmt_conn_time(stat.seconds),
                fmt_delay(avg),
            );
        }
    }
}

fn problem_sections(out: &mut String, stats: &Stats, options: &ReportOptions) {
    grouped_section(
        out,
        "Message deferral detail",
        &stats.deferral_detail,
        options.limits.deferral,
        options,
    );
    grouped_section(
        out,
        "Message bounce detail (by relay)",
        &stats.bounce_detail,
        options.limits.bounce,
        options,
    );
    count_section(
        out,
        "Message reject detail",
        &stats.reject_detail,
        options.limits.reject,
        options,
    );
    count_section(
        out,
        "Message reject warning detail",
        &stats.reject_warning_detail,
        options.limits.reject,
        options,
    );
    count_section(
        out,
        "Message hold detail",
        &stats.hold_detail,
        options.limits.reject,
        options,
    );
    count_section(
        out,
        "Message discard detail",
        &stats.discard_detail,
        options.limits.reject,
        options,
    );
    count_section(
        out,
        "SMTP delivery failures",
        &stats.smtp_failure_detail,
        options.limits.smtp,
        options,
    );

    // These four always render when non-empty, quiet or not.
    severity_section(out, "Warnings", &stats.warnings, options);
    severity_section(out, "Fatal Errors", &stats.fatals, options);
    severity_section(out, "Panics", &stats.panics, options);
    if !stats.master_messages.is_empty() {
        heading(out, "Master daemon messages");
        for (text, count) in ranked(&stats.master_messages, |count| *count) {
            let _ = writeln!(out, "{count:>9}   {}", clip(text, options));
        }
    }
}

fn severity_section(
    out: &mut String,
    title: &str,
    table: &GroupedDetail,
    options: &ReportOptions,
) {
    if table.is_empty() {
        return;
    }
    heading(out, title);
    for (daemon, reasons) in table {
        let total: u64 = reasons.values().sum();
        let _ = writeln!(out, "  {daemon} (total: {total})");
        for (text, count) in ranked(reasons, |count| *count)
            .into_iter()
            .take(options.limits.other.cap(reasons.len()))
        {
            let _ = writeln!(out, "{count:>9}   {}", clip(text, options));
        }
    }
}

fn grouped_section(
    out: &mut String,
    title: &str,
    table: &GroupedDetail,
    limit: DetailLimit,
    options: &ReportOptions,
) {
    if limit.suppresses() {
        return;
    }
    if table.is_empty() {
        if !options.quiet {
            heading(out, title);
            out.push_str("  none\n");
        }
        return;
    }

    heading(out, title);
    for (group, reasons) in table {
        let total: u64 = reasons.values().sum();
        let _ = writeln!(out, "  {group} (total: {total})");
        for (reason, count) in ranked(reasons, |count| *count)
            .into_iter()
            .take(limit.cap(reasons.len()))
        {
            let _ = writeln!(out, "{count:>9}   {}", clip(reason, options));
        }
    }
}

fn count_section(
    out: &mut String,
    title: &str,
    table: &BTreeMap<String, u64>,
    limit: DetailLimit,
    options: &ReportOptions,
) {
    if limit.suppresses() {
        return;
    }
    if table.is_empty() {
        if !options.quiet {
            heading(out, title);
            out.push_str("  none\n");
        }
        return;
    }

    let ranked = ranked(table, |count| *count);
    let shown = limit.cap(ranked.len());
    if shown < ranked.len() {
        heading(out, &format!("{title} (top {shown} of {})", ranked.len()));
    } else {
        heading(out, title);
    }
    for (key, count) in ranked.into_iter().take(shown) {
        let _ = writeln!(out, "{count:>9}   {}", clip(key, options));
    }
}

/// Emits the section heading, with a `(top N of M)` marker when the
/// list is truncated. Returns false when the body should be skipped.
fn render_list_heading(
    out: &mut String,
    title: &str,
    len: usize,
    limit: DetailLimit,
    quiet: bool,
) -> bool {
    if len == 0 {
        if !quiet {
            heading(out, title);
            out.push_str("  none\n");
        }
        return false;
    }
    let shown = limit.cap(len);
    if shown < len {
        heading(out, &format!("{title} (top {shown} of {len})"));
    } else {
        heading(out, title);
    }
    true
}

fn heading(out: &mut String, title: &str) {
    out.push('\n');
    out.push_str(title);
    out.push('\n');
    out.push_str(&"-".repeat(title.len()));
    out.push('\n');
}

/// Primary metric descending, key ascending on ties. BTreeMap hands the
/// entries over in key order, so the stable sort settles ties for free;
/// the explicit tiebreak keeps the contract visible.
fn ranked<'a, T, F>(table: &'a BTreeMap<String, T>, metric: F) -> Vec<(&'a str, &'a T)>
where
    F: Fn(&T) -> u64,
{
    let mut rows: Vec<(&str, &T)> =
        table.iter().map(|(key, value)| (key.as_str(), value)).collect();
    rows.sort_by(|a, b| {
        metric(b.1).cmp(&metric(a.1)).then_with(|| a.0.cmp(b.0))
    });
    rows
}

fn capped<'a, T>(
    rows: Vec<(&'a str, &'a T)>,
    limit: DetailLimit,
) -> impl Iterator<Item = (&'a str, &'a T)> {
    let cap = limit.cap(rows.len());
    rows.into_iter().take(cap)
}

fn day_range(stats: &Stats, zero_fill: bool) -> Vec<Date> {
    if !zero_fill {
        return stats.per_day.keys().copied().collect();
    }
    let (Some(first), Some(last)) = (
        stats.per_day.keys().next().copied(),
        stats.per_day.keys().next_back().copied(),
    ) else {
        return Vec::new();
    };

    let mut days = Vec::new();
    let mut day = first;
    loop {
        days.push(day);
        if day >= last {
            break;
        }
        match day.next_day() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

fn reject_percent(received: u64, rejected: u64) -> u64 {
    let attempts = received + rejected;
    if attempts == 0 {
        0
    } else {
        (rejected * 100 + attempts / 2) / attempts
    }
}

/// Byte counts above 512k/512m collapse into k/m units, the raw number
/// stays below that.
pub fn adj_int_units(value: u64) -> String {
    const K: u64 = 1024;
    const M: u64 = K * K;
    if value > 512 * M {
        format!("{}m", (value + M / 2) / M)
    } else if value > 512 * K {
        format!("{}k", (value + K / 2) / K)
    } else {
        value.to_string()
    }
}

/// Delays render in the largest sensible unit.
pub fn fmt_delay(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

/// Total connection time as `h/m/s` components, leading zeros dropped.
pub fn fmt_conn_time(seconds: f64) -> String {
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

fn hour_label(hour: u8, iso: bool) -> String {
    if iso {
        format!("{hour:02}:00-{:02}:00", (hour + 1) % 24)
    } else {
        format!("{hour:02}00-{:02}00", (hour + 1) % 24)
    }
}

fn date_label(date: Date, iso: bool) -> String {
    if iso {
        format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            date.month() as u8,
            date.day()
        )
    } else {
        format!(
            "{} {:02} {}",
            month_abbrev(date.month()),
            date.day(),
            date.year()
        )
    }
}

fn month_abbrev(month: Month) -> &'static str {
    match month {
        Month::January => "Jan",
        Month::February => "Feb",
        Month::March => "Mar",
        Month::April => "Apr",
        Month::May => "May",
        Month::June => "Jun",
        Month::July => "Jul",
        Month::August => "Aug",
        Month::September => "Sep",
        Month::October => "Oct",
        Month::November => "Nov",
        Month::December => "Dec",
    }
}

fn clip<'a>(text: &'a str, options: &ReportOptions) -> std::borrow::Cow<'a, str> {
    if options.full_reason || text.chars().count() <= REASON_WIDTH {
        return std::borrow::Cow::Borrowed(text);
    }
    let truncated: String = text.chars().take(REASON_WIDTH - 3).collect();
    std::borrow::Cow::Owned(format!("{truncated}..."))
}
