use std::collections::HashMap;

use thiserror::Error;
use time::{Date, Month, PrimitiveDateTime, Time};
use tracing::debug;

use crate::options::parse_iso_date;

/// Postfix daemon that produced a line, derived from the process tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Qmgr,
    Smtp,
    Smtpd,
    Bounce,
    Cleanup,
    Local,
    Virtual,
    Postdrop,
    Master,
    Anvil,
    Lmtp,
    Other,
}

impl Subsystem {
    /// Matches the last path component of the tag, so instance prefixes
    /// like `postfix-in/smtp` still classify.
    pub fn from_daemon(daemon: &str) -> Self {
        let name = daemon.rsplit('/').next().unwrap_or(daemon);
        match name {
            "qmgr" => Self::Qmgr,
            "smtp" => Self::Smtp,
            "smtpd" => Self::Smtpd,
            "bounce" => Self::Bounce,
            "cleanup" => Self::Cleanup,
            "local" => Self::Local,
            "virtual" => Self::Virtual,
            "postdrop" => Self::Postdrop,
            "master" => Self::Master,
            "anvil" => Self::Anvil,
            "lmtp" => Self::Lmtp,
            _ => Self::Other,
        }
    }

    /// Daemons whose `to=`/`status=` lines are per-recipient outcomes.
    pub fn is_delivery_agent(self) -> bool {
        matches!(self, Self::Smtp | Self::Local | Self::Virtual | Self::Lmtp)
    }
}

/// Free-form message severity markers, recognized in any subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
    Panic,
}

/// One classified log line. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: PrimitiveDateTime,
    pub host: String,
    pub daemon: String,
    pub pid: Option<u32>,
    pub subsystem: Subsystem,
    pub queue_id: Option<String>,
    /// Message text with the queue-id prefix stripped.
    pub text: String,
    pub fields: HashMap<String, String>,
}

impl LogEvent {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Valid whenever present: non-numeric values were dropped at parse.
    pub fn size(&self) -> Option<u64> {
        self.field("size").and_then(|value| value.parse().ok())
    }

    pub fn nrcpt(&self) -> Option<u64> {
        self.field("nrcpt").and_then(|value| value.parse().ok())
    }

    pub fn delay(&self) -> Option<f64> {
        self.field("delay").and_then(|value| value.parse().ok())
    }

    pub fn severity(&self) -> Option<(Severity, &str)> {
        if let Some(rest) = self.text.strip_prefix("warning: ") {
            return Some((Severity::Warning, rest));
        }
        if let Some(rest) = self.text.strip_prefix("fatal: ") {
            return Some((Severity::Fatal, rest));
        }
        if let Some(rest) = self.text.strip_prefix("panic: ") {
            return Some((Severity::Panic, rest));
        }
        None
    }
}

/// A line that does not match the syslog header shape. Skipped and
/// counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedLine {
    #[error("unrecognized timestamp")]
    BadTimestamp,
    #[error("missing host field")]
    MissingHost,
    #[error("missing process tag")]
    MissingTag,
}

/// Classifies one raw log line. Pure function of the line plus the
/// fallback year used for year-less traditional stamps.
pub fn parse_line(
    line: &str,
    fallback_year: i32,
) -> Result<LogEvent, MalformedLine> {
    let line = line.trim_end();
    let (timestamp, rest) = parse_timestamp(line, fallback_year)?;

    let (host, rest) = take_token(rest).ok_or(MalformedLine::MissingHost)?;
    let (tag, rest) = take_token(rest).ok_or(MalformedLine::MissingTag)?;
    let tag = tag.strip_suffix(':').ok_or(MalformedLine::MissingTag)?;

    let (daemon, pid) = split_pid(tag);
    let subsystem = Subsystem::from_daemon(daemon);

    let message = rest.trim_start();
    let (queue_id, text) = match message.split_once(": ") {
        Some((token, remainder)) if is_queue_id(token) => {
            (Some(token.to_string()), remainder)
        }
        _ => (None, message),
    };

    let mut fields = parse_fields(text);
    if let Some(reason) = status_reason(text) {
        fields.insert("reason".to_string(), reason);
    }
    validate_numeric_fields(&mut fields);

    Ok(LogEvent {
        timestamp,
        host: host.to_string(),
        daemon: daemon.to_string(),
        pid,
        subsystem,
        queue_id,
        text: text.to_string(),
        fields,
    })
}

/// Opaque per-message token assigned by Postfix: short-format upper-hex
/// or long-format mixed-case alphanumerics, always carrying a digit.
/// `NOQUEUE` marks smtpd activity rejected before queue assignment.
pub fn is_queue_id(token: &str) -> bool {
    if token == "NOQUEUE" {
        return true;
    }
    (5..=20).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_alphanumeric())
        && token.chars().any(|c| c.is_ascii_digit())
}

/// Collapses runs of whitespace into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len());
    let mut prev_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                collapsed.push(' ');
                prev_space = true;
            }
        } else {
            collapsed.push(ch);
            prev_space = false;
        }
    }
    collapsed.trim().to_string()
}

fn parse_timestamp(
    line: &str,
    fallback_year: i32,
) -> Result<(PrimitiveDateTime, &str), MalformedLine> {
    let (first, rest) = take_token(line).ok_or(MalformedLine::BadTimestamp)?;

    if first.len() >= 19 && first.as_bytes()[4] == b'-' {
        // rsyslog RFC 3339 stamp; fraction and offset are ignored.
        let date =
            parse_iso_date(&first[..10]).ok_or(MalformedLine::BadTimestamp)?;
        let time = parse_hms(&first[11..19]).ok_or(MalformedLine::BadTimestamp)?;
        return Ok((PrimitiveDateTime::new(date, time), rest));
    }

    let month = month_from_abbrev(first).ok_or(MalformedLine::BadTimestamp)?;
    let (day, rest) = take_token(rest).ok_or(MalformedLine::BadTimestamp)?;
    let day: u8 = day.parse().map_err(|_| MalformedLine::BadTimestamp)?;
    let (hms, rest) = take_token(rest).ok_or(MalformedLine::BadTimestamp)?;
    let time = parse_hms(hms).ok_or(MalformedLine::BadTimestamp)?;
    let date = Date::from_calendar_date(fallback_year, month, day)
        .map_err(|_| MalformedLine::BadTimestamp)?;

    Ok((PrimitiveDateTime::new(date, time), rest))
}

fn month_from_abbrev(token: &str) -> Option<Month> {
    match token {
        "Jan" => Some(Month::January),
        "Feb" => Some(Month::February),
        "Mar" => Some(Month::March),
        "Apr" => Some(Month::April),
        "May" => Some(Month::May),
        "Jun" => Some(Month::June),
        "Jul" => Some(Month::July),
        "Aug" => Some(Month::August),
        "Sep" => Some(Month::September),
        "Oct" => Some(Month::October),
        "Nov" => Some(Month::November),
        "Dec" => Some(Month::December),
        _ => None,
    }
}

fn parse_hms(token: &str) -> Option<Time> {
    let mut parts = token.splitn(3, ':');
    let hour: u8 = parts.next()?.parse().ok()?;
    let minute: u8 = parts.next()?.parse().ok()?;
    let second: u8 = parts.next()?.parse().ok()?;
    Time::from_hms(hour, minute, second).ok()
}

fn take_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    Some((&text[..end], &text[end..]))
}

fn split_pid(tag: &str) -> (&str, Option<u32>) {
    if let Some(stripped) = tag.strip_suffix(']') {
        if let Some((daemon, pid)) = stripped.split_once('[') {
            return (daemon, pid.parse().ok());
        }
    }
    (tag, None)
}

/// Permissive key=value scan: keys are `[a-z_]+` at a segment start,
/// values angle-bracketed, quoted or bare. Duplicates last-wins.
fn parse_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if at_key_start(bytes, i) {
            let mut j = i;
            while j < bytes.len()
                && (bytes[j].is_ascii_lowercase() || bytes[j] == b'_')
            {
                j += 1;
            }
            if j > i && j < bytes.len() && bytes[j] == b'=' {
                let key = &text[i..j];
                let (value, next) = scan_value(text, j + 1);
                fields.insert(key.to_string(), value);
                i = next;
                continue;
            }
        }
        i += 1;
    }

    fields
}

fn at_key_start(bytes: &[u8], i: usize) -> bool {
    if !(bytes[i].is_ascii_lowercase() || bytes[i] == b'_') {
        return false;
    }
    i == 0 || matches!(bytes[i - 1], b' ' | b',' | b'(')
}

fn scan_value(text: &str, pos: usize) -> (String, usize) {
    let rest = &text[pos..];
    match rest.chars().next() {
        Some('<') => match rest[1..].find('>') {
            Some(end) => (rest[1..1 + end].to_string(), pos + end + 2),
            None => (rest[1..].to_string(), text.len()),
        },
        Some('"') => match rest[1..].find('"') {
            Some(end) => (rest[1..1 + end].to_string(), pos + end + 2),
            None => (rest[1..].to_string(), text.len()),
        },
        _ => {
            let end = rest
                .find(|c: char| c == ',' || c.is_whitespace())
                .unwrap_or(rest.len());
            (rest[..end].to_string(), pos + end)
        }
    }
}

/// The free text following the `status=` token, usually a parenthesized
/// reply or reason.
fn status_reason(text: &str) -> Option<String> {
    let idx = text.find("status=")?;
    let after = &text[idx + "status=".len()..];
    let token_end =
        after.find(char::is_whitespace).unwrap_or(after.len());
    let rest = after[token_end..].trim();
    if rest.is_empty() {
        return None;
    }
    let rest = rest.strip_prefix('(').unwrap_or(rest);
    let rest = rest.strip_suffix(')').unwrap_or(rest);
    let reason = collapse_whitespace(rest);
    if reason.is_empty() { None } else { Some(reason) }
}

/// Field-level validation: a bad numeric value drops that field only,
/// the rest of the line is still used.
fn validate_numeric_fields(fields: &mut HashMap<String, String>) {
    for key in ["size", "nrcpt"] {
        if let Some(value) = fields.get(key) {
            if value.parse::<u64>().is_err() {
                debug!("dropping unparsable numeric field: {key}={value}");
                fields.remove(key);
            }
        }
    }
    if let Some(value) = fields.get("delay") {
        let parsed = value.parse::<f64>();
        if !parsed.as_ref().is_ok_and(|d| d.is_finite() && *d >= 0.0) {
            debug!("dropping unparsable delay field: delay={value}");
            fields.remove("delay");
        }
    }
}
