use serde::{Deserialize, Deserializer};
use time::{Date, Duration, Month};

use crate::error::OptionsError;

/// Restricts the run to a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayFilter {
    Today,
    Yesterday,
    On(Date),
}

impl DayFilter {
    /// Accepts `today`, `yesterday` or an explicit `CCYY-MM-DD` date.
    pub fn parse(value: &str) -> Result<Self, OptionsError> {
        match value.trim() {
            "today" => Ok(Self::Today),
            "yesterday" => Ok(Self::Yesterday),
            other => parse_iso_date(other)
                .map(Self::On)
                .ok_or_else(|| OptionsError::InvalidDayFilter(other.to_string())),
        }
    }

    pub fn resolve(self, reference: Date) -> Date {
        match self {
            Self::Today => reference,
            Self::Yesterday => reference.saturating_sub(Duration::days(1)),
            Self::On(date) => date,
        }
    }
}

pub(crate) fn parse_iso_date(value: &str) -> Option<Date> {
    let mut parts = value.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

/// VERP sender-address munging level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerpLevel {
    #[default]
    Off,
    /// Replace the numeric id segment with `ID`.
    Simple,
    /// Collapse the address down to `prefix@domain`.
    Aggressive,
}

impl VerpLevel {
    pub fn from_level(level: u8) -> Result<Self, OptionsError> {
        match level {
            0 => Ok(Self::Off),
            1 => Ok(Self::Simple),
            2 => Ok(Self::Aggressive),
            other => Err(OptionsError::InvalidVerpLevel(other)),
        }
    }
}

/// Parse-side configuration, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct Options {
    pub day_filter: Option<DayFilter>,
    /// The date `today` resolves against. Supplied by the caller so the
    /// core stays deterministic.
    pub reference_date: Date,
    /// Year assumed for traditional syslog stamps, which carry none.
    pub fallback_year: i32,
    /// Lower-case the whole address, not only the host/domain part.
    pub ignore_case: bool,
    pub verp_mung: VerpLevel,
    /// Input is known to be chronologically ordered; a date filter may
    /// then stop the run at the first line past the wanted day.
    pub assume_monotonic: bool,
}

impl Options {
    pub fn new(reference_date: Date) -> Self {
        Self {
            day_filter: None,
            reference_date,
            fallback_year: reference_date.year(),
            ignore_case: false,
            verp_mung: VerpLevel::Off,
            assume_monotonic: false,
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(1970..=9999).contains(&self.fallback_year) {
            return Err(OptionsError::YearOutOfRange(self.fallback_year));
        }
        Ok(())
    }

    pub fn wanted_date(&self) -> Option<Date> {
        self.day_filter.map(|filter| filter.resolve(self.reference_date))
    }
}

/// Render-time cap for one detail table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLimit {
    All,
    Top(u32),
}

impl DetailLimit {
    /// Accepts a non-negative count, `all` or `none`.
    pub fn parse(value: &str) -> Result<Self, OptionsError> {
        match value.trim() {
            "all" => Ok(Self::All),
            "none" => Ok(Self::Top(0)),
            other => other
                .parse::<u32>()
                .map(Self::Top)
                .map_err(|_| OptionsError::InvalidDetailLimit(other.to_string())),
        }
    }

    /// A zero limit suppresses the whole section.
    pub fn suppresses(self) -> bool {
        matches!(self, Self::Top(0))
    }

    /// How many of `len` entries get shown.
    pub fn cap(self, len: usize) -> usize {
        match self {
            Self::All => len,
            Self::Top(n) => len.min(n as usize),
        }
    }
}

impl Default for DetailLimit {
    fn default() -> Self {
        Self::All
    }
}

impl<'de> Deserialize<'de> for DetailLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawLimit {
            Count(u32),
            Text(String),
        }

        match RawLimit::deserialize(deserializer)? {
            RawLimit::Count(n) => Ok(Self::Top(n)),
            RawLimit::Text(text) => {
                Self::parse(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Per-category caps for the problem-detail sections.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetailLimits {
    pub deferral: DetailLimit,
    pub bounce: DetailLimit,
    pub reject: DetailLimit,
    pub smtp: DetailLimit,
    /// Warnings, fatals, panics, master messages and the no-size list.
    pub other: DetailLimit,
}

impl DetailLimits {
    /// The `--detail COUNT` shorthand: one cap for everything.
    pub fn uniform(limit: DetailLimit) -> Self {
        Self {
            deferral: limit,
            bounce: limit,
            reject: limit,
            smtp: limit,
            other: limit,
        }
    }
}

/// Render-side configuration. The renderer is a pure function of the
/// snapshot plus these values.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub limits: DetailLimits,
    pub host_top: DetailLimit,
    pub user_top: DetailLimit,
    pub iso_date: bool,
    pub zero_fill: bool,
    pub problems_first: bool,
    pub quiet: bool,
    /// Show the full reason text instead of a truncated one.
    pub full_reason: bool,
    /// Emit the "messages with no size data" section.
    pub no_size_section: bool,
    pub smtpd_stats: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            limits: DetailLimits::default(),
            host_top: DetailLimit::All,
            user_top: DetailLimit::All,
            iso_date: false,
            zero_fill: false,
            problems_first: false,
            quiet: false,
            full_reason: false,
            no_size_section: true,
            smtpd_stats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_filter_accepts_keywords_and_iso_dates() {
        assert_eq!(DayFilter::parse("today").unwrap(), DayFilter::Today);
        assert_eq!(DayFilter::parse("yesterday").unwrap(), DayFilter::Yesterday);

        let explicit = DayFilter::parse("2023-02-17").unwrap();
        let DayFilter::On(date) = explicit else {
            panic!("expected an explicit date");
        };
        assert_eq!((date.year(), date.month() as u8, date.day()), (2023, 2, 17));

        assert!(DayFilter::parse("tomorrow").is_err());
        assert!(DayFilter::parse("2023-13-01").is_err());
    }

    #[test]
    fn yesterday_resolves_against_the_reference_date() {
        let reference = parse_iso_date("2023-03-01").unwrap();
        let resolved = DayFilter::Yesterday.resolve(reference);
        assert_eq!(
            (resolved.year(), resolved.month() as u8, resolved.day()),
            (2023, 2, 28)
        );
    }

    #[test]
    fn detail_limit_parses_counts_and_keywords() {
        assert_eq!(DetailLimit::parse("all").unwrap(), DetailLimit::All);
        assert_eq!(DetailLimit::parse("none").unwrap(), DetailLimit::Top(0));
        assert_eq!(DetailLimit::parse("7").unwrap(), DetailLimit::Top(7));
        assert!(DetailLimit::parse("-1").is_err());
        assert!(DetailLimit::parse("many").is_err());
    }

    #[test]
    fn zero_limit_suppresses_and_caps() {
        assert!(DetailLimit::Top(0).suppresses());
        assert!(!DetailLimit::All.suppresses());
        assert_eq!(DetailLimit::Top(3).cap(10), 3);
        assert_eq!(DetailLimit::All.cap(10), 10);
    }

    #[test]
    fn fallback_year_is_validated() {
        let reference = parse_iso_date("2023-02-17").unwrap();
        let mut options = Options::new(reference);
        assert!(options.validate().is_ok());

        options.fallback_year = 123;
        assert_eq!(options.validate(), Err(OptionsError::YearOutOfRange(123)));
    }
}
