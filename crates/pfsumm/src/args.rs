use std::path::PathBuf;

use clap::{ArgAction, Parser};
use pfsumm_core::{DayFilter, DetailLimit};

fn parse_limit(value: &str) -> Result<DetailLimit, String> {
    DetailLimit::parse(value).map_err(|error| error.to_string())
}

fn parse_day(value: &str) -> Result<DayFilter, String> {
    DayFilter::parse(value).map_err(|error| error.to_string())
}

/// `-h` is the host/domain top count, matching the traditional tool;
/// the help flag is therefore long-only.
#[derive(Debug, Parser)]
#[command(
    name = "pfsumm",
    version,
    about = "Produce a traffic summary from Postfix syslog files",
    disable_help_flag = true
)]
pub struct Args {
    /// Log files to read, in order. Files ending in .gz, .bz2 or .xz
    /// are decompressed on the fly. With no files, or `-`, the log is
    /// read from standard input.
    #[arg(value_name = "LOGFILE")]
    pub files: Vec<PathBuf>,

    /// Restrict the summary to one day: today, yesterday or CCYY-MM-DD.
    #[arg(short = 'd', long = "day", value_name = "WHICH", value_parser = parse_day)]
    pub day: Option<DayFilter>,

    /// One cap for every detail section: a count, "all" or "none".
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub detail: Option<DetailLimit>,

    /// Cap for the bounce detail section.
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub bounce_detail: Option<DetailLimit>,

    /// Cap for the deferral detail section.
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub deferral_detail: Option<DetailLimit>,

    /// Cap for the reject, reject warning, hold and discard sections.
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub reject_detail: Option<DetailLimit>,

    /// Cap for the smtp delivery failure section.
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub smtp_detail: Option<DetailLimit>,

    /// Cap for warnings, fatals, panics, master and no-size sections.
    #[arg(long, value_name = "COUNT", value_parser = parse_limit)]
    pub other_detail: Option<DetailLimit>,

    /// Top count for the host/domain summaries.
    #[arg(short = 'h', long = "host", value_name = "COUNT", value_parser = parse_limit)]
    pub host: Option<DetailLimit>,

    /// Top count for the per-user summaries.
    #[arg(short = 'u', long = "user", value_name = "COUNT", value_parser = parse_limit)]
    pub user: Option<DetailLimit>,

    /// Fold the whole address to lower case, not only the host/domain.
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// VERP sender munging level: 0 off, 1 id-masked, 2 collapsed.
    #[arg(long, value_name = "LEVEL")]
    pub verp_mung: Option<u8>,

    /// ISO date and time formats in the report.
    #[arg(long)]
    pub iso_date_time: bool,

    /// Render hour/day rows even when all their counters are zero.
    #[arg(short = 'z', long)]
    pub zero_fill: bool,

    /// Emit the problem detail sections right after the grand totals.
    #[arg(long)]
    pub problems_first: bool,

    /// Drop headings for empty sections.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Do not truncate long reason texts.
    #[arg(long)]
    pub verbose_msg_detail: bool,

    /// Suppress the "messages with no size data" section.
    #[arg(long)]
    pub no_no_msg_size: bool,

    /// Include the smtpd connection summaries.
    #[arg(long)]
    pub smtpd_stats: bool,

    /// Year assumed for traditional syslog stamps, which carry none.
    #[arg(long, value_name = "CCYY")]
    pub year: Option<i32>,

    /// Input is chronologically ordered; with --day, stop reading at
    /// the first line past the wanted day.
    #[arg(long)]
    pub monotonic: bool,

    /// Force the input compression instead of going by file extension.
    #[arg(long, value_name = "FORMAT", value_enum)]
    pub compression: Option<crate::input::Compression>,

    /// Raise diagnostic verbosity (-v info, -vv debug); PFSUMM_LOG
    /// overrides.
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Emit the aggregate snapshot as JSON instead of the report.
    #[arg(long)]
    pub json: bool,

    #[arg(long, action = ArgAction::HelpLong, help = "Print help")]
    pub help: Option<bool>,
}
