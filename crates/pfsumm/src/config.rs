use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pfsumm_core::{
    DetailLimit, DetailLimits, Options, ReportOptions, VerpLevel,
};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::args::Args;

const CONFIG_ENV: &str = "PFSUMM_CONFIG";
const CONFIG_NAME: &str = "pfsumm.yaml";

/// Optional YAML defaults file. Every field mirrors a command-line
/// flag; flags given on the command line win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub detail: Option<DetailLimit>,
    pub bounce_detail: Option<DetailLimit>,
    pub deferral_detail: Option<DetailLimit>,
    pub reject_detail: Option<DetailLimit>,
    pub smtp_detail: Option<DetailLimit>,
    pub other_detail: Option<DetailLimit>,
    pub host: Option<DetailLimit>,
    pub user: Option<DetailLimit>,
    pub ignore_case: bool,
    pub verp_mung: Option<u8>,
    pub iso_date_time: bool,
    pub zero_fill: bool,
    pub problems_first: bool,
    pub quiet: bool,
    pub verbose_msg_detail: bool,
    pub no_no_msg_size: bool,
    pub smtpd_stats: bool,
}

impl FileConfig {
    /// Missing config file is not an error; a present but unparsable
    /// one is.
    pub fn load() -> Result<Self> {
        let Some(path) = resolve_config_path() else {
            return Ok(Self::default());
        };
        debug!("loading defaults: path={}", path.display());
        load_config_yaml(&path)
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = home_dir() {
        let home_yaml = home.join(CONFIG_NAME);
        if home_yaml.exists() {
            return Some(home_yaml);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join(CONFIG_NAME);
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }

    None
}

fn home_dir() -> Option<PathBuf> {
    non_empty_env("HOME").map(PathBuf::from)
}

fn load_config_yaml(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_slice(&raw)
        .with_context(|| format!("failed to parse yaml {}", path.display()))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

/// The fully merged run configuration.
#[derive(Debug)]
pub struct Settings {
    pub files: Vec<PathBuf>,
    pub options: Options,
    pub report: ReportOptions,
    pub compression: Option<crate::input::Compression>,
    pub json: bool,
}

impl Settings {
    pub fn assemble(args: Args, file: FileConfig) -> Result<Self> {
        let mut options = Options::new(OffsetDateTime::now_utc().date());
        options.day_filter = args.day;
        if let Some(year) = args.year {
            options.fallback_year = year;
        }
        options.ignore_case = args.ignore_case || file.ignore_case;
        let verp_level = args.verp_mung.or(file.verp_mung).unwrap_or(0);
        options.verp_mung = VerpLevel::from_level(verp_level)?;
        options.assume_monotonic = args.monotonic;
        options.validate()?;

        let uniform = args.detail.or(file.detail);
        let mut limits = match uniform {
            Some(limit) => DetailLimits::uniform(limit),
            None => DetailLimits::default(),
        };
        if let Some(limit) = args.deferral_detail.or(file.deferral_detail) {
            limits.deferral = limit;
        }
        if let Some(limit) = args.bounce_detail.or(file.bounce_detail) {
            limits.bounce = limit;
        }
        if let Some(limit) = args.reject_detail.or(file.reject_detail) {
            limits.reject = limit;
        }
        if let Some(limit) = args.smtp_detail.or(file.smtp_detail) {
            limits.smtp = limit;
        }
        if let Some(limit) = args.other_detail.or(file.other_detail) {
            limits.other = limit;
        }

        let report = ReportOptions {
            limits,
            host_top: args.host.or(file.host).unwrap_or(DetailLimit::All),
            user_top: args.user.or(file.user).unwrap_or(DetailLimit::All),
            iso_date: args.iso_date_time || file.iso_date_time,
            zero_fill: args.zero_fill || file.zero_fill,
            problems_first: args.problems_first || file.problems_first,
            quiet: args.quiet || file.quiet,
            full_reason: args.verbose_msg_detail || file.verbose_msg_detail,
            no_size_section: !(args.no_no_msg_size || file.no_no_msg_size),
            smtpd_stats: args.smtpd_stats || file.smtpd_stats,
        };

        Ok(Self {
            files: args.files,
            options,
            report,
            compression: args.compression,
            json: args.json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pfsumm").chain(argv.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn flags_override_file_defaults() {
        let mut file = FileConfig::default();
        file.quiet = true;
        file.host = Some(DetailLimit::Top(5));

        let settings = Settings::assemble(args(&["-h", "10"]), file)
            .expect("settings should assemble");
        assert!(settings.report.quiet);
        assert_eq!(settings.report.host_top, DetailLimit::Top(10));
    }

    #[test]
    fn uniform_detail_applies_before_per_category_caps() {
        let settings = Settings::assemble(
            args(&["--detail", "3", "--bounce-detail", "all"]),
            FileConfig::default(),
        )
        .expect("settings should assemble");

        assert_eq!(settings.report.limits.deferral, DetailLimit::Top(3));
        assert_eq!(settings.report.limits.bounce, DetailLimit::All);
    }

    #[test]
    fn bad_verp_level_is_rejected_up_front() {
        let result =
            Settings::assemble(args(&["--verp-mung", "7"]), FileConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn config_yaml_accepts_counts_and_keywords() {
        let parsed: FileConfig = serde_yaml::from_str(
            "detail: 10\nbounce_detail: none\nsmtpd_stats: true\n",
        )
        .expect("yaml should parse");
        assert_eq!(parsed.detail, Some(DetailLimit::Top(10)));
        assert_eq!(parsed.bounce_detail, Some(DetailLimit::Top(0)));
        assert!(parsed.smtpd_stats);
    }
}
