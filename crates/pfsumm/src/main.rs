mod args;
mod config;
mod input;
mod logging;

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use pfsumm_core::{LineOutcome, Summarizer, render};
use tracing::info;

use crate::args::Args;
use crate::config::{FileConfig, Settings};

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = match args.verbose {
        0 => "pfsumm=warn",
        1 => "pfsumm=info,pfsumm_core=info",
        _ => "pfsumm=debug,pfsumm_core=debug",
    };
    logging::init_logging(default_filter, "PFSUMM_LOG");

    let file_config = FileConfig::load()?;
    let settings = Settings::assemble(args, file_config)?;

    // Bad inputs abort before any line is aggregated.
    for path in &settings.files {
        if path != Path::new("-") && !path.is_file() {
            anyhow::bail!("input file not readable: {}", path.display());
        }
    }

    let mut summarizer = Summarizer::new(settings.options.clone())?;

    if settings.files.is_empty() {
        feed(input::open_stdin(settings.compression), &mut summarizer);
    } else {
        for path in &settings.files {
            let keep_going = if path == Path::new("-") {
                feed(input::open_stdin(settings.compression), &mut summarizer)
            } else {
                feed(
                    input::open_log(path, settings.compression)?,
                    &mut summarizer,
                )
            };
            if !keep_going {
                info!(
                    "stopping early: past the filtered day in {}",
                    path.display()
                );
                break;
            }
        }
    }

    let stats = summarizer.finish();
    info!(
        "run complete: lines={}, considered={}, malformed={}",
        stats.lines_total, stats.lines_considered, stats.malformed_lines
    );

    let stdout = io::stdout().lock();
    if settings.json {
        emit_json(stdout, &stats)?;
    } else {
        emit_report(stdout, &render(&stats, &settings.report))?;
    }

    Ok(())
}

/// Feeds one reader line by line. Returns false once the summarizer
/// reports the input has moved past the filtered day.
fn feed<R: BufRead>(reader: R, summarizer: &mut Summarizer) -> bool {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                // Undecodable input past this point; the summary covers
                // what was read.
                tracing::warn!("read error, stopping this file: {error}");
                return true;
            }
        };
        if summarizer.feed_line(&line) == LineOutcome::BeyondWindow {
            return false;
        }
    }
    true
}

fn emit_json<W: Write>(mut out: W, stats: &pfsumm_core::Stats) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, stats)
        .context("failed to serialize stats")?;
    writeln!(out)?;
    Ok(())
}

fn emit_report<W: Write>(mut out: W, report: &str) -> Result<()> {
    out.write_all(report.as_bytes())?;
    Ok(())
}
