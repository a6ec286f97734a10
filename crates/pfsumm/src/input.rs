use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tracing::debug;
use xz2::read::XzDecoder;

/// Wire format of one input file, decided by its extension unless
/// forced on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Self::Gzip,
            Some("bz2" | "bzip2") => Self::Bzip2,
            Some("xz" | "lzma") => Self::Xz,
            _ => Self::None,
        }
    }
}

/// Opens one log file as a line reader, decompressing on the fly.
pub fn open_log(
    path: &Path,
    forced: Option<Compression>,
) -> Result<Box<dyn BufRead>> {
    let compression = forced.unwrap_or_else(|| Compression::from_path(path));
    debug!(
        "opening log: path={}, compression={compression:?}",
        path.display()
    );
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(decode(file, compression))
}

/// Standard input with an optionally forced compression format. There
/// is no extension to inspect, so auto-detection means plain text.
pub fn open_stdin(forced: Option<Compression>) -> Box<dyn BufRead> {
    decode(std::io::stdin(), forced.unwrap_or(Compression::None))
}

fn decode<R: Read + 'static>(
    reader: R,
    compression: Compression,
) -> Box<dyn BufRead> {
    match compression {
        Compression::None => Box::new(BufReader::new(reader)),
        Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(reader))),
        Compression::Bzip2 => Box::new(BufReader::new(MultiBzDecoder::new(reader))),
        Compression::Xz => Box::new(BufReader::new(XzDecoder::new(reader))),
    }
}
