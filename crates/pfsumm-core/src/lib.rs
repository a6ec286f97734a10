pub mod classifier;
pub mod correlator;
pub mod error;
pub mod options;
pub mod report;
pub mod stats;
pub mod summarizer;

pub use classifier::{LogEvent, MalformedLine, Severity, Subsystem, parse_line};
pub use correlator::{
    Correlator, Disposition, Outcome, RecipientOutcome, SmtpdSession,
    SmtpdTracker,
};
pub use error::{OptionsError, TableError};
pub use options::{
    DayFilter, DetailLimit, DetailLimits, Options, ReportOptions, VerpLevel,
};
pub use report::render;
pub use stats::{Aggregator, Stats};
pub use summarizer::{LineOutcome, Summarizer};
