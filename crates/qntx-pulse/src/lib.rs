//! ATS tokenizer, pulse scheduler, and force-trigger path (spec §4.5, C5).

pub mod ats;
pub mod scheduler;

pub use ats::{AtsError, AtsParser, AtsParserRegistry, ParsedAts};
pub use scheduler::{ScheduleRequest, Scheduler};
