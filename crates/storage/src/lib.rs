//! SQLite event journal.
//!
//! An append-only log of supervisor events (lifecycle, gap reports,
//! acquisitions) for after-the-fact inspection. The journal is never read
//! back for control decisions; all authoritative state lives in memory.

mod error;
mod journal;

pub use error::{Error, Result};
pub use journal::{Journal, JournalEntry};
