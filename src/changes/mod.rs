//! Change detection and application.
//!
//! After a run the workspace's upper layer holds everything the command
//! wrote. [`ChangeClassifier`] turns it into a list of [`ChangeRecord`]s,
//! [`summarize`] renders that list for review and [`CommitEngine`] applies it
//! to the host.

mod classify;
mod commit;
mod record;

pub use classify::{ChangeClassifier, EntryKind, Outside, UpperEntry, classify_entry};
pub use commit::{
    CommitEngine, CommitFailure, CommitReport, NO_CHANGES, SUMMARY_HEADER, summarize,
};
pub use record::{ChangeKind, ChangeRecord, read_records, write_records};
