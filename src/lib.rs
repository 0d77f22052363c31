//! cowrun - run a command on a copy-on-write view of the host filesystem.
//!
//! The command runs inside new user, mount and PID namespaces on top of an
//! OverlayFS stack whose upper layers live in a workspace directory. After
//! it exits, the upper layer is classified into a list of changes which can
//! be reviewed, committed to the host or thrown away.
//!
//! # Platform Requirements
//!
//! - Linux kernel 5.11+ (unprivileged OverlayFS with `userxattr`)
//! - Unprivileged user namespaces enabled
//! - Optionally `mergerfs` or `unionfs` for mount points with nested mounts
//!
//! # Example
//!
//! ```no_run
//! use cowrun::config::{Mode, RunConfig};
//! use cowrun::pipeline::{Pipeline, TerminalPrompt};
//! use cowrun::sandbox::LinuxHost;
//!
//! fn main() -> miette::Result<()> {
//!     cowrun::system::check_all()?;
//!
//!     let config = RunConfig::new("example").with_mode(Mode::Show);
//!     let command = vec!["make".to_string(), "install".to_string()];
//!     let code = Pipeline::new(&LinuxHost, &config).run(
//!         Some(&command),
//!         &mut std::io::stdout(),
//!         &mut TerminalPrompt,
//!     )?;
//!     std::process::exit(code);
//! }
//! ```

pub mod changes;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sandbox;
pub mod signal;
pub mod system;
pub mod workspace;

pub use changes::{ChangeKind, ChangeRecord};
pub use config::{Mode, RunConfig};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use workspace::Workspace;
