//! One invocation, from workspace to exit code.
//!
//! ```text
//! Empty ─► Layered ─► Executed ─► Classified ─┬─► Committed
//!                                             ├─► Shown
//!                                             └─► Discarded
//! ```
//!
//! The workspace is released on every path out of here, including errors and
//! interruptions, by the `Workspace` guard. A termination signal stops the
//! pipeline at the next transition with exit status `128 + N`; nothing is
//! classified or committed after it.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::changes::{
    ChangeClassifier, ChangeRecord, CommitEngine, NO_CHANGES, read_records, summarize, write_records,
};
use crate::config::{Mode, RunConfig};
use crate::error::{EXIT_CONSISTENCY, Error};
use crate::sandbox::executor::{ExecutionRequest, IsolationExecutor};
use crate::sandbox::host::HostOps;
use crate::sandbox::layers::{LayerBuilder, discover_mountpoints};
use crate::signal;
use crate::workspace::{IgnoreFilter, Workspace};

/// Question asked in interactive mode.
pub const COMMIT_QUESTION: &str = "Commit these changes? [y/N] ";

/// Pipeline stage, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Empty,
    Layered,
    Executed,
    Classified,
    Committed,
    Shown,
    Discarded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Layered => "layered",
            Self::Executed => "executed",
            Self::Classified => "classified",
            Self::Committed => "committed",
            Self::Shown => "shown",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Answer to the commit question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// The prompt was interrupted by signal N.
    Interrupted(i32),
}

/// Asks the user whether to commit.
pub trait Prompt {
    fn confirm(&mut self, question: &str) -> Answer;
}

impl<F: FnMut(&str) -> Answer> Prompt for F {
    fn confirm(&mut self, question: &str) -> Answer {
        self(question)
    }
}

/// Reads the answer from the terminal.
///
/// The read is not retried on `EINTR`, so a signal at the prompt ends it.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&mut self, question: &str) -> Answer {
        let mut stdout = io::stdout();
        let _ = write!(stdout, "{question}");
        let _ = stdout.flush();

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        let mut stdin = io::stdin().lock();
        loop {
            match stdin.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if let Some(sig) = signal::take() {
                        let _ = writeln!(stdout);
                        return Answer::Interrupted(sig as i32);
                    }
                }
                Err(_) => return Answer::No,
            }
        }

        parse_answer(&String::from_utf8_lossy(&line))
    }
}

/// `y` or `yes` in any case means yes; anything else means no.
#[must_use]
pub fn parse_answer(input: &str) -> Answer {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Answer::Yes,
        _ => Answer::No,
    }
}

/// Drives one invocation.
pub struct Pipeline<'a, H: HostOps + ?Sized> {
    host: &'a H,
    config: &'a RunConfig,
}

impl<'a, H: HostOps + ?Sized> Pipeline<'a, H> {
    #[must_use]
    pub fn new(host: &'a H, config: &'a RunConfig) -> Self {
        Self { host, config }
    }

    /// Runs `command` in a sandbox and handles its changes according to the
    /// configured mode. Returns the exit status for the process.
    ///
    /// # Errors
    ///
    /// Input errors (bad paths, patterns) and consistency errors (invalid
    /// workspace, namespace failures). The command's own failure is returned
    /// as its exit status.
    #[instrument(skip_all, fields(mode = ?self.config.mode))]
    pub fn run(
        &self,
        command: Option<&[String]>,
        out: &mut dyn Write,
        prompt: &mut dyn Prompt,
    ) -> Result<i32, Error> {
        self.config.validate()?;

        let workspace = Workspace::acquire(
            self.config.workspace.as_deref(),
            &self.config.scratch_dir,
            &self.config.exec_id,
        )?;
        debug!(stage = %Stage::Empty, workspace = %workspace.root().display());
        workspace.record_ignore_patterns(&self.config.ignore_patterns)?;
        let filter = workspace.ignore_filter(&self.config.ignore_patterns)?;
        if let Some(code) = interruption() {
            return Ok(code);
        }

        let mountpoints = discover_mountpoints(&self.config.host_root)?;
        let layers = LayerBuilder::new(self.host, workspace.paths(), &self.config.host_root)
            .with_lower_dirs(self.config.lower_dirs.clone())
            .with_union_helper(self.config.union_helper.clone());
        let executor = IsolationExecutor::new(self.host, workspace.paths(), layers);

        let mut request = ExecutionRequest::new(&self.config.shell, &self.config.working_dir)
            .with_env(self.config.env.iter().cloned())
            .with_network_isolation(self.config.isolate_network);
        if let Some(words) = command {
            request = request.with_command(words);
        }

        debug!(stage = %Stage::Layered, workspace = %workspace.root().display());
        let result = executor.run(&mountpoints, &request)?;
        debug!(stage = %Stage::Executed, exit_code = result.exit_code);

        if !result.degraded.is_empty() {
            warn!(
                count = result.degraded.len(),
                log = %workspace.paths().mount_log.display(),
                "Some directories could not be sandboxed and were empty during the run"
            );
        }
        if let Some(sig) = result.interrupted {
            info!(signal = sig, "Run interrupted, discarding changes");
            return Ok(signal::interrupted_exit_code(sig));
        }
        if let Some(code) = interruption() {
            return Ok(code);
        }

        self.review(workspace, &filter, result.exit_code, out, prompt)
    }

    /// Classifies the workspace and commits, shows or discards the changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the upper layer cannot be read or the change list
    /// cannot be written.
    pub fn review(
        &self,
        mut workspace: Workspace,
        filter: &IgnoreFilter,
        exit_code: i32,
        out: &mut dyn Write,
        prompt: &mut dyn Prompt,
    ) -> Result<i32, Error> {
        let records = self.classify(&workspace, filter)?;
        debug!(stage = %Stage::Classified, count = records.len());

        // Quiet runs hand the workspace to the caller even when it is empty.
        if records.is_empty() && self.config.mode != Mode::Quiet {
            writeln!(out, "{NO_CHANGES}")?;
            workspace.release()?;
            debug!(stage = %Stage::Discarded);
            return Ok(exit_code);
        }

        match self.config.mode {
            Mode::Quiet => {
                workspace.keep();
                writeln!(out, "{}", workspace.root().display())?;
                debug!(stage = %Stage::Shown);
                Ok(exit_code)
            }
            Mode::Show => {
                write!(out, "{}", summarize(&records))?;
                workspace.keep();
                writeln!(out, "{}", workspace.root().display())?;
                debug!(stage = %Stage::Shown);
                Ok(exit_code)
            }
            Mode::AutoCommit => self.commit_and_release(workspace, &records, filter, exit_code),
            Mode::Interactive => {
                write!(out, "{}", summarize(&records))?;
                out.flush()?;
                match prompt.confirm(COMMIT_QUESTION) {
                    Answer::Yes => self.commit_and_release(workspace, &records, filter, exit_code),
                    Answer::No => {
                        workspace.release()?;
                        debug!(stage = %Stage::Discarded);
                        Ok(exit_code)
                    }
                    Answer::Interrupted(sig) => Ok(signal::interrupted_exit_code(sig)),
                }
            }
        }
    }

    /// `explore DIR`: opens an interactive shell on top of an existing
    /// workspace. Changes stay in the workspace.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub fn explore(
        &self,
        dir: &Path,
        out: &mut dyn Write,
        prompt: &mut dyn Prompt,
    ) -> Result<i32, Error> {
        let config = self.config.clone().with_workspace(dir).with_mode(Mode::Quiet);
        Pipeline::new(self.host, &config).run(None, out, prompt)
    }

    /// `summary DIR`: prints the changes recorded in an existing workspace.
    ///
    /// # Errors
    ///
    /// Returns an input error if `dir` does not exist and a consistency error
    /// if it is not a valid workspace.
    pub fn summary(&self, dir: &Path, out: &mut dyn Write) -> Result<i32, Error> {
        let workspace = Workspace::open(dir)?;
        let filter = workspace.ignore_filter(&self.config.ignore_patterns)?;
        let records = self.classify(&workspace, &filter)?;
        write!(out, "{}", summarize(&records))?;
        Ok(0)
    }

    /// `commit DIR`: applies the changes recorded in an existing workspace.
    ///
    /// # Errors
    ///
    /// Same as [`summary`](Self::summary).
    pub fn commit(&self, dir: &Path, out: &mut dyn Write) -> Result<i32, Error> {
        let workspace = Workspace::open(dir)?;
        let filter = workspace.ignore_filter(&self.config.ignore_patterns)?;
        let reviewed = read_records(&workspace.paths().changes_file).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring unreadable change list");
            Vec::new()
        });
        let records = self.classify(&workspace, &filter)?;
        if !reviewed.is_empty() && reviewed != records {
            warn!(
                reviewed = reviewed.len(),
                current = records.len(),
                "Workspace changed since its change list was written"
            );
        }
        if records.is_empty() {
            writeln!(out, "{NO_CHANGES}")?;
            return Ok(0);
        }
        self.commit_and_release(workspace, &records, &filter, 0)
    }

    fn classify(
        &self,
        workspace: &Workspace,
        filter: &IgnoreFilter,
    ) -> Result<Vec<ChangeRecord>, Error> {
        let paths = workspace.paths();
        let records =
            ChangeClassifier::new(self.host, &paths.upper, &self.config.host_root, filter)
                .classify()?;
        write_records(&paths.changes_file, &records)?;
        Ok(records)
    }

    fn commit_and_release(
        &self,
        workspace: Workspace,
        records: &[ChangeRecord],
        filter: &IgnoreFilter,
        exit_code: i32,
    ) -> Result<i32, Error> {
        let report = CommitEngine::new(&workspace.paths().upper, &self.config.host_root, filter)
            .commit(records);
        workspace.release()?;
        debug!(stage = %Stage::Committed, applied = report.applied);

        if report.is_success() {
            Ok(exit_code)
        } else {
            warn!(failed = report.failures.len(), "Some changes could not be committed");
            Ok(EXIT_CONSISTENCY)
        }
    }
}

fn interruption() -> Option<i32> {
    signal::take().map(|sig| signal::interrupted_exit_code(sig as i32))
}
