//! Run configuration.
//!
//! Everything a run depends on is collected here once, in `main`. Components
//! receive values from [`RunConfig`] and never consult the environment.

use std::ffi::{OsStr, OsString};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{User, getuid};

use crate::error::InputError;
use crate::sandbox::layers::resolve_lower_dir;
use crate::workspace::IgnoreFilter;

/// Shell used when no usable shell is configured.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Union helpers looked up on `PATH`, in order of preference.
pub const UNION_HELPERS: &[&str] = &["mergerfs", "unionfs"];

/// Login shells that refuse interactive use.
const REFUSING_SHELLS: &[&str] = &["nologin", "false"];

/// What happens with the changes after the command exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Show the summary and ask before committing.
    Interactive,
    /// Commit without asking.
    AutoCommit,
    /// Keep the workspace and print its path.
    Quiet,
    /// Show the summary, keep the workspace and print its path.
    Show,
}

impl Mode {
    /// Derives the mode from the command-line switches.
    ///
    /// `-y` wins over everything; `-n`, `-D` and `-L` each suppress the
    /// prompt.
    #[must_use]
    pub fn from_flags(no_commit: bool, yes: bool, has_workspace: bool, has_lowers: bool) -> Self {
        if yes {
            Self::AutoCommit
        } else if no_commit || has_workspace || has_lowers {
            Self::Quiet
        } else {
            Self::Interactive
        }
    }

    /// Interactive mode cannot prompt without a terminal and shows instead.
    #[must_use]
    pub fn for_terminal(self, stdin_is_terminal: bool) -> Self {
        match self {
            Self::Interactive if !stdin_is_terminal => Self::Show,
            other => other,
        }
    }
}

/// Configuration of one invocation.
///
/// # Example
///
/// ```
/// use cowrun::config::{Mode, RunConfig};
///
/// let config = RunConfig::new("run-1")
///     .with_mode(Mode::AutoCommit)
///     .with_ignore_patterns(vec!["\\.log$".to_string()])
///     .with_network_isolation(true);
///
/// assert_eq!(config.exec_id, "run-1");
/// assert!(config.isolate_network);
/// ```
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    /// Existing workspace to reuse (`-D`).
    pub workspace: Option<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub isolate_network: bool,
    /// Resolved union helper, if any.
    pub union_helper: Option<PathBuf>,
    /// Extra lower roots, already resolved to the directories stacked.
    pub lower_dirs: Vec<PathBuf>,
    pub shell: PathBuf,
    /// Names a fresh workspace `cowrun-{exec_id}`.
    pub exec_id: String,
    /// Parent directory of fresh workspaces.
    pub scratch_dir: PathBuf,
    /// Root of the filesystem the sandbox shadows.
    pub host_root: PathBuf,
    /// Working directory of the command.
    pub working_dir: PathBuf,
    /// Environment of the command, not necessarily UTF-8.
    pub env: Vec<(OsString, OsString)>,
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but the
    /// execution identifier.
    #[must_use]
    pub fn new(exec_id: impl Into<String>) -> Self {
        Self {
            mode: Mode::Interactive,
            workspace: None,
            ignore_patterns: Vec::new(),
            isolate_network: false,
            union_helper: None,
            lower_dirs: Vec::new(),
            shell: PathBuf::from(FALLBACK_SHELL),
            exec_id: exec_id.into(),
            scratch_dir: std::env::temp_dir(),
            host_root: PathBuf::from("/"),
            working_dir: PathBuf::from("/"),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = patterns;
        self
    }

    #[must_use]
    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    #[must_use]
    pub fn with_union_helper(mut self, helper: Option<PathBuf>) -> Self {
        self.union_helper = helper;
        self
    }

    /// Sets the `-L` directories; workspaces among them contribute their
    /// upper layer.
    #[must_use]
    pub fn with_lower_dirs(mut self, dirs: &[PathBuf]) -> Self {
        self.lower_dirs = dirs.iter().map(|d| resolve_lower_dir(d)).collect();
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_host_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.host_root = root.into();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Checks the user-supplied paths and patterns.
    ///
    /// # Errors
    ///
    /// Returns the `InputError` for the first missing lower directory or
    /// invalid ignore pattern.
    pub fn validate(&self) -> Result<(), InputError> {
        for dir in &self.lower_dirs {
            if !dir.is_dir() {
                return Err(InputError::LowerDirNotFound { path: dir.clone() });
            }
        }
        IgnoreFilter::new(self.ignore_patterns.iter().cloned())?;
        Ok(())
    }
}

/// Picks the shell: an explicit override, else the login shell if usable,
/// else [`FALLBACK_SHELL`].
#[must_use]
pub fn resolve_shell(explicit: Option<&Path>, login: Option<&Path>) -> PathBuf {
    explicit
        .or(login.filter(|shell| is_usable_shell(shell)))
        .map_or_else(|| PathBuf::from(FALLBACK_SHELL), Path::to_path_buf)
}

/// The calling user's login shell from the passwd database.
#[must_use]
pub fn login_shell() -> Option<PathBuf> {
    User::from_uid(getuid()).ok().flatten().map(|user| user.shell)
}

fn is_usable_shell(shell: &Path) -> bool {
    let refused = shell
        .file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| REFUSING_SHELLS.contains(&name));
    !refused && shell.is_file()
}

/// Finds the union helper: an explicit path must exist, otherwise the first
/// of [`UNION_HELPERS`] found on `search_path`.
///
/// # Errors
///
/// Returns `InputError::UnionHelperNotFound` for a missing explicit helper.
pub fn resolve_union_helper(
    explicit: Option<&Path>,
    search_path: Option<&OsStr>,
) -> Result<Option<PathBuf>, InputError> {
    if let Some(helper) = explicit {
        return if helper.is_file() {
            Ok(Some(helper.to_path_buf()))
        } else {
            Err(InputError::UnionHelperNotFound {
                path: helper.to_path_buf(),
            })
        };
    }

    let Some(search_path) = search_path else {
        return Ok(None);
    };
    Ok(UNION_HELPERS
        .iter()
        .find_map(|name| find_executable(name, search_path)))
}

/// Looks `name` up in a `PATH`-style list of directories.
#[must_use]
pub fn find_executable(name: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
}
