//! Error types for cowrun.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every fatal error maps onto one of two exit-code classes: input errors (2)
//! and consistency errors (1).

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Exit code for consistency and internal errors.
pub const EXIT_CONSISTENCY: i32 = 1;

/// Exit code for bad arguments and missing user-supplied paths.
pub const EXIT_INPUT: i32 = 2;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Bad arguments or missing user-supplied paths
    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] InputError),

    /// The workspace cannot be trusted or could not be set up
    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    /// A mount operation that the pipeline cannot recover from
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mount(#[from] MountError),

    /// Namespace creation or process supervision failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Exec(#[from] ExecError),

    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(cowrun::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(cowrun::io))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the process exit code for this error class.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) => EXIT_INPUT,
            _ => EXIT_CONSISTENCY,
        }
    }
}

/// Errors caused by what the user asked for.
#[derive(Error, Debug, Diagnostic)]
pub enum InputError {
    /// No command given on the run path
    #[error("no command given")]
    #[diagnostic(code(cowrun::input::missing_command), help("usage: cowrun [flags] CMD [ARGS...]"))]
    MissingCommand,

    /// A subcommand was given without its workspace argument
    #[error("`{subcommand}` expects a workspace directory")]
    #[diagnostic(code(cowrun::input::missing_workspace))]
    MissingWorkspaceArgument { subcommand: String },

    /// Workspace directory given via -D or a subcommand does not exist
    #[error("workspace directory does not exist: {}", path.display())]
    #[diagnostic(code(cowrun::input::workspace_not_found))]
    WorkspaceNotFound { path: PathBuf },

    /// Union helper given via -U does not exist
    #[error("union helper does not exist: {}", path.display())]
    #[diagnostic(
        code(cowrun::input::union_helper_not_found),
        help("install mergerfs or unionfs-fuse, or point -U at the binary")
    )]
    UnionHelperNotFound { path: PathBuf },

    /// Lower directory given via -L does not exist
    #[error("lower directory does not exist: {}", path.display())]
    #[diagnostic(code(cowrun::input::lower_dir_not_found))]
    LowerDirNotFound { path: PathBuf },

    /// An ignore pattern is not a valid regular expression
    #[error("invalid ignore pattern '{pattern}'")]
    #[diagnostic(code(cowrun::input::ignore_pattern))]
    InvalidIgnorePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors related to the sandbox workspace.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// A previous run did not clean up, or another run is using the workspace
    #[error("workspace is not valid: found non-directory entry {}", stray.display())]
    #[diagnostic(
        code(cowrun::workspace::invalid),
        help("another invocation may be using this workspace, or a previous run was interrupted; remove the entry or use a fresh workspace")
    )]
    Invalid { stray: PathBuf },

    /// An expected workspace directory is missing
    #[error("workspace is missing its {name} directory: {}", path.display())]
    #[diagnostic(code(cowrun::workspace::missing_directory))]
    MissingDirectory { name: &'static str, path: PathBuf },

    /// A fresh workspace path is already taken
    #[error("workspace already exists: {}", path.display())]
    #[diagnostic(
        code(cowrun::workspace::exists),
        help("unset COWRUN_EXECID or choose a different execution identifier")
    )]
    AlreadyExists { path: PathBuf },

    /// A line of the persisted change list does not parse
    #[error("malformed change record: '{line}'")]
    #[diagnostic(code(cowrun::workspace::changes))]
    MalformedChangeRecord { line: String },

    /// I/O error while manipulating the workspace
    #[error("{context}")]
    #[diagnostic(code(cowrun::workspace::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to mount operations.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// OverlayFS mount failed
    #[error("OverlayFS mount failed: {0}")]
    #[diagnostic(code(cowrun::mount::overlay))]
    OverlayMount(String),

    /// procfs mount failed
    #[error("procfs mount failed: {0}")]
    #[diagnostic(code(cowrun::mount::proc))]
    ProcMount(String),

    /// Bind mount failed
    #[error("bind mount failed: {0}")]
    #[diagnostic(code(cowrun::mount::bind))]
    BindMount(String),

    /// Unmount failed
    #[error("unmount failed: {0}")]
    #[diagnostic(code(cowrun::mount::unmount))]
    Unmount(String),

    /// Union-filesystem helper failed
    #[error("union helper failed: {0}")]
    #[diagnostic(code(cowrun::mount::union_helper))]
    UnionHelper(String),

    /// Directory needed as an overlay layer could not be created
    #[error("failed to create layer directory {}", path.display())]
    #[diagnostic(code(cowrun::mount::layer_directory))]
    LayerDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to namespace creation and command supervision.
#[derive(Error, Debug, Diagnostic)]
pub enum ExecError {
    /// The host refused to create the namespaces
    #[error("failed to create namespaces: {0}")]
    #[diagnostic(
        code(cowrun::exec::namespaces),
        help("unprivileged user namespaces must be enabled (sysctl kernel.unprivileged_userns_clone=1)")
    )]
    NamespaceCreation(String),

    /// fork/wait failed
    #[error("process supervision failed: {0}")]
    #[diagnostic(code(cowrun::exec::process))]
    Process(String),

    /// The namespace holder failed while preparing the sandbox
    #[error("sandbox setup failed: {0}")]
    #[diagnostic(code(cowrun::exec::setup))]
    Setup(String),

    /// The namespace holder exited without a readable report
    #[error("sandbox holder report unreadable: {0}")]
    #[diagnostic(code(cowrun::exec::report))]
    Report(String),
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Kernel version too old for unprivileged overlay mounts
    #[error("Kernel version {found} is below minimum required {required}")]
    #[diagnostic(
        code(cowrun::system::kernel_version),
        help("unprivileged OverlayFS with the userxattr option needs kernel 5.11 or later")
    )]
    KernelTooOld { found: String, required: String },

    /// Unprivileged user namespaces not enabled
    #[error("Unprivileged user namespaces are not enabled")]
    #[diagnostic(
        code(cowrun::system::userns),
        help("Enable with: sysctl -w kernel.unprivileged_userns_clone=1")
    )]
    UserNamespacesDisabled,

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(cowrun::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_exit_with_two() {
        let err = Error::from(InputError::MissingCommand);
        assert_eq!(err.exit_code(), EXIT_INPUT);

        let err = Error::from(InputError::WorkspaceNotFound {
            path: PathBuf::from("/nonexistent"),
        });
        assert_eq!(err.exit_code(), EXIT_INPUT);
    }

    #[test]
    fn test_consistency_errors_exit_with_one() {
        let err = Error::from(WorkspaceError::Invalid {
            stray: PathBuf::from("/tmp/ws/temproot/etc/passwd"),
        });
        assert_eq!(err.exit_code(), EXIT_CONSISTENCY);

        let err = Error::from(ExecError::NamespaceCreation("EPERM".to_string()));
        assert_eq!(err.exit_code(), EXIT_CONSISTENCY);
    }

    #[test]
    fn test_invalid_workspace_message_names_stray_entry() {
        let err = WorkspaceError::Invalid {
            stray: PathBuf::from("/ws/temproot/dev/null"),
        };
        assert!(err.to_string().contains("/ws/temproot/dev/null"));
    }
}
