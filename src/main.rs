//! cowrun - Entry Point
//!
//! Parses the command line, collects the environment into a `RunConfig` and
//! hands it to the pipeline.

use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, fmt};

use cowrun::config::{self, Mode, RunConfig};
use cowrun::error::{Error, InputError};
use cowrun::pipeline::{Pipeline, TerminalPrompt};
use cowrun::sandbox::LinuxHost;
use cowrun::{signal, system};

/// Run a command on a copy-on-write view of the filesystem, then review,
/// commit or discard what it changed.
#[derive(Parser, Debug)]
#[command(
    name = "cowrun",
    version,
    about,
    disable_version_flag = true,
    override_usage = "cowrun [flags] CMD [ARGS...]\n       cowrun [flags] summary|commit|explore DIR"
)]
struct Args {
    /// Do not commit; print the workspace path instead
    #[arg(short = 'n')]
    no_commit: bool,

    /// Commit without asking (overrides -n)
    #[arg(short = 'y')]
    yes: bool,

    /// Run the command in a new network namespace
    #[arg(short = 'x')]
    isolate_network: bool,

    /// Ignore paths matching PATTERN (repeatable)
    #[arg(short = 'i', value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Use an existing workspace instead of a temporary one
    #[arg(short = 'D', value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Union helper for mount points with nested mounts
    #[arg(short = 'U', value_name = "PATH", env = "COWRUN_UNION_HELPER")]
    union_helper: Option<PathBuf>,

    /// Extra lower directories, colon separated
    #[arg(short = 'L', value_name = "DIRS", value_delimiter = ':')]
    lower_dirs: Vec<PathBuf>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    /// Enable verbose logging
    #[arg(long, env = "COWRUN_VERBOSE")]
    verbose: bool,

    #[arg(long, hide = true, env = "COWRUN_SHELL")]
    shell: Option<PathBuf>,

    #[arg(long, hide = true, env = "COWRUN_EXECID")]
    exec_id: Option<String>,

    /// Command to run, or a subcommand and its workspace
    #[arg(value_name = "CMD", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Words that select a subcommand instead of a command to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subcommand {
    Summary,
    Commit,
    Explore,
}

impl Subcommand {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "summary" => Some(Self::Summary),
            "commit" => Some(Self::Commit),
            "explore" => Some(Self::Explore),
            _ => None,
        }
    }
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<i32, Error> {
    signal::install()?;

    let config = build_config(&args)?;
    let host = LinuxHost;
    let pipeline = Pipeline::new(&host, &config);
    let mut stdout = io::stdout();
    let mut prompt = TerminalPrompt;

    let Some(first) = args.command.first() else {
        return Err(InputError::MissingCommand.into());
    };

    if let Some(subcommand) = Subcommand::parse(first) {
        let dir = args.command.get(1).map(PathBuf::from).ok_or_else(|| {
            InputError::MissingWorkspaceArgument {
                subcommand: first.clone(),
            }
        })?;
        debug!(?subcommand, dir = %dir.display());
        return match subcommand {
            Subcommand::Summary => pipeline.summary(&dir, &mut stdout),
            Subcommand::Commit => pipeline.commit(&dir, &mut stdout),
            Subcommand::Explore => {
                system::check_all()?;
                pipeline.explore(&dir, &mut stdout, &mut prompt)
            }
        };
    }

    system::check_all()?;
    pipeline.run(Some(args.command.as_slice()), &mut stdout, &mut prompt)
}

fn build_config(args: &Args) -> Result<RunConfig, Error> {
    let mode = Mode::from_flags(
        args.no_commit,
        args.yes,
        args.workspace.is_some(),
        !args.lower_dirs.is_empty(),
    )
    .for_terminal(io::stdin().is_terminal());

    let exec_id = args
        .exec_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let union_helper = config::resolve_union_helper(
        args.union_helper.as_deref(),
        std::env::var_os("PATH").as_deref(),
    )?;
    let shell = config::resolve_shell(args.shell.as_deref(), config::login_shell().as_deref());

    let mut config = RunConfig::new(exec_id)
        .with_mode(mode)
        .with_ignore_patterns(args.ignore.clone())
        .with_network_isolation(args.isolate_network)
        .with_union_helper(union_helper)
        .with_lower_dirs(&args.lower_dirs)
        .with_shell(shell)
        .with_working_dir(std::env::current_dir()?)
        .with_env(std::env::vars_os());
    if let Some(dir) = &args.workspace {
        config = config.with_workspace(dir);
    }

    debug!(mode = ?config.mode, shell = %config.shell.display(), exec_id = %config.exec_id);
    Ok(config)
}
