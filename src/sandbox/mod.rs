//! Copy-on-write sandbox built from Linux namespaces and OverlayFS.
//!
//! Every host mount point is overlaid with a writable upper layer inside the
//! workspace, the overlays are stacked at `temproot/` and the command runs
//! chrooted there. The host filesystem is never written while the command
//! runs; everything lands in the workspace's `upperdir/`.
//!
//! # Example
//!
//! ```no_run
//! use cowrun::sandbox::{ExecutionRequest, IsolationExecutor, LayerBuilder, LinuxHost};
//! use cowrun::sandbox::layers::discover_mountpoints;
//! use cowrun::workspace::Workspace;
//!
//! let host = LinuxHost;
//! let workspace = Workspace::acquire(None, std::path::Path::new("/tmp"), "example").unwrap();
//! let layers = LayerBuilder::new(&host, workspace.paths(), "/");
//! let executor = IsolationExecutor::new(&host, workspace.paths(), layers);
//!
//! let request = ExecutionRequest::new("/bin/sh", "/tmp").with_command(&["touch", "hello"]);
//! let result = executor.run(&discover_mountpoints("/".as_ref()).unwrap(), &request).unwrap();
//! println!("exit code: {}", result.exit_code);
//! ```

pub mod executor;
pub mod host;
pub mod layers;
pub mod mountinfo;
pub mod mounts;

pub use executor::{ExecutionRequest, ExecutionResult, IsolationExecutor};
pub use host::{HostOps, LinuxHost, NamespaceOptions};
pub use layers::{LayerBuilder, LayerReport, MountPoint};
