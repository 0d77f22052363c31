//! System requirements validation.
//!
//! Checks that the host can create the sandbox before anything is mounted.

mod requirements;

pub use requirements::{
    MIN_KERNEL_VERSION, SystemRequirements, check_all, check_kernel_version,
    check_user_namespaces,
};
