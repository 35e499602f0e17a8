//! System interaction layer
//!
//! Everything that touches the host lives here:
//! - Distribution detection (os-release, image-based marker)
//! - The intent -> command plan dispatch table
//! - Deployment ref lookup for rpm-ostree rebases
//! - Plan execution (child processes, output streaming, cancellation)

pub mod detect;
pub mod executor;
pub mod ostree;
pub mod strategy;

pub use detect::DistroProbe;
pub use executor::{Executor, ExecutorOptions, StdinMode};
pub use ostree::{RefResolver, RpmOstreeStatus};
pub use strategy::{describe, CommandStrategy, DistroTable};
