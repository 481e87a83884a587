//! Supervisor for sandboxed script runtimes.
//!
//! The [`BinaryStore`] installs a checksum-verified runtime executable, the
//! [`Launcher`] keeps it running with a least-privilege command line, and the
//! [`ControlServer`] hands every launched [`Instance`] a single-use token it
//! must present when connecting back over a WebSocket. Calls flow over that
//! socket through [`Instance::call_method`]; [`Instance::stop`] asks the child
//! to wind down before its whole process tree is killed.

pub mod binary_store;
pub mod config;
pub mod error;
pub mod instance;
pub mod launcher;
pub mod notify;
pub mod process_tree;
pub mod server;
pub mod service;
mod task;

pub use binary_store::{BinaryStore, ManifestResolver, ReleaseRef, ReqwestFetcher};
pub use config::{ControlServerConfig, InstanceTimings, KillOptions, RestartPolicy};
pub use error::{CallError, InstallError, LaunchError, ServeError, StartError};
pub use instance::{Instance, InstanceSnapshot, Lifecycle, StopOutcome};
pub use launcher::{LaunchSpec, Launcher};
pub use notify::{LaunchEvent, LaunchNotifier};
pub use server::ControlServer;
pub use service::ServiceConfig;
