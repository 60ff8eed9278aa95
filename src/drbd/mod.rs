//! DRBD Manage Client
//!
//! Drives the `drbdmanage` CLI to define, assign, and tear down replicated
//! DRBD resources, and mounts the resulting block devices. The cluster's
//! state is only observable through the tool's machine-readable listings, so
//! everything here boils down to running a command, parsing its line-oriented
//! output, and polling until the cluster converges on the requested state.
//!
//! All operations in this module are blocking; async callers wrap them in
//! `spawn_blocking`.

pub mod command;
pub mod device;
pub mod mount;
pub mod parse;
pub mod poller;
pub mod resource;

pub use command::{CmdOutput, CommandRunner, SystemRunner};
pub use mount::FsUtil;
pub use poller::PollPolicy;
pub use resource::{DrbdConfig, DrbdManage, Resource, DM_TOOL};
