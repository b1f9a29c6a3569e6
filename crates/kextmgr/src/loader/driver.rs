//! The link/load driver contract
//!
//! The driver that actually links symbols and injects modules into the
//! kernel is external. The manager hands it a dependency graph in load
//! order plus the request options, either calling it in-process or
//! spawning the child command it offers. A child terminates with the
//! numeric code of its result; the parent maps the exit status back, with
//! abnormal termination collapsing to the child-task error.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, error};

use kextmgr_core::{Error, Result, VersionNumber};

use crate::kext::KextHandle;

/// One module in the dependency graph, in load order
#[derive(Debug, Clone)]
pub struct GraphEntry {
    /// Handle of the kext this entry was built from
    pub handle: KextHandle,
    /// Bundle identifier (the expected kmod name)
    pub identifier: String,
    /// Bundle version
    pub version: VersionNumber,
    /// Absolute bundle path
    pub path: PathBuf,
    /// Whether the bundle declares an executable
    pub has_executable: bool,
    /// Explicit load address, when symbol generation runs without a load
    pub load_address: Option<u64>,
}

/// Dependency graph handed to the driver: dependencies first, the load
/// target last
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub entries: Vec<GraphEntry>,
}

impl DependencyGraph {
    /// The entry for the load target
    pub fn target(&self) -> Option<&GraphEntry> {
        self.entries.last()
    }
}

/// Options forwarded to the driver for one load
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub kernel_file: PathBuf,
    pub patch_dir: Option<PathBuf>,
    pub symbol_dir: Option<PathBuf>,
    pub do_load: bool,
    pub do_start: bool,
    pub do_prelink: bool,
    pub interactive_level: u8,
    pub ask_overwrite_symbols: bool,
    pub overwrite_symbols: bool,
}

/// The external link/load driver
pub trait LinkLoadDriver {
    /// Perform the link/load synchronously in this process
    fn load(&mut self, graph: &DependencyGraph, request: &DriverRequest) -> Result<()>;

    /// Command for performing the same load in a child process
    ///
    /// The command must exit with the numeric code of its result (zero for
    /// success). Drivers that cannot run detached return `None` and the
    /// load falls back to in-process.
    fn child_command(&self, graph: &DependencyGraph, request: &DriverRequest) -> Option<Command> {
        let _ = (graph, request);
        None
    }
}

/// Run a driver child command and translate its exit status
pub(crate) fn run_in_child(mut command: Command) -> Result<()> {
    debug!("forking child task to perform load");

    let status = match command.status() {
        Ok(status) => status,
        Err(err) => {
            error!(%err, "can't fork child process to load");
            return Err(Error::Unspecified);
        }
    };

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(Error::from_code(code)),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    error!(signal, "forked load task exited by signal");
                } else {
                    error!("unknown result from forked load task");
                }
            }
            #[cfg(not(unix))]
            error!("unknown result from forked load task");
            Err(Error::ChildTask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_child_success() {
        assert!(run_in_child(sh("exit 0")).is_ok());
    }

    #[test]
    fn test_child_exit_code_maps_to_error_kind() {
        assert_eq!(run_in_child(sh("exit 21")), Err(Error::authentication("")));
        assert_eq!(run_in_child(sh("exit 30")), Err(Error::LinkLoad));
    }

    #[test]
    fn test_child_unknown_code_is_unspecified() {
        assert_eq!(run_in_child(sh("exit 99")), Err(Error::Unspecified));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_killed_by_signal_is_child_task() {
        assert_eq!(run_in_child(sh("kill -9 $$")), Err(Error::ChildTask));
    }

    #[test]
    fn test_unrunnable_command_is_unspecified() {
        let command = Command::new("/nonexistent/kextload-helper");
        assert_eq!(run_in_child(command), Err(Error::Unspecified));
    }
}
