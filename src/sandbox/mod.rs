//! Script execution isolation backends.
//!
//! Each backend wraps the `bun run` invocation in an OS-level restriction
//! mechanism; `detect` picks the strongest one available on the host.

pub mod bubblewrap;
pub mod common;
pub mod linux_network;
pub mod macos;
pub mod macos_network;
pub mod none;
pub mod nsjail;

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

pub use bubblewrap::Bubblewrap;
pub use linux_network::LinuxNetwork;
pub use macos::MacOs;
pub use macos_network::MacOsNetwork;
pub use none::NoSandbox;
pub use nsjail::Nsjail;

/// Aggregate input to a sandbox backend. Paths are canonicalized by the
/// runner before they land here.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Whether outbound network access is permitted (via the proxy).
    pub network: bool,
    /// Unix socket of the filtering proxy, bound into jails (Linux).
    pub proxy_socket_path: Option<PathBuf>,
    /// HTTP proxy port on localhost; 0 when no proxy is running.
    pub proxy_port: u16,
    /// SOCKS5 proxy port on localhost; 0 when unavailable.
    pub socks5_port: u16,

    /// Additional readable paths (--allow-read).
    pub readable_paths: Vec<PathBuf>,
    /// Additional writable paths (--allow-write).
    pub writable_paths: Vec<PathBuf>,
    /// Working directory for the script.
    pub work_dir: PathBuf,

    /// Memory cap in MB; a GC hint on backends without rlimits.
    pub memory_mb: u64,
    /// Wall-clock timeout; zero means unlimited.
    pub timeout: Duration,
    /// CPU seconds cap; enforced by nsjail only.
    pub cpu_seconds: u64,

    /// Bun binary path.
    pub bun_binary: PathBuf,
    /// Script path.
    pub script_path: PathBuf,
    /// Arguments forwarded to the script.
    pub script_args: Vec<String>,
    /// node_modules directory when dependencies are installed.
    pub node_modules: Option<PathBuf>,

    /// Proxy environment fragment for the child.
    pub extra_env: Vec<(String, String)>,
    /// Environment variable names passed through in addition to the safelist.
    pub allowed_env_vars: Vec<String>,

    /// Capture stdout/stderr instead of streaming to the parent.
    pub capture_output: bool,
}

/// Execution outcome. stdout/stderr are captured only when streaming was
/// suppressed.
#[derive(Debug, Default)]
pub struct ExecStatus {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Interface for script execution isolation.
pub trait Sandbox {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// True if this backend provides actual isolation.
    fn is_sandboxed(&self) -> bool;

    /// True if this backend can run on the current host.
    fn available(&self) -> bool;

    /// Run the script within the sandbox.
    fn execute(&self, cfg: &Config) -> Result<ExecStatus>;
}

/// Best available sandbox for the platform. `full` requests filesystem
/// and process isolation; otherwise network-only isolation is chosen.
pub fn detect(full: bool) -> Box<dyn Sandbox> {
    if full {
        detect_full()
    } else {
        detect_network()
    }
}

fn detect_full() -> Box<dyn Sandbox> {
    if cfg!(target_os = "macos") {
        if MacOs.available() {
            return Box::new(MacOs);
        }
    } else if cfg!(target_os = "linux") {
        if Bubblewrap.available() {
            return Box::new(Bubblewrap);
        }
        if Nsjail.available() {
            return Box::new(Nsjail);
        }
    }
    Box::new(NoSandbox)
}

fn detect_network() -> Box<dyn Sandbox> {
    if cfg!(target_os = "macos") {
        if MacOsNetwork.available() {
            return Box::new(MacOsNetwork);
        }
    } else if cfg!(target_os = "linux") {
        if LinuxNetwork.available() {
            return Box::new(LinuxNetwork);
        }
    }
    Box::new(NoSandbox)
}

/// Whether a command is resolvable in PATH.
pub fn command_exists(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };

    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            candidate.is_file()
        }
    })
}
