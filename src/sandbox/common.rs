//! Shared helpers for sandbox backends: environment filtering, command
//! construction, path resolution, and deadline-bounded child execution.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{Config, ExecStatus};

/// Environment variables always passed through to the child.
pub const SAFE_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TZ", "TMPDIR", "TEMP", "TMP", "LOGNAME",
    "EDITOR", "VISUAL", "PAGER",
];

/// Prefixes of environment variables always passed through.
pub const SAFE_ENV_PREFIXES: &[&str] = &["LC_", "XDG_"];

/// Fixed loopback port the in-jail socat bridge listens on.
pub const SANDBOX_BRIDGE_PORT: u16 = 18923;

/// Filter the process environment down to the safelist plus `allowed`.
pub fn filter_env(allowed: &[String]) -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(name, _)| {
            allowed.iter().any(|a| a == name)
                || SAFE_ENV_VARS.contains(&name.as_str())
                || SAFE_ENV_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .collect()
}

/// Escape a string for safe interpolation into `sh -c`. Wraps in single
/// quotes, escaping embedded single quotes.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Argument vector for the bun invocation: `bun run <script> [args...]`.
pub fn build_bun_args(cfg: &Config) -> Vec<String> {
    let mut args = vec![
        cfg.bun_binary.to_string_lossy().into_owned(),
        "run".to_string(),
        cfg.script_path.to_string_lossy().into_owned(),
    ];
    args.extend(cfg.script_args.iter().cloned());
    args
}

/// Shell-escaped bun command line for embedding in bridge scripts.
pub fn build_bun_command(cfg: &Config) -> String {
    build_bun_args(cfg)
        .iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Proxy environment for processes behind the socat bridge.
pub fn bridge_proxy_env() -> Vec<(String, String)> {
    let addr = format!("http://127.0.0.1:{SANDBOX_BRIDGE_PORT}");
    vec![
        ("HTTP_PROXY".to_string(), addr.clone()),
        ("HTTPS_PROXY".to_string(), addr.clone()),
        ("http_proxy".to_string(), addr.clone()),
        ("https_proxy".to_string(), addr.clone()),
        ("ALL_PROXY".to_string(), addr),
    ]
}

/// Shell script that bridges a fixed loopback port to the proxy's Unix
/// socket, waits for the port to become connectable, then runs `bun_cmd`.
///
/// The readiness probe is a retry loop on `nc -z`, not a fixed sleep;
/// a sleep races the socat startup on slow hosts.
pub fn build_socat_bridge_command(socket_path: &str, bun_cmd: &str) -> String {
    format!(
        "socat TCP-LISTEN:{port},fork,reuseaddr UNIX-CONNECT:{socket} &\n\
         SOCAT_PID=$!\n\
         for i in 1 2 3 4 5 6 7 8 9 10; do\n\
         \x20 if nc -z 127.0.0.1 {port} 2>/dev/null; then break; fi\n\
         \x20 sleep 0.05\n\
         done\n\
         {bun_cmd}\n\
         EXIT_CODE=$?\n\
         kill $SOCAT_PID 2>/dev/null\n\
         exit $EXIT_CODE",
        port = SANDBOX_BRIDGE_PORT,
        socket = shell_escape(socket_path),
        bun_cmd = bun_cmd,
    )
}

/// Resolve a path to its real form: absolute, with symlinks followed.
/// Nonexistent paths come back absolute but unresolved, so callers can
/// create them.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to read current directory")?
            .join(path)
    };

    match absolute.canonicalize() {
        Ok(real) => Ok(real),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(absolute),
        Err(e) => Err(e).with_context(|| format!("failed to resolve {}", absolute.display())),
    }
}

/// Escape a string for the Seatbelt profile grammar (backslash, quote).
pub fn seatbelt_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Apply the filtered environment, proxy fragment, NODE_PATH, and
/// (optionally) the soft memory hint to a command.
pub fn apply_sandbox_env(cmd: &mut Command, cfg: &Config, memory_hint: bool) {
    cmd.env_clear();
    cmd.envs(filter_env(&cfg.allowed_env_vars));
    cmd.envs(cfg.extra_env.iter().cloned());

    if let Some(ref node_modules) = cfg.node_modules {
        cmd.env("NODE_PATH", node_modules);
    }

    if memory_hint && cfg.memory_mb > 0 {
        cmd.env("BUN_JSC_forceRAMSize", (cfg.memory_mb * 1024 * 1024).to_string());
    }
}

/// Spawn `cmd` and wait for it, honoring the wall-clock timeout from the
/// config. On expiry the child is killed and the call fails.
pub fn run_command(cmd: &mut Command, cfg: &Config) -> Result<ExecStatus> {
    let deadline = if cfg.timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + cfg.timeout)
    };

    cmd.stdin(Stdio::inherit());
    if cfg.capture_output {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    }

    let mut child = cmd.spawn().context("failed to spawn sandboxed process")?;
    wait_with_deadline(&mut child, deadline, cfg.timeout)
}

/// Poll the child until exit or deadline. Captured stdout/stderr are
/// drained by background threads while the child runs; without that, any
/// output past the pipe buffer would block the child and deadlock us.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
    timeout: Duration,
) -> Result<ExecStatus> {
    let stdout_handle = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut s = String::new();
            let _ = out.read_to_string(&mut s);
            s
        })
    });
    let stderr_handle = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut s = String::new();
            let _ = err.read_to_string(&mut s);
            s
        })
    });

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle
                    .map(|h| h.join().unwrap_or_default())
                    .unwrap_or_default();
                let stderr = stderr_handle
                    .map(|h| h.join().unwrap_or_default())
                    .unwrap_or_default();

                return Ok(ExecStatus {
                    exit_code: exit_code_of(&status),
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {}
            Err(e) => {
                kill_child(child);
                return Err(e).context("failed to wait for sandboxed process");
            }
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                kill_child(child);
                if let Some(h) = stdout_handle {
                    let _ = h.join();
                }
                if let Some(h) = stderr_handle {
                    let _ = h.join();
                }
                bail!("execution timed out after {}s", timeout.as_secs());
            }
        }

        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(unix)]
fn kill_child(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    thread::sleep(Duration::from_millis(100));
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
