//! Full sandbox on Linux via nsjail, the only backend with hard resource
//! limits (rlimits on address space, CPU, file size, fds, processes).

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

use super::common::{apply_sandbox_env, build_bun_args, filter_env, resolve_path, run_command};
use super::{command_exists, Config, ExecStatus, Sandbox};

pub struct Nsjail;

impl Sandbox for Nsjail {
    fn name(&self) -> &'static str {
        "nsjail"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        cfg!(target_os = "linux") && command_exists("nsjail")
    }

    fn execute(&self, cfg: &Config) -> Result<ExecStatus> {
        let args = build_args(cfg).context("failed to build nsjail args")?;

        let mut cmd = Command::new("nsjail");
        cmd.args(&args);

        // Environment crosses the jail boundary via -E flags; the memory
        // cap is a hard rlimit here, so no GC hint.
        apply_sandbox_env(&mut cmd, cfg, false);

        run_command(&mut cmd, cfg)
    }
}

/// nsjail argument vector for the given config.
pub fn build_args(cfg: &Config) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    // Run once, as nobody, quietly.
    push(&["--mode", "o"]);
    push(&["--user", "65534", "--group", "65534"]);
    push(&["--quiet"]);

    // Resource limits.
    if !cfg.timeout.is_zero() {
        push(&["--time_limit", &cfg.timeout.as_secs().to_string()]);
    }
    if cfg.memory_mb > 0 {
        push(&["--rlimit_as", &cfg.memory_mb.to_string()]);
    }
    if cfg.cpu_seconds > 0 {
        push(&["--rlimit_cpu", &cfg.cpu_seconds.to_string()]);
    }
    push(&["--rlimit_fsize", "50"]);
    push(&["--rlimit_nofile", "128"]);
    push(&["--rlimit_nproc", "10"]);

    // Network isolation. Proxied traffic needs the host namespace to
    // reach the proxy socket.
    if !cfg.network {
        push(&["--clone_newnet"]);
    } else if cfg.proxy_socket_path.is_some() {
        push(&["--disable_clone_newnet"]);
    }

    for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin"] {
        if Path::new(dir).exists() {
            push(&["-R", dir]);
        }
    }

    push(&["-R", "/dev/null", "-R", "/dev/urandom", "-R", "/dev/random"]);
    push(&["--mount_proc"]);

    for path in ["/usr/share/zoneinfo", "/etc/localtime"] {
        if Path::new(path).exists() {
            push(&["-R", path]);
        }
    }

    if cfg.network {
        for path in ["/etc/resolv.conf", "/etc/hosts", "/etc/services", "/etc/nsswitch.conf"] {
            if Path::new(path).exists() {
                push(&["-R", path]);
            }
        }
        for dir in ["/etc/ssl", "/etc/pki", "/etc/ca-certificates", "/usr/share/ca-certificates"] {
            if Path::new(dir).exists() {
                push(&["-R", dir]);
            }
        }
    }

    let bun_path = resolve_path(&cfg.bun_binary).context("failed to resolve bun path")?;
    let bun_dir = bun_path.parent().unwrap_or(Path::new("/"));
    args.extend(["-R".to_string(), bun_dir.to_string_lossy().into_owned()]);

    let script_path = resolve_path(&cfg.script_path).context("failed to resolve script path")?;
    let script_dir = script_path.parent().unwrap_or(Path::new("/"));
    args.extend(["-R".to_string(), script_dir.to_string_lossy().into_owned()]);

    if !cfg.work_dir.as_os_str().is_empty() {
        let work_dir = resolve_path(&cfg.work_dir).context("failed to resolve work dir")?;
        args.extend(["--cwd".to_string(), work_dir.to_string_lossy().into_owned()]);
    }

    if let Some(ref node_modules) = cfg.node_modules {
        let resolved = resolve_path(node_modules).context("failed to resolve node_modules")?;
        let deps_dir = resolved.parent().unwrap_or(Path::new("/"));
        args.extend(["-R".to_string(), deps_dir.to_string_lossy().into_owned()]);
    }

    for path in &cfg.readable_paths {
        let Ok(resolved) = resolve_path(path) else {
            continue;
        };
        args.extend(["-R".to_string(), resolved.to_string_lossy().into_owned()]);
    }

    for path in &cfg.writable_paths {
        let resolved = match resolve_path(path) {
            Ok(p) if p.exists() => p,
            Ok(p) => {
                if std::fs::create_dir_all(&p).is_err() {
                    continue;
                }
                p
            }
            Err(_) => continue,
        };
        args.extend(["-B".to_string(), resolved.to_string_lossy().into_owned()]);
    }

    args.extend(["--tmpfsmount".to_string(), "/tmp".to_string()]);

    // Environment crosses the jail boundary explicitly.
    let mut env = filter_env(&cfg.allowed_env_vars);
    env.extend(cfg.extra_env.iter().cloned());
    if let Some(ref node_modules) = cfg.node_modules {
        env.push(("NODE_PATH".to_string(), node_modules.to_string_lossy().into_owned()));
    }
    for (name, value) in env {
        args.extend(["-E".to_string(), format!("{name}={value}")]);
    }

    args.push("--".to_string());
    args.extend(build_bun_args(cfg));

    Ok(args)
}
