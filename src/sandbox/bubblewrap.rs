//! Full sandbox on Linux via bubblewrap (bwrap): fresh namespaces and a
//! tmpfs root with read-only binds for exactly what the script needs.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

use super::common::{
    apply_sandbox_env, bridge_proxy_env, build_bun_args, build_bun_command,
    build_socat_bridge_command, resolve_path, run_command,
};
use super::{command_exists, Config, ExecStatus, Sandbox};

/// Path the proxy socket is bound to inside the jail.
const JAIL_PROXY_SOCKET: &str = "/tmp/proxy.sock";

pub struct Bubblewrap;

impl Sandbox for Bubblewrap {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        cfg!(target_os = "linux") && command_exists("bwrap")
    }

    fn execute(&self, cfg: &Config) -> Result<ExecStatus> {
        let args = build_args(cfg).context("failed to build bwrap args")?;

        let mut cmd = Command::new("bwrap");
        cmd.args(&args);

        // bwrap has no rlimit primitives; memory stays a GC hint.
        apply_sandbox_env(&mut cmd, cfg, true);
        if cfg.network && cfg.proxy_socket_path.is_some() {
            cmd.envs(bridge_proxy_env());
        }

        run_command(&mut cmd, cfg)
    }
}

/// bwrap argument vector for the given config.
pub fn build_args(cfg: &Config) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    // Namespace isolation. The network namespace is only kept when the
    // script runs offline; proxied traffic needs the host namespace to
    // reach the Unix socket bind.
    push(&["--unshare-user", "--unshare-pid", "--unshare-uts", "--unshare-cgroup"]);
    if !cfg.network {
        push(&["--unshare-net"]);
    }
    push(&["--die-with-parent", "--new-session"]);

    // Minimal root filesystem.
    push(&["--tmpfs", "/"]);
    push(&["--dev", "/dev"]);
    push(&["--proc", "/proc"]);

    // System directories, bound read-only when they exist.
    let system_dirs = [
        "/usr",
        "/lib",
        "/lib64",
        "/bin",
        "/sbin",
        "/etc/alternatives",
        "/etc/ld.so.cache",
        "/etc/ld.so.conf",
        "/etc/ld.so.conf.d",
    ];
    for dir in system_dirs {
        if Path::new(dir).exists() {
            push(&["--ro-bind", dir, dir]);
        }
    }

    // Timezone data.
    for path in ["/usr/share/zoneinfo", "/etc/localtime"] {
        if Path::new(path).exists() {
            push(&["--ro-bind", path, path]);
        }
    }

    if cfg.network {
        // DNS resolution.
        for path in ["/etc/resolv.conf", "/etc/hosts", "/etc/services", "/etc/nsswitch.conf"] {
            if Path::new(path).exists() {
                push(&["--ro-bind", path, path]);
            }
        }
        // SSL certificates.
        for dir in ["/etc/ssl", "/etc/pki", "/etc/ca-certificates", "/usr/share/ca-certificates"] {
            if Path::new(dir).exists() {
                push(&["--ro-bind", dir, dir]);
            }
        }
    }

    let bun_path = resolve_path(&cfg.bun_binary).context("failed to resolve bun path")?;
    let bun_dir = bun_path.parent().unwrap_or(Path::new("/"));
    let bun_dir_str = bun_dir.to_string_lossy().into_owned();
    args.extend(["--ro-bind".to_string(), bun_dir_str.clone(), bun_dir_str]);

    let script_path = resolve_path(&cfg.script_path).context("failed to resolve script path")?;
    let script_dir = script_path.parent().unwrap_or(Path::new("/"));
    let script_dir_str = script_dir.to_string_lossy().into_owned();
    args.extend(["--ro-bind".to_string(), script_dir_str.clone(), script_dir_str]);

    // Working directory is set but not mounted; writing there requires an
    // explicit --allow-write.
    if !cfg.work_dir.as_os_str().is_empty() {
        let work_dir = resolve_path(&cfg.work_dir).context("failed to resolve work dir")?;
        args.extend(["--chdir".to_string(), work_dir.to_string_lossy().into_owned()]);
    }

    if let Some(ref node_modules) = cfg.node_modules {
        let resolved = resolve_path(node_modules).context("failed to resolve node_modules")?;
        let deps_dir = resolved.parent().unwrap_or(Path::new("/"));
        let deps_dir_str = deps_dir.to_string_lossy().into_owned();
        args.extend(["--ro-bind".to_string(), deps_dir_str.clone(), deps_dir_str]);
    }

    for path in &cfg.readable_paths {
        let Ok(resolved) = resolve_path(path) else {
            continue;
        };
        let s = resolved.to_string_lossy().into_owned();
        args.extend(["--ro-bind".to_string(), s.clone(), s]);
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
        let s = resolved.to_string_lossy().into_owned();
        args.extend(["--bind".to_string(), s.clone(), s]);
    }

    // Isolated scratch space, never the host /tmp.
    args.extend(["--tmpfs".to_string(), "/tmp".to_string()]);

    if cfg.network {
        if let Some(ref socket_path) = cfg.proxy_socket_path {
            let s = socket_path.to_string_lossy().into_owned();
            args.extend(["--ro-bind".to_string(), s, JAIL_PROXY_SOCKET.to_string()]);
        }
    }

    if cfg.network && cfg.proxy_socket_path.is_some() {
        let bun_cmd = build_bun_command(cfg);
        let script = build_socat_bridge_command(JAIL_PROXY_SOCKET, &bun_cmd);
        args.extend(["/bin/sh".to_string(), "-c".to_string(), script]);
    } else {
        args.extend(build_bun_args(cfg));
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
        let bun = tmp.path().join("bun");
        let script = tmp.path().join("tool.ts");
        std::fs::write(&bun, b"").unwrap();
        std::fs::write(&script, b"").unwrap();

        Config {
            bun_binary: bun,
            script_path: script,
            work_dir: tmp.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn windows_of<'a>(args: &'a [String], flag: &str) -> Vec<(&'a str, &'a str)> {
        args.windows(3)
            .filter(|w| w[0] == flag)
            .map(|w| (w[1].as_str(), w[2].as_str()))
            .collect()
    }

    #[test]
    fn offline_jail_unshares_all_namespaces() {
        let tmp = TempDir::new().unwrap();
        let args = build_args(&config(&tmp)).unwrap();

        for flag in ["--unshare-user", "--unshare-pid", "--unshare-uts", "--unshare-cgroup", "--unshare-net", "--die-with-parent"] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
        assert!(args.contains(&"--proc".to_string()));

        // tmpfs root and isolated /tmp.
        let tmpfs: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "--tmpfs")
            .map(|w| &w[1])
            .collect();
        assert!(tmpfs.contains(&&"/".to_string()));
        assert!(tmpfs.contains(&&"/tmp".to_string()));
    }

    #[test]
    fn binds_bun_and_script_directories_read_only() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let args = build_args(&cfg).unwrap();

        let dir = cfg.script_path.parent().unwrap().canonicalize().unwrap();
        let dir = dir.to_string_lossy();
        let ro_binds = windows_of(&args, "--ro-bind");
        assert!(ro_binds.iter().any(|(src, _)| *src == dir));
    }

    #[test]
    fn networked_jail_keeps_host_netns_and_bridges_the_socket() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("proxy.sock");
        std::fs::write(&socket, b"").unwrap();

        let cfg = Config {
            network: true,
            proxy_socket_path: Some(socket.clone()),
            ..config(&tmp)
        };
        let args = build_args(&cfg).unwrap();

        assert!(!args.contains(&"--unshare-net".to_string()));

        let ro_binds = windows_of(&args, "--ro-bind");
        assert!(ro_binds
            .iter()
            .any(|(_, dst)| *dst == "/tmp/proxy.sock"));

        let script = args.last().unwrap();
        assert!(script.contains("socat"));
        assert!(script.contains("UNIX-CONNECT:'/tmp/proxy.sock'"));
        assert_eq!(args[args.len() - 3], "/bin/sh");
    }

    #[test]
    fn writable_paths_are_created_and_bound_read_write() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");

        let cfg = Config { writable_paths: vec![out.clone()], ..config(&tmp) };
        let args = build_args(&cfg).unwrap();

        assert!(out.is_dir(), "nonexistent writable path is created");
        let binds = windows_of(&args, "--bind");
        let out_str = out.to_string_lossy();
        assert!(binds.iter().any(|(src, _)| *src == out_str));
    }

    #[test]
    fn command_ends_with_bun_invocation_when_offline() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        let args = build_args(&cfg).unwrap();

        let tail = &args[args.len() - 3..];
        assert!(tail[0].ends_with("/bun"));
        assert_eq!(tail[1], "run");
        assert!(tail[2].ends_with("/tool.ts"));
    }

    #[test]
    fn backend_identity() {
        assert_eq!(Bubblewrap.name(), "bubblewrap");
        assert!(Bubblewrap.is_sandboxed());
        if !cfg!(target_os = "linux") {
            assert!(!Bubblewrap.available());
        }
    }
}
