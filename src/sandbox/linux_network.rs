//! Network-only isolation on Linux via `unshare`.
//!
//! Offline mode runs bun inside an unconnected network namespace. Proxied
//! mode keeps the namespace but bridges a fixed loopback port to the
//! proxy's Unix socket with socat, so only filtered traffic leaves.

use anyhow::Result;
use std::process::Command;

use super::common::{
    apply_sandbox_env, bridge_proxy_env, build_bun_args, build_bun_command,
    build_socat_bridge_command, run_command,
};
use super::{command_exists, Config, ExecStatus, Sandbox};

pub struct LinuxNetwork;

impl Sandbox for LinuxNetwork {
    fn name(&self) -> &'static str {
        "linux-network"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        cfg!(target_os = "linux") && command_exists("unshare")
    }

    fn execute(&self, cfg: &Config) -> Result<ExecStatus> {
        let mut cmd = if !cfg.network {
            build_offline_command(cfg)
        } else if cfg.proxy_socket_path.is_some() {
            build_proxy_command(cfg)
        } else {
            // Nothing to isolate; run bun directly.
            let args = build_bun_args(cfg);
            let mut cmd = Command::new(&args[0]);
            cmd.args(&args[1..]);
            cmd
        };

        apply_sandbox_env(&mut cmd, cfg, true);
        if cfg.network && cfg.proxy_socket_path.is_some() {
            // Inside the namespace the proxy is reachable on the bridge port.
            cmd.envs(bridge_proxy_env());
        }

        if !cfg.work_dir.as_os_str().is_empty() {
            cmd.current_dir(&cfg.work_dir);
        }

        run_command(&mut cmd, cfg)
    }
}

/// `unshare --net` gives the child an unconnected network namespace.
fn build_offline_command(cfg: &Config) -> Command {
    let mut cmd = Command::new("unshare");
    cmd.args(["--net", "--map-root-user", "--"]);
    cmd.args(build_bun_args(cfg));
    cmd
}

/// Same namespace, with the socat bridge wrapping the bun invocation.
fn build_proxy_command(cfg: &Config) -> Command {
    let socket_path = cfg
        .proxy_socket_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let bun_cmd = build_bun_command(cfg);
    let script = build_socat_bridge_command(&socket_path, &bun_cmd);

    let mut cmd = Command::new("unshare");
    cmd.args(["--net", "--map-root-user", "sh", "-c", &script]);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            bun_binary: PathBuf::from("/cache/bun/1.1.34/bun"),
            script_path: PathBuf::from("/scripts/tool.ts"),
            script_args: vec!["--x".into()],
            ..Config::default()
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn offline_command_unshares_the_network() {
        let cmd = build_offline_command(&config());
        assert_eq!(cmd.get_program(), "unshare");

        let args = args_of(&cmd);
        assert_eq!(
            args,
            vec![
                "--net",
                "--map-root-user",
                "--",
                "/cache/bun/1.1.34/bun",
                "run",
                "/scripts/tool.ts",
                "--x"
            ]
        );
    }

    #[test]
    fn proxy_command_wraps_bun_in_the_bridge_script() {
        let cfg = Config {
            network: true,
            proxy_socket_path: Some(PathBuf::from("/tmp/buns/proxy.sock")),
            ..config()
        };

        let cmd = build_proxy_command(&cfg);
        let args = args_of(&cmd);
        assert_eq!(&args[..4], &["--net", "--map-root-user", "sh", "-c"]);

        let script = &args[4];
        assert!(script.contains("socat TCP-LISTEN:"));
        assert!(script.contains("UNIX-CONNECT:'/tmp/buns/proxy.sock'"));
        assert!(script.contains("'/cache/bun/1.1.34/bun' 'run' '/scripts/tool.ts' '--x'"));
        assert!(script.contains("nc -z"), "readiness probe, not a fixed sleep");
    }

    #[test]
    fn backend_identity() {
        assert_eq!(LinuxNetwork.name(), "linux-network");
        assert!(LinuxNetwork.is_sandboxed());
        if !cfg!(target_os = "linux") {
            assert!(!LinuxNetwork.available());
        }
    }
}
