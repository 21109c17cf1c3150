//! Network-only isolation via macOS Seatbelt: full filesystem access,
//! outbound network restricted to the proxy.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use std::process::Command;

use super::common::{apply_sandbox_env, build_bun_args, run_command};
use super::{command_exists, Config, ExecStatus, Sandbox};

pub struct MacOsNetwork;

impl Sandbox for MacOsNetwork {
    fn name(&self) -> &'static str {
        "macos-network"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        cfg!(target_os = "macos") && command_exists("sandbox-exec")
    }

    fn execute(&self, cfg: &Config) -> Result<ExecStatus> {
        let profile = generate_profile(cfg);

        let mut profile_file = tempfile::Builder::new()
            .prefix("buns-network-")
            .suffix(".sb")
            .tempfile()
            .context("failed to create sandbox profile")?;
        profile_file
            .write_all(profile.as_bytes())
            .context("failed to write sandbox profile")?;

        let mut cmd = Command::new("sandbox-exec");
        cmd.arg("-f").arg(profile_file.path());
        cmd.args(build_bun_args(cfg));

        apply_sandbox_env(&mut cmd, cfg, true);

        if !cfg.work_dir.as_os_str().is_empty() {
            cmd.current_dir(&cfg.work_dir);
        }

        run_command(&mut cmd, cfg)
    }
}

/// Allow-default profile that only restricts the network.
pub fn generate_profile(cfg: &Config) -> String {
    let mut p = String::new();

    p.push_str("(version 1)\n");
    p.push_str("(allow default)\n\n");

    p.push_str(";; Block all network except proxy\n");
    p.push_str("(deny network*)\n\n");

    if cfg.network && cfg.proxy_port > 0 {
        p.push_str(";; Allow proxy connections (localhost only)\n");
        let _ = writeln!(
            p,
            "(allow network-outbound (remote ip \"localhost:{}\"))",
            cfg.proxy_port
        );
        if cfg.socks5_port > 0 {
            let _ = writeln!(
                p,
                "(allow network-outbound (remote ip \"localhost:{}\"))",
                cfg.socks5_port
            );
        }
        p.push_str("(allow network-outbound (remote unix-socket))\n");
    }

    p
}
