//! No-op sandbox: direct execution with no isolation.

use anyhow::Result;
use std::process::Command;

use super::common::{build_bun_args, run_command};
use super::{Config, ExecStatus, Sandbox};

/// Fallback used when no sandbox is available or requested.
pub struct NoSandbox;

impl Sandbox for NoSandbox {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_sandboxed(&self) -> bool {
        false
    }

    fn available(&self) -> bool {
        true
    }

    /// Runs the script with the full parent environment; only NODE_PATH
    /// and the memory hint are added.
    fn execute(&self, cfg: &Config) -> Result<ExecStatus> {
        let args = build_bun_args(cfg);
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);

        if let Some(ref node_modules) = cfg.node_modules {
            cmd.env("NODE_PATH", node_modules);
        }
        if cfg.memory_mb > 0 {
            cmd.env("BUN_JSC_forceRAMSize", (cfg.memory_mb * 1024 * 1024).to_string());
        }

        if !cfg.work_dir.as_os_str().is_empty() {
            cmd.current_dir(&cfg.work_dir);
        }

        run_command(&mut cmd, cfg)
    }
}
