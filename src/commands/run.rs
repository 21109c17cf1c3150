//! The `run` command: sandbox selection and runner invocation.

use anyhow::{bail, Result};

use crate::cache::Cache;
use crate::cli::{split_and_trim, RunFlags};
use crate::runner::{RunOptions, Runner};
use crate::sandbox::{self, NoSandbox, Sandbox};

/// Execute a script with its dependencies; returns the exit code.
pub fn run_script(script: &str, args: &[String], flags: &RunFlags, quiet: bool) -> Result<i32> {
    let cache = Cache::default_location()?;
    cache.ensure_dirs()?;

    let extra_packages = flags
        .packages
        .as_deref()
        .map(split_and_trim)
        .unwrap_or_default();
    let allow_hosts = flags
        .allow_host
        .as_deref()
        .map(split_and_trim)
        .unwrap_or_default();
    let allow_read = flags
        .allow_read
        .as_deref()
        .map(split_and_trim)
        .unwrap_or_default();
    let allow_write = flags
        .allow_write
        .as_deref()
        .map(split_and_trim)
        .unwrap_or_default();
    let allow_env = flags
        .allow_env
        .as_deref()
        .map(split_and_trim)
        .unwrap_or_default();

    // A requested restriction is never silently degraded: if detection
    // comes back with the no-op backend, refuse to run.
    let sb: Box<dyn Sandbox> = if flags.sandbox {
        let sb = sandbox::detect(true);
        if !sb.is_sandboxed() {
            bail!("--sandbox requested but no sandbox is available on this system");
        }
        sb
    } else if flags.offline || !allow_hosts.is_empty() {
        let sb = sandbox::detect(false);
        if !sb.is_sandboxed() {
            bail!(
                "--offline/--allow-host requires network sandboxing, but no sandbox is available on this system"
            );
        }
        sb
    } else {
        Box::new(NoSandbox)
    };

    let runner = Runner::new(cache, quiet);
    runner.run(RunOptions {
        script: script.to_string(),
        args: args.to_vec(),
        bun_constraint: flags.bun.clone().unwrap_or_default(),
        extra_packages,

        sandbox: sb,
        network: !flags.offline,
        allow_hosts,
        allow_read,
        allow_write,
        allow_env,
        memory_mb: flags.memory,
        timeout_secs: flags.timeout,
        cpu_seconds: flags.cpu,
    })
}
