//! End-to-end script execution: metadata, version resolution, binary and
//! dependency materialization, sandbox selection, proxy lifecycle.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::cache::{self, Cache};
use crate::deps;
use crate::download::Downloader;
use crate::index::Index;
use crate::metadata;
use crate::proxy;
use crate::resolver::Resolver;
use crate::sandbox::{self, common::resolve_path, Sandbox};

/// Options for one script run.
pub struct RunOptions {
    pub script: String,
    pub args: Vec<String>,

    /// Bun version constraint from the CLI, overriding the script's.
    pub bun_constraint: String,
    /// Additional packages from the CLI, appended after the script's.
    pub extra_packages: Vec<String>,

    /// Backend selected by the CLI (NoSandbox when no isolation applies).
    pub sandbox: Box<dyn Sandbox>,
    /// Whether the script may reach the network.
    pub network: bool,
    pub allow_hosts: Vec<String>,
    pub allow_read: Vec<String>,
    pub allow_write: Vec<String>,
    pub allow_env: Vec<String>,
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub cpu_seconds: u64,
}

/// Executes scripts with their dependencies.
pub struct Runner {
    cache: Cache,
    resolver: Resolver<Index>,
    quiet: bool,
}

impl Runner {
    pub fn new(cache: Cache, quiet: bool) -> Self {
        let index = Index::new(cache.index_dir());
        Self {
            cache,
            resolver: Resolver::new(index),
            quiet,
        }
    }

    /// Run a script; returns its exit code.
    pub fn run(&self, opts: RunOptions) -> Result<i32> {
        // The guard keeps a stdin-sourced temp script on disk for the whole
        // run and removes it on every exit path.
        let (script_path, content, _stdin_guard) = source_script(&opts.script)?;

        tracing::debug!("parsing script metadata");
        let meta = metadata::parse(&content)?;

        let mut packages = meta.packages;
        packages.extend(opts.extra_packages.iter().cloned());

        let constraint = if opts.bun_constraint.is_empty() {
            meta.bun.clone()
        } else {
            opts.bun_constraint.clone()
        };

        tracing::debug!("resolving Bun version for constraint '{constraint}'");
        let version = self.resolver.resolve(&constraint)?;
        tracing::debug!("matched Bun {version}");

        let downloader = Downloader::new(self.cache.bun_dir(), self.quiet);
        let bun_path = downloader.get_binary(&version)?;
        tracing::debug!("bun binary: {}", bun_path.display());

        let mut deps_dir: Option<PathBuf> = None;
        if !packages.is_empty() {
            let hash = cache::hash_packages(&packages);
            let dir = self.cache.deps_dir_for_hash(&hash);
            tracing::debug!("dependencies hash: {}...", &hash[..12]);

            if self.cache.is_deps_hit(&hash) {
                tracing::debug!("cache hit: {}", dir.display());
            } else {
                tracing::debug!("cache miss: {}", dir.display());
                deps::install(&bun_path, &dir, &packages, self.quiet)
                    .context("failed to install dependencies")?;
                tracing::debug!("dependencies installed");
            }
            deps_dir = Some(dir);
        }

        if opts.sandbox.is_sandboxed() {
            self.exec_sandboxed(&bun_path, &script_path, &opts, deps_dir.as_deref())
        } else {
            tracing::debug!("executing: {} run {}", bun_path.display(), script_path.display());
            exec_script(&bun_path, &script_path, &opts.args, deps_dir.as_deref())
        }
    }

    fn exec_sandboxed(
        &self,
        bun_path: &Path,
        script_path: &Path,
        opts: &RunOptions,
        deps_dir: Option<&Path>,
    ) -> Result<i32> {
        let sb = &opts.sandbox;

        // Proxies run only for sandboxed executions that keep network
        // access; the Drop impl tears them down on every exit path.
        let proxy_mgr = if opts.network {
            tracing::debug!("starting proxy server");
            let mgr = proxy::Manager::new(proxy::ManagerConfig {
                allowed_hosts: opts.allow_hosts.clone(),
            })
            .context("failed to start proxy")?;
            tracing::debug!("proxy started on port {}", mgr.port());
            Some(mgr)
        } else {
            None
        };

        let work_dir = std::env::current_dir()
            .unwrap_or_else(|_| script_path.parent().unwrap_or(Path::new("/")).to_path_buf());

        let cfg = sandbox::Config {
            network: opts.network,
            proxy_socket_path: proxy_mgr.as_ref().and_then(|m| m.socket_path()),
            proxy_port: proxy_mgr.as_ref().map(|m| m.port()).unwrap_or(0),
            socks5_port: proxy_mgr.as_ref().and_then(|m| m.socks5_port()).unwrap_or(0),

            readable_paths: opts.allow_read.iter().map(PathBuf::from).collect(),
            writable_paths: opts.allow_write.iter().map(PathBuf::from).collect(),
            work_dir,

            memory_mb: opts.memory_mb,
            timeout: Duration::from_secs(opts.timeout_secs),
            cpu_seconds: opts.cpu_seconds,

            bun_binary: bun_path.to_path_buf(),
            script_path: script_path.to_path_buf(),
            script_args: opts.args.clone(),
            node_modules: deps_dir.map(|d| d.join("node_modules")),

            extra_env: proxy_mgr.as_ref().map(|m| m.env_vars()).unwrap_or_default(),
            allowed_env_vars: opts.allow_env.clone(),

            capture_output: false,
        };

        tracing::debug!("using sandbox: {}", sb.name());
        tracing::debug!(
            "executing sandboxed: {} run {}",
            bun_path.display(),
            script_path.display()
        );

        let status = sb.execute(&cfg).context("execution failed")?;
        tracing::debug!("exit code: {}", status.exit_code);
        Ok(status.exit_code)
    }
}

/// Read the script bytes, materializing stdin (`-`) into a `.ts` temp
/// file whose guard deletes it when dropped.
fn source_script(
    script: &str,
) -> Result<(PathBuf, Vec<u8>, Option<tempfile::NamedTempFile>)> {
    if script == "-" {
        let mut content = Vec::new();
        std::io::stdin()
            .read_to_end(&mut content)
            .context("failed to read stdin")?;

        let mut tmp = tempfile::Builder::new()
            .prefix("buns-")
            .suffix(".ts")
            .tempfile()
            .context("failed to create temp file")?;
        tmp.write_all(&content).context("failed to write temp file")?;

        let path = tmp.path().to_path_buf();
        return Ok((path, content, Some(tmp)));
    }

    let path = resolve_path(Path::new(script))?;
    let content = std::fs::read(&path).map_err(|_| anyhow!("script not found: {script}"))?;
    Ok((path, content, None))
}

/// Direct (unsandboxed) execution with inherited stdio, in the caller's
/// working directory.
fn exec_script(
    bun_path: &Path,
    script_path: &Path,
    args: &[String],
    deps_dir: Option<&Path>,
) -> Result<i32> {
    let mut cmd = Command::new(bun_path);
    cmd.arg("run").arg(script_path).args(args);
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(deps_dir) = deps_dir {
        cmd.env("NODE_PATH", deps_dir.join("node_modules"));
    }

    let status = cmd
        .status()
        .with_context(|| format!("failed to execute {}", bun_path.display()))?;

    Ok(status.code().unwrap_or(1))
}
