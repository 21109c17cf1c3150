//! Lifecycle of the filtering proxies for one sandboxed execution.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use super::filter::DomainFilter;
use super::http::HttpProxy;
use super::socks5::Socks5Proxy;

/// Configuration for the proxy manager.
#[derive(Debug, Default)]
pub struct ManagerConfig {
    /// Allowed hosts; empty means allow all.
    pub allowed_hosts: Vec<String>,
}

/// Coordinates the HTTP proxy, the best-effort SOCKS5 proxy, and (on
/// Linux) the Unix-socket proxy that gets bound into jails.
pub struct Manager {
    http_proxy: HttpProxy,
    socks5_proxy: Option<Socks5Proxy>,
    socket_proxy: Option<HttpProxy>,
    socket_dir: Option<TempDir>,
    stopped: bool,
}

impl Manager {
    /// Create and start all proxies. The HTTP proxy is mandatory; SOCKS5
    /// and the Unix socket are best-effort (a warning, not a failure).
    pub fn new(cfg: ManagerConfig) -> Result<Self> {
        let filter = Arc::new(DomainFilter::from_allowed_hosts(&cfg.allowed_hosts));

        let mut http_proxy =
            HttpProxy::new(Arc::clone(&filter)).context("failed to create HTTP proxy")?;
        http_proxy.start().context("failed to start HTTP proxy")?;

        let socks5_proxy = match Socks5Proxy::new(Arc::clone(&filter)) {
            Ok(mut proxy) => match proxy.start() {
                Ok(()) => Some(proxy),
                Err(e) => {
                    tracing::warn!("SOCKS5 proxy failed to start: {e:#} (non-HTTP traffic may fail)");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("SOCKS5 proxy failed to create: {e:#} (non-HTTP traffic may fail)");
                None
            }
        };

        let (socket_proxy, socket_dir) = if cfg!(target_os = "linux") {
            match start_socket_proxy(&filter) {
                Ok((proxy, dir)) => (Some(proxy), Some(dir)),
                Err(e) => {
                    tracing::warn!("could not start Unix socket proxy: {e:#}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok(Self {
            http_proxy,
            socks5_proxy,
            socket_proxy,
            socket_dir,
            stopped: false,
        })
    }

    /// Shut down all proxies and remove the socket file. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(ref mut proxy) = self.socket_proxy {
            proxy.stop();
        }
        self.socket_dir.take();
        if let Some(ref mut proxy) = self.socks5_proxy {
            proxy.stop();
        }
        self.http_proxy.stop();
    }

    pub fn port(&self) -> u16 {
        self.http_proxy.port()
    }

    pub fn socks5_port(&self) -> Option<u16> {
        self.socks5_proxy.as_ref().map(Socks5Proxy::port)
    }

    /// Path of the Unix socket proxy (Linux only).
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_proxy
            .as_ref()
            .map(|p| PathBuf::from(p.addr()))
    }

    /// Environment fragment pointing subprocesses at the proxies.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let http_addr = format!("http://{}", self.http_proxy.addr());

        let mut env = vec![
            ("HTTP_PROXY".to_string(), http_addr.clone()),
            ("HTTPS_PROXY".to_string(), http_addr.clone()),
            ("http_proxy".to_string(), http_addr.clone()),
            ("https_proxy".to_string(), http_addr),
        ];

        if let Some(ref socks5) = self.socks5_proxy {
            let socks_addr = format!("socks5://{}", socks5.addr());
            env.push(("ALL_PROXY".to_string(), socks_addr.clone()));
            env.push(("all_proxy".to_string(), socks_addr));
        }

        env
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_socket_proxy(filter: &Arc<DomainFilter>) -> Result<(HttpProxy, TempDir)> {
    let dir = tempfile::Builder::new()
        .prefix("buns-proxy-")
        .tempdir()
        .context("failed to create socket directory")?;

    let socket_path = dir.path().join("proxy.sock");
    let mut proxy = HttpProxy::new_unix(Arc::clone(filter), &socket_path)?;
    proxy.start()?;

    Ok((proxy, dir))
}
