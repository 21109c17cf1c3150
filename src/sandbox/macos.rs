//! Full filesystem and process isolation via macOS Seatbelt (sandbox-exec).

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::process::Command;

use super::common::{apply_sandbox_env, build_bun_args, resolve_path, run_command, seatbelt_escape};
use super::{command_exists, Config, ExecStatus, Sandbox};

pub struct MacOs;

impl Sandbox for MacOs {
    fn name(&self) -> &'static str {
        "macos"
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
            .prefix("buns-sandbox-")
            .suffix(".sb")
            .tempfile()
            .context("failed to create sandbox profile")?;
        profile_file
            .write_all(profile.as_bytes())
            .context("failed to write sandbox profile")?;

        let mut cmd = Command::new("sandbox-exec");
        cmd.arg("-f").arg(profile_file.path());
        cmd.args(build_bun_args(cfg));

        // Seatbelt has no resource-limit primitives; memory stays a GC hint.
        apply_sandbox_env(&mut cmd, cfg, true);

        if !cfg.work_dir.as_os_str().is_empty() {
            cmd.current_dir(&cfg.work_dir);
        }

        run_command(&mut cmd, cfg)
    }
}

/// Deny-default Seatbelt profile allowing only what bun needs to run the
/// script plus the explicitly granted paths and proxy ports.
pub fn generate_profile(cfg: &Config) -> String {
    let mut p = String::new();

    p.push_str("(version 1)\n");
    p.push_str("(deny default)\n\n");

    p.push_str(";; Process operations (required for Bun to run)\n");
    p.push_str("(allow process*)\n");
    p.push_str("(allow sysctl-read)\n");
    p.push_str("(allow mach-lookup)\n");
    p.push_str("(allow signal (target self))\n\n");

    p.push_str(";; Root directory (required for path resolution)\n");
    p.push_str("(allow file-read* (literal \"/\"))\n\n");

    p.push_str(";; Minimal device access\n");
    p.push_str("(allow file-read* (literal \"/dev/null\"))\n");
    p.push_str("(allow file-read* (literal \"/dev/urandom\"))\n");
    p.push_str("(allow file-read* (literal \"/dev/random\"))\n\n");

    p.push_str(";; Timezone data\n");
    p.push_str("(allow file-read* (subpath \"/usr/share/zoneinfo\"))\n");
    p.push_str("(allow file-read* (subpath \"/var/db/timezone\"))\n");
    p.push_str("(allow file-read* (literal \"/etc/localtime\"))\n");
    p.push_str("(allow file-read* (literal \"/private/etc/localtime\"))\n\n");

    if cfg.network {
        p.push_str(";; DNS resolution (network enabled)\n");
        p.push_str("(allow file-read* (literal \"/etc/resolv.conf\"))\n");
        p.push_str("(allow file-read* (literal \"/private/etc/resolv.conf\"))\n");
        p.push_str("(allow file-read* (literal \"/etc/hosts\"))\n");
        p.push_str("(allow file-read* (literal \"/private/etc/hosts\"))\n\n");

        p.push_str(";; SSL certificates (required for HTTPS)\n");
        p.push_str("(allow file-read* (literal \"/etc\"))\n");
        p.push_str("(allow file-read* (subpath \"/private/etc/ssl\"))\n\n");
    }

    if !cfg.bun_binary.as_os_str().is_empty() {
        p.push_str(";; Bun binary\n");
        if let Some(bun_dir) = cfg.bun_binary.parent() {
            add_path_components(&mut p, bun_dir);
            let _ = writeln!(
                p,
                "(allow file-read* (subpath \"{}\"))\n",
                seatbelt_escape(&bun_dir.to_string_lossy())
            );
        }
    }

    if !cfg.script_path.as_os_str().is_empty() {
        p.push_str(";; Script file\n");
        if let Some(script_dir) = cfg.script_path.parent() {
            add_path_components(&mut p, script_dir);
            let _ = writeln!(
                p,
                "(allow file-read* (subpath \"{}\"))\n",
                seatbelt_escape(&script_dir.to_string_lossy())
            );
        }
    }

    if let Some(ref node_modules) = cfg.node_modules {
        p.push_str(";; Node modules (dependencies)\n");
        let resolved = resolve_path(node_modules).unwrap_or_else(|_| node_modules.clone());
        add_path_components(&mut p, &resolved);
        let _ = writeln!(
            p,
            "(allow file-read* (subpath \"{}\"))\n",
            seatbelt_escape(&resolved.to_string_lossy())
        );
    }

    if !cfg.readable_paths.is_empty() {
        p.push_str(";; Additional readable paths (--allow-read)\n");
        for path in &cfg.readable_paths {
            let Ok(resolved) = resolve_path(path) else {
                continue;
            };
            add_path_components(&mut p, path);
            if *path != resolved {
                let _ = writeln!(
                    p,
                    "(allow file-read* (literal \"{}\"))",
                    seatbelt_escape(&path.to_string_lossy())
                );
                add_path_components(&mut p, &resolved);
            }
            let _ = writeln!(
                p,
                "(allow file-read* (subpath \"{}\"))",
                seatbelt_escape(&resolved.to_string_lossy())
            );
        }
        p.push('\n');
    }

    p.push_str(";; Minimal write access\n");
    p.push_str("(allow file-write* (literal \"/dev/null\"))\n\n");

    if !cfg.writable_paths.is_empty() {
        p.push_str(";; Additional writable paths (--allow-write)\n");
        for path in &cfg.writable_paths {
            let Ok(resolved) = resolve_path(path) else {
                continue;
            };
            add_path_components(&mut p, path);
            if *path != resolved {
                let _ = writeln!(
                    p,
                    "(allow file-read* (literal \"{}\"))",
                    seatbelt_escape(&path.to_string_lossy())
                );
                add_path_components(&mut p, &resolved);
            }
            let _ = writeln!(
                p,
                "(allow file-write* (subpath \"{}\"))",
                seatbelt_escape(&resolved.to_string_lossy())
            );
            let _ = writeln!(
                p,
                "(allow file-read* (subpath \"{}\"))",
                seatbelt_escape(&resolved.to_string_lossy())
            );
        }
        p.push('\n');
    }

    if cfg.network {
        p.push_str(";; Network: proxy connections only\n");
        if cfg.proxy_port > 0 {
            let _ = writeln!(
                p,
                "(allow network-outbound (remote ip \"localhost:{}\"))",
                cfg.proxy_port
            );
        }
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

/// Literal read permissions for every ancestor directory of `path`, so the
/// kernel can traverse down to the allowed subtree.
fn add_path_components(profile: &mut String, path: &Path) {
    let mut ancestors: Vec<&Path> = path
        .ancestors()
        .skip(1)
        .filter(|a| !a.as_os_str().is_empty() && a.as_os_str() != "/")
        .collect();
    ancestors.reverse();

    for ancestor in ancestors {
        let _ = writeln!(
            profile,
            "(allow file-read* (literal \"{}\"))",
            seatbelt_escape(&ancestor.to_string_lossy())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> Config {
        Config {
            bun_binary: PathBuf::from("/cache/bun/1.1.34/bun"),
            script_path: PathBuf::from("/home/dev/scripts/tool.ts"),
            work_dir: PathBuf::from("/home/dev"),
            ..Config::default()
        }
    }

    #[test]
    fn profile_denies_by_default() {
        let profile = generate_profile(&base_config());
        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains("(allow process*)"));
        assert!(profile.contains("(allow file-read* (literal \"/dev/urandom\"))"));
    }

    #[test]
    fn profile_grants_bun_and_script_directories() {
        let profile = generate_profile(&base_config());
        assert!(profile.contains("(allow file-read* (subpath \"/cache/bun/1.1.34\"))"));
        assert!(profile.contains("(allow file-read* (literal \"/cache/bun\"))"));
        assert!(profile.contains("(allow file-read* (subpath \"/home/dev/scripts\"))"));
        assert!(profile.contains("(allow file-read* (literal \"/home/dev\"))"));
    }

    #[test]
    fn offline_profile_has_no_network_allowances() {
        let profile = generate_profile(&base_config());
        assert!(!profile.contains("network-outbound"));
        assert!(!profile.contains("resolv.conf"));
    }

    #[test]
    fn networked_profile_allows_only_proxy_ports() {
        let cfg = Config {
            network: true,
            proxy_port: 40001,
            socks5_port: 40002,
            ..base_config()
        };

        let profile = generate_profile(&cfg);
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:40001\"))"));
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:40002\"))"));
        assert!(profile.contains("(allow network-outbound (remote unix-socket))"));
        assert!(profile.contains("resolv.conf"), "DNS config readable when networked");
        assert!(!profile.contains("(allow network*)"), "no blanket network allowance");
    }

    #[test]
    fn writable_paths_get_read_and_write_subtrees() {
        let cfg = Config {
            writable_paths: vec![PathBuf::from("/tmp/out")],
            ..base_config()
        };

        let profile = generate_profile(&cfg);
        assert!(profile.contains("(allow file-write* (subpath \"/tmp/out\"))"));
        assert!(profile.contains("(allow file-read* (subpath \"/tmp/out\"))"));
        assert!(profile.contains("(allow file-read* (literal \"/tmp\"))"));
    }

    #[test]
    fn paths_are_escaped_for_the_profile_grammar() {
        let cfg = Config {
            readable_paths: vec![PathBuf::from("/tmp/odd\"name")],
            ..base_config()
        };

        let profile = generate_profile(&cfg);
        assert!(profile.contains("odd\\\"name"));
    }

    #[test]
    fn backend_identity() {
        assert_eq!(MacOs.name(), "macos");
        assert!(MacOs.is_sandboxed());
        if !cfg!(target_os = "macos") {
            assert!(!MacOs.available());
        }
    }
}
