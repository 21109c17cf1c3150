//! Downloads Bun release archives and extracts the binary into the cache.

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use semver::Version;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DOWNLOAD_BASE: &str = "https://github.com/oven-sh/bun/releases/download";

#[cfg(target_os = "macos")]
const OS_TAG: &str = "darwin";
#[cfg(not(target_os = "macos"))]
const OS_TAG: &str = "linux";

#[cfg(target_arch = "aarch64")]
const ARCH_TAG: &str = "aarch64";
#[cfg(not(target_arch = "aarch64"))]
const ARCH_TAG: &str = "x64";

/// Downloads and caches Bun binaries.
pub struct Downloader {
    cache_dir: PathBuf,
    quiet: bool,
}

impl Downloader {
    pub fn new(cache_dir: impl Into<PathBuf>, quiet: bool) -> Self {
        Self { cache_dir: cache_dir.into(), quiet }
    }

    /// Path to the Bun binary for `version`, downloading it first if it is
    /// not already cached.
    pub fn get_binary(&self, version: &Version) -> Result<PathBuf> {
        let bin_path = self.binary_path(version);
        if bin_path.exists() {
            return Ok(bin_path);
        }

        self.download(version)
            .with_context(|| format!("failed to download Bun {version}"))?;

        Ok(bin_path)
    }

    /// True when `version` is already present in the cache.
    pub fn is_cached(&self, version: &Version) -> bool {
        self.binary_path(version).exists()
    }

    fn download(&self, version: &Version) -> Result<()> {
        let url = download_url(version);
        tracing::debug!("downloading {url}");

        let response = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build()
            .get(&url)
            .set("User-Agent", "buns-cli")
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => anyhow!("HTTP {code} for {url}"),
                ureq::Error::Transport(t) => anyhow!("cannot reach release server: {t}"),
            })?;

        let total: Option<u64> = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok());

        // Stream the archive to a temp file; NamedTempFile removes it on
        // every exit path.
        let mut tmp = tempfile::Builder::new()
            .prefix("bun-")
            .suffix(".zip")
            .tempfile()
            .context("failed to create temp file")?;

        let mut reader = response.into_reader();
        if self.quiet {
            io::copy(&mut reader, tmp.as_file_mut()).context("failed to stream archive")?;
        } else {
            let bar = download_bar(total, version);
            io::copy(&mut bar.wrap_read(&mut reader), tmp.as_file_mut())
                .context("failed to stream archive")?;
            bar.finish_and_clear();
        }

        self.extract(tmp.path(), version)
            .context("failed to extract Bun archive")
    }

    fn extract(&self, zip_path: &Path, version: &Version) -> Result<()> {
        let file = fs::File::open(zip_path)?;
        let mut archive = zip::ZipArchive::new(file).context("invalid zip archive")?;

        // The binary sits at bun-{os}-{arch}/bun, or at the archive root.
        let entry_index = (0..archive.len()).find(|&i| {
            archive
                .by_index(i)
                .map(|f| f.name() == "bun" || f.name().ends_with("/bun"))
                .unwrap_or(false)
        });

        let Some(entry_index) = entry_index else {
            bail!("bun binary not found in archive");
        };

        let version_dir = self.cache_dir.join(version.to_string());
        fs::create_dir_all(&version_dir)
            .with_context(|| format!("failed to create {}", version_dir.display()))?;

        let bin_path = version_dir.join("bun");
        let mut entry = archive.by_index(entry_index)?;
        let mut out = fs::File::create(&bin_path)
            .with_context(|| format!("failed to create {}", bin_path.display()))?;
        io::copy(&mut entry, &mut out)?;
        out.flush()?;
        drop(out);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&bin_path, fs::Permissions::from_mode(0o755))?;
        }

        Ok(())
    }

    fn binary_path(&self, version: &Version) -> PathBuf {
        self.cache_dir.join(version.to_string()).join("bun")
    }
}

fn download_url(version: &Version) -> String {
    format!("{DOWNLOAD_BASE}/bun-v{version}/bun-{OS_TAG}-{ARCH_TAG}.zip")
}

fn download_bar(total: Option<u64>, version: &Version) -> ProgressBar {
    let bar = match total {
        Some(len) => {
            let bar = ProgressBar::new(len);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        }
        None => ProgressBar::new_spinner(),
    };
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_message(format!("Downloading Bun {version}"));
    bar
}
