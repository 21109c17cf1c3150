//! The `cache` subcommands: list, clean, dir.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::cache::Cache;

/// Show cached Bun builds, dependency caches, index age, and total size.
pub fn list() -> Result<()> {
    let cache = Cache::default_location()?;

    let versions = cache.list_bun_versions()?;
    println!("Bun binaries:");
    if versions.is_empty() {
        println!("  (none)");
    } else {
        for version in &versions {
            println!("  {version}");
        }
    }

    let hashes = cache.list_deps_hashes()?;
    println!("\nDependency caches:");
    if hashes.is_empty() {
        println!("  (none)");
    } else {
        for hash in &hashes {
            let display = if hash.len() > 12 { &hash[..12] } else { hash };
            println!("  {display}...");
        }
    }

    println!("\nIndex cache:");
    match index_age(&cache) {
        Some(age) => println!("  Last updated: {age} ago"),
        None => println!("  (not cached)"),
    }

    let size = cache.size()?;
    println!("\nTotal cache size: {}", format_size(size));

    Ok(())
}

/// Remove cached data; dependencies by default.
pub fn clean(bun: bool, mut deps: bool, index: bool, all: bool) -> Result<()> {
    if !bun && !deps && !index && !all {
        deps = true;
    }

    let cache = Cache::default_location()?;

    if all {
        println!("Removing all cache data...");
        cache.clean_all()?;
        println!("Done.");
        return Ok(());
    }

    if bun {
        println!("Removing Bun binaries...");
        cache.clean_bun()?;
    }

    if deps {
        println!("Removing dependency caches...");
        cache.clean_deps()?;
    }

    if index {
        println!("Removing index cache...");
        cache.clean_index()?;
    }

    println!("Done.");
    Ok(())
}

/// Print the cache root path.
pub fn dir() -> Result<()> {
    let cache = Cache::default_location()?;
    println!("{}", cache.base_dir().display());
    Ok(())
}

fn index_age(cache: &Cache) -> Option<String> {
    let stamp = std::fs::read_to_string(cache.index_dir().join("fetched_at")).ok()?;
    let fetched_at = DateTime::parse_from_rfc3339(stamp.trim()).ok()?;
    let age = Utc::now().signed_duration_since(fetched_at);

    let minutes = age.num_minutes().max(0);
    if minutes >= 60 {
        Some(format!("{}h{}m", minutes / 60, minutes % 60))
    } else {
        Some(format!("{minutes}m"))
    }
}

fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let units = ['K', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", bytes as f64 / div as f64, units[exp])
}
