//! Inline script metadata: the `// buns` comment block.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Parsed `// buns` block from a script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    /// Bun version constraint, e.g. ">=1.1"
    #[serde(default)]
    pub bun: String,

    /// Package specs, e.g. ["zod@^3.0", "chalk@^5.0"]
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Extract metadata from a script's `// buns` comment block.
///
/// Lines before the marker are ignored (shebangs, banner comments). The
/// block is the run of `//` comment lines directly after a line whose
/// trimmed content is exactly `// buns`; the first non-comment line ends
/// it. The collected text is TOML. A missing or empty block is not an
/// error and yields the defaults.
pub fn parse(content: &[u8]) -> Result<Metadata> {
    let text = String::from_utf8_lossy(content);
    let mut toml_lines: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();

        if !in_block {
            if trimmed == "// buns" {
                in_block = true;
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("//") {
            // Strip one optional space after the comment prefix.
            toml_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else {
            break;
        }
    }

    if toml_lines.is_empty() {
        return Ok(Metadata::default());
    }

    let block = toml_lines.join("\n");
    toml::from_str(&block).context("failed to parse // buns metadata block")
}
