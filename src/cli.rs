use clap::{Args, Parser, Subcommand};

/// Run TypeScript/JavaScript scripts with inline dependencies
/// and automatic Bun version management.
#[derive(Parser, Debug)]
#[command(name = "buns")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Script to run ("-" reads from stdin)
    #[arg(value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Arguments passed to the script (after --)
    #[arg(value_name = "ARGS", last = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub flags: RunFlags,

    /// Show detailed output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress buns output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a TypeScript/JavaScript script with inline dependencies
    #[command(long_about = "Run a TypeScript/JavaScript script, automatically installing any \
declared dependencies.

The script can declare dependencies in a // buns comment block:

    #!/usr/bin/env buns
    // buns
    // bun = \">=1.0\"
    // packages = [\"zod@^3.0\", \"chalk@^5.0\"]

    import { z } from \"zod\";

Use \"-\" to read from stdin.")]
    Run {
        /// Script to run ("-" reads from stdin)
        #[arg(value_name = "SCRIPT")]
        script: String,

        /// Arguments passed to the script (after --)
        #[arg(value_name = "ARGS", last = true)]
        args: Vec<String>,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Manage the buns cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show cached Bun builds and dependencies
    List,

    /// Remove cached data (dependencies by default)
    Clean {
        /// Remove Bun binaries
        #[arg(long)]
        bun: bool,

        /// Remove dependencies
        #[arg(long)]
        deps: bool,

        /// Remove index cache
        #[arg(long)]
        index: bool,

        /// Remove everything
        #[arg(long)]
        all: bool,
    },

    /// Print cache directory path
    Dir,
}

/// Script execution flags, registered on both the root command and `run`
/// so `buns script.ts --sandbox` and `buns run script.ts --sandbox` behave
/// identically.
#[derive(Args, Debug, Default)]
pub struct RunFlags {
    /// Bun version constraint (overrides script)
    #[arg(long, value_name = "CONSTRAINT")]
    pub bun: Option<String>,

    /// Comma-separated packages to add
    #[arg(long, value_name = "PACKAGES")]
    pub packages: Option<String>,

    /// Enable sandboxing (restricts filesystem access)
    #[arg(long)]
    pub sandbox: bool,

    /// Block all network access
    #[arg(long)]
    pub offline: bool,

    /// Allowed hosts (comma-separated)
    #[arg(long, value_name = "HOSTS")]
    pub allow_host: Option<String>,

    /// Additional readable paths (comma-separated)
    #[arg(long, value_name = "PATHS")]
    pub allow_read: Option<String>,

    /// Additional writable paths (comma-separated)
    #[arg(long, value_name = "PATHS")]
    pub allow_write: Option<String>,

    /// Environment variables to pass through (comma-separated)
    #[arg(long, value_name = "VARS")]
    pub allow_env: Option<String>,

    /// Memory limit in MB
    #[arg(long, value_name = "MB", default_value_t = 128)]
    pub memory: u64,

    /// Execution timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// CPU time limit in seconds (enforced on Linux only)
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub cpu: u64,
}

/// Split a comma-separated flag value, trimming whitespace and dropping
/// empty entries.
pub fn split_and_trim(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn split_and_trim_handles_spaces_and_empties() {
        assert_eq!(
            split_and_trim("zod@^3.0, chalk@^5.0 ,,lodash"),
            vec!["zod@^3.0", "chalk@^5.0", "lodash"]
        );
        assert!(split_and_trim("").is_empty());
        assert!(split_and_trim(" , ").is_empty());
    }

    #[test]
    fn root_accepts_script_and_trailing_args() {
        let cli = Cli::parse_from(["buns", "script.ts", "--", "--flag", "value"]);
        assert_eq!(cli.script.as_deref(), Some("script.ts"));
        assert_eq!(cli.args, vec!["--flag", "value"]);
    }

    #[test]
    fn run_subcommand_accepts_sandbox_flags() {
        let cli = Cli::parse_from([
            "buns",
            "run",
            "script.ts",
            "--sandbox",
            "--allow-host",
            "httpbin.org,*.github.com",
            "--memory",
            "64",
        ]);
        match cli.command {
            Some(Commands::Run { script, flags, .. }) => {
                assert_eq!(script, "script.ts");
                assert!(flags.sandbox);
                assert_eq!(flags.allow_host.as_deref(), Some("httpbin.org,*.github.com"));
                assert_eq!(flags.memory, 64);
                assert_eq!(flags.timeout, 30);
            }
            other => panic!("expected run subcommand, got {other:?}"),
        }
    }
}
