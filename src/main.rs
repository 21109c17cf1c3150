use buns::cli::{CacheCommands, Cli, Commands};
use buns::{commands, observability};
use clap::Parser;

fn main() {
    let cli = Cli::parse();
    observability::init_tracing(cli.verbose, cli.quiet);

    let outcome = match cli.command {
        Some(Commands::Run { script, args, flags }) => {
            commands::run::run_script(&script, &args, &flags, cli.quiet)
        }
        Some(Commands::Cache { command }) => match command {
            CacheCommands::List => commands::cache::list().map(|()| 0),
            CacheCommands::Clean { bun, deps, index, all } => {
                commands::cache::clean(bun, deps, index, all).map(|()| 0)
            }
            CacheCommands::Dir => commands::cache::dir().map(|()| 0),
        },
        None => match cli.script {
            Some(script) => {
                commands::run::run_script(&script, &cli.args, &cli.flags, cli.quiet)
            }
            None => {
                // No script and no subcommand: print usage like `--help`.
                use clap::CommandFactory;
                let _ = Cli::command().print_help();
                Ok(0)
            }
        },
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("buns: {err:#}");
            std::process::exit(1);
        }
    }
}
