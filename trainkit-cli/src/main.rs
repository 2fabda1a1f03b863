//! trainkit CLI: merge configurations, run the demo workload and inspect
//! checkpoints.

mod commands;
mod demo;
mod logging;

use clap::Parser;
use std::path::PathBuf;

/// trainkit: hook-driven training runs with checkpoints and metric history
#[derive(Parser, Debug)]
#[command(name = "trainkit", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where a configuration comes from.
#[derive(clap::Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Base configuration file (YAML, TOML or JSON) or directory holding config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Optional configuration files merged over the base, in order
    #[arg(short = 'o', long = "optional")]
    optional: Vec<PathBuf>,

    /// Warn about unknown override keys instead of failing
    #[arg(long)]
    lenient: bool,

    /// Overrides such as trainer.max_epoch=10 or trainer.device:cuda:0
    overrides: Vec<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the merged configuration as YAML
    Config {
        #[command(flatten)]
        source: ConfigArgs,
    },
    /// Train the built-in synthetic linear-regression workload
    Train {
        #[command(flatten)]
        source: ConfigArgs,

        #[command(flatten)]
        demo: demo::DemoOptions,

        /// Log the meter snapshot every N steps
        #[arg(long, default_value = "10")]
        log_every: usize,
    },
    /// Show the run buffers and metric history stored in a checkpoint
    Inspect {
        /// Checkpoint file or run directory
        path: PathBuf,

        /// File to read inside a run directory
        #[arg(short, long, default_value = "last.pth")]
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    commands::handle_command(cli.command, logging::Verbosity {
        verbose: cli.verbose,
        quiet: cli.quiet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_config_with_overrides() {
        let cli = Cli::try_parse_from([
            "trainkit",
            "config",
            "-c",
            "base.yaml",
            "-o",
            "extra.toml",
            "--lenient",
            "trainer.max_epoch=5",
            "logging.level:debug",
        ])
        .unwrap();
        match cli.command {
            Commands::Config { source } => {
                assert_eq!(source.config, Some(PathBuf::from("base.yaml")));
                assert_eq!(source.optional, vec![PathBuf::from("extra.toml")]);
                assert!(source.lenient);
                assert_eq!(
                    source.overrides,
                    vec!["trainer.max_epoch=5", "logging.level:debug"]
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_train_defaults() {
        let cli = Cli::try_parse_from(["trainkit", "-vv", "train", "trainer.max_epoch=2"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Train {
                source,
                demo: options,
                log_every,
            } => {
                assert_eq!(source.overrides, vec!["trainer.max_epoch=2"]);
                assert_eq!(log_every, 10);
                assert_eq!(options, demo::DemoOptions::default());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["trainkit", "inspect", "runs/a", "-n", "best.pth"]).unwrap();
        match cli.command {
            Commands::Inspect { path, name } => {
                assert_eq!(path, PathBuf::from("runs/a"));
                assert_eq!(name, "best.pth");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
