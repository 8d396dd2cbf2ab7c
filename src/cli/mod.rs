pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs probes on a jittered schedule and surfaces their measurements", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the prober until interrupted")]
    Run {
        #[arg(short, long, help = "Path to the YAML configuration")]
        config: PathBuf,

        #[arg(long, help = "Start every probe immediately instead of spreading starts")]
        disable_jitter: bool,
    },
    #[command(about = "Validate a configuration and list the probes that would run here")]
    Check {
        #[arg(short, long, help = "Path to the YAML configuration")]
        config: PathBuf,

        #[arg(long, help = "Hostname to evaluate run_on patterns against")]
        hostname: Option<String>,
    },
    #[command(about = "Print the configuration as the prober sees it")]
    DumpConfig {
        #[arg(short, long, help = "Path to the YAML configuration")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["cadence", "-v", "run", "--config", "prober.yaml", "--disable-jitter"]);
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Run {
                config,
                disable_jitter,
            }) => {
                assert_eq!(config, PathBuf::from("prober.yaml"));
                assert!(disable_jitter);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_dump_config() {
        let cli = Cli::parse_from(["cadence", "dump-config", "-c", "prober.yaml"]);
        assert!(matches!(cli.command, Some(Commands::DumpConfig { .. })));
    }
}
