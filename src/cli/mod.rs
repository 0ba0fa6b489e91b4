//! CLI module for Argus
//!
//! Provides command-line interface parsing for the `argus` binary.
//! Uses clap for argument parsing and owo-colors for colored terminal output.

pub mod output;

use crate::utils::toml_config::{ArgusConfig, HypothesisMode};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Argus - research orchestration engine
///
/// Breaks a question into tasks, searches every relevant source with retries
/// and query reformulation, and stops when the findings saturate.
#[derive(Parser, Debug)]
#[command(
    name = "argus",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "Argus - research orchestration engine",
    after_help = "EXAMPLES:\n    \
                  argus run \"Who sells refurbished lab centrifuges in Ohio?\"\n    \
                  argus run \"...\" --output report.json --parallel-hypotheses\n    \
                  argus sources                 # List registered sources\n    \
                  argus config --validate       # Check argus.toml"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "argus.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Research a question and print (or write) the report
    Run(RunArgs),

    /// List registered sources with their critical and strict flags
    Sources,

    /// Show configuration information
    Config {
        /// Validate the configuration file, including referenced env vars
        #[arg(long)]
        validate: bool,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The research question
    pub question: String,

    /// Write the full JSON report here instead of printing a summary
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Execute hypotheses concurrently
    #[arg(long, conflicts_with_all = ["sequential_hypotheses", "no_hypotheses"])]
    pub parallel_hypotheses: bool,

    /// Execute hypotheses one at a time with coverage-driven stopping
    #[arg(long, conflicts_with = "no_hypotheses")]
    pub sequential_hypotheses: bool,

    /// Disable hypothesis branching
    #[arg(long)]
    pub no_hypotheses: bool,
}

impl RunArgs {
    /// Fold the hypothesis flags into `config`. Either mode flag also
    /// enables branching.
    pub fn apply(&self, config: &mut ArgusConfig) {
        if self.no_hypotheses {
            config.hypotheses.enabled = false;
        } else if self.parallel_hypotheses {
            config.hypotheses.enabled = true;
            config.hypotheses.mode = HypothesisMode::Parallel;
        } else if self.sequential_hypotheses {
            config.hypotheses.enabled = true;
            config.hypotheses.mode = HypothesisMode::Sequential;
        }
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["argus", "run", "q"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).map(|cli| cli.command) {
            Ok(Commands::Run(args)) => args,
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parallel_flag_enables_parallel_mode() {
        let mut config = ArgusConfig::default();
        run_args(&["--parallel-hypotheses"]).apply(&mut config);
        assert!(config.hypotheses.enabled);
        assert_eq!(config.hypotheses.mode, HypothesisMode::Parallel);
    }

    #[test]
    fn test_no_hypotheses_disables_branching() {
        let mut config = ArgusConfig::default();
        config.hypotheses.enabled = true;
        run_args(&["--no-hypotheses"]).apply(&mut config);
        assert!(!config.hypotheses.enabled);
    }

    #[test]
    fn test_without_flags_config_is_untouched() {
        let mut config = ArgusConfig::default();
        config.hypotheses.mode = HypothesisMode::Parallel;
        run_args(&[]).apply(&mut config);
        assert!(!config.hypotheses.enabled);
        assert_eq!(config.hypotheses.mode, HypothesisMode::Parallel);
    }

    #[test]
    fn test_conflicting_mode_flags_rejected() {
        let parsed = Cli::try_parse_from([
            "argus",
            "run",
            "q",
            "--parallel-hypotheses",
            "--no-hypotheses",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_config_path_defaults() {
        let cli = Cli::try_parse_from(["argus", "sources"]).expect("parses");
        assert_eq!(cli.config, PathBuf::from("argus.toml"));
        assert!(matches!(cli.command, Commands::Sources));
    }
}
