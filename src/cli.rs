use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "status-watch",
    about = "Watch an application status page and email when it changes",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one check and exit
    Check {
        /// Append JSON-lines cycle events to this file
        #[arg(long, value_name = "PATH")]
        event_log: Option<PathBuf>,
    },

    /// Check repeatedly on a fixed interval until interrupted
    Watch {
        /// Minutes to sleep between checks
        #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
        interval_mins: u64,

        /// Append JSON-lines cycle events to this file
        #[arg(long, value_name = "PATH")]
        event_log: Option<PathBuf>,
    },

    /// Show the effective configuration (secrets redacted)
    Config {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_defaults_to_thirty_minutes() {
        let cli = Cli::try_parse_from(["status-watch", "watch"]).unwrap();
        match cli.command {
            Command::Watch {
                interval_mins,
                event_log,
            } => {
                assert_eq!(interval_mins, 30);
                assert!(event_log.is_none());
            }
            other => panic!("expected watch, got {other:?}"),
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Cli::try_parse_from(["status-watch", "watch", "--interval-mins", "0"]).is_err());
    }

    #[test]
    fn check_accepts_event_log_and_global_verbosity() {
        let cli = Cli::try_parse_from([
            "status-watch",
            "check",
            "--event-log",
            "logs/cycles.jsonl",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Check { event_log } => {
                assert_eq!(event_log, Some(PathBuf::from("logs/cycles.jsonl")));
            }
            other => panic!("expected check, got {other:?}"),
        }
    }

    #[test]
    fn config_json_flag_parses() {
        let cli = Cli::try_parse_from(["status-watch", "config", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Config { json: true }));
    }

    #[test]
    fn completions_take_a_shell() {
        let cli = Cli::try_parse_from(["status-watch", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Completions {
                shell: CompletionShell::Zsh
            }
        ));
    }
}
