use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_FILE: &str = "lazyhost.toml";

#[derive(Debug, Parser)]
#[command(
    name = "lazyhost",
    about = "Starts game backends on demand and stops them when idle",
    version
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon,
    /// Validate the configuration file and exit
    Check,
    /// Show every backend and its state
    #[command(visible_alias = "list")]
    Status,
    /// Start a backend
    Start { name: String },
    /// Stop a backend
    Stop { name: String },
    /// Keep a backend running (`30m`, `2h`, `forever`, `clear`)
    Hold {
        name: String,
        duration: Option<String>,
    },
    /// Write a line to a backend's stdin
    Send {
        name: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },
    /// Show the status line a client connecting through `host` would see
    Ping { host: Option<String> },
    /// Re-read the configuration file
    Reload,
    /// Stop all backends and shut down the daemon
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args_no_command() {
        let cli = Cli::try_parse_from(["lazyhost"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(!cli.json);
    }

    #[test]
    fn test_daemon() {
        let cli = Cli::try_parse_from(["lazyhost", "daemon"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Daemon));
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["lazyhost", "check", "--config", "/etc/lh.toml"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Check));
        assert_eq!(cli.config, PathBuf::from("/etc/lh.toml"));
    }

    #[test]
    fn test_status_list_alias() {
        let cli = Cli::try_parse_from(["lazyhost", "list", "--json"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Status));
        assert!(cli.json);
    }

    #[test]
    fn test_start_stop() {
        let cli = Cli::try_parse_from(["lazyhost", "start", "smp"]).unwrap();
        match cli.command.unwrap() {
            Command::Start { name } => assert_eq!(name, "smp"),
            _ => panic!("expected Start"),
        }

        let cli = Cli::try_parse_from(["lazyhost", "stop", "smp"]).unwrap();
        match cli.command.unwrap() {
            Command::Stop { name } => assert_eq!(name, "smp"),
            _ => panic!("expected Stop"),
        }
    }

    #[test]
    fn test_hold_duration_optional() {
        let cli = Cli::try_parse_from(["lazyhost", "hold", "smp"]).unwrap();
        match cli.command.unwrap() {
            Command::Hold { name, duration } => {
                assert_eq!(name, "smp");
                assert!(duration.is_none());
            }
            _ => panic!("expected Hold"),
        }

        let cli = Cli::try_parse_from(["lazyhost", "hold", "smp", "2h"]).unwrap();
        match cli.command.unwrap() {
            Command::Hold { duration, .. } => assert_eq!(duration.as_deref(), Some("2h")),
            _ => panic!("expected Hold"),
        }
    }

    #[test]
    fn test_send_joins_words() {
        let args = ["lazyhost", "send", "smp", "say", "hello", "--all"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command.unwrap() {
            Command::Send { name, line } => {
                assert_eq!(name, "smp");
                assert_eq!(line, vec!["say", "hello", "--all"]);
            }
            _ => panic!("expected Send"),
        }
    }

    #[test]
    fn test_send_requires_line() {
        assert!(Cli::try_parse_from(["lazyhost", "send", "smp"]).is_err());
    }

    #[test]
    fn test_start_missing_name() {
        assert!(Cli::try_parse_from(["lazyhost", "start"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["lazyhost", "bogus"]).is_err());
    }

    #[test]
    fn test_ping_host_optional() {
        let cli = Cli::try_parse_from(["lazyhost", "ping"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Ping { host: None }));

        let cli = Cli::try_parse_from(["lazyhost", "ping", "smp.example.com"]).unwrap();
        match cli.command.unwrap() {
            Command::Ping { host } => assert_eq!(host.as_deref(), Some("smp.example.com")),
            _ => panic!("expected Ping"),
        }
    }
}
