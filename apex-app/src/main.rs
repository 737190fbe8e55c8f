//! Apex main binary.

mod api_error;
mod config;
mod http_auth;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "apex",
    version,
    about = "Policy-gated action runner with a supervised self-modifying agent"
)]
struct Cli {
    /// Config file (defaults to ~/.apex/config.toml).
    #[arg(long, global = true, env = "APEX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the Apex server (default).
    Serve,
    /// Validate config and check that the working directories are writable.
    Doctor,
    /// Print X-TS and X-SIG headers for a request body.
    Sign {
        #[arg(long)]
        body: String,
    },
    /// Operate the agent kill switch without a running server.
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },
}

#[derive(Debug, Subcommand)]
enum KillSwitchAction {
    Activate {
        #[arg(long)]
        reason: String,
    },
    Deactivate {
        #[arg(long, env = "KILL_SWITCH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();
    if let Ok(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    match command {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Sign { body } => server::sign(cli.config, &body).await,
        Command::KillSwitch { action } => {
            let command = match action {
                KillSwitchAction::Activate { reason } => {
                    server::KillSwitchCommand::Activate { reason }
                }
                KillSwitchAction::Deactivate { password } => {
                    server::KillSwitchCommand::Deactivate { password }
                }
            };
            server::kill_switch(cli.config, command).await
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,apex=debug,apex_app=debug,apex_agent=debug,apex_tools=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("APEX_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported APEX_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve_and_parses_subcommands() {
        let cli = Cli::try_parse_from(["apex"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["apex", "--config", "/tmp/a.toml", "sign", "--body", "{}"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));
        assert!(matches!(cli.command, Some(Command::Sign { ref body }) if body == "{}"));

        let cli = Cli::try_parse_from(["apex", "kill-switch", "activate", "--reason", "drill"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::KillSwitch {
                action: KillSwitchAction::Activate { ref reason }
            }) if reason == "drill"
        ));
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload_to_string(boxed.as_ref()), "non-string panic payload");
    }
}
