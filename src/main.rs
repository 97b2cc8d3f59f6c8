use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use xhbot_server::settings::{settings_path, ServerSettings};
use xhbot_server::{DefaultMessageHandler, ServerDeps};
use xhbot_store::{BotTokenRepo, Database, MemorySessionStore};
use xhbot_telemetry::{init_telemetry, parse_level, TelemetryConfig, TelemetryError};

#[derive(Parser, Debug)]
#[command(name = "xhbot")]
#[command(about = "WebSocket gateway for chat-bot frontends")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ~/.xhbot/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until Ctrl-C.
    Serve {
        /// Listen port, overriding settings and XHBOT_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage trusted bot tokens.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Issue a new token. The plaintext is printed once.
    Issue {
        #[arg(long)]
        label: String,
    },
    /// Revoke the active token under a label.
    Revoke {
        #[arg(long)]
        label: String,
    },
    /// List stored tokens.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = xhbot_server::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                settings.port = port;
            }
            init_logging(&settings)?;
            serve(settings).await
        }
        Command::Token { action } => {
            init_logging(&settings)?;
            token(&settings, action)
        }
    }
}

fn telemetry_config(settings: &ServerSettings) -> Result<TelemetryConfig, TelemetryError> {
    let module_levels = settings
        .logging
        .modules
        .iter()
        .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
        .collect::<Result<Vec<_>, TelemetryError>>()?;
    Ok(TelemetryConfig {
        log_level: parse_level(&settings.logging.level)?,
        module_levels,
        json: settings.logging.json,
    })
}

fn init_logging(settings: &ServerSettings) -> anyhow::Result<()> {
    let config = telemetry_config(settings).context("logging settings")?;
    init_telemetry(&config).context("initializing logging")
}

async fn serve(settings: ServerSettings) -> anyhow::Result<()> {
    tracing::info!("starting xhbot");

    let db = Database::open(&settings.db_path)
        .with_context(|| format!("opening token database {}", settings.db_path.display()))?;
    let sessions = Arc::new(MemorySessionStore::from_secs(settings.session.expiry_secs));
    let deps = ServerDeps {
        validator: Arc::new(BotTokenRepo::new(db)),
        handler: Arc::new(DefaultMessageHandler::new(sessions.clone())),
        sessions,
    };

    let handle = xhbot_server::start(&settings, deps)
        .await
        .with_context(|| format!("binding {}:{}", settings.host, settings.port))?;
    tracing::info!(port = handle.port, "xhbot ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    tracing::info!(connections = handle.registry.count(), "shutting down");
    handle.shutdown();
    Ok(())
}

fn token(settings: &ServerSettings, action: TokenAction) -> anyhow::Result<()> {
    let db = Database::open(&settings.db_path)
        .with_context(|| format!("opening token database {}", settings.db_path.display()))?;
    let repo = BotTokenRepo::new(db);

    match action {
        TokenAction::Issue { label } => {
            let issued = repo.issue(&label)?;
            println!("{}", issued.token.expose());
            eprintln!("issued token '{}'; it will not be shown again", issued.label);
        }
        TokenAction::Revoke { label } => {
            repo.revoke(&label)?;
            println!("revoked '{label}'");
        }
        TokenAction::List => {
            for row in repo.list()? {
                let status = match &row.revoked_at {
                    Some(at) => format!("revoked {at}"),
                    None => "active".to_string(),
                };
                println!("{}\t{}\t{}\t{}", row.id, row.label, row.created_at, status);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xhbot_telemetry::filter_directive;

    #[test]
    fn module_levels_come_from_settings() {
        let mut settings = ServerSettings::default();
        settings.logging.level = "warn".into();
        settings.logging.modules.insert("tower_http".into(), "debug".into());

        let config = telemetry_config(&settings).unwrap();
        assert_eq!(filter_directive(&config), "warn,tower_http=debug");
    }

    #[test]
    fn bad_module_level_is_rejected() {
        let mut settings = ServerSettings::default();
        settings.logging.modules.insert("xhbot_server".into(), "loud".into());
        assert!(matches!(
            telemetry_config(&settings),
            Err(TelemetryError::InvalidLevel(_))
        ));
    }
}
