mod console;

use anyhow::Context;
use clap::Parser;
use config::{ClientSettings, PathManager, Settings, load_env_file};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use storefront_core::{
    ChatController, Collaborators, ControllerConfig, ControllerEvent, DiagnosticSink,
    FileHistoryStore, HttpTransport, SkipReason,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use console::{ConsoleHost, Renderer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal client for the storefront assistant", long_about = None)]
struct Args {
    /// Base URL of the storefront API (e.g. http://localhost:8000/api)
    #[arg(long, env = "STOREFRONT_API_URL")]
    api_url: Option<String>,

    /// LLM provider the backend should use
    #[arg(long, env = "STOREFRONT_PROVIDER")]
    provider: Option<String>,

    /// Keep a separate saved conversation per scope (e.g. a user id)
    #[arg(long)]
    scope: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Store an API key (encrypted) in the settings file and exit
    #[arg(long, value_name = "KEY")]
    set_api_key: Option<String>,

    /// Remove the stored API key and exit
    #[arg(long)]
    forget_api_key: bool,

    /// Print frames the client skipped
    #[arg(long, short)]
    verbose: bool,
}

fn setup_logging() -> anyhow::Result<WorkerGuard> {
    // Debug builds log to ./storefront-assistant.log, recreated on each run.
    // Release builds use the logs directory with daily rotation.
    #[cfg(debug_assertions)]
    let (non_blocking, guard) = {
        let path = PathBuf::from("./storefront-assistant.log");
        let _ = std::fs::remove_file(&path);
        let file = std::fs::File::create(&path)?;
        tracing_appender::non_blocking(file)
    };

    #[cfg(not(debug_assertions))]
    let (non_blocking, guard) = {
        let log_dir = PathManager::logs_dir().unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            &log_dir,
            "assistant.log",
        );
        tracing_appender::non_blocking(file_appender)
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Ok(guard)
}

/// Handle the credential flags. Returns true when the program should exit.
fn manage_api_key(args: &Args) -> anyhow::Result<bool> {
    if args.set_api_key.is_none() && !args.forget_api_key {
        return Ok(false);
    }
    let mut settings = Settings::load();
    if let Some(key) = &args.set_api_key {
        settings.set_api_key(key).map_err(anyhow::Error::msg)?;
        settings.save().map_err(anyhow::Error::msg)?;
        println!("API key saved.");
    } else {
        settings.remove_api_key();
        settings.save().map_err(anyhow::Error::msg)?;
        println!("API key removed.");
    }
    Ok(true)
}

fn client_settings(args: &Args) -> ClientSettings {
    let mut client = ClientSettings::from_env(&Settings::load());
    if let Some(url) = &args.api_url {
        client.backend_url = url.trim_end_matches('/').to_string();
    }
    if let Some(provider) = &args.provider {
        client.provider = provider.clone();
    }
    if let Some(scope) = &args.scope {
        client.storage_scope = Some(scope.clone());
    }
    client
}

// Slash command parsing and handling
mod commands {
    pub enum Command {
        Quit,
        Help,
        Cancel,
        Clear,
        Stats,
        Go,
    }

    impl Command {
        pub fn parse(input: &str) -> Result<Self, String> {
            let Some(name) = input.strip_prefix('/') else {
                return Err("Not a command".to_string());
            };
            match name.split_whitespace().next().unwrap_or_default() {
                "quit" | "exit" => Ok(Command::Quit),
                "help" => Ok(Command::Help),
                "cancel" => Ok(Command::Cancel),
                "clear" => Ok(Command::Clear),
                "stats" => Ok(Command::Stats),
                "go" => Ok(Command::Go),
                "" => Err("Empty command".to_string()),
                other => Err(format!(
                    "Unknown command: /{}. Type /help for available commands.",
                    other
                )),
            }
        }
    }

    pub fn print_help() {
        println!("Available commands:");
        println!("  /cancel                - Stop the reply being streamed");
        println!("  /clear                 - Clear the conversation");
        println!("  /stats                 - Show backend status");
        println!("  /go                    - Follow the last offered link (sign in, checkout)");
        println!("  /quit, /exit           - Exit");
        println!("  /help                  - Show this help message");
        println!("  Ctrl+D                 - Exit");
    }

}

enum Input {
    Line(Option<String>),
    Event(Option<ControllerEvent>),
}

fn prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file();
    let args = Args::parse();
    if let Some(dir) = &args.data_dir {
        PathManager::set_data_dir(dir.clone());
    }
    if manage_api_key(&args)? {
        return Ok(());
    }

    PathManager::ensure_dirs_exist().context("Failed to create data directories")?;
    let _guard = setup_logging()?;
    tracing::info!("Starting storefront assistant");

    let client = client_settings(&args);
    let transport = Arc::new(HttpTransport::new(&client.backend_url)?);
    let store = Arc::new(FileHistoryStore::in_data_dir(
        client.storage_scope.as_deref(),
        client.retention_limit,
    )?);
    let host = Arc::new(ConsoleHost::default());
    let diagnostics: Option<Arc<dyn DiagnosticSink>> = if args.verbose {
        Some(Arc::new(|reason: &SkipReason| eprintln!("\n  [skipped] {reason}")))
    } else {
        None
    };
    let collaborators = Collaborators {
        cart: host.clone(),
        notifier: host.clone(),
        diagnostics,
    };
    let mut controller = ChatController::restore(
        transport,
        store,
        collaborators,
        ControllerConfig::from(&client),
    )
    .await;

    println!("Storefront assistant at {} ({})", client.backend_url, client.provider);
    println!("Type /help for commands, Ctrl+D or /quit to exit.");

    let mut renderer = Renderer::default();
    renderer.render(&controller.messages())?;
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            event = controller.next_event() => Input::Event(event),
        };

        match input {
            Input::Event(Some(ControllerEvent::LogChanged)) => {
                renderer.render(&controller.messages())?;
            }
            Input::Event(Some(ControllerEvent::Settled)) => prompt(),
            Input::Event(Some(ControllerEvent::Cleared)) => {
                renderer.reset();
                println!("\n--- conversation cleared ---");
            }
            // Already printed by the console notifier
            Input::Event(Some(ControllerEvent::Notice(_))) => {}
            Input::Event(None) => break,
            Input::Line(None) => {
                println!();
                println!("Goodbye!");
                break;
            }
            Input::Line(Some(line)) => {
                let input = line.trim();
                if input.is_empty() {
                    prompt();
                    continue;
                }
                if input.starts_with('/') {
                    match commands::Command::parse(input) {
                        Ok(commands::Command::Quit) => {
                            println!("Goodbye!");
                            break;
                        }
                        Ok(commands::Command::Help) => commands::print_help(),
                        Ok(commands::Command::Cancel) => {
                            if !controller.cancel().await {
                                println!("Nothing to cancel.");
                            }
                            continue;
                        }
                        Ok(commands::Command::Clear) => {
                            let interrupted = controller.is_active();
                            if let Err(e) = controller.clear().await {
                                eprintln!("Failed to clear history: {e:#}");
                            }
                            // an interrupted reply re-prompts on Settled
                            if interrupted {
                                continue;
                            }
                        }
                        Ok(commands::Command::Stats) => match controller.stats().await {
                            Ok(stats) => println!("{}", serde_json_pretty(&stats)),
                            Err(e) => eprintln!("Error: {e:#}"),
                        },
                        Ok(commands::Command::Go) => match host.take_action() {
                            Some(action) => action.follow(host.as_ref()),
                            None => println!("No pending link."),
                        },
                        Err(err) => println!("{}", err),
                    }
                    if !controller.is_active() {
                        prompt();
                    }
                    continue;
                }

                if !controller.submit(input) {
                    println!("Still answering; type /cancel to stop it.");
                }
            }
        }
    }

    let saved = controller.messages().len();
    tracing::info!(messages = saved, "Exiting storefront assistant");
    Ok(())
}

fn serde_json_pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
