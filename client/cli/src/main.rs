use alistnav::transfer::safe_name;
use alistnav::{Attachment, Inbound, Navigator, Outbox, Reply, Settings};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "alistnav")]
#[command(about = "Browse and transfer Alist files with numbered listings", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat-style session on stdin/stdout
    Console {
        /// User id the session acts as
        #[arg(long, default_value = "console")]
        user: String,
        /// Copy downloaded files here before they are cleaned up
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
    /// Drop cached listings
    ClearCache {
        /// Only this user's listings
        #[arg(long)]
        user: Option<String>,
    },
    /// Write the current settings to the settings file
    InitConfig,
    /// Show where settings and data live
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alistnav=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        None => console(settings, "console".to_string(), None).await?,
        Some(Commands::Console { user, save_dir }) => console(settings, user, save_dir).await?,
        Some(Commands::ClearCache { user }) => {
            let navigator = Navigator::new(settings);
            let removed = navigator.cache().clear(user.as_deref());
            println!("removed {} cached listings", removed);
        }
        Some(Commands::InitConfig) => {
            settings.save(cli.config.as_deref())?;
            match &cli.config {
                Some(path) => println!("wrote {}", path.display()),
                None => println!("wrote {}", Settings::config_path()?.display()),
            }
        }
        Some(Commands::Status) => status(&settings, cli.config.as_deref())?,
    }

    Ok(())
}

fn status(settings: &Settings, config: Option<&Path>) -> anyhow::Result<()> {
    let config_path = match config {
        Some(path) => path.to_path_buf(),
        None => Settings::config_path()?,
    };
    println!("settings: {}", config_path.display());
    println!("data: {}", settings.data_dir().display());
    if settings.default_alist_url.is_empty() {
        println!("server: (not set)");
    } else {
        println!("server: {}", settings.default_alist_url);
    }
    println!(
        "mode: {}",
        if settings.require_user_auth {
            "per-user"
        } else {
            "shared"
        }
    );
    Ok(())
}

/// `:file <path>` and `:image <path>` stand in for chat attachments.
fn console_event(user: &str, line: &str) -> Inbound {
    if let Some(path) = line.strip_prefix(":file ") {
        let path = PathBuf::from(path.trim());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        return Inbound::attachment(user, Attachment::File { name, path });
    }
    if let Some(path) = line.strip_prefix(":image ") {
        let path = PathBuf::from(path.trim());
        return Inbound::attachment(user, Attachment::Image { path });
    }
    Inbound::command(user, line)
}

async fn console(settings: Settings, user: String, save_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let navigator = Arc::new(Navigator::new(settings));
    let (outbox, mut rx) = Outbox::channel(64);

    let printer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            print_reply(reply, save_dir.as_deref()).await;
        }
    });

    println!("alistnav console as {}. type help, :exit to leave", user);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":exit" {
            break;
        }

        let event = console_event(&user, line);
        let navigator = Arc::clone(&navigator);
        let outbox = outbox.clone();
        tasks.spawn(async move { navigator.handle(event, &outbox).await });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("handler task failed: {}", e);
        }
    }
    drop(outbox);
    printer.await?;
    Ok(())
}

/// Names come from the server, so they are cleaned before touching disk.
fn save_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(safe_name(name))
}

async fn print_reply(reply: Reply, save_dir: Option<&Path>) {
    match reply {
        Reply::Text(text) => println!("{}\n", text),
        Reply::File { name, path } => match save_dir {
            Some(dir) => {
                let dest = save_path(dir, &name);
                match tokio::fs::copy(&path, &dest).await {
                    Ok(_) => println!("saved {}\n", dest.display()),
                    Err(e) => println!("could not save {}: {}\n", name, e),
                }
            }
            None => println!("file ready: {} ({})\n", name, path.display()),
        },
    }
}
