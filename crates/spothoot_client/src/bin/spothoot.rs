//! spothoot: command-line front end for the SpotHoot proxy.
//! Reads config, connects to the WebSocket server, waits for readiness, runs
//! one command and prints the reply to stdout.

use clap::{Parser, Subcommand};
use spothoot_client::config::{self, Config};
use spothoot_client::{
    FileStore, MemoryStore, Proxy, ProxyOptions, ReplyData, SessionRecord, SessionStore,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "spothoot", about = "SpotHoot quiz service client")]
struct Cli {
    /// Config file; falls back to ~/.spothoot/config.yaml when present.
    #[arg(long, env = "SPOTHOOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the provider authorization URL.
    LoginUrl,
    /// Exchange an authorization code for a user session.
    Login { code: String },
    Logout,
    /// Print the restored session, if any.
    Whoami,
    Users,
    Playlists,
    CreateQuiz {
        playlist: String,
        nbr_of_songs: u32,
        #[arg(required = true)]
        user_ids: Vec<i64>,
    },
    /// Print every server-pushed event on a topic until the connection closes.
    Watch { event: String },
}

fn load_config(explicit: Option<PathBuf>) -> Config {
    if let Some(path) = explicit {
        return config::load(&path).unwrap_or_else(|e| {
            fail(format!("failed to load config from {}: {}", path.display(), e))
        });
    }
    match config::default_config_path() {
        Some(path) if path.exists() => config::load(&path).unwrap_or_else(|e| {
            fail(format!("failed to load config from {}: {}", path.display(), e))
        }),
        _ => Config::default(),
    }
}

fn print_reply(reply: &ReplyData) {
    match reply {
        ReplyData::Raw(s) => println!("{}", s),
        ReplyData::Parsed(v) => {
            println!("{}", serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()))
        }
    }
}

fn print_user(user: &SessionRecord) {
    print_reply(&ReplyData::Parsed(serde_json::Value::Object(
        user.as_map().clone(),
    )));
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    process::exit(1);
}

async fn run(proxy: &Proxy, command: Command) -> Result<(), String> {
    match command {
        Command::LoginUrl => {
            let url = proxy.get_login_url().await.map_err(|e| e.to_string())?;
            println!("{}", url);
        }
        Command::Login { code } => {
            let user = proxy.login(&code).await.map_err(|e| e.to_string())?;
            if !user.is_logged_in() {
                return Err("login rejected".to_string());
            }
            print_user(&user);
        }
        Command::Logout => proxy.logout().map_err(|e| e.to_string())?,
        Command::Whoami => {
            let user = proxy.user();
            if user.is_logged_in() {
                print_user(&user);
            } else {
                println!("not logged in");
            }
        }
        Command::Users => print_reply(&proxy.get_users().await.map_err(|e| e.to_string())?),
        Command::Playlists => {
            print_reply(&proxy.get_playlists().await.map_err(|e| e.to_string())?)
        }
        Command::CreateQuiz {
            playlist,
            nbr_of_songs,
            user_ids,
        } => {
            let quiz = proxy
                .create_quiz(&user_ids, &playlist, nbr_of_songs)
                .await
                .map_err(|e| e.to_string())?;
            print_reply(&quiz);
        }
        Command::Watch { event } => {
            let mut sub = proxy.subscribe(&event);
            let closed = proxy.closed();
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    got = sub.recv() => match got {
                        Some(envelope) => print_reply(&ReplyData::from_value(envelope.data)),
                        None => break,
                    },
                    res = &mut closed => {
                        res.map_err(|e| e.to_string())?;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config(cli.config);
    let store: Arc<dyn SessionStore> = match &cfg.session.storage_file {
        Some(path) => Arc::new(FileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let proxy = Proxy::with_options(store, ProxyOptions::from(&cfg));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fail(format!("failed to create runtime: {}", e)));

    rt.block_on(async {
        let mut ready = proxy.subscribe(spothoot_client::SERVICE_READY);
        if let Err(e) = proxy.connect(cfg.server_url()).await {
            fail(format!("connection failed: {}", e));
        }
        ready.recv().await;
        tracing::debug!(command = ?cli.command, "running command");

        let result = run(&proxy, cli.command).await;
        proxy.shutdown().await;
        if let Err(e) = result {
            fail(e);
        }
    });
}
