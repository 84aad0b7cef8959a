mod config;
mod dispatch;
mod logging;
mod transport;

use core::time::Duration;
use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use matrix_sdk::{
    Client,
    config::SyncSettings,
    room::Room,
    ruma::{
        MilliSecondsSinceUnixEpoch,
        events::room::{
            member::{MembershipState, StrippedRoomMemberEvent},
            message::OriginalSyncRoomMessageEvent,
        },
    },
};
use tracing::{info, warn};

use bridge_core::{Router, SessionStore, ShellExecutor};

use crate::{
    config::load_config,
    dispatch::Dispatcher,
    logging::init_tracing,
    transport::{LoginOptions, connect, on_room_message},
};

#[derive(Parser, Debug)]
#[command(
    name = "matrix-cli-bridge",
    version,
    about = "Chat bridge that runs shell commands and AI-delegated coding tasks per user"
)]
struct Args {
    /// Homeserver base URL, e.g. `https://matrix-client.matrix.org`.
    #[arg(long, env = "MATRIX_HOMESERVER")]
    homeserver: String,

    /// Username (localpart or full user ID)
    #[arg(long, env = "MATRIX_USERNAME")]
    username: String,

    /// Password (if omitted, will prompt if needed)
    #[arg(long, env = "MATRIX_PASSWORD")]
    password: Option<String>,

    /// Directory for persistent state (encryption keys, sync cache, user sessions)
    #[arg(long, env = "MATRIX_STORE", default_value = "./bot-store")]
    store: PathBuf,

    /// JSON session file for access token/device info
    #[arg(long, env = "MATRIX_SESSION_FILE", default_value = "./session.json")]
    session_file: PathBuf,

    /// Device display name
    #[arg(long, env = "MATRIX_DEVICE_NAME", default_value = "matrix-cli-bridge")]
    device_name: String,

    /// Path to the YAML bridge config
    #[arg(long, env = "BRIDGE_CONFIG", default_value = "./config.yaml")]
    config: PathBuf,

    /// Disable auto-joining rooms when invited
    #[arg(long)]
    no_autojoin: bool,

    /// Sync timeout in milliseconds
    #[arg(long, env = "MATRIX_SYNC_TIMEOUT_MS", default_value_t = 30000)]
    sync_timeout_ms: u64,
}

impl Args {
    fn login_options(&self) -> LoginOptions {
        LoginOptions {
            homeserver: self.homeserver.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            store: self.store.clone(),
            session_file: self.session_file.clone(),
            device_name: self.device_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present so clap can pick up env vars.
    let _ = dotenvy::dotenv();
    init_tracing()?;
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let default_root = config.default_root()?;
    let store = SessionStore::open(args.store.join("sessions"), default_root)
        .await
        .context("opening session store")?;
    let executor = ShellExecutor::new(&config.executor);
    let ai = bridge_ai::build_client(&config.ai)?;
    let router = Router::new(
        Arc::new(store),
        Arc::new(executor),
        ai,
        config.router_config(),
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(router)));
    let config = Arc::new(config);

    let client = connect(&args.login_options()).await?;
    let started = MilliSecondsSinceUnixEpoch::now();

    if !args.no_autojoin {
        client.add_event_handler(|ev: StrippedRoomMemberEvent, room: Room, client: Client| async move {
            if ev.content.membership != MembershipState::Invite {
                return;
            }
            let Some(own_id) = client.user_id() else {
                return;
            };
            if ev.state_key != own_id.as_str() {
                return;
            }
            info!(room_id = %room.room_id(), "Auto-joining invited room");
            if let Err(e) = room.join().await {
                warn!(error = %e, "Failed to accept invite");
            }
        });
    }

    client.add_event_handler(
        move |ev: OriginalSyncRoomMessageEvent, room: Room, client: Client| {
            let dispatcher = Arc::clone(&dispatcher);
            let config = Arc::clone(&config);
            async move {
                on_room_message(&ev, room, &client, &dispatcher, &config, started);
            }
        },
    );

    info!(
        timeout_ms = args.sync_timeout_ms,
        "Starting sync… Press Ctrl+C to stop."
    );
    let settings = SyncSettings::new().timeout(Duration::from_millis(args.sync_timeout_ms));
    tokio::select! {
        res = client.sync(settings) => res.map_err(|e| anyhow!("sync terminated: {e}")),
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl+C")?;
            info!("Shutting down");
            Ok(())
        }
    }
}
