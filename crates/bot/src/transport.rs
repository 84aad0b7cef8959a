use std::{
    fs,
    io::IsTerminal as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result, anyhow, bail};
use async_trait::async_trait;
use matrix_sdk::{
    Client, SessionMeta,
    authentication::{SessionTokens, matrix::MatrixSession},
    room::Room,
    ruma::{
        MilliSecondsSinceUnixEpoch,
        events::room::message::{MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent},
    },
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use bridge_core::{InboundMessage, sanitize_line};

use crate::{
    config::BotConfig,
    dispatch::{Dispatcher, ReplySink},
};

/// Homeserver credentials and where the E2EE state lives.
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub homeserver: String,
    pub username: String,
    pub password: Option<String>,
    pub store: PathBuf,
    pub session_file: PathBuf,
    pub device_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedSession {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user_id: String,
    device_id: String,
}

/// Builds a client backed by the SQLite store and either restores the saved
/// session or logs in with a password.
pub async fn connect(opts: &LoginOptions) -> Result<Client> {
    fs::create_dir_all(&opts.store)
        .with_context(|| format!("creating store directory at {}", opts.store.display()))?;

    let client = Client::builder()
        .homeserver_url(&opts.homeserver)
        .handle_refresh_tokens()
        .sqlite_store(&opts.store, None)
        .build()
        .await
        .context("building matrix client")?;

    if let Some(saved) = load_session(&opts.session_file)? {
        info!(user = %saved.user_id, "Restoring session");
        let session = MatrixSession {
            meta: SessionMeta {
                user_id: saved.user_id.parse().context("invalid stored user_id")?,
                device_id: saved.device_id.into(),
            },
            tokens: SessionTokens {
                access_token: saved.access_token,
                refresh_token: saved.refresh_token,
            },
        };
        client
            .restore_session(session)
            .await
            .context("restoring session")?;
        return Ok(client);
    }

    let password = resolve_password(opts)?;
    info!(user = %opts.username, "Logging in");
    let response = client
        .matrix_auth()
        .login_username(&opts.username, &password)
        .initial_device_display_name(&opts.device_name)
        .request_refresh_token()
        .send()
        .await
        .context("login failed")?;

    let saved = SavedSession {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        user_id: response.user_id.to_string(),
        device_id: response.device_id.to_string(),
    };
    save_session(&opts.session_file, &saved)?;
    info!(user = %saved.user_id, device = %saved.device_id, "Logged in");
    Ok(client)
}

/// Empty values count as missing; prompting only happens on a terminal.
fn resolve_password(opts: &LoginOptions) -> Result<String> {
    if let Some(p) = opts
        .password
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Ok(p.to_owned());
    }
    if !std::io::stdin().is_terminal() {
        bail!(
            "no MATRIX_PASSWORD and no stored session; set MATRIX_PASSWORD or provide a session file at {}",
            opts.session_file.display()
        );
    }
    warn!("No password provided via --password or MATRIX_PASSWORD. Prompting...");
    #[cfg(feature = "rpassword")]
    {
        rpassword::prompt_password("Matrix password:")
            .map_err(|e| anyhow!("failed to read password: {e}"))
    }
    #[cfg(not(feature = "rpassword"))]
    {
        Err(anyhow!("rpassword feature is not enabled; cannot prompt for password"))
    }
}

fn load_session(path: &Path) -> Result<Option<SavedSession>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading session file at {}", path.display()))?;
    let session = serde_json::from_str(&data).context("parsing session JSON")?;
    Ok(Some(session))
}

fn save_session(path: &Path, session: &SavedSession) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(session)?;
    fs::write(path, data).with_context(|| format!("writing session file at {}", path.display()))
}

/// Replies land in the room the message came from.
#[derive(Debug, Clone)]
pub struct RoomSink {
    room: Room,
}

impl RoomSink {
    pub const fn new(room: Room) -> Self {
        Self { room }
    }
}

#[async_trait]
impl ReplySink for RoomSink {
    async fn typing(&self, active: bool) {
        if let Err(e) = self.room.typing_notice(active).await {
            debug!(room_id = %self.room.room_id(), error = %e, "Typing notice failed");
        }
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.room
            .send(RoomMessageEventContent::text_plain(text))
            .await
            .context("sending reply")?;
        Ok(())
    }
}

/// Only plain text and notices carry commands.
pub fn message_body(msgtype: &MessageType) -> Option<&str> {
    match msgtype {
        MessageType::Text(t) => Some(t.body.as_str()),
        MessageType::Notice(n) => Some(n.body.as_str()),
        MessageType::Audio(_)
        | MessageType::Emote(_)
        | MessageType::File(_)
        | MessageType::Image(_)
        | MessageType::Location(_)
        | MessageType::ServerNotice(_)
        | MessageType::Video(_)
        | MessageType::VerificationRequest(_)
        | _ => None,
    }
}

pub fn event_time(ts: MilliSecondsSinceUnixEpoch) -> OffsetDateTime {
    let nanos = i128::from(u64::from(ts.get())) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Filters one room event and hands it to the dispatcher. Events from before
/// `started` are replays from the sync cache and are never executed.
pub fn on_room_message(
    ev: &OriginalSyncRoomMessageEvent,
    room: Room,
    client: &Client,
    dispatcher: &Dispatcher,
    config: &BotConfig,
    started: MilliSecondsSinceUnixEpoch,
) {
    let Some(own_id) = client.user_id() else {
        return;
    };
    if ev.sender == own_id {
        return;
    }
    if ev.origin_server_ts < started {
        debug!(event = %ev.event_id, "Skipping event from before startup");
        return;
    }
    if !config.answers_in(room.room_id().as_str()) {
        debug!(room_id = %room.room_id(), "Room not in allowlist");
        return;
    }
    let Some(body) = message_body(&ev.content.msgtype) else {
        return;
    };

    info!(
        room_id = %room.room_id(),
        sender = %ev.sender,
        body = %sanitize_line(body, 200),
        "Incoming message"
    );
    let message = InboundMessage {
        user_key: ev.sender.to_string(),
        text: body.to_owned(),
        timestamp: event_time(ev.origin_server_ts),
    };
    dispatcher.submit(message, Arc::new(RoomSink::new(room)));
}

#[cfg(test)]
mod tests {
    use matrix_sdk::ruma::UInt;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn only_text_and_notice_are_read() {
        assert_eq!(message_body(&MessageType::text_plain("!ls")), Some("!ls"));
        assert_eq!(message_body(&MessageType::notice_plain("hi")), Some("hi"));
    }

    #[test]
    fn converts_server_timestamp() {
        let ts = MilliSecondsSinceUnixEpoch(UInt::new(1_700_000_000_123).unwrap());
        assert_eq!(event_time(ts), datetime!(2023-11-14 22:13:20.123 UTC));
    }

    #[test]
    fn session_file_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/session.json");
        assert!(load_session(&path).unwrap().is_none());

        let saved = SavedSession {
            access_token: "tok".to_owned(),
            refresh_token: None,
            user_id: "@bot:example.org".to_owned(),
            device_id: "DEV".to_owned(),
        };
        save_session(&path, &saved).unwrap();
        let loaded = load_session(&path).unwrap().unwrap();
        assert_eq!(loaded.user_id, "@bot:example.org");
        assert_eq!(loaded.access_token, "tok");
    }
}
