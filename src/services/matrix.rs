//! Matrix client-server API.
//!
//! `matrix[s]://{user}:{password}@{homeserver}[:port]/#{alias}[/!{room_id}...]`
//! `matrix[s]://{homeserver}/#{alias}?token={access_token}`
//!
//! Password logins happen on first send and the access token is reused until
//! the homeserver rejects it. Room aliases are resolved once per instance.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::http::oauth::{IssuedToken, TokenCache};
use crate::http::pool::ClientClass;
use crate::http::response::{self, send_with_retry};
use crate::notifications::body::truncate;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext, attachment_summary};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{deliver_each, effective_format, escape_html, url_format};

const API: &str = "_matrix/client/v3";
const MAX_BODY: usize = 65000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixConfig {
    pub secure: bool,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// `#alias:server` or `!id:server`.
    pub rooms: Vec<String>,
    /// Send as `m.notice` (bots) instead of `m.text`.
    pub notice: bool,
    pub format: Option<BodyFormat>,
}

pub struct Matrix {
    ctx: ServiceContext,
    config: MatrixConfig,
    session: TokenCache,
    room_ids: DashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct DirectoryReply {
    room_id: String,
}

impl Matrix {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: MatrixConfig::default(),
            session: TokenCache::default(),
            room_ids: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    fn base(&self) -> String {
        let config = &self.config;
        let scheme = if config.secure { "https" } else { "http" };
        match config.port {
            Some(port) => format!("{scheme}://{}:{port}/{API}", config.host),
            None => format!("{scheme}://{}/{API}", config.host),
        }
    }

    /// Complete a bare room name with the homeserver, keeping explicit
    /// `#alias:server` and `!id:server` forms as given.
    fn normalize_room(room: &str, host: &str) -> String {
        let (sigil, name) = match room.chars().next() {
            Some(sigil @ ('#' | '!')) => (sigil, &room[1..]),
            _ => ('#', room),
        };
        if name.contains(':') {
            format!("{sigil}{name}")
        } else {
            format!("{sigil}{name}:{host}")
        }
    }

    pub(crate) fn build_content(&self, request: &NotificationRequest, summary: Option<&str>) -> Value {
        let msgtype = if self.config.notice { "m.notice" } else { "m.text" };
        let mut plain = request.title_and_body();
        if let Some(summary) = summary {
            plain.push_str("\n\n");
            plain.push_str(summary);
        }
        let plain = truncate(&plain, MAX_BODY);
        match effective_format(request, self.config.format) {
            BodyFormat::Text => json!({ "msgtype": msgtype, "body": plain }),
            format => {
                let body = match format {
                    BodyFormat::Html => request.body.clone(),
                    _ => escape_html(&request.body).replace('\n', "<br/>"),
                };
                let mut html = if request.title.trim().is_empty() {
                    body
                } else {
                    format!("<h4>{}</h4>{body}", escape_html(&request.title))
                };
                if let Some(summary) = summary {
                    html.push_str(&format!("<p>{}</p>", escape_html(summary).replace('\n', "<br/>")));
                }
                json!({
                    "msgtype": msgtype,
                    "body": plain,
                    "format": "org.matrix.custom.html",
                    "formatted_body": truncate(&html, MAX_BODY),
                })
            }
        }
    }

    async fn login(&self, client: &reqwest::Client) -> NotifyResult<IssuedToken> {
        let (Some(user), Some(password)) = (&self.config.user, &self.config.password) else {
            return Err(NotifyError::Auth {
                status: 401,
                body: "access token rejected and no password to log in with".to_string(),
            });
        };
        let payload = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user },
            "password": password,
            "initial_device_display_name": "herald",
        });
        let endpoint = format!("{}/login", self.base());
        let reply = send_with_retry(self.id(), || Ok(client.post(&endpoint).json(&payload))).await?;
        let reply: LoginReply = response::json(reply).await?;
        tracing::debug!(event = "matrix_login", host = %self.config.host, "logged in to homeserver");
        Ok(IssuedToken {
            token: reply.access_token,
            expires_in: None,
        })
    }

    async fn room_id(&self, client: &reqwest::Client, token: &str, room: &str) -> NotifyResult<String> {
        if room.starts_with('!') {
            return Ok(room.to_string());
        }
        if let Some(id) = self.room_ids.get(room) {
            return Ok(id.clone());
        }
        let endpoint = format!("{}/directory/room/{}", self.base(), urlencoding::encode(room));
        let reply = send_with_retry(self.id(), || Ok(client.get(&endpoint).bearer_auth(token))).await?;
        let reply: DirectoryReply = response::json(reply).await?;
        self.room_ids.insert(room.to_string(), reply.room_id.clone());
        Ok(reply.room_id)
    }

    async fn send_once(&self, client: &reqwest::Client, room: &str, content: &Value) -> NotifyResult<()> {
        let token = self.session.token(|| self.login(client)).await?;
        let room_id = self.room_id(client, &token, room).await?;
        let endpoint = format!(
            "{}/rooms/{}/send/m.room.message/{}",
            self.base(),
            urlencoding::encode(&room_id),
            uuid::Uuid::new_v4().simple()
        );
        send_with_retry(self.id(), || Ok(client.put(&endpoint).bearer_auth(&token).json(content))).await?;
        Ok(())
    }

    async fn send_to_room(&self, client: &reqwest::Client, room: &str, content: &Value) -> NotifyResult<()> {
        match self.send_once(client, room, content).await {
            Err(err) if err.is_auth() && self.config.password.is_some() => {
                tracing::debug!(event = "matrix_relogin", room = %room, "access token rejected; logging in again");
                self.session.invalidate();
                self.send_once(client, room, content).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl NotificationService for Matrix {
    fn id(&self) -> &'static str {
        "matrix"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let host = url.require_host()?.to_string();
        let token = url.param("token").map(str::to_string);
        if token.is_none() && (url.user.is_none() || url.password.is_none()) {
            return Err(NotifyError::url("matrix needs user:password@ or token="));
        }
        let mut rooms: Vec<String> = url.path.clone();
        rooms.extend(url.param_list("to"));
        if rooms.is_empty() {
            return Err(NotifyError::url("matrix needs at least one room"));
        }
        let rooms = rooms.iter().map(|room| Self::normalize_room(room, &host)).collect();
        let msgtype = url.param("msgtype").unwrap_or("text").to_ascii_lowercase();
        if !matches!(msgtype.as_str(), "text" | "notice") {
            return Err(NotifyError::url(format!("matrix msgtype must be text or notice, got '{msgtype}'")));
        }

        self.session = match &token {
            Some(token) => TokenCache::with_token(token.clone()),
            None => TokenCache::default(),
        };
        self.room_ids.clear();
        self.config = MatrixConfig {
            secure: url.secure_variant("matrix"),
            host,
            port: url.port,
            user: url.user.clone(),
            password: url.password.clone(),
            token,
            rooms,
            notice: msgtype == "notice",
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Default, self.id())?;
        let summary = attachment_summary(request).await;
        let content = self.build_content(request, summary.as_deref());
        deliver_each(self.id(), &self.config.rooms, |room| {
            let client = client.clone();
            let content = &content;
            async move { self.send_to_room(&client, room, content).await }
        })
        .await
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Metadata
    }

    fn max_body_length(&self) -> usize {
        MAX_BODY
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        UrlBuilder::new(if config.secure { "matrixs" } else { "matrix" })
            .user(config.user.as_deref())
            .password(config.password.as_deref())
            .host(&config.host)
            .port(config.port)
            .segments(&config.rooms)
            .param_opt("token", config.token.as_ref())
            .param_opt("msgtype", config.notice.then_some("notice"))
            .param_opt("format", config.format)
            .build()
    }
}
