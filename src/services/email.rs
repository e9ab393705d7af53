//! SMTP email.
//!
//! `mailto://[user:password@]smtp.example.com[:port]/[to@example.com...][?from=&name=&cc=&bcc=&mode=]`
//!
//! `mailtos://` connects with implicit TLS (port 465 by default). `mailto://`
//! upgrades with STARTTLS when the server offers it, or always with
//! `mode=starttls`; `mode=none` disables TLS. One message is sent per
//! recipient.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{deliver_each, effective_format, url_format};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Implicit TLS from the first byte.
    Wrapper,
    /// STARTTLS if offered.
    #[default]
    Opportunistic,
    /// STARTTLS or fail.
    Required,
    None,
}

impl TlsMode {
    fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Wrapper => "ssl",
            TlsMode::Opportunistic => "auto",
            TlsMode::Required => "starttls",
            TlsMode::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailConfig {
    pub secure: bool,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub tls: TlsMode,
    pub format: Option<BodyFormat>,
}

impl EmailConfig {
    fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.tls {
            TlsMode::Wrapper => 465,
            TlsMode::None => 25,
            _ => 587,
        })
    }
}

#[derive(Default)]
pub struct Email {
    config: EmailConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Email {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    fn build_transport(config: &EmailConfig) -> NotifyResult<AsyncSmtpTransport<Tokio1Executor>> {
        let params = || {
            TlsParameters::new(config.host.clone())
                .map_err(|err| NotifyError::config(format!("invalid TLS parameters: {err}")))
        };
        let tls = match config.tls {
            TlsMode::Wrapper => Tls::Wrapper(params()?),
            TlsMode::Opportunistic => Tls::Opportunistic(params()?),
            TlsMode::Required => Tls::Required(params()?),
            TlsMode::None => Tls::None,
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
            .port(config.effective_port())
            .tls(tls)
            .timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(builder.build())
    }

    fn mailbox(address: &str, name: Option<&str>) -> NotifyResult<Mailbox> {
        let address: Address = address
            .parse()
            .map_err(|err| NotifyError::config(format!("invalid email address '{address}': {err}")))?;
        Ok(Mailbox::new(name.map(str::to_string), address))
    }

    pub(crate) async fn build_message(&self, request: &NotificationRequest, recipient: &str) -> NotifyResult<Message> {
        let config = &self.config;
        let mut builder = Message::builder()
            .from(Self::mailbox(&config.from, config.from_name.as_deref())?)
            .to(Self::mailbox(recipient, None)?)
            .subject(if request.title.trim().is_empty() {
                format!("{} notification", request.notify_type)
            } else {
                request.title.clone()
            });
        for cc in &config.cc {
            builder = builder.cc(Self::mailbox(cc, None)?);
        }
        for bcc in &config.bcc {
            builder = builder.bcc(Self::mailbox(bcc, None)?);
        }

        let text_part = match effective_format(request, config.format) {
            BodyFormat::Html => SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(request.body.clone()),
            _ => SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(request.body.clone()),
        };
        if request.attachments.is_empty() {
            return builder.singlepart(text_part).map_err(build_error);
        }
        let mut multipart = MultiPart::mixed().singlepart(text_part);
        for attachment in &request.attachments {
            let mime = attachment.mime_type().await?;
            let content_type = ContentType::parse(&mime)
                .or_else(|_| ContentType::parse(crate::attachments::mime::OCTET_STREAM))
                .map_err(|err| NotifyError::config(err.to_string()))?;
            let bytes = attachment.read().await?;
            multipart = multipart.singlepart(
                MailAttachment::new(attachment.name().to_string()).body(bytes.to_vec(), content_type),
            );
        }
        builder.multipart(multipart).map_err(build_error)
    }
}

fn build_error(err: lettre::error::Error) -> NotifyError {
    NotifyError::config(format!("failed to build email: {err}"))
}

fn smtp_error(err: lettre::transport::smtp::Error) -> NotifyError {
    let status = err
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());
    match status {
        Some(status @ (530 | 535)) => NotifyError::Auth {
            status,
            body: err.to_string(),
        },
        Some(status) if err.is_permanent() => NotifyError::Provider {
            status,
            body: err.to_string(),
        },
        _ => NotifyError::Transport(err.to_string()),
    }
}

#[async_trait]
impl NotificationService for Email {
    fn id(&self) -> &'static str {
        "mailto"
    }

    fn default_port(&self) -> Option<u16> {
        Some(self.config.effective_port())
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let host = url.require_host()?.to_string();
        let secure = url.scheme == "mailtos";
        let tls = match url.param("mode").map(str::to_ascii_lowercase).as_deref() {
            _ if secure => TlsMode::Wrapper,
            None | Some("auto") => TlsMode::Opportunistic,
            Some("ssl") | Some("tls") => TlsMode::Wrapper,
            Some("starttls") => TlsMode::Required,
            Some("none") | Some("insecure") => TlsMode::None,
            Some(other) => return Err(NotifyError::url(format!("unknown mail mode '{other}'"))),
        };

        let from = match (url.param("from"), url.user.as_deref()) {
            (Some(from), _) => from.to_string(),
            (None, Some(user)) if user.contains('@') => user.to_string(),
            (None, Some(user)) => format!("{user}@{host}"),
            (None, None) => return Err(NotifyError::url("mailto needs a user or from= address")),
        };
        let mut to: Vec<String> = url.path.iter().filter(|s| s.contains('@')).cloned().collect();
        to.extend(url.param_list("to"));
        if to.is_empty() {
            to.push(from.clone());
        }

        let config = EmailConfig {
            secure,
            host,
            port: url.port,
            user: url.user.clone(),
            password: url.password.clone(),
            from,
            from_name: url.param("name").map(str::to_string),
            to,
            cc: url.param_list("cc"),
            bcc: url.param_list("bcc"),
            tls,
            format: url_format(url)?,
        };
        for address in config.to.iter().chain(&config.cc).chain(&config.bcc).chain([&config.from]) {
            Self::mailbox(address, None)?;
        }
        self.transport = Some(Self::build_transport(&config)?);
        self.config = config;
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| NotifyError::config("mailto service used before configuration"))?;
        deliver_each(self.id(), &self.config.to, |recipient| async move {
            let message = self.build_message(request, recipient).await?;
            transport.send(message).await.map_err(smtp_error)?;
            Ok(())
        })
        .await
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Content
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        let scheme = if config.secure { "mailtos" } else { "mailto" };
        let default_from = config
            .user
            .as_ref()
            .map(|user| if user.contains('@') { user.clone() } else { format!("{user}@{}", config.host) });
        let list = |items: &[String]| (!items.is_empty()).then(|| items.join(","));
        UrlBuilder::new(scheme)
            .user(config.user.as_deref())
            .password(config.password.as_deref())
            .host(&config.host)
            .port(config.port)
            .segments(&config.to)
            .param_opt("from", (default_from.as_ref() != Some(&config.from)).then_some(&config.from))
            .param_opt("name", config.from_name.as_ref())
            .param_opt("cc", list(&config.cc))
            .param_opt("bcc", list(&config.bcc))
            .param_opt(
                "mode",
                (!config.secure && config.tls != TlsMode::Opportunistic).then(|| config.tls.as_str()),
            )
            .param_opt("format", config.format)
            .build()
    }
}
