//! AWS SNS text messages.
//!
//! `aws-sns-sms://{access_key}:{secret_key}@{region}/{+phone}[/{+phone}...][?from=SenderID]`
//!
//! Requests are signed with AWS Signature Version 4 unless `proxy=` hands
//! them to a relay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::http::pool::ClientClass;
use crate::http::proxy::ProxyConfig;
use crate::http::response::send_with_retry;
use crate::notifications::body::truncate;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{NotificationService, ServiceContext};
use crate::notifications::types::NotificationRequest;
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{deliver_each, required};

const SERVICE: &str = "sns";
const API_VERSION: &str = "2010-03-31";
/// One SMS segment; SNS splits longer texts and bills each part.
const MAX_BODY: usize = 140;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnsConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub phones: Vec<String>,
    pub sender_id: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

pub struct Sns {
    ctx: ServiceContext,
    config: SnsConfig,
}

fn hmac_sha256(key: &[u8], data: &str) -> NotifyResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| NotifyError::config(format!("invalid signing key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Derive the SigV4 signing key for one day, region and service.
pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> NotifyResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    hmac_sha256(&k_service, "aws4_request")
}

/// Headers for a signed form POST to `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

pub(crate) fn sign_form_post(
    access_key: &str,
    secret_key: &str,
    region: &str,
    host: &str,
    body: &str,
    now: DateTime<Utc>,
) -> NotifyResult<Signature> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let content_type = "application/x-www-form-urlencoded; charset=utf-8";
    let signed_headers = "content-type;host;x-amz-date";
    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{content_type}\nhost:{host}\nx-amz-date:{amz_date}\n\n{signed_headers}\n{}",
        sha256_hex(body)
    );
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(&canonical_request)
    );
    let key = signing_key(secret_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, &string_to_sign)?);
    Ok(Signature {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}"
        ),
    })
}

fn form_encode(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_phone(value: &str) -> bool {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    (10..=15).contains(&digits.len())
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')' | '.'))
}

/// E.164 with the punctuation removed.
fn normalize_phone(value: &str) -> String {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

impl Sns {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: SnsConfig::default(),
        }
    }

    pub fn config(&self) -> &SnsConfig {
        &self.config
    }

    fn host(&self) -> String {
        format!("sns.{}.amazonaws.com", self.config.region)
    }

    pub(crate) fn publish_body(&self, phone: &str, message: &str) -> String {
        let mut fields = vec![
            ("Action", "Publish"),
            ("Message", message),
            ("PhoneNumber", phone),
            ("Version", API_VERSION),
        ];
        if let Some(sender) = &self.config.sender_id {
            fields.push(("MessageAttributes.entry.1.Name", "AWS.SNS.SMS.SenderID"));
            fields.push(("MessageAttributes.entry.1.Value.DataType", "String"));
            fields.push(("MessageAttributes.entry.1.Value.StringValue", sender));
        }
        form_encode(&fields)
    }

    async fn publish(&self, client: &reqwest::Client, phone: &str, message: &str) -> NotifyResult<()> {
        if let Some(proxy) = &self.config.proxy {
            let envelope = proxy.envelope(
                SERVICE,
                json!({
                    "access_key_id": self.config.access_key,
                    "secret_access_key": self.config.secret_key,
                    "region": self.config.region,
                }),
                json!({
                    "PhoneNumber": phone,
                    "Message": message,
                    "SenderID": self.config.sender_id,
                }),
            );
            return proxy.send(client, &envelope).await;
        }

        let host = self.host();
        let endpoint = format!("https://{host}/");
        let body = self.publish_body(phone, message);
        send_with_retry(self.id(), || {
            let signature = sign_form_post(
                &self.config.access_key,
                &self.config.secret_key,
                &self.config.region,
                &host,
                &body,
                Utc::now(),
            )?;
            Ok(client
                .post(&endpoint)
                .header("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")
                .header("X-Amz-Date", signature.amz_date)
                .header("Authorization", signature.authorization)
                .body(body.clone()))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationService for Sns {
    fn id(&self) -> &'static str {
        "sns"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let access_key = required(url.user.as_deref(), "access key id", "sns")?;
        let secret_key = required(url.password.as_deref(), "secret access key", "sns")?;
        let region = match url.param("region") {
            Some(region) => region.to_string(),
            None => url.require_host()?.to_ascii_lowercase(),
        };
        if !region.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(NotifyError::url(format!("invalid AWS region '{region}'")));
        }
        let mut targets = url.path.clone();
        targets.extend(url.param_list("to"));
        let mut phones = Vec::with_capacity(targets.len());
        for target in &targets {
            if !is_phone(target) {
                return Err(NotifyError::url(format!("sns: '{target}' is not a phone number")));
            }
            phones.push(normalize_phone(target));
        }
        if phones.is_empty() {
            return Err(NotifyError::url("sns needs at least one phone number"));
        }
        self.config = SnsConfig {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region,
            phones,
            sender_id: url.param("from").map(str::to_string),
            proxy: ProxyConfig::from_service_url(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Cloud, self.id())?;
        let message = truncate(&request.title_and_body(), MAX_BODY);
        deliver_each(self.id(), &self.config.phones, |phone| {
            let client = client.clone();
            let message = &message;
            async move { self.publish(&client, phone, message).await }
        })
        .await
    }

    fn max_body_length(&self) -> usize {
        MAX_BODY
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        let builder = UrlBuilder::new("sns")
            .user(Some(&config.access_key))
            .password(Some(&config.secret_key))
            .host(&config.region)
            .segments(&config.phones)
            .param_opt("from", config.sender_id.as_ref());
        match &config.proxy {
            Some(proxy) => proxy.append_to(builder).build(),
            None => builder.build(),
        }
    }
}
