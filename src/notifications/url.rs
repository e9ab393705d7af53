//! Destination URL grammar.
//!
//! `scheme://[user[:secret]@]host[:port][/path][?query]`
//!
//! Parsing is deliberately looser than RFC 3986: service tokens routinely
//! contain characters a strict parser rejects (Telegram's `123456:ABC` bot
//! token sits where a host:port would). The port is only split off when it is
//! numeric, `#` is kept as part of path segments (`/#channel`), and every
//! component is percent-decoded. A `+` in the query is literal, not a space,
//! so phone numbers survive.

use std::collections::BTreeMap;
use std::fmt;

use crate::notifications::error::{NotifyError, NotifyResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    raw: String,
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: Vec<String>,
    /// Query parameters with lowercased keys; the last occurrence wins.
    pub query: BTreeMap<String, String>,
    /// `+Name=value` query parameters, forwarded as HTTP headers by services that allow it.
    pub headers: Vec<(String, String)>,
}

/// Lowercase the scheme and strip leading whitespace.
pub fn normalize_scheme(scheme: &str) -> String {
    scheme.trim_start().trim_end().to_ascii_lowercase()
}

/// Extract and normalise the scheme of `raw` without parsing the rest.
pub fn scheme_of(raw: &str) -> NotifyResult<String> {
    let raw = raw.trim_start();
    let (scheme, _) = raw
        .split_once("://")
        .ok_or_else(|| NotifyError::url(format!("missing '://' in '{}'", redact_raw(raw))))?;
    let scheme = normalize_scheme(scheme);
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return Err(NotifyError::url(format!("invalid scheme '{scheme}'")));
    }
    Ok(scheme)
}

impl ServiceUrl {
    pub fn parse(raw: &str) -> NotifyResult<Self> {
        let trimmed = raw.trim();
        let scheme = scheme_of(trimmed)?;
        let rest = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default();

        let (before_query, query_raw) = match rest.split_once('?') {
            Some((before, query)) => (before, Some(query)),
            None => (rest, None),
        };
        let (authority, path_raw) = match before_query.find('/') {
            Some(idx) => (&before_query[..idx], &before_query[idx + 1..]),
            None => (before_query, ""),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(idx) => (Some(&authority[..idx]), &authority[idx + 1..]),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (non_empty(decode(user)?), Some(decode(password)?)),
                None => (non_empty(decode(info)?), None),
            },
            None => (None, None),
        };
        let (host, port) = split_host_port(hostport)?;

        let path = path_raw
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect::<NotifyResult<Vec<_>>>()?;

        let mut query = BTreeMap::new();
        let mut headers = Vec::new();
        if let Some(query_raw) = query_raw {
            for pair in query_raw.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = decode(value)?;
                if let Some(name) = key.strip_prefix('+') {
                    let name = decode(name)?;
                    if !name.is_empty() {
                        headers.push((name, value));
                    }
                    continue;
                }
                query.insert(decode(key)?.to_ascii_lowercase(), value);
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            scheme,
            user,
            password,
            host: decode(host)?,
            port,
            path,
            query,
            headers,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// First present parameter among `keys`.
    pub fn param_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.param(key))
    }

    pub fn param_bool(&self, key: &str) -> NotifyResult<Option<bool>> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => parse_bool(value)
                .map(Some)
                .ok_or_else(|| NotifyError::url(format!("'{key}' must be a boolean, got '{value}'"))),
        }
    }

    pub fn param_parsed<T: std::str::FromStr>(&self, key: &str) -> NotifyResult<Option<T>> {
        match self.param(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| NotifyError::url(format!("invalid value '{value}' for '{key}'"))),
        }
    }

    /// Comma or space separated list parameter.
    pub fn param_list(&self, key: &str) -> Vec<String> {
        self.param(key).map(split_list).unwrap_or_default()
    }

    pub fn require_host(&self) -> NotifyResult<&str> {
        if self.host.is_empty() {
            return Err(NotifyError::url(format!("{}:// URL is missing a host", self.scheme)));
        }
        Ok(&self.host)
    }

    /// `true` when the scheme ends in `s` for services with a TLS twin (`ntfys`, `jsons`).
    pub fn secure_variant(&self, plain: &str) -> bool {
        self.scheme != plain && self.scheme.starts_with(plain) && self.scheme.ends_with('s')
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact(&self.raw))
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" | "y" => Some(true),
        "0" | "no" | "false" | "off" | "n" => Some(false),
        _ => None,
    }
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ' ', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_host_port(hostport: &str) -> NotifyResult<(&str, Option<u16>)> {
    if let Some(inner) = hostport.strip_prefix('[') {
        let (_, after) = inner
            .split_once(']')
            .ok_or_else(|| NotifyError::url("unterminated IPv6 literal"))?;
        let host_len = inner.len() - after.len() + 1;
        let host = &hostport[..host_len];
        return match after.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None => Ok((host, None)),
        };
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            Ok((host, Some(parse_port(port)?)))
        }
        _ => Ok((hostport, None)),
    }
}

fn parse_port(port: &str) -> NotifyResult<u16> {
    port.parse::<u16>()
        .map_err(|_| NotifyError::url(format!("invalid port '{port}'")))
}

fn decode(value: &str) -> NotifyResult<String> {
    urlencoding::decode(value)
        .map(|value| value.into_owned())
        .map_err(|err| NotifyError::url(format!("invalid percent-encoding: {err}")))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

/// Builds a URL from configuration, percent-encoding each component so that
/// [`ServiceUrl::parse`] recovers the same values.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    scheme: String,
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: Option<u16>,
    path: Vec<String>,
    query: Vec<(String, String)>,
}

impl UrlBuilder {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            user: None,
            password: None,
            host: String::new(),
            port: None,
            path: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    pub fn password(mut self, password: Option<&str>) -> Self {
        self.password = password.map(str::to_string);
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn segment(mut self, segment: &str) -> Self {
        self.path.push(segment.to_string());
        self
    }

    pub fn segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.path
            .extend(segments.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn param_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn build(self) -> String {
        let mut out = format!("{}://", self.scheme);
        if let Some(user) = &self.user {
            out.push_str(&urlencoding::encode(user));
            if let Some(password) = &self.password {
                out.push(':');
                out.push_str(&urlencoding::encode(password));
            }
            out.push('@');
        }
        if self.host.starts_with('[') {
            out.push_str(&self.host);
        } else {
            out.push_str(&urlencoding::encode(&self.host));
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{port}"));
        }
        for segment in &self.path {
            out.push('/');
            out.push_str(&encode_segment(segment));
        }
        if !self.query.is_empty() {
            let query = self
                .query
                .iter()
                .map(|(key, value)| format!("{}={}", encode_key(key), urlencoding::encode(value)))
                .collect::<Vec<_>>()
                .join("&");
            out.push('?');
            out.push_str(&query);
        }
        out
    }
}

/// Header parameters keep their literal `+` prefix.
fn encode_key(key: &str) -> String {
    match key.strip_prefix('+') {
        Some(name) => format!("+{}", urlencoding::encode(name)),
        None => urlencoding::encode(key).into_owned(),
    }
}

/// Segments keep a leading `#`/`@`/`+` readable; everything else is encoded.
fn encode_segment(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first @ ('#' | '+' | '@' | '!')) => {
            let rest: String = chars.collect();
            format!("{first}{}", urlencoding::encode(&rest))
        }
        _ => urlencoding::encode(segment).into_owned(),
    }
}

/// Mask credentials in a raw URL string for logs and metric rows.
///
/// The password in userinfo becomes `****`, secret-looking query values are
/// masked, and long path segments keep only their first four characters.
pub fn redact(raw: &str) -> String {
    redact_secrets(raw, &[])
}

/// [`redact`], additionally masking every component equal to one of
/// `secrets` regardless of where it sits or how short it is.
pub fn redact_secrets(raw: &str, secrets: &[&str]) -> String {
    let Ok(parsed) = ServiceUrl::parse(raw) else {
        return redact_raw(raw);
    };
    let known = |value: &str| secrets.iter().any(|secret| !secret.is_empty() && *secret == value);
    let mask = |value: &str| if known(value) { mask_secret(value) } else { mask_token(value) };
    let user = parsed.user.as_deref().map(|user| if known(user) { mask_secret(user) } else { user.to_string() });
    let mut builder = UrlBuilder::new(&parsed.scheme)
        .user(user.as_deref())
        .password(parsed.password.as_ref().map(|_| "****"))
        .host(&mask(&parsed.host))
        .port(parsed.port);
    for segment in &parsed.path {
        builder = builder.segment(&mask(segment));
    }
    for (key, value) in &parsed.query {
        let value = if is_secret_key(key) || known(value) { "****".to_string() } else { value.clone() };
        builder = builder.param(key, value);
    }
    builder.build().replace("%2A", "*")
}

fn redact_raw(raw: &str) -> String {
    match raw.split_once("://") {
        Some((scheme, _)) => format!("{}://****", scheme.trim()),
        None => "****".to_string(),
    }
}

fn mask_token(value: &str) -> String {
    let hostname_like = value.contains('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    if value.chars().count() < 20 || hostname_like {
        return value.to_string();
    }
    let head: String = value.chars().take(4).collect();
    format!("{head}****")
}

/// A known secret keeps a four character prefix only when it is long enough
/// that the prefix gives nothing away.
fn mask_secret(value: &str) -> String {
    if value.chars().count() < 12 {
        return "****".to_string();
    }
    let head: String = value.chars().take(4).collect();
    format!("{head}****")
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["token", "secret", "key", "pass", "auth"]
        .iter()
        .any(|needle| key.contains(needle))
}
