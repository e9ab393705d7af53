use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::attachments::Attachment;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyType {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// RGB triple for services that render colored cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn from_u32(value: u32) -> Self {
        Self {
            r: ((value >> 16) & 0xff) as u8,
            g: ((value >> 8) & 0xff) as u8,
            b: (value & 0xff) as u8,
        }
    }

    pub fn as_u32(&self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl NotifyType {
    pub const ALL: [NotifyType; 4] = [
        NotifyType::Info,
        NotifyType::Success,
        NotifyType::Warning,
        NotifyType::Error,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            NotifyType::Info => "info",
            NotifyType::Success => "success",
            NotifyType::Warning => "warning",
            NotifyType::Error => "error",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            NotifyType::Info => "ℹ️",
            NotifyType::Success => "✅",
            NotifyType::Warning => "⚠️",
            NotifyType::Error => "❌",
        }
    }

    pub fn color(&self) -> Color {
        match self {
            NotifyType::Info => Color::from_u32(0x3498db),
            NotifyType::Success => Color::from_u32(0x2ecc71),
            NotifyType::Warning => Color::from_u32(0xf39c12),
            NotifyType::Error => Color::from_u32(0xe74c3c),
        }
    }

    /// Urgency on a 1 (lowest) to 5 (highest) scale, for services with a
    /// numeric priority field.
    pub fn priority_hint(&self) -> u8 {
        match self {
            NotifyType::Info | NotifyType::Success => 3,
            NotifyType::Warning => 4,
            NotifyType::Error => 5,
        }
    }

    /// Integer code persisted in metric rows.
    pub fn code(&self) -> i64 {
        match self {
            NotifyType::Info => 0,
            NotifyType::Success => 1,
            NotifyType::Warning => 2,
            NotifyType::Error => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(NotifyType::Info),
            1 => Some(NotifyType::Success),
            2 => Some(NotifyType::Warning),
            3 => Some(NotifyType::Error),
            _ => None,
        }
    }
}

impl fmt::Display for NotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NotifyType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" | "i" => Ok(NotifyType::Info),
            "success" | "s" | "ok" => Ok(NotifyType::Success),
            "warning" | "warn" | "w" => Ok(NotifyType::Warning),
            "error" | "failure" | "e" => Ok(NotifyType::Error),
            other => Err(format!("unknown notification type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    Text,
    Markdown,
    Html,
}

impl BodyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyFormat::Text => "text",
            BodyFormat::Markdown => "markdown",
            BodyFormat::Html => "html",
        }
    }
}

impl fmt::Display for BodyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BodyFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" | "plain" => Ok(BodyFormat::Text),
            "markdown" | "md" => Ok(BodyFormat::Markdown),
            "html" => Ok(BodyFormat::Html),
            other => Err(format!("unknown body format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub notify_type: NotifyType,
    pub body_format: Option<BodyFormat>,
    pub tags: BTreeSet<String>,
    pub url: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl NotificationRequest {
    pub fn new(title: impl Into<String>, body: impl Into<String>, notify_type: NotifyType) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            notify_type,
            ..Self::default()
        }
    }

    /// Effective format, defaulting to plain text.
    pub fn format(&self) -> BodyFormat {
        self.body_format.unwrap_or(BodyFormat::Text)
    }

    /// Title and body joined the way single-field services expect.
    pub fn title_and_body(&self) -> String {
        match (self.title.trim().is_empty(), self.body.trim().is_empty()) {
            (true, _) => self.body.clone(),
            (false, true) => self.title.clone(),
            (false, false) => format!("{}\n{}", self.title, self.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_type_helpers() {
        assert_eq!(NotifyType::Warning.label(), "warning");
        assert_eq!(NotifyType::Error.color().hex(), "#e74c3c");
        assert_eq!(NotifyType::Success.priority_hint(), 3);
        assert!(NotifyType::Error.priority_hint() > NotifyType::Warning.priority_hint());
        assert_eq!(NotifyType::Success.color().as_u32(), 0x2ecc71);
        for kind in NotifyType::ALL {
            assert_eq!(NotifyType::from_code(kind.code()), Some(kind));
            assert_eq!(kind.label().parse::<NotifyType>().unwrap(), kind);
        }
        assert!("loud".parse::<NotifyType>().is_err());
    }

    #[test]
    fn body_format_parsing() {
        assert_eq!("MD".parse::<BodyFormat>().unwrap(), BodyFormat::Markdown);
        assert_eq!("html".parse::<BodyFormat>().unwrap(), BodyFormat::Html);
        assert!("rtf".parse::<BodyFormat>().is_err());
    }

    #[test]
    fn title_and_body_joins_non_empty_parts() {
        let request = NotificationRequest::new("", "body", NotifyType::Info);
        assert_eq!(request.title_and_body(), "body");
        let request = NotificationRequest::new("title", "body", NotifyType::Info);
        assert_eq!(request.title_and_body(), "title\nbody");
    }
}
