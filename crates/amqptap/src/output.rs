//! Message rendering and persistence.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use amqptap_core::{MessageProperties, OutboundMessage, TappedMessage};
use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// JSON form of a message, as printed with `--json`, written to `--save-dir`
/// and read back by `pub --json-lines`.
///
/// Header values are plain JSON, so their AMQP types do not survive a
/// republish: integers and timestamps go out as `LongLongInt`, strings as
/// `LongString`, and byte arrays or decimals as their debug text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedMessage {
    #[serde(default)]
    pub exchange: String,

    #[serde(default)]
    pub routing_key: String,

    #[serde(default)]
    pub redelivered: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub properties: MessageProperties,

    /// Base64 encoded body.
    pub body: String,
}

impl SavedMessage {
    pub fn from_tapped(message: &TappedMessage) -> Self {
        let delivery = &message.delivery;
        Self {
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            received_at: Some(message.received_at),
            properties: delivery.properties.clone(),
            body: BASE64_STANDARD.encode(&delivery.body),
        }
    }

    /// Turn a saved message into one to publish. `exchange` and `routing_key`
    /// replace the saved values when given.
    pub fn into_outbound(
        self,
        exchange: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<OutboundMessage> {
        let body = BASE64_STANDARD
            .decode(self.body.as_bytes())
            .context("Message body is not valid base64")?;
        let exchange = exchange.map(str::to_string).unwrap_or(self.exchange);
        let routing_key = routing_key.map(str::to_string).unwrap_or(self.routing_key);

        Ok(OutboundMessage::new(exchange, routing_key, body).with_properties(self.properties))
    }
}

/// How messages are printed on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    JsonLines,
}

/// Writes received messages to a sink and optionally to a directory.
pub struct MessagePrinter<W: Write> {
    out: W,
    format: OutputFormat,
    save_dir: Option<PathBuf>,
}

impl MessagePrinter<io::Stdout> {
    pub fn stdout(format: OutputFormat, save_dir: Option<PathBuf>) -> Result<Self> {
        Self::new(io::stdout(), format, save_dir)
    }
}

impl<W: Write> MessagePrinter<W> {
    pub fn new(out: W, format: OutputFormat, save_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &save_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(Self {
            out,
            format,
            save_dir,
        })
    }

    pub fn print(&mut self, message: &TappedMessage) -> Result<()> {
        match self.format {
            OutputFormat::Plain => self.out.write_all(render_plain(message).as_bytes())?,
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, &SavedMessage::from_tapped(message))?;
                self.out.write_all(b"\n")?;
            }
        }
        self.out.flush()?;

        if let Some(dir) = &self.save_dir {
            let path = save_message(dir, message)?;
            tracing::debug!(path = %path.display(), "Message saved");
        }
        Ok(())
    }
}

/// Human readable form of a message: a header line, the properties that are
/// set, then the body.
pub fn render_plain(message: &TappedMessage) -> String {
    let delivery = &message.delivery;
    let props = &delivery.properties;
    let mut out = format!(
        "------ {} exchange={} routing_key={}{} ------\n",
        message.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        delivery.exchange,
        delivery.routing_key,
        if delivery.redelivered { " (redelivered)" } else { "" },
    );

    let fields = [
        ("content_type", props.content_type.clone()),
        ("content_encoding", props.content_encoding.clone()),
        ("delivery_mode", props.delivery_mode.map(|v| v.to_string())),
        ("priority", props.priority.map(|v| v.to_string())),
        ("correlation_id", props.correlation_id.clone()),
        ("reply_to", props.reply_to.clone()),
        ("expiration", props.expiration.clone()),
        ("message_id", props.message_id.clone()),
        ("timestamp", props.timestamp.map(|v| v.to_string())),
        ("type", props.kind.clone()),
        ("user_id", props.user_id.clone()),
        ("app_id", props.app_id.clone()),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            out.push_str(&format!("{name}: {value}\n"));
        }
    }
    for (name, value) in &props.headers {
        out.push_str(&format!("header {name}: {value}\n"));
    }

    out.push_str(&String::from_utf8_lossy(&delivery.body));
    out.push('\n');
    out
}

/// Write `message` to `dir/amqptap-<unix nanos>.json`, never overwriting an
/// existing file.
pub fn save_message(dir: &Path, message: &TappedMessage) -> Result<PathBuf> {
    let saved = SavedMessage::from_tapped(message);
    let mut nanos = message.received_at.timestamp_nanos_opt().unwrap_or_default();

    loop {
        let path = dir.join(format!("amqptap-{nanos}.json"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                serde_json::to_writer_pretty(file, &saved)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => nanos += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        }
    }
}
