//! Logging setup and per-message log context
//!
//! [`setup_logging`] installs a `tracing-subscriber` fmt subscriber for
//! binaries and tests that embed the transport layer. [`message_span`] builds
//! the span inbound processing runs in, carrying the Call-ID and the session
//! id of the message so every log line of one message can be correlated.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};
use crate::message::{markers, SipMessage};

/// Separator inside the session id Via parameter
const SESSION_ID_SEPARATOR: char = '_';

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log span open/close events
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}

/// Span for processing one message
pub fn message_span(message: &SipMessage) -> tracing::Span {
    tracing::debug_span!(
        "sip_message",
        call_id = message.call_id().unwrap_or_default(),
        session_id = %session_id(message).unwrap_or_default(),
    )
}

/// Session id from the top Via: the session marker value up to its second separator
pub fn session_id(message: &SipMessage) -> Option<String> {
    let via = message.top_via()?.ok()?;
    let sid = via.param(markers::SESSION_ID)??;
    let first = sid.find(SESSION_ID_SEPARATOR)?;
    let second = sid[first + 1..].find(SESSION_ID_SEPARATOR)? + first + 1;
    Some(sid[..second].to_string())
}
