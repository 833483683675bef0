//! Newline-delimited JSON intake from standard input.
//!
//! Each line is one request:
//!
//! ```json
//! {"channel_id": 42, "text": "Deposit received", "kind": "deposit", "priority": "high"}
//! {"handle": "@punter", "text": "*Bet won*", "parse_mode": "MarkdownV2"}
//! {"channel_id": 42, "text": "Kick-off in 10 minutes", "scheduled_for": "2026-05-01T18:50:00Z"}
//! ```
//!
//! Lines that fail to parse or validate are logged and skipped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use herald_core::models::{NewNotification, ParseMode, Priority, Recipient, RenderOptions};
use herald_delivery::NotificationService;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// One request line.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntakeLine {
    channel_id: Option<i64>,
    handle: Option<String>,
    text: String,
    kind: Option<String>,
    priority: Option<Priority>,
    scheduled_for: Option<DateTime<Utc>>,
    parse_mode: Option<ParseMode>,
    #[serde(default)]
    disable_notification: bool,
    max_retries: Option<u32>,
}

/// Counts of what happened to the lines read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Parses one line into a request.
pub fn parse_line(line: &str) -> Result<NewNotification> {
    let line: IntakeLine = serde_json::from_str(line).context("malformed request line")?;

    let recipient = Recipient::from_parts(line.channel_id, line.handle.as_deref())?;
    let mut request = NewNotification::new(recipient, line.text).render_options(RenderOptions {
        parse_mode: line.parse_mode,
        disable_notification: line.disable_notification,
        ..RenderOptions::default()
    });

    if let Some(kind) = line.kind {
        request = request.kind(kind);
    }
    if let Some(priority) = line.priority {
        request = request.priority(priority);
    }
    if let Some(at) = line.scheduled_for {
        request = request.scheduled_for(at);
    }
    if let Some(max_retries) = line.max_retries {
        request = request.max_retries(max_retries);
    }

    request.validate()?;
    Ok(request)
}

/// Reads requests until end of input and enqueues them.
pub async fn run<R>(reader: R, service: &NotificationService) -> Result<IntakeSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IntakeSummary::default();
    let mut line_number = 0_usize;

    while let Some(line) = lines.next_line().await.context("failed to read request line")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let request = match parse_line(&line) {
            Ok(request) => request,
            Err(error) => {
                warn!(line = line_number, error = %format!("{error:#}"), "skipping invalid request");
                summary.rejected += 1;
                continue;
            },
        };

        match service.enqueue(request).await {
            Ok(id) => {
                debug!(line = line_number, notification_id = %id, "request accepted");
                summary.accepted += 1;
            },
            Err(error) => {
                warn!(line = line_number, code = error.code(), error = %error, "request rejected");
                summary.rejected += 1;
            },
        }
    }

    info!(accepted = summary.accepted, rejected = summary.rejected, "request input closed");
    Ok(summary)
}
