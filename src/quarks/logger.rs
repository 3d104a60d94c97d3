/*
 * Copyright (C) 2024 The Quarks StatefulSet Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Structured line logging shared by every component of the operator.
//!
//! Each line carries the component, the message, and optional key/value
//! fields. When a reconcile span is active the trace and span ids are added
//! so that all lines of one pass can be correlated.

use crate::quarks::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "quarks-statefulset";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "logfmt" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unsupported log format '{}'; expected 'text' or 'json'",
                other
            )),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Lines below `level` are dropped.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }

    fn enabled(self) -> bool {
        self as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unsupported log level '{}'", other)),
        }
    }
}

fn quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && !value.chars().any(|c| {
            c.is_whitespace() || c.is_control() || matches!(c, '"' | '\\' | '=' | '[' | ']' | ',')
        });
    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

fn render_text(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| format!("{}={}", key, quote_if_needed(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_json(fields: &[(&str, &str)]) -> String {
    let payload: serde_json::Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| ((*key).to_string(), Value::String((*value).to_string())))
        .collect();
    Value::Object(payload).to_string()
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if !level.enabled() {
        return;
    }
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let trace_context = tracing::current_context();

    let mut fields: Vec<(&str, &str)> = Vec::with_capacity(8 + metadata.len());
    fields.push(("ts", &timestamp));
    fields.push(("level", level.as_str()));
    fields.push(("service", SERVICE_NAME));
    fields.push(("component", component));
    fields.push(("msg", message));
    if let Some(ctx) = trace_context.as_ref() {
        fields.push(("trace_id", ctx.trace_id()));
        fields.push(("span_id", ctx.span_id()));
    }
    fields.extend_from_slice(metadata);

    let line = match current_log_format() {
        LogFormat::Text => render_text(&fields),
        LogFormat::Json => render_json(&fields),
    };
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let result = if level.is_stderr() {
        writeln!(io::stderr().lock(), "{}", line)
    } else {
        writeln!(io::stdout().lock(), "{}", line)
    };

    if let Err(error) = result {
        let _ = writeln!(
            io::stderr().lock(),
            "{}: failed to write log line: {} (original: {})",
            SERVICE_NAME,
            error,
            line
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    if let Ok(mut guard) = test_log_store().lock() {
        guard.push((level, line.to_string()));
    }
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Drains the lines captured by unit tests.
#[cfg(test)]
pub(crate) fn take_test_logs() -> Vec<(LogLevel, String)> {
    test_log_store()
        .lock()
        .map(|mut guard| guard.drain(..).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarks::observability::tracing;
    use serial_test::serial;

    #[tokio::test]
    #[serial(logger)]
    async fn text_lines_carry_span_ids_and_fields() {
        tracing::init();
        set_log_format(LogFormat::Text);
        take_test_logs();
        tracing::with_span("test.component", "text-log", async {
            log_info("unit", "reconciled", &[("namespace", "demo"), ("note", "two words")]);
        })
        .await;

        let logs = take_test_logs();
        let (_, line) = logs
            .iter()
            .find(|(_, line)| line.contains("msg=reconciled"))
            .expect("line captured");
        assert!(line.contains("trace_id=") && line.contains("span_id="), "{line}");
        assert!(line.contains("namespace=demo"), "{line}");
        assert!(line.contains("note=\"two words\""), "{line}");
        assert!(line.contains("service=quarks-statefulset"), "{line}");
    }

    #[tokio::test]
    #[serial(logger)]
    async fn json_lines_are_objects() {
        tracing::init();
        set_log_format(LogFormat::Json);
        take_test_logs();
        tracing::with_span("test.component", "json-log", async {
            log_warn("unit", "json-check", &[("key", "value")]);
        })
        .await;
        set_log_format(LogFormat::Text);

        let logs = take_test_logs();
        let payload = logs
            .iter()
            .filter_map(|(_, line)| serde_json::from_str::<Value>(line).ok())
            .find(|payload| payload.get("msg").and_then(Value::as_str) == Some("json-check"))
            .expect("json line captured");
        assert_eq!(payload.get("component").and_then(Value::as_str), Some("unit"));
        assert_eq!(payload.get("key").and_then(Value::as_str), Some("value"));
        assert!(payload.get("trace_id").and_then(Value::as_str).is_some());
    }

    #[test]
    #[serial(logger)]
    fn levels_below_minimum_are_dropped() {
        set_log_format(LogFormat::Text);
        take_test_logs();
        set_min_level(LogLevel::Warn);
        log_info("unit", "hidden", &[]);
        log_error("unit", "shown", &[]);
        set_min_level(LogLevel::Debug);

        let logs = take_test_logs();
        assert!(logs.iter().all(|(_, line)| !line.contains("msg=hidden")));
        assert!(logs.iter().any(|(level, line)| *level == LogLevel::Error && line.contains("msg=shown")));
    }

    #[test]
    fn formats_and_levels_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
