//! Structured log output
//!
//! Every record is a single self-delimited JSON object written to stderr:
//!
//! ```text
//! {"timestamp":"2026-08-02T12:00:00+0200","level":"INFO","message":"...","thread":"..."}
//! ```
//!
//! The formatter renders each event into one buffer and the fmt layer
//! issues a single unbuffered write per record, so records never
//! interleave across tasks and are flushed as they are produced. Write
//! failures are swallowed by the layer.

use std::fmt::{self, Write as _};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(JsonLine)
                .with_writer(std::io::stderr),
        )
        .init();
}

struct JsonLine;

impl<S, N> FormatEvent<S, N> for JsonLine
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string();
        let level = event.metadata().level().to_string();

        writeln!(
            writer,
            "{{\"timestamp\":{},\"level\":{},\"message\":{},\"thread\":{}}}",
            json_string(&timestamp)?,
            json_string(&level)?,
            json_string(&visitor.rendered())?,
            json_string(&thread_token())?,
        )
    }
}

/// Collects the event message plus any structured fields into one line.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn rendered(&self) -> String {
        if self.fields.is_empty() {
            self.message.clone()
        } else if self.message.is_empty() {
            self.fields.clone()
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

/// Encode a string as a JSON string literal. serde_json escapes `"`,
/// `\`, `\n`, `\r`, `\t` and every control byte below 0x20 as a
/// six-character `\u00xx` sequence, which is exactly the wire contract.
fn json_string(value: &str) -> Result<String, fmt::Error> {
    serde_json::to_string(value).map_err(|_| fmt::Error)
}

/// Opaque worker identity token for the current OS thread.
fn thread_token() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}
