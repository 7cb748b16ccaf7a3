#![warn(missing_docs)]
//! # Structured logging for the fabric orchestrator
//!
//! Every binary and test in the workspace sets up its subscriber through
//! this crate so that filtering works the same everywhere.
//!
//! ## Usage
//! ### Console and filter
//! Log to the console and narrow down with `RUST_LOG`:
//! ```bash
//! RUST_LOG='fabric_orchestrator::chaincode=debug' fabric-orch chaincode deploy
//! ```
//! Spans carry the org and channel a call was made for, so you can filter on them:
//! ```bash
//! RUST_LOG='[join{org="Org2"}]=trace' fabric-orch channel setup
//! ```
//! If `CUSTOM_FILTER` is set it replaces the `RUST_LOG` filter entirely.
//!
//! ### Output kinds
//! The [Output] type is meant to be used as a command line arg
//! (`--structured Json`) and handed to [init_fmt] on start up.
//!
//! #### Json
//! With `--structured Json` every event is written as one json object per line:
//! ```json
//! {"time":"2024-03-03T08:07:05.910Z","level":"INFO","target":"fabric_orchestrator::channel","file":"crates/fabric_orchestrator/src/channel.rs","line":120,"fields":{"message":"peer joined"},"spans":[{"name":"join","level":"INFO","fields":{"channel":"npa-channel","org":"Org2"}}]}
//! ```
//! Pipe it to `jq` to pull out the fields you care about.

use tracing::Subscriber;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        format::{DefaultFields, FmtSpan, Format},
        time::UtcTime,
        MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer, Registry,
};

use derive_more::Display;
use std::str::FromStr;

mod fmt;

use fmt::FormatEvent;
pub use tracing;

#[derive(Debug, Clone, PartialEq, Eq, Display)]
/// How log lines are written to stderr
pub enum Output {
    /// One short line per event
    Compact,
    /// One json object per event, with the fields of the enclosing spans
    Json,
    /// Json plus a line with the duration of every closed span
    JsonTimed,
    /// Human readable lines (default)
    Log,
    /// Human readable lines plus span durations
    LogTimed,
    /// Nothing
    None,
}

/// Why an [Output] name was not understood
pub type ParseError = String;

impl FromStr for Output {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Json" => Ok(Output::Json),
            "JsonTimed" => Ok(Output::JsonTimed),
            "Log" => Ok(Output::Log),
            "LogTimed" => Ok(Output::LogTimed),
            "Compact" => Ok(Output::Compact),
            "None" => Ok(Output::None),
            other => Err(format!(
                "unknown log output '{}', expected one of Log, LogTimed, Compact, Json, JsonTimed, None",
                other
            )),
        }
    }
}

/// Run logging in a unit test.
///
/// RUST_LOG must be set or this is a no-op. Safe to call from every test in a
/// binary: only the first call installs the subscriber.
pub fn test_run() -> Result<(), errors::TracingError> {
    if std::env::var_os("RUST_LOG").is_none() {
        return Ok(());
    }
    match init_fmt(Output::Log) {
        Err(errors::TracingError::SetGlobal(_)) => Ok(()),
        r => r,
    }
}

/// The filter every subscriber uses.
///
/// `RUST_LOG` when set, otherwise info for the orchestrator crates and warn
/// for everything else. A parseable `CUSTOM_FILTER` replaces either.
pub fn standard_filter() -> Result<EnvFilter, errors::TracingError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new("warn")
            .add_directive("fabric_orchestrator=info".parse()?)
            .add_directive("fabric_cli=info".parse()?),
    };
    if std::env::var_os("CUSTOM_FILTER").is_none() {
        return Ok(filter);
    }
    match EnvFilter::try_from_env("CUSTOM_FILTER") {
        Ok(custom) => Ok(custom),
        Err(e) => {
            eprintln!("Failed to parse CUSTOM_FILTER {:?}", e);
            Ok(filter)
        }
    }
}

fn console_layer<W, S>(writer: W) -> tracing_subscriber::fmt::Layer<S, DefaultFields, Format, W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    S: Subscriber + Send + Sync + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::Layer::default()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
}

/// Install the global subscriber for `output` with the [standard_filter].
///
/// Logs always go to stderr so stdout stays free for command output.
pub fn init_fmt(output: Output) -> Result<(), errors::TracingError> {
    init_fmt_with_writer(output, std::io::stderr)
}

fn init_fmt_with_writer<W>(output: Output, writer: W) -> Result<(), errors::TracingError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = standard_filter()?;
    let spans = match output {
        Output::JsonTimed | Output::LogTimed => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    };

    match output {
        Output::Json | Output::JsonTimed => Registry::default()
            .with(
                console_layer(writer)
                    .with_span_events(spans)
                    .with_timer(UtcTime::rfc_3339())
                    .json()
                    .event_format(FormatEvent)
                    .with_filter(filter),
            )
            .try_init()?,
        Output::Log | Output::LogTimed => Registry::default()
            .with(console_layer(writer).with_span_events(spans).with_filter(filter))
            .try_init()?,
        Output::Compact => Registry::default()
            .with(console_layer(writer).compact().with_filter(filter))
            .try_init()?,
        Output::None => (),
    };
    Ok(())
}

pub mod errors {
    //! Error in the tracing/logging framework

    use thiserror::Error;

    /// Error in the tracing/logging framework
    #[allow(missing_docs)] // should be self-explanatory
    #[derive(Error, Debug)]
    pub enum TracingError {
        #[error(transparent)]
        SetGlobal(#[from] tracing_subscriber::util::TryInitError),
        #[error(transparent)]
        BadDirective(#[from] tracing_subscriber::filter::ParseError),
    }
}
