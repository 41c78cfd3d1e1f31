use std::io;

use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::{
        self,
        format::{Format, JsonFields, Writer},
        time::FormatTime,
        writer::BoxMakeWriter,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::logging::args::{LogFormat, LoggingArgs};

enum OutputFormatter<T> {
    Full(Format<fmt::format::Full, T>),
    Pretty(Format<fmt::format::Pretty, T>),
    Json(Format<fmt::format::Json, T>),
    Compact(Format<fmt::format::Compact, T>),
}

impl<S, N, T> FormatEvent<S, N> for OutputFormatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        match self {
            Self::Full(fmt) => fmt.format_event(ctx, writer, event),
            Self::Pretty(fmt) => fmt.format_event(ctx, writer, event),
            Self::Json(fmt) => fmt.format_event(ctx, writer, event),
            Self::Compact(fmt) => fmt.format_event(ctx, writer, event),
        }
    }
}

/// Initialize the `tracing` logging setup.
///
/// # Errors
///
/// - [`TryInitError`], if initializing the [`tracing_subscriber::Registry`] fails.
pub fn init_logger(log_args: &LoggingArgs) -> Result<impl Drop, TryInitError> {
    let LoggingArgs {
        log_format,
        log_folder,
        log_level,
        log_file_prefix,
    } = log_args;

    let filter = log_level.map_or_else(
        || {
            std::env::var("RUST_LOG").map_or_else(
                |_| {
                    if cfg!(debug_assertions) {
                        EnvFilter::default().add_directive(Directive::from(LevelFilter::DEBUG))
                    } else {
                        EnvFilter::default().add_directive(Directive::from(LevelFilter::INFO))
                    }
                },
                EnvFilter::new,
            )
        },
        |log_level| EnvFilter::default().add_directive(Directive::from(log_level)),
    );

    let formatter = fmt::format().with_target(true);
    let output_format = match log_format {
        LogFormat::Full => OutputFormatter::Full(formatter.clone()),
        LogFormat::Pretty => OutputFormatter::Pretty(formatter.clone().pretty()),
        LogFormat::Json => OutputFormatter::Json(formatter.clone().json()),
        LogFormat::Compact => OutputFormatter::Compact(formatter.clone().compact()),
    };

    let error_layer = tracing_error::ErrorLayer::default();

    let output_writer = BoxMakeWriter::new(io::stderr);

    // The Registry/Layer interface requires one concrete type per layer, so
    // the JSON console variant gets its own slot and the other variants share
    // one; `Option<Layer>` implements `Layer`.
    let (output_layer, json_output_layer) = match log_format {
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .event_format(output_format)
                    .with_ansi(true)
                    .fmt_fields(JsonFields::new())
                    .with_writer(output_writer),
            ),
        ),
        _ => (
            Some(
                fmt::layer()
                    .event_format(output_format)
                    .with_ansi(true)
                    .with_writer(output_writer),
            ),
            None,
        ),
    };

    let json_file_appender =
        tracing_appender::rolling::never(log_folder, format!("{log_file_prefix}.jsonl"));
    let (non_blocking, json_file_guard) = tracing_appender::non_blocking(json_file_appender);

    let json_file_layer = fmt::layer()
        .event_format(formatter.json())
        .fmt_fields(JsonFields::new())
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(filter)
        .with(output_layer)
        .with(json_output_layer)
        .with(json_file_layer)
        .with(error_layer)
        .try_init()?;

    Ok(json_file_guard)
}
