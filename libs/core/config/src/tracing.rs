use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{fmt::MakeWriter, prelude::*, EnvFilter};

/// Where log lines are written.
///
/// Child executors speak their protocol over stdout, so they must log to
/// stderr; the supervisor logs to stdout like every other service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operations. Safe to call
/// multiple times.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing for a process logging to stdout.
///
/// - **Production** (`APP_ENV=production`): flattened JSON, no module targets
/// - **Development** (default): pretty, human-readable output
///
/// Both include `tracing_error::ErrorLayer` so eyre reports carry span traces.
/// `RUST_LOG` overrides the default filter (`info` in production, `debug`
/// otherwise). Calling this more than once is a no-op.
pub fn init_tracing(environment: &Environment) {
    init_tracing_with_output(environment, LogOutput::Stdout);
}

/// Initialize tracing, choosing the output stream.
pub fn init_tracing_with_output(environment: &Environment, output: LogOutput) {
    let initialized = match output {
        LogOutput::Stdout => try_init(environment, std::io::stdout),
        LogOutput::Stderr => try_init(environment, std::io::stderr),
    };

    if initialized {
        info!(environment = ?environment, output = ?output, "Tracing initialized");
    } else {
        debug!("Tracing already initialized, skipping re-initialization");
    }
}

fn default_filter(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.is_production() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug,h2=info,tower=info,hyper_util=info")
        }
    })
}

fn try_init<W>(environment: &Environment, writer: W) -> bool
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = default_filter(environment);

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    result.is_ok()
}
