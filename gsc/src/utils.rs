use anyhow::{Result, anyhow};
use log::LevelFilter;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use tokio::signal::unix::{SignalKind, signal};

#[cfg(feature = "tracing")]
#[macro_export]
macro_rules! spawn {
    ($name:expr, $body:expr) => {{
        tokio::task::Builder::new()
            .name($name)
            .spawn($body)
            .map_err(anyhow::Error::from)
    }};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! spawn {
    ($name:expr, $body:expr) => {{ Result::<_, anyhow::Error>::Ok(tokio::task::spawn($body)) }};
}

pub use spawn;

pub fn init_logging(verbosity: u8) {
    fn level_filter(verbosity: u8) -> LevelFilter {
        match verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pretty_env_logger::formatted_builder()
        .filter_module("bollard", level_filter(verbosity.saturating_sub(1)))
        .filter_module("hyper", level_filter(verbosity.saturating_sub(2)))
        .filter_module("tokio", level_filter(verbosity.saturating_sub(3)))
        .filter_module("tracing", level_filter(verbosity.saturating_sub(3)))
        .filter_level(level_filter(verbosity))
        .format_timestamp(None)
        .init();
}

pub trait StringablePathExt {
    fn must_to_str(&self) -> Result<&str>;
}

impl StringablePathExt for Path {
    fn must_to_str(&self) -> Result<&str> {
        self.to_str()
            .ok_or_else(|| anyhow!("filename contains non-UTF-8 characters"))
    }
}

/// Write a chunk of engine output to `out` exactly as received, flushing so
/// the caller sees progress as it arrives.
///
/// Engine events do not align with lines: a line may span several chunks and a
/// newline may arrive on its own.
pub fn forward_chunk<W: Write + ?Sized>(out: &mut W, chunk: &str) -> Result<()> {
    out.write_all(chunk.as_bytes())?;
    out.flush()?;

    Ok(())
}

/// Expand environment variables in a string.
/// Supports ${VAR_NAME} syntax (brace notation) and bash parameter expansion.
/// Variables not found in the environment are left unchanged.
/// Supports default values with ${VAR_NAME:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let mut pos = 0;

    while let Some(start) = result[pos..].find("${") {
        let absolute_start = pos + start;

        let Some(end) = result[absolute_start + 2..].find('}') else {
            // Malformed ${ syntax, stop processing
            break;
        };

        let var_start = absolute_start + 2;
        let var_end = var_start + end;
        let var_content = &result[var_start..var_end];

        let (var_name, default_value) = match var_content.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_content, None),
        };

        if var_name.is_empty() || var_name.chars().any(|c| !c.is_alphanumeric() && c != '_') {
            pos = var_end + 1;
            continue;
        }

        let replacement_value = match std::env::var(var_name) {
            Ok(var_value) if !var_value.is_empty() => var_value,
            _ => match default_value {
                Some(default) => default.to_string(),
                None => {
                    pos = var_end + 1;
                    continue;
                }
            },
        };

        result = format!(
            "{}{}{}",
            &result[..absolute_start],
            replacement_value,
            &result[var_end + 1..]
        );
        pos = absolute_start + replacement_value.len();
    }

    result
}

pub async fn register_shutdown_signal_handler() -> Result<impl Future> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    spawn!("signal handler", async move {
        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => (),
        }
    })
}
