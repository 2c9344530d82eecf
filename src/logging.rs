use anyhow::{Context as _, bail};
use tracing::Subscriber;
use tracing_subscriber::{
    Layer, Registry,
    filter::LevelFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::config::{Config, LogFormat};

const LEVEL_NAMES: &str = "trace, debug, info, warn, error, off";

/// Resolved logging choices: CLI flag over `[logging]` over built-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level.or_else(|| logging.and_then(|l| l.level.as_deref())) {
            Some(raw) => parse_level(raw)?,
            None => LevelFilter::INFO,
        };
        let format = logging
            .and_then(|l| l.format)
            .unwrap_or(LogFormat::Json);
        Ok(Self { level, format })
    }
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    let level = match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => bail!("invalid log level `{raw}`; expected one of {LEVEL_NAMES}"),
    };
    Ok(level)
}

pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    init_with_writer(config, cli_level, std::io::stderr)
}

/// Installs the process-wide subscriber, sending formatted events to `writer`.
pub fn init_with_writer<W>(config: &Config, cli_level: Option<&str>, writer: W) -> anyhow::Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let settings = LogSettings::resolve(config, cli_level)?;
    subscriber(settings, writer)
        .try_init()
        .context("initialize logging subscriber")
}

fn subscriber<W>(settings: LogSettings, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .with_filter(settings.level)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_filter(settings.level)
            .boxed(),
    };
    tracing_subscriber::registry().with(layer)
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serde_json::Value;
    use tracing_subscriber::filter::LevelFilter;

    use super::{LogSettings, subscriber};
    use crate::config::{Config, LogFormat};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn lines(&self) -> Vec<String> {
            let bytes = self.0.lock().expect("capture lock").clone();
            String::from_utf8(bytes)
                .expect("log output should be UTF-8")
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("capture lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn with_logging(toml: &str) -> Config {
        Config::from_toml_str(toml).expect("config should parse")
    }

    #[test]
    fn defaults_are_info_and_json() {
        assert_eq!(
            LogSettings::resolve(&Config::default(), None).expect("defaults"),
            LogSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Json,
            }
        );
    }

    #[test]
    fn cli_level_wins_over_config() {
        let config = with_logging("[logging]\nlevel = \"warn\"\nformat = \"pretty\"\n");

        let from_config = LogSettings::resolve(&config, None).expect("config level");
        assert_eq!(from_config.level, LevelFilter::WARN);
        assert_eq!(from_config.format, LogFormat::Pretty);
        assert_eq!(
            LogSettings::resolve(&config, Some(" DEBUG ")).expect("cli level").level,
            LevelFilter::DEBUG
        );
    }

    #[test]
    fn unknown_level_names_the_accepted_ones() {
        let err = LogSettings::resolve(&Config::default(), Some("verbose")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("`verbose`"), "unexpected error: {message}");
        assert!(message.contains("trace, debug"), "unexpected error: {message}");
    }

    #[test]
    fn json_events_carry_worker_fields_and_respect_level() {
        let capture = Capture::default();
        let writer = capture.clone();
        let settings = LogSettings {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        };

        tracing::subscriber::with_default(subscriber(settings, move || writer.clone()), || {
            tracing::debug!("filtered out");
            tracing::info!(target: "autodemo::worker", work_id = 7, project = "demo1", "project advanced");
        });

        let lines = capture.lines();
        assert_eq!(lines.len(), 1, "lines: {lines:?}");
        let event: Value = serde_json::from_str(&lines[0]).expect("log line should be JSON");
        assert_eq!(event["level"], "INFO");
        assert_eq!(event["target"], "autodemo::worker");
        assert_eq!(event["fields"]["message"], "project advanced");
        assert_eq!(event["fields"]["work_id"], 7);
        assert_eq!(event["fields"]["project"], "demo1");
        assert!(event.get("timestamp").is_some(), "event: {event}");
    }
}
