use crate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber for an embedding host.
///
/// `RUST_LOG` wins over the configured level. Fails if a global subscriber is
/// already set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let mut filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!(
            "crpc_core={level},crpc_economics={level}",
            level = config.level
        )
    }));

    for (module, level) in &config.module_filters {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true);
            match &config.file_output {
                Some(file_path) => {
                    let file_layer = fmt::layer()
                        .json()
                        .with_writer(open_log_file(file_path)?)
                        .with_ansi(false);
                    subscriber.with(json_layer).with(file_layer).try_init()?;
                }
                None => subscriber.with(json_layer).try_init()?,
            }
        }
        "compact" => {
            let compact_layer = fmt::layer()
                .compact()
                .with_target(false)
                .with_line_number(false)
                .with_file(false);
            match &config.file_output {
                Some(file_path) => {
                    let file_layer = fmt::layer()
                        .json()
                        .with_writer(open_log_file(file_path)?)
                        .with_ansi(false);
                    subscriber.with(compact_layer).with(file_layer).try_init()?;
                }
                None => subscriber.with(compact_layer).try_init()?,
            }
        }
        _ => {
            let show_location = matches!(config.level.as_str(), "debug" | "trace");
            let pretty_layer = fmt::layer()
                .with_target(show_location)
                .with_line_number(show_location)
                .with_file(show_location);
            match &config.file_output {
                Some(file_path) => {
                    let file_layer = fmt::layer()
                        .json()
                        .with_writer(open_log_file(file_path)?)
                        .with_ansi(false);
                    subscriber.with(pretty_layer).with(file_layer).try_init()?;
                }
                None => subscriber.with(pretty_layer).try_init()?,
            }
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_module_filter_is_rejected() {
        let mut config = LoggingConfig::default();
        config
            .module_filters
            .insert("crpc_core".to_string(), "not a level!".to_string());
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_unopenable_log_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir").join("crpc.log");
        for format in ["json", "compact", "pretty"] {
            let config = LoggingConfig {
                format: format.to_string(),
                file_output: Some(missing.to_string_lossy().into_owned()),
                ..LoggingConfig::default()
            };
            assert!(init_logging(&config).is_err());
        }
    }
}
