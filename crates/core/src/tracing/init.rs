//! Initialization functions for tracing

use anyhow::Result;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::tracing::config::InstrumentationConfig;

/// Initialize tracing with the given configuration
///
/// Events go to stderr so command output on stdout stays clean.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init_tracing(config: &InstrumentationConfig) -> Result<()> {
    build_subscriber(config, std::io::stderr).try_init()?;

    tracing::debug!(service = %config.service_name, "tracing initialized");
    Ok(())
}

fn build_subscriber<W>(
    config: &InstrumentationConfig,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(writer);

    if config.json {
        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json()),
        )
    } else {
        Box::new(tracing_subscriber::registry().with(env_filter).with(layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn captured_output(json: bool) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let config = InstrumentationConfig {
            log_level: "warn".to_string(),
            json,
            ..InstrumentationConfig::default()
        };

        let subscriber = build_subscriber(&config, move || writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "farmreg_http", "Token refresh failed");
        });

        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_events_go_to_the_configured_writer() {
        assert!(captured_output(false).contains("Token refresh failed"));
    }

    #[test]
    fn test_json_events_go_to_the_configured_writer() {
        let output = captured_output(true);
        let line = output.lines().next().unwrap();
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["fields"]["message"], "Token refresh failed");
    }
}
