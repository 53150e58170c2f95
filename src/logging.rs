use anyhow::Context;
use std::{fs::File, path::Path, path::PathBuf, sync::Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "btc_feature_collector=info,collector=info";

/// Install the global subscriber: stdout always, plus a plain-text session
/// log under `log_dir` when given. Returns the session log path.
pub fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let path = dir.join(session_log_name(chrono::Local::now()));
            let file =
                File::create(&path).with_context(|| format!("create {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(log_path)
}

fn session_log_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("session_{}.log", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_session_log_name() {
        let now = Utc.with_ymd_and_hms(2026, 1, 29, 10, 37, 12).unwrap();
        assert_eq!(session_log_name(now), "session_20260129_103712.log");
    }
}
