use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber.
///
/// Filtering comes from `MISSIVE_LOG` (default `info`). Debug builds log in
/// a human-readable format, release builds as JSON lines.
pub fn init() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("MISSIVE_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
