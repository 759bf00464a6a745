use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use hyperfs::config::Settings;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let settings = Settings::from_env()?;

    // Sized to match the "bounded worker pool of 32" resource budget —
    // every catalog transaction runs on this pool via spawn_blocking.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(32)
        .build()?;

    info!(
        port = settings.port,
        data_dir = %settings.data_dir.display(),
        tmp_dir = %settings.tmp_dir.display(),
        db_path = %settings.db_path.display(),
        "hyperfs starting"
    );

    runtime.block_on(hyperfs::server::run(settings))
}
