use crate::command::Supervisor;
use crate::config::Config;
use crate::processor::Dispatcher;
use crate::store::ArtifactStore;
use crate::sweeper::Sweeper;
use crate::web::start_web_server;

mod command;
mod config;
mod error;
mod logging;
mod models;
mod processor;
mod store;
mod sweeper;
#[cfg(test)]
mod testing;
mod web;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = Config::from_env()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;

    logging::init_tracing(config.log_file.as_deref())?;

    let store = ArtifactStore::open(&config.store_dir)?;
    tracing::info!(store = %store.root().display(), "artifact store ready");

    if config.converter_timeout.is_none() {
        tracing::warn!("CONVERTER_TIMEOUT_SECS is unset; a hung converter blocks its job forever");
    }

    let supervisor = Supervisor::new(
        config.pdf_converter.clone(),
        config.fdf_converter.clone(),
        config.converter_timeout,
    );
    let dispatcher = Dispatcher::new(store.clone(), supervisor, &config);

    Sweeper::new(store, config.retention_window, config.sweep_min_age).spawn(config.sweep_interval);

    start_web_server(&config, dispatcher).await
}
