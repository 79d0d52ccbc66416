//! # backup-engine
//! The daemon that runs scheduled backups and cleanup.
//!

use std::{fs, path::PathBuf, sync::Arc};

use backup_engine::{
    BackupService, Config, ServiceSettings,
    archive_store::{ArchiveStore, DirectoryMirror, ObjectStore},
    catalog::Catalog,
    notify::LogNotifier,
    scheduler::{Schedule, SchedulerHandle},
    store::DirectoryStore,
};
use mimalloc::MiMalloc;
use shared::{Failure, init_logger};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    // Initialize config if args include 'init'.
    if std::env::args().any(|arg| arg.eq("init")) {
        let config = Config::default();
        let contents =
            toml::to_string_pretty(&config).or_log_and_panic("Could not serialize config file");
        fs::write("config.toml", contents).or_log_and_panic("Could not create config file");
        return;
    }

    // Load config
    let config =
        Config::load_toml(PathBuf::from("./config.toml")).or_log_and_panic("Could not load config");

    let _logger = init_logger(&config.log).or_log_and_panic("Could not start logging");

    let store =
        DirectoryStore::open(config.store_directory.clone()).or_log_and_panic("Could not open store");
    let catalog = Catalog::load_or_create(config.catalog_file.clone())
        .or_log_and_panic("Could not load or create catalog");

    let mirror = config.mirror.as_ref().map(|mirror| {
        Arc::new(DirectoryMirror::new(mirror.directory.clone())) as Arc<dyn ObjectStore>
    });
    let archives = ArchiveStore::new(config.backup_directory.clone(), mirror)
        .or_log_and_panic("Could not open backup directory");

    let service = BackupService::new(
        Arc::new(store),
        Arc::new(catalog),
        archives,
        ServiceSettings::from_config(&config),
        Arc::new(LogNotifier),
    );

    let scheduler = SchedulerHandle::new(service.clone(), Schedule::from(&config.schedule));
    scheduler.start();

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {error}");
    }

    info!("Shutting down");
    scheduler.shutdown().await;
    service.shutdown().await;
}
