use std::{env, path::PathBuf, process::ExitCode};

use tracing::{error, info};

use mcsweep::{
    catalog::Catalog,
    config::{Config, ExportFormat},
    control,
    scanner::Scanner,
    storage::StateDir,
    tracing::init_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // environment problems before the scan starts are exit 2: the wrapper
    // should not bother restarting us into the same wall
    let state_dir = match StateDir::create() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("failed to prepare the state directory: {err:#}");
            return ExitCode::from(2);
        }
    };

    // first command line argument is the location of the config file
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.config_path());
    let config = match Config::load_or_init(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {err:#}", config_path.display());
            return ExitCode::from(2);
        }
    };

    init_tracing(&config, &state_dir.logs_dir());
    info!("config loaded from {}", config_path.display());

    let text_path = PathBuf::from(&config.output_file);
    let json_path = config
        .exports(ExportFormat::Json)
        .then(|| text_path.with_extension("json"));
    let csv_path = config
        .exports(ExportFormat::Csv)
        .then(|| text_path.with_extension("csv"));
    let catalog = match Catalog::open(text_path, json_path, csv_path) {
        Ok(catalog) => catalog,
        Err(err) => {
            error!("failed to open the catalog: {err:#}");
            return ExitCode::from(2);
        }
    };
    info!("catalog seeded with {} known servers", catalog.seen.len());

    let (control, commands) = control::channel();
    let mut scanner = match Scanner::new(config, catalog, state_dir, commands) {
        Ok(scanner) => scanner,
        Err(err) => {
            error!("invalid scan setup: {err:#}");
            return ExitCode::from(2);
        }
    };

    let ctrl_c_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight probes");
            ctrl_c_control.stop();
        }
    });

    match scanner.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("scan failed: {err:#}");
            ExitCode::from(1)
        }
    }
}
