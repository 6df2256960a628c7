// Shoebox server binary
//
// Runs the startup sequence and parks as the host process for the watcher,
// scheduler, and indexing worker. The HTTP surface mounts on top of the
// library separately.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use shoebox::config::Config;
use shoebox::{bootstrap, health};

#[derive(Parser)]
#[command(name = "shoebox")]
#[command(about = "Photo/video library backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Photo library root
    #[arg(long, env = "PHOTOS_DIR")]
    photos_dir: PathBuf,

    /// Data directory for the catalog databases (defaults to the platform
    /// data dir)
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Thumbnail output root (defaults to <data-dir>/thumbs)
    #[arg(long, env = "THUMBS_DIR")]
    thumbs_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "shoebox")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./shoebox-data"))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let thumbs_dir = cli.thumbs_dir.unwrap_or_else(|| data_dir.join("thumbs"));
    let config = Config::from_env(cli.photos_dir, data_dir, thumbs_dir);

    info!(
        "Starting shoebox: photos={} data={} thumbs={}",
        config.photos_dir.display(),
        config.data_dir.display(),
        config.thumbs_dir.display()
    );

    let app = match bootstrap::run(config) {
        Ok(app) => app,
        Err(e) => {
            error!("Startup failed: {}", e);
            // Give the logger a moment to flush before exiting.
            std::thread::sleep(Duration::from_millis(200));
            std::process::exit(1);
        }
    };

    // Park as the host process; periodically surface health degradation.
    loop {
        std::thread::sleep(Duration::from_secs(60));
        let report = health::check(
            &app.store,
            &app.kv,
            app.service.indexer(),
            app.redis_configured,
        );
        if !report.ok {
            for issue in &report.issues {
                warn!("Health: {} - {}", issue.code, issue.detail);
            }
        }
    }
}
