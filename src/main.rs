mod cache;
mod collectors;
mod config;
mod engine;
mod estimator;
mod history;
mod http;
mod links;
mod metrics;
mod state;

use axum::serve;
use clap::Parser;
use config::Config;
use engine::ResourceMonitor;
use links::LinkStore;
use metrics::Metrics;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "linksd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./linksd.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
    /// Overrides `links_db` from the config file.
    #[arg(long)]
    links_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_or_default(&cli.config) {
        Ok((cfg, true)) => cfg,
        Ok((cfg, false)) => {
            warn!(path = %cli.config, "файл конфигурации не найден, используются значения по умолчанию");
            cfg
        }
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(links_db) = cli.links_db {
        cfg.links_db = links_db;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "некорректные параметры запуска");
        std::process::exit(1);
    }

    info!(
        listen = %cfg.listen,
        links_db = %cfg.links_db.display(),
        tick_interval = ?cfg.resources.tick_interval,
        "запуск linksd"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let links = match LinkStore::open(&cfg.links_db).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "не удалось открыть хранилище ссылок");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = ResourceMonitor::new(cfg.resources.clone(), metrics.clone());
    let monitor_task = monitor.start(shutdown_rx.clone());

    let http_task = {
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let app = http::build_router(metrics, monitor, links);
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(addr = %addr, "HTTP-сервер слушает");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = monitor_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
