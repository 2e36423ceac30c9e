mod cache;
mod config;
mod dns;
mod engine;
mod loader;
mod mac;
mod rules;
mod schedule;
mod shutdown;
mod trie;
mod updater;
mod users;

use std::{path::PathBuf, sync::Arc};

use tracing::{error, info, warn};

struct CliArgs {
    config: PathBuf,
    data: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut cli = CliArgs {
        config: PathBuf::from("config.yaml"),
        data: PathBuf::from("data"),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(p) = args.next() {
                    cli.config = PathBuf::from(p);
                }
            }
            "--data" => {
                if let Some(p) = args.next() {
                    cli.data = PathBuf::from(p);
                }
            }
            _ => {}
        }
    }
    cli
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();

    let config = match config::Config::load(&args.config) {
        Ok(cfg) => {
            info!(path = %args.config.display(), "configuration loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %args.config.display(), error = %e, "failed to load config, using defaults");
            config::Config::default()
        }
    };

    // Engine construction validates user addresses and schedules; a bad
    // entry here is fatal before the server ever binds.
    let engine = Arc::new(engine::Engine::new(config.clone())?);

    let loader = Arc::new(loader::Loader::new(&args.data));
    engine.reload(&loader).await;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    updater::spawn_refresh(&config, engine.clone(), loader.clone(), shutdown_rx.clone());

    let decision_cache = Arc::new(cache::TtlCache::new());
    let upstream_cache = Arc::new(cache::TtlCache::new());
    decision_cache.spawn_sweeper(shutdown_rx.clone());
    upstream_cache.spawn_sweeper(shutdown_rx.clone());

    let server = dns::DnsServer::new(dns::DnsServerDeps {
        engine,
        mac: Arc::new(mac::MacResolver::new(time::Duration::minutes(5))),
        decision_cache,
        upstream_cache,
        listen: config.server.listen_socket_addr()?,
        upstream: config.server.upstream_socket_addr()?,
    });

    let mut server_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { server.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown requested");
            shutdown_tx.trigger();
            match server_task.await {
                Ok(Ok(())) => {}
                Ok(Err(run_err)) => error!(error = %run_err, "dns server error"),
                Err(join_err) => error!(error = %join_err, "dns task join error"),
            }
        }
        res = &mut server_task => {
            shutdown_tx.trigger();
            match res {
                Ok(Ok(())) => {}
                Ok(Err(run_err)) => error!(error = %run_err, "dns server error"),
                Err(join_err) => error!(error = %join_err, "dns task join error"),
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
