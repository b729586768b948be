// src/main.rs

//! # afr entry point
//!
//! Parses the command line and runs one of three commands:
//!
//! - `serve`: the hub, plus file serving and watching when directories are given.
//! - `send`: posts one message to a running hub.
//! - `listen`: follows a running hub the way a browser page would.

use afr::broad::{Broad, BroadOptions};
use afr::config::{self, AppConfig, CliArgs, Command, RemoteArgs, RemoteConfig, SendArgs, ServeArgs};
use afr::msg::Msg;
use afr::serve::FileServer;
use afr::{receiver, remote, watcher, web};
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if config::wants_help(&args) {
        config::print_help()?;
        return Ok(());
    }

    match CliArgs::parse().command {
        Command::Serve(args) => run_serve(args).await,
        Command::Send(args) => run_send(args).await,
        Command::Listen(args) => run_listen(args.remote).await,
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn config_or_exit<T>(loaded: Result<T, afr::error::AfrError>) -> T {
    match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let app_config = Arc::new(config_or_exit(AppConfig::from_args(&args)));
    init_tracing(&app_config.log_level)?;
    tracing::info!("afr starting with configuration: {:?}", app_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broad = Broad::new(BroadOptions {
        namespace: app_config.namespace.clone(),
        ..Default::default()
    });

    let dirs = Arc::new(app_config.served_dirs()?);
    let files = if dirs.is_empty() {
        tracing::info!("No directories given, serving hub routes only.");
        None
    } else {
        Some(Arc::new(
            FileServer::new(dirs.as_ref().clone()).site(app_config.site),
        ))
    };

    let mut tasks = Vec::new();

    if !dirs.is_empty() {
        let (msg_tx, mut msg_rx) = mpsc::channel::<Msg>(100);
        watcher::run_watcher(Arc::clone(&dirs), app_config.key.clone(), msg_tx).await?;

        // Forward watcher messages to every subscribed client.
        let hub = broad.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = msg_rx.recv() => {
                        match hub.send(&msg) {
                            Ok(count) => tracing::debug!("Sent {:?} to {} clients", msg, count),
                            Err(e) => tracing::error!("Failed to broadcast {:?}: {}", msg, e),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("Forwarding loop shutting down.");
                            break;
                        }
                    }
                    else => {
                        tracing::info!("Watcher channel closed. Forwarding loop exiting.");
                        break;
                    }
                }
            }
        }));
    }

    let mut server = tokio::spawn(web::start_server(
        Arc::clone(&app_config),
        broad,
        files,
        shutdown_rx,
    ));

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => tracing::info!("Ctrl-C received, initiating shutdown..."),
                Err(err) => tracing::error!("Failed to listen for Ctrl-C signal: {}", err),
            }
            None
        }
        res = &mut server => Some(res),
    };

    if shutdown_tx.send(true).is_err() {
        tracing::debug!("No task is waiting for the shutdown signal");
    }

    let server_result = match finished {
        Some(res) => res,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Web server exited with error: {}", e),
        Err(e) => tracing::error!("Web server task panicked: {}", e),
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("A task panicked or exited with error: {}", e);
        }
    }

    tracing::info!("afr shut down gracefully.");
    Ok(())
}

async fn run_send(args: SendArgs) -> Result<()> {
    let remote_config = config_or_exit(RemoteConfig::from_args(&args.remote));
    init_tracing(&remote_config.log_level)?;

    let mut msg = Msg::new(args.kind).with_key(remote_config.key.clone());
    if let Some(path) = args.path {
        msg = msg.with_path(path);
    }
    let reply = remote::send(&remote_config.loc, &msg).await?;
    println!("{}", reply);
    Ok(())
}

async fn run_listen(args: RemoteArgs) -> Result<()> {
    let remote_config = config_or_exit(RemoteConfig::from_args(&args));
    init_tracing(&remote_config.log_level)?;
    tracing::info!("Listening to {}", remote_config.loc.base()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener = tokio::spawn(receiver::run_listener(
        remote_config.loc,
        remote_config.key,
        None,
        shutdown_rx,
    ));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::error!("Failed to listen for Ctrl-C signal: {}", err);
            }
            if shutdown_tx.send(true).is_err() {
                tracing::debug!("Listener already stopped");
            }
            listener.await??;
        }
        res = &mut listener => res??,
    }
    Ok(())
}
