//! Buddy Blocks entry point: parses configuration, opens the data file and
//! metadata store, runs crash recovery, then starts the batch controller on
//! a dedicated thread and `workers` data-plane threads, each with its own
//! single-threaded Tokio runtime and listening socket.

mod cli;
mod config;
mod controller;
mod http;
mod logging;
mod payload_io;
mod worker;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use buddy_core::DataFile;
use buddy_mailbox::mailbox;
use buddy_store::FjallMetadataStore;
use clap::Parser;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::{ConfigError, RawConfig};
use crate::controller::{Controller, ControllerConfig};
use crate::http::{serve, AppState};
use crate::worker::WorkerHandle;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config) {
        error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<config::Config, ConfigError> {
    let mut raw = match &cli.config {
        Some(path) => RawConfig::from_file(path)?,
        None => RawConfig::default(),
    };
    raw.apply_env_overrides();
    cli.apply(&mut raw);
    raw.resolve()
}

#[derive(Debug, snafu::Snafu)]
enum StartupError {
    #[snafu(display("failed to open data file: {source}"))]
    DataFile { source: buddy_core::DataFileError },
    #[snafu(display("failed to open metadata store: {source}"))]
    MetadataStore { source: buddy_store::OpenError },
    #[snafu(display("startup recovery failed: {source}"))]
    Recovery { source: buddy_core::AllocatorError },
    #[snafu(display("startup self-check failed: {source}"))]
    SelfCheck { source: buddy_core::AllocatorError },
    #[snafu(display("failed to open worker data file handle: {source}"))]
    WorkerDataFile { source: std::io::Error },
}

fn run(config: config::Config) -> Result<(), StartupError> {
    let controller_data_file = Arc::new(
        buddy_core::FileDataController::open(&config.data_file, config.extend_chunk_macro_blocks)
            .map_err(|source| StartupError::DataFile { source })?,
    );
    let store = FjallMetadataStore::open(&config.meta_dir, "metadata")
        .map_err(|source| StartupError::MetadataStore { source })?;

    let controller_cfg = ControllerConfig {
        idle_interval: std::time::Duration::from_nanos(config.controller_idle_ns),
        idempotent_duplicate_hash: config.idempotent_duplicate_hash,
    };

    let mut request_mailboxes: Vec<(buddy_mailbox::Sender<buddy_proto::Request>, buddy_mailbox::Receiver<buddy_proto::Request>)> =
        Vec::with_capacity(config.workers);
    let mut reply_mailboxes: Vec<(buddy_mailbox::Sender<buddy_proto::Reply>, buddy_mailbox::Receiver<buddy_proto::Reply>)> =
        Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        request_mailboxes.push(mailbox(config.mailbox_capacity).expect("mailbox_capacity validated as power of two"));
        reply_mailboxes.push(mailbox(config.mailbox_capacity).expect("mailbox_capacity validated as power of two"));
    }

    let (request_senders, request_receivers): (Vec<_>, Vec<_>) = request_mailboxes.into_iter().unzip();
    let (reply_senders, reply_receivers): (Vec<_>, Vec<_>) = reply_mailboxes.into_iter().unzip();

    let mut controller = Controller::new(
        store,
        Box::new(CloneableDataFile(Arc::clone(&controller_data_file))),
        request_receivers,
        reply_senders,
        controller_cfg,
    );
    controller.recover().map_err(|source| StartupError::Recovery { source })?;
    info!("startup recovery complete, data file size = {} bytes", controller_data_file.size());

    let counts = controller.self_check().map_err(|source| StartupError::SelfCheck { source })?;
    for class in buddy_core::SizeClass::ALL {
        let i = class.ordinal() as usize;
        info!(
            ?class,
            free = counts.free[i],
            temp = counts.temp[i],
            occupied = counts.occupied[i],
            "startup self-check"
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    spawn_shutdown_watcher(Arc::clone(&running));

    let controller_running = Arc::clone(&running);
    let controller_thread = std::thread::Builder::new()
        .name("buddy-controller".into())
        .spawn(move || controller.run(&controller_running))
        .expect("failed to spawn controller thread");

    let mut worker_threads = Vec::with_capacity(config.workers);
    for (id, (to_controller, from_controller)) in request_senders.into_iter().zip(reply_receivers).enumerate() {
        let worker_running = Arc::clone(&running);
        let data_file_path = config.data_file.clone();
        let pool_target_free = config.pool_target_free;
        let worker_poll_ns = config.worker_poll_ns;
        let port = config.port;
        let shutdown_grace_ms = config.shutdown_grace_ms;
        let handle = std::thread::Builder::new()
            .name(format!("buddy-worker-{id}"))
            .spawn(move || {
                run_worker(
                    id as u16,
                    to_controller,
                    from_controller,
                    data_file_path,
                    pool_target_free,
                    worker_poll_ns,
                    port,
                    shutdown_grace_ms,
                    worker_running,
                )
            })
            .expect("failed to spawn worker thread");
        worker_threads.push(handle);
    }

    controller_thread.join().expect("controller thread panicked");
    for handle in worker_threads {
        let _ = handle.join();
    }
    Ok(())
}

/// `FileDataController` owns its file handle behind an `Arc` inside the
/// controller thread only; this thin wrapper lets the controller hold a
/// `Box<dyn DataFile>` without giving up the `Arc` the startup logger needs.
struct CloneableDataFile(Arc<buddy_core::FileDataController>);

impl buddy_core::DataFile for CloneableDataFile {
    fn size(&self) -> u64 {
        self.0.size()
    }

    fn extend(&self, additional_bytes: u64) -> Result<(), buddy_core::DataFileError> {
        self.0.extend(additional_bytes)
    }

    fn chunk_bytes(&self) -> u64 {
        self.0.chunk_bytes()
    }
}

fn spawn_shutdown_watcher(running: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("buddy-shutdown-watcher".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build shutdown-watcher runtime");
            rt.block_on(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received, draining in-flight requests");
                running.store(false, Ordering::Relaxed);
            });
        })
        .expect("failed to spawn shutdown watcher thread");
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    id: u16,
    to_controller: buddy_mailbox::Sender<buddy_proto::Request>,
    from_controller: buddy_mailbox::Receiver<buddy_proto::Reply>,
    data_file_path: std::path::PathBuf,
    pool_target_free: [usize; buddy_core::SizeClass::POOLABLE.len()],
    worker_poll_ns: u64,
    port: u16,
    shutdown_grace_ms: u64,
    running: Arc<AtomicBool>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let data_file = match std::fs::OpenOptions::new().read(true).write(true).open(&data_file_path) {
            Ok(file) => Arc::new(file),
            Err(err) => {
                error!(worker_id = id, error = %err, "worker failed to open data file");
                return;
            }
        };

        let handle = WorkerHandle::new(id, to_controller, from_controller, pool_target_free);
        let pump = handle.clone();
        let poll_sleep = std::time::Duration::from_nanos(worker_poll_ns);
        tokio::task::spawn_local(async move { pump.run_pump(poll_sleep).await });

        let state = Arc::new(AppState { handle, data_file });
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = match bind_reuseport(addr) {
            Ok(listener) => listener,
            Err(err) => {
                error!(worker_id = id, error = %err, "worker failed to bind listener");
                return;
            }
        };
        info!(worker_id = id, %addr, "worker listening");

        // Tracks every in-flight connection task so shutdown can wait for
        // them (up to a bounded grace period) instead of dropping the
        // `LocalSet` out from under them.
        let mut connections = tokio::task::JoinSet::new();

        while running.load(Ordering::Relaxed) {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                    while connections.try_join_next().is_some() {}
                    continue;
                }
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(worker_id = id, error = %err, "accept failed");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let state = Arc::clone(&state);
            connections.spawn_local(async move {
                let service = hyper::service::service_fn(move |req| serve(Arc::clone(&state), req));
                if let Err(err) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(error = %err, "connection closed with error");
                }
            });
        }

        info!(worker_id = id, in_flight = connections.len(), "accept loop stopped, draining in-flight connections");
        let grace = std::time::Duration::from_millis(shutdown_grace_ms);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(worker_id = id, remaining = connections.len(), "shutdown grace period elapsed, aborting remaining connections");
            connections.shutdown().await;
        }
    });
}

fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { tokio::net::TcpSocket::new_v4()? } else { tokio::net::TcpSocket::new_v6()? };
    socket.set_reuseport(true)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}
