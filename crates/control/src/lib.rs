//! Admin endpoints and engine lifecycle.
//!
//! One process-wide [`Core`] owns the rule store, the record queue, the
//! monitor worker and the two TCP endpoints: a request/reply control channel
//! and a one-way monitor channel. Startup builds everything in dependency
//! order and [`CoreHandle::shutdown`] tears it down in reverse; the
//! accept-unload and accept-detach flags gate the destructive paths and
//! default to off.
//!
//! Each channel admits a single peer at a time. Control requests are handled
//! serially per connection and any failure is returned to the admin as a
//! platform status code on the reply header.

#![deny(unsafe_code)]

use fsgate_core::config::Config;
use fsgate_core::status::OpStatus;
use fsgate_core::version::CORE_VERSION;
use intercept::{HostOps, Pipeline};
use monitor::{FrameSink, RecordQueue};
use rules::{RuleStore, StoreError};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wire::{Reply, ReplyPayload, Request, WireError};

/// Startup failures.
#[derive(Debug, Error)]
pub enum StartError {
    /// An endpoint could not be bound.
    #[error("bind {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: String,
        /// Underlying socket error.
        source: std::io::Error,
    },
}

/// Process-wide engine state shared by the endpoints and the lifecycle.
pub struct Core {
    store: Arc<RuleStore>,
    queue: Arc<RecordQueue>,
    accept_unload: AtomicBool,
    accept_detach: AtomicBool,
    admin_connected: AtomicBool,
    attached_volumes: Mutex<HashSet<String>>,
    port_tx: watch::Sender<Option<FrameSink>>,
    terminate_tx: watch::Sender<bool>,
    monitor_gen: AtomicU64,
    port_lock: Mutex<()>,
}

/// Running engine: the core plus its spawned tasks and bound addresses.
pub struct CoreHandle {
    core: Arc<Core>,
    config: Config,
    control_addr: SocketAddr,
    monitor_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
    control_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

/// Start the engine: configuration, store, queue, endpoints, worker, in that
/// order. A bind failure unwinds whatever was built before it.
pub async fn start(config: Config) -> Result<CoreHandle, StartError> {
    let store = Arc::new(RuleStore::new());
    let queue = Arc::new(RecordQueue::new(config.max_records));
    let (port_tx, port_rx) = watch::channel(None::<FrameSink>);
    let (terminate_tx, terminate_rx) = watch::channel(false);

    let control_listener = TcpListener::bind(&config.control_addr).await.map_err(|source| {
        StartError::Bind { addr: config.control_addr.clone(), source }
    })?;
    let monitor_listener = TcpListener::bind(&config.monitor_addr).await.map_err(|source| {
        StartError::Bind { addr: config.monitor_addr.clone(), source }
    })?;
    let control_addr = control_listener.local_addr().map_err(|source| StartError::Bind {
        addr: config.control_addr.clone(),
        source,
    })?;
    let monitor_addr = monitor_listener.local_addr().map_err(|source| StartError::Bind {
        addr: config.monitor_addr.clone(),
        source,
    })?;

    let core = Arc::new(Core {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        accept_unload: AtomicBool::new(false),
        accept_detach: AtomicBool::new(false),
        admin_connected: AtomicBool::new(false),
        attached_volumes: Mutex::new(HashSet::new()),
        port_tx,
        terminate_tx,
        monitor_gen: AtomicU64::new(0),
        port_lock: Mutex::new(()),
    });

    let worker = tokio::spawn(monitor::run_worker(queue, port_rx, terminate_rx));
    let control_task = tokio::spawn(control_accept_loop(Arc::clone(&core), control_listener));
    let monitor_task = tokio::spawn(monitor_accept_loop(Arc::clone(&core), monitor_listener));

    info!(%control_addr, %monitor_addr, max_records = config.max_records, "fsgate core started");
    Ok(CoreHandle {
        core,
        config,
        control_addr,
        monitor_addr,
        worker: Some(worker),
        control_task,
        monitor_task,
    })
}

impl CoreHandle {
    /// Shared rule store, for wiring an interception pipeline.
    #[must_use]
    pub fn store(&self) -> Arc<RuleStore> {
        Arc::clone(&self.core.store)
    }

    /// Shared record queue.
    #[must_use]
    pub fn queue(&self) -> Arc<RecordQueue> {
        Arc::clone(&self.core.queue)
    }

    /// Build an interception pipeline bound to this core's store and queue,
    /// honoring the configured open-denial status.
    pub fn pipeline<H: HostOps>(&self, host: H) -> Pipeline<H> {
        let pipeline = Pipeline::new(self.store(), self.queue(), host);
        if self.config.deny_open_with_not_found {
            pipeline.with_deny_open_status(OpStatus::NOT_FOUND)
        } else {
            pipeline
        }
    }

    /// Bound address of the control endpoint.
    #[must_use]
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Bound address of the monitor channel.
    #[must_use]
    pub fn monitor_addr(&self) -> SocketAddr {
        self.monitor_addr
    }

    /// Whether an admin has made unload acceptable.
    #[must_use]
    pub fn accept_unload(&self) -> bool {
        self.core.accept_unload.load(Ordering::SeqCst)
    }

    /// Record a volume as filtered.
    pub fn attach_volume(&self, volume: impl Into<String>) {
        self.core.attached_volumes.lock().expect("volume set lock poisoned").insert(volume.into());
    }

    /// Stop filtering one volume. Requires the accept-detach flag; an
    /// unknown volume reports not-found.
    pub fn detach_volume(&self, volume: &str) -> Result<(), OpStatus> {
        if !self.core.accept_detach.load(Ordering::SeqCst) {
            return Err(OpStatus::DEVICE_BUSY);
        }
        let mut volumes =
            self.core.attached_volumes.lock().expect("volume set lock poisoned");
        if volumes.remove(volume) {
            info!(volume, "volume detached");
            Ok(())
        } else {
            Err(OpStatus::NOT_FOUND)
        }
    }

    /// Tear the engine down: draining store, worker stop bounded at 100 ms,
    /// endpoints closed, queue cleared. Refused until an admin set the
    /// accept-unload flag; past that point problems are logged, never
    /// blocking.
    pub async fn shutdown(&mut self) -> Result<(), OpStatus> {
        if !self.accept_unload() {
            warn!("shutdown refused: unload not acceptable");
            return Err(OpStatus::DEVICE_BUSY);
        }
        self.core.store.set_draining();
        if let Some(worker) = self.worker.take() {
            monitor::shutdown_worker(worker, &self.core.terminate_tx, &self.core.queue).await;
        }
        self.control_task.abort();
        self.monitor_task.abort();
        let cleared = self.core.queue.clear();
        info!(cleared, "fsgate core torn down");
        Ok(())
    }
}

/// Map store failures onto reply status codes.
fn store_status(err: &StoreError) -> OpStatus {
    match err {
        StoreError::InvalidRule(_) => OpStatus::INVALID_PARAMETER,
        StoreError::Busy => OpStatus::DEVICE_BUSY,
    }
}

/// Dispatch one admin request against the core.
fn handle_request(core: &Core, request: Request) -> Reply {
    match request {
        Request::GetCoreVersion => Reply::ok(ReplyPayload::Version(CORE_VERSION)),
        Request::SetUnloadAcceptable(value) => {
            core.accept_unload.store(value, Ordering::SeqCst);
            info!(value, "unload acceptable toggled");
            Reply::ok(ReplyPayload::Empty)
        }
        Request::SetDetachAcceptable(value) => {
            core.accept_detach.store(value, Ordering::SeqCst);
            info!(value, "detach acceptable toggled");
            Reply::ok(ReplyPayload::Empty)
        }
        Request::AddRules(rules) => match core.store.add(&rules) {
            Ok(added) => Reply::ok(ReplyPayload::AffectedCount(added as u32)),
            Err(e) => {
                warn!(error = %e, "add rules failed");
                Reply::failed(store_status(&e))
            }
        },
        Request::RemoveRules(rules) => match core.store.remove(&rules) {
            Ok(removed) => Reply::ok(ReplyPayload::AffectedCount(removed as u32)),
            Err(e) => {
                warn!(error = %e, "remove rules failed");
                Reply::failed(store_status(&e))
            }
        },
        Request::QueryRules => Reply::ok(ReplyPayload::Rules(core.store.query())),
        Request::CheckMatchedRule(path) => {
            Reply::ok(ReplyPayload::Rules(core.store.check_matches(&path)))
        }
        Request::CleanupRules => match core.store.cleanup() {
            Ok(removed) => Reply::ok(ReplyPayload::AffectedCount(removed as u32)),
            Err(e) => {
                warn!(error = %e, "cleanup rules failed");
                Reply::failed(store_status(&e))
            }
        },
    }
}

async fn control_accept_loop(core: Arc<Core>, listener: TcpListener) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "control accept failed");
                break;
            }
        };
        if core.admin_connected.swap(true, Ordering::SeqCst) {
            // Already serving an admin; turn this one away with Busy.
            warn!(%peer, "admin port busy, rejecting connection");
            let _ = wire::write_reply(&mut stream, &Reply::failed(OpStatus::DEVICE_BUSY)).await;
            continue;
        }
        info!(%peer, "admin connected");
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            serve_control(&core, stream).await;
            core.admin_connected.store(false, Ordering::SeqCst);
            info!("admin disconnected");
        });
    }
}

async fn serve_control(core: &Core, mut stream: TcpStream) {
    loop {
        match wire::read_request(&mut stream).await {
            Ok(Some(request)) => {
                debug!(?request, "admin request");
                let reply = handle_request(core, request);
                if wire::write_reply(&mut stream, &reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(WireError::Io(e)) => {
                debug!(error = %e, "admin stream failed");
                break;
            }
            Err(e) => {
                // Malformed but fully-consumed message: report the status
                // and keep the connection.
                warn!(error = %e, "malformed admin request");
                if wire::write_reply(&mut stream, &Reply::failed(e.status())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn monitor_accept_loop(core: Arc<Core>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "monitor accept failed");
                break;
            }
        };
        let generation = {
            let _guard = core.port_lock.lock().expect("port lock poisoned");
            if core.port_tx.borrow().is_some() {
                warn!(%peer, "monitor port busy, rejecting consumer");
                continue;
            }
            let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(32);
            let generation = core.monitor_gen.fetch_add(1, Ordering::SeqCst) + 1;
            core.port_tx.send(Some(frame_tx)).ok();
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                forward_frames(stream, frame_rx).await;
                let _guard = core.port_lock.lock().expect("port lock poisoned");
                // Only clear the port if no newer consumer replaced us.
                if core.monitor_gen.load(Ordering::SeqCst) == generation {
                    core.port_tx.send(None).ok();
                }
                info!("monitor consumer detached");
            });
            generation
        };
        // Frames may be pending from before the attach.
        core.queue.raise_wake();
        info!(%peer, generation, "monitor consumer attached");
    }
}

/// Push frames to the consumer socket until it closes or the channel ends.
async fn forward_frames(stream: TcpStream, mut frames: mpsc::Receiver<Vec<u8>>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut probe = [0u8; 16];
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(body) => {
                    if wire::write_frame(&mut writer, &body).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = reader.read(&mut probe) => match read {
                // The channel is one-way; any read completion means the
                // consumer went away.
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
}
