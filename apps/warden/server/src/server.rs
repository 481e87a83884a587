//! Control channel server: registers instances, launches their runtimes and
//! accepts exactly one authenticated socket per live instance.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{future::join_all, SinkExt, StreamExt};
use hyper::server::conn::http1;
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    service::TowerToHyperService,
};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::{control_url, InstanceId, InstanceToken};

use crate::{
    config::{ControlServerConfig, DEFAULT_MAX_HEADER_BYTES},
    error::{LaunchError, ServeError, StartError},
    instance::{Instance, InstanceSnapshot, StopOutcome},
    launcher::{LaunchSpec, Launcher},
    notify::{LaunchEvent, LaunchNotifier},
    service::{ServiceConfig, ServiceLayout},
    task::spawn_supervised,
};

const OUTBOUND_DEPTH: usize = 64;
const LAUNCH_EVENT_DEPTH: usize = 16;

#[derive(Clone)]
pub struct ControlServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ControlServerConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    instances: Mutex<HashMap<InstanceToken, Arc<Instance>>>,
    launcher: Launcher,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

impl ControlServer {
    /// Binds the control listener. Nothing is accepted until [`serve`] runs.
    ///
    /// [`serve`]: ControlServer::serve
    pub async fn bind(
        config: ControlServerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ServeError> {
        config.check()?;
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServeError::Bind {
            addr: config.listen_addr,
            source,
        })?;
        let launcher = Launcher::new(config.restart.clone(), config.kill.clone());
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                listener: Mutex::new(Some(listener)),
                instances: Mutex::new(HashMap::new()),
                launcher,
                cancel,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn control_url(&self, instance: &Instance) -> String {
        control_url(self.inner.local_addr, instance.token())
    }

    /// Accepts control connections until the server's token is cancelled,
    /// then removes (and so kills) every registered instance.
    pub async fn serve(&self) -> Result<(), ServeError> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or(ServeError::AlreadyServing)?;
        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&self.inner));

        let mut http = http1::Builder::new();
        http.timer(TokioTimer::new())
            .header_read_timeout(self.inner.config.header_read_timeout)
            .max_buf_size(self.inner.config.max_header_bytes.max(DEFAULT_MAX_HEADER_BYTES))
            .keep_alive(false);

        info!(listen_addr = %self.inner.local_addr, "control server listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "failed to accept control connection");
                        continue;
                    }
                },
            };

            let connection = http
                .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router.clone()))
                .with_upgrades();
            let cancel = self.inner.cancel.clone();
            // Bounds everything before the upgrade; the upgraded socket is
            // driven by its own task.
            let deadline = self.inner.config.connect_timeout;
            spawn_supervised("control-connection", async move {
                tokio::pin!(connection);
                tokio::select! {
                    result = tokio::time::timeout(deadline, connection.as_mut()) => match result {
                        Ok(Err(err)) => debug!(%peer, error = %err, "control connection failed"),
                        Err(_) => {
                            counter!("warden_connections_rejected_total", 1, "reason" => "slow");
                            debug!(%peer, "control connection timed out before upgrade");
                        }
                        Ok(Ok(())) => {}
                    },
                    _ = cancel.cancelled() => {}
                }
            });
        }

        info!("control server shutting down");
        self.remove_all().await;
        Ok(())
    }

    /// Registers a new instance of `service`, launches its runtime and waits
    /// until the runtime has connected back.
    pub async fn start_instance(
        &self,
        cancel: &CancellationToken,
        service: ServiceConfig,
    ) -> Result<InstanceId, StartError> {
        service.validate()?;
        let launch_cancel = self.inner.cancel.child_token();
        let instance = self.new_instance(&service.name, launch_cancel.clone());
        let layout = ServiceLayout::plan(&self.inner.config.state_dir, &service, instance.id());
        if let Some(dir) = &layout.scratch_dir {
            instance.set_scratch_dir(dir.clone());
        }
        self.register(Arc::clone(&instance));

        match self
            .launch(cancel, &instance, &service, layout, launch_cancel)
            .await
        {
            Ok(()) => {
                counter!("warden_instances_started_total", 1, "service" => service.name.clone());
                info!(
                    instance = %instance.id(),
                    service = %service.name,
                    pid = ?instance.pid(),
                    "instance started"
                );
                Ok(instance.id())
            }
            Err(err) => {
                warn!(instance = %instance.id(), service = %service.name, error = %err, "instance failed to start");
                self.remove_instance(instance.id()).await;
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
        service: &ServiceConfig,
        layout: ServiceLayout,
        launch_cancel: CancellationToken,
    ) -> Result<(), StartError> {
        layout
            .prepare(&service.program)
            .await
            .map_err(StartError::Workspace)?;
        let spec = LaunchSpec {
            executable: self.inner.config.runtime_path.clone(),
            workdir: layout.workdir,
            cache_dir: layout.cache_dir,
            entry_program: layout.entry_program,
            allow_network: service.allow_network,
            control_addr: self.inner.local_addr,
            control_url: self.control_url(instance),
        };
        spec.validate()?;

        let mut connected = instance.connected_watch();
        let (notifier, launch_events) = LaunchNotifier::channel(LAUNCH_EVENT_DEPTH);
        let (failed_tx, failed_rx) = oneshot::channel::<LaunchError>();
        let launcher = self.inner.launcher.clone();
        let id = instance.id();
        let handle = spawn_supervised("launcher", async move {
            match launcher
                .execute(&spec, &launch_cancel, Some(&notifier))
                .await
            {
                Ok(()) | Err(LaunchError::Cancelled) => {
                    debug!(instance = %id, "launcher finished");
                }
                Err(err) => {
                    let _ = failed_tx.send(err);
                }
            }
        });
        instance.set_launcher(handle);
        spawn_supervised(
            "launch-events",
            track_launch_events(Arc::downgrade(instance), launch_events),
        );

        tokio::select! {
            attached = connected.wait_for(|connected| *connected) => {
                attached.map(|_| ()).map_err(|_| StartError::DidNotConnect)
            }
            failed = failed_rx => Err(match failed {
                Ok(err) => StartError::Launch(err),
                Err(_) => StartError::Cancelled,
            }),
            _ = tokio::time::sleep(self.inner.config.connect_timeout) => Err(StartError::DidNotConnect),
            _ = cancel.cancelled() => Err(StartError::Cancelled),
        }
    }

    /// Registers an instance whose runtime is launched by the caller. The
    /// runtime must connect to [`ControlServer::control_url`].
    pub fn register_instance(&self, service: &str) -> Arc<Instance> {
        let instance = self.new_instance(service, self.inner.cancel.child_token());
        self.register(Arc::clone(&instance));
        instance
    }

    fn new_instance(&self, service: &str, launch_cancel: CancellationToken) -> Arc<Instance> {
        Instance::new(
            service,
            self.inner.config.instance.clone(),
            self.inner.config.kill.clone(),
            launch_cancel,
        )
    }

    fn register(&self, instance: Arc<Instance>) {
        debug!(instance = %instance.id(), service = %instance.service(), "instance registered");
        let mut instances = self.inner.instances.lock();
        instances.insert(*instance.token(), instance);
        gauge!("warden_instances_active", instances.len() as f64);
    }

    pub fn instance(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.inner
            .instances
            .lock()
            .values()
            .find(|instance| instance.id() == id)
            .cloned()
    }

    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        let instances: Vec<Arc<Instance>> = self.inner.instances.lock().values().cloned().collect();
        let mut snapshots: Vec<InstanceSnapshot> =
            instances.iter().map(|instance| instance.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Unregisters the instance and kills its process tree.
    pub async fn remove_instance(&self, id: InstanceId) -> bool {
        let removed = {
            let mut instances = self.inner.instances.lock();
            let token = instances
                .iter()
                .find(|(_, instance)| instance.id() == id)
                .map(|(token, _)| *token);
            let removed = token.and_then(|token| instances.remove(&token));
            gauge!("warden_instances_active", instances.len() as f64);
            removed
        };
        let Some(instance) = removed else {
            return false;
        };

        instance.kill().await;
        if let Some(dir) = instance.take_scratch_dir() {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(instance = %id, dir = %dir.display(), error = %err, "failed to remove scratch directory");
                }
            }
        }
        debug!(instance = %id, "instance removed");
        true
    }

    /// Gracefully stops the instance, then removes it.
    pub async fn stop_instance(
        &self,
        cancel: &CancellationToken,
        id: InstanceId,
    ) -> Option<StopOutcome> {
        let instance = self.instance(id)?;
        let outcome = instance.stop(cancel).await;
        self.remove_instance(id).await;
        Some(outcome)
    }

    /// Stops every registered instance concurrently.
    pub async fn stop_all(&self, cancel: &CancellationToken) {
        let ids: Vec<InstanceId> = self.instances().into_iter().map(|s| s.id).collect();
        join_all(ids.into_iter().map(|id| self.stop_instance(cancel, id))).await;
    }

    async fn remove_all(&self) {
        let ids: Vec<InstanceId> = self.instances().into_iter().map(|s| s.id).collect();
        join_all(ids.into_iter().map(|id| self.remove_instance(id))).await;
    }
}

impl ServerInner {
    /// Resolves a presented token to an instance that may still connect.
    fn authorize(&self, raw: &str) -> Result<Arc<Instance>, &'static str> {
        let token = InstanceToken::parse(raw).map_err(|_| "malformed_token")?;
        let instance = self
            .instances
            .lock()
            .get(&token)
            .cloned()
            .ok_or("unknown_token")?;
        if instance.is_killed() {
            return Err("killed");
        }
        if instance.is_connected() {
            return Err("already_connected");
        }
        Ok(instance)
    }
}

async fn track_launch_events(
    instance: Weak<Instance>,
    mut events: mpsc::Receiver<LaunchEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(instance) = instance.upgrade() else {
            break;
        };
        match event {
            LaunchEvent::Started { pid } => instance.set_pid(Some(pid)),
            LaunchEvent::Exited { pid, code } => {
                debug!(instance = %instance.id(), pid, ?code, "runtime process exited");
                instance.clear_pid(pid);
            }
        }
    }
}

fn reject(reason: &'static str) -> Response {
    counter!("warden_connections_rejected_total", 1, "reason" => reason);
    debug!(reason, "control connection rejected");
    // Every rejection reason gets the same response.
    StatusCode::BAD_REQUEST.into_response()
}

async fn ws_handler(
    State(inner): State<Arc<ServerInner>>,
    query: Option<Query<TokenQuery>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return reject("not_upgrade");
    };
    let Some(Query(query)) = query else {
        return reject("missing_token");
    };
    match inner.authorize(&query.token) {
        Ok(instance) => ws.on_upgrade(move |socket| async move {
            spawn_supervised("control-socket", serve_socket(socket, instance)).await.ok();
        }),
        Err(reason) => reject(reason),
    }
}

async fn serve_socket(socket: WebSocket, instance: Arc<Instance>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_DEPTH);
    let Some(handle) = instance.attach_socket(outbound_tx) else {
        // Lost a race with another connection for the same token.
        counter!("warden_connections_rejected_total", 1, "reason" => "already_connected");
        let _ = socket.close().await;
        return;
    };
    counter!("warden_connections_accepted_total", 1);
    info!(instance = %instance.id(), service = %instance.service(), "runtime connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let closed = handle.closed().clone();

    let writer = spawn_supervised("control-writer", {
        let closed = closed.clone();
        async move {
            loop {
                let next = tokio::select! {
                    _ = closed.cancelled() => break,
                    next = outbound_rx.recv() => next,
                };
                let Some(text) = next else { break };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }
    });

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => instance.handle_inbound(&text),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => instance.handle_inbound(text),
                Err(_) => debug!(instance = %instance.id(), "discarding non-utf8 binary message"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(instance = %instance.id(), error = %err, "control socket read failed");
                break;
            }
        }
    }

    instance.detach_socket(handle.generation());
    let _ = writer.await;
    info!(instance = %instance.id(), "runtime disconnected");
}
