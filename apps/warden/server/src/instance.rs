//! A launched runtime as seen by the supervisor: its control socket, the
//! responses it has sent back, and the shutdown state machine.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, watch, Notify, OnceCell},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::{
    already_stopped_payload, ControlFrame, CorrelationId, FrameKind, InstanceId, InstanceToken,
    ALL_STOPPED_EVENT,
};

use crate::{
    config::{InstanceTimings, KillOptions},
    error::CallError,
    process_tree::{kill_tree, process_exists},
};

/// Upper bound on waiting for the launcher task after it was cancelled.
const LAUNCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shutdown state of an instance. It only ever moves forward; both
/// `StoppedGracefully` and `Killed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    #[default]
    Running,
    StopRequested,
    StoppedGracefully,
    Killed,
}

/// How a call to [`Instance::stop`] ended. The process is killed in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    /// The child announced that everything it runs has stopped.
    Graceful,
    /// The child answered that it had stopped before.
    AlreadyStopped,
    /// No acknowledgement before the deadline, or nothing to ask.
    Forced,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub service: String,
    pub pid: Option<u32>,
    pub connected: bool,
    pub lifecycle: Lifecycle,
}

/// Outbound half of an attached control socket.
#[derive(Debug, Clone)]
pub(crate) struct SocketHandle {
    generation: u64,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl SocketHandle {
    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn is_live(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

struct RetainedResponse {
    payload: Option<Value>,
    received: Instant,
}

#[derive(Default)]
struct InstanceState {
    socket: Option<SocketHandle>,
    responses: HashMap<CorrelationId, RetainedResponse>,
    pid: Option<u32>,
    lifecycle: Lifecycle,
    launcher: Option<JoinHandle<Option<()>>>,
    scratch_dir: Option<PathBuf>,
}

pub struct Instance {
    id: InstanceId,
    token: InstanceToken,
    service: String,
    timings: InstanceTimings,
    kill_options: KillOptions,
    state: Mutex<InstanceState>,
    /// Connection history only; shutdown state lives in `state.lifecycle`.
    connected_once: AtomicBool,
    socket_generation: AtomicU64,
    responses_changed: Notify,
    events: broadcast::Sender<ControlFrame>,
    connected: watch::Sender<bool>,
    launch_cancel: CancellationToken,
    stop_once: OnceCell<StopOutcome>,
    kill_once: OnceCell<()>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn new(
        service: impl Into<String>,
        timings: InstanceTimings,
        kill_options: KillOptions,
        launch_cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(timings.event_buffer.max(1));
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            id: InstanceId::new(),
            token: InstanceToken::generate(),
            service: service.into(),
            timings,
            kill_options,
            state: Mutex::new(InstanceState::default()),
            connected_once: AtomicBool::new(false),
            socket_generation: AtomicU64::new(0),
            responses_changed: Notify::new(),
            events,
            connected,
            launch_cancel,
            stop_once: OnceCell::new(),
            kill_once: OnceCell::new(),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn token(&self) -> &InstanceToken {
        &self.token
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    /// Whether a live control socket is attached right now.
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .socket
            .as_ref()
            .is_some_and(SocketHandle::is_live)
    }

    pub fn has_connected(&self) -> bool {
        self.connected_once.load(Ordering::Acquire)
    }

    /// True once the lifecycle is terminal. A graceful stop counts: its
    /// kill phase follows immediately and the runtime is no longer served.
    pub fn is_killed(&self) -> bool {
        self.lifecycle().is_terminal()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Moves the lifecycle to `next` unless it is already there or further.
    fn advance(&self, next: Lifecycle) {
        let mut state = self.state.lock();
        if next.rank() > state.lifecycle.rank() {
            debug!(instance = %self.id, from = ?state.lifecycle, to = ?next, "lifecycle transition");
            state.lifecycle = next;
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            service: self.service.clone(),
            pid: self.pid(),
            connected: self.is_connected(),
            lifecycle: self.lifecycle(),
        }
    }

    /// Events pushed by the child. Not consumed by anything in the
    /// supervisor itself apart from the shutdown handshake.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlFrame> {
        self.events.subscribe()
    }

    pub(crate) fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    /// Forgets `pid` once that process has exited.
    pub(crate) fn clear_pid(&self, pid: u32) {
        let mut state = self.state.lock();
        if state.pid == Some(pid) {
            state.pid = None;
        }
    }

    pub(crate) fn set_launcher(&self, handle: JoinHandle<Option<()>>) {
        self.state.lock().launcher = Some(handle);
    }

    pub(crate) fn set_scratch_dir(&self, dir: PathBuf) {
        self.state.lock().scratch_dir = Some(dir);
    }

    pub(crate) fn take_scratch_dir(&self) -> Option<PathBuf> {
        self.state.lock().scratch_dir.take()
    }

    /// Attaches a freshly accepted socket. Refused once the instance was
    /// killed or while another socket is still live.
    pub(crate) fn attach_socket(&self, outbound: mpsc::Sender<String>) -> Option<SocketHandle> {
        let mut state = self.state.lock();
        let live = state.socket.as_ref().is_some_and(SocketHandle::is_live);
        if state.lifecycle.is_terminal() || live {
            return None;
        }
        let handle = SocketHandle {
            generation: self.socket_generation.fetch_add(1, Ordering::Relaxed) + 1,
            outbound,
            closed: CancellationToken::new(),
        };
        state.socket = Some(handle.clone());
        drop(state);

        self.connected_once.store(true, Ordering::Release);
        self.connected.send_replace(true);
        Some(handle)
    }

    pub(crate) fn detach_socket(&self, generation: u64) {
        let mut state = self.state.lock();
        if state
            .socket
            .as_ref()
            .is_some_and(|socket| socket.generation == generation)
        {
            if let Some(socket) = state.socket.take() {
                socket.closed.cancel();
            }
        }
        drop(state);
        self.connected.send_replace(false);
        self.responses_changed.notify_waiters();
    }

    /// Routes one inbound text message. Anything that is not a well-formed
    /// response or event is dropped.
    pub(crate) fn handle_inbound(&self, text: &str) {
        let frame = match ControlFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                counter!("warden_frames_discarded_total", 1, "reason" => "undecodable");
                debug!(instance = %self.id, error = %err, "discarding inbound message");
                return;
            }
        };
        match (frame.kind, frame.id) {
            (FrameKind::Response, Some(id)) => self.record_response(id, frame.payload),
            (FrameKind::Event, _) => {
                let frame = ControlFrame { id: None, ..frame };
                // No subscribers is fine.
                let _ = self.events.send(frame);
            }
            _ => {
                counter!("warden_frames_discarded_total", 1, "reason" => "unexpected_kind");
                debug!(instance = %self.id, kind = ?frame.kind, "ignoring inbound frame");
            }
        }
    }

    fn record_response(&self, id: CorrelationId, payload: Option<Value>) {
        self.state.lock().responses.insert(
            id,
            RetainedResponse {
                payload,
                received: Instant::now(),
            },
        );
        self.responses_changed.notify_waiters();
    }

    fn take_response(&self, id: &CorrelationId) -> Option<Option<Value>> {
        self.state
            .lock()
            .responses
            .remove(id)
            .map(|retained| retained.payload)
    }

    fn purge_expired(&self) {
        let retention = self.timings.response_retention;
        let mut state = self.state.lock();
        let before = state.responses.len();
        state
            .responses
            .retain(|_, retained| retained.received.elapsed() < retention);
        let purged = before - state.responses.len();
        if purged > 0 {
            counter!("warden_responses_purged_total", purged as u64);
        }
    }

    #[cfg(test)]
    fn retained_responses(&self) -> usize {
        self.state.lock().responses.len()
    }

    async fn send_frame(&self, frame: &ControlFrame) -> Result<(), CallError> {
        let text = frame.encode()?;
        let outbound = {
            let state = self.state.lock();
            match state.socket.as_ref() {
                Some(socket) if socket.is_live() => socket.outbound.clone(),
                _ => return Err(CallError::NotConnected),
            }
        };
        outbound
            .send(text)
            .await
            .map_err(|_| CallError::NotConnected)
    }

    /// Sends a request and waits for the response carrying its correlation
    /// id. Responses may arrive in any order.
    pub async fn call_method(
        &self,
        cancel: &CancellationToken,
        method: &str,
        payload: Option<Value>,
    ) -> Result<Value, CallError> {
        let started = Instant::now();
        let result = self.call_inner(cancel, method, payload).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.metric_label(),
        };
        counter!("warden_rpc_calls_total", 1, "outcome" => outcome);
        histogram!(
            "warden_rpc_call_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    async fn call_inner(
        &self,
        cancel: &CancellationToken,
        method: &str,
        payload: Option<Value>,
    ) -> Result<Value, CallError> {
        if self.is_killed() {
            return Err(CallError::Killed);
        }
        let frame = ControlFrame::request(method, payload);
        let id = frame.id.clone().ok_or(CallError::NotConnected)?;
        self.send_frame(&frame).await?;

        let timeout = self.timings.call_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.responses_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }
            if self.is_killed() {
                return Err(CallError::Killed);
            }
            self.purge_expired();
            if let Some(payload) = self.take_response(&id) {
                return Ok(payload.unwrap_or(Value::Null));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CallError::TimedOut(timeout));
            }

            let wait = self.timings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Asks the child to stop, then kills its process tree whatever the
    /// answer. Only the first caller runs the sequence; later callers get
    /// the same outcome.
    pub async fn stop(&self, cancel: &CancellationToken) -> StopOutcome {
        *self
            .stop_once
            .get_or_init(|| async {
                self.advance(Lifecycle::StopRequested);
                let outcome = self.request_stop(cancel).await;
                if outcome != StopOutcome::Forced {
                    self.advance(Lifecycle::StoppedGracefully);
                }
                self.kill().await;
                counter!("warden_instance_stops_total", 1, "outcome" => outcome.metric_label());
                info!(instance = %self.id, service = %self.service, ?outcome, "instance stopped");
                outcome
            })
            .await
    }

    async fn request_stop(&self, cancel: &CancellationToken) -> StopOutcome {
        if !self.has_connected() {
            return StopOutcome::Forced;
        }
        let closed = {
            let state = self.state.lock();
            match state.socket.as_ref() {
                Some(socket) if socket.is_live() => socket.closed.clone(),
                _ => return StopOutcome::Forced,
            }
        };

        let mut events = self.events.subscribe();
        let frame = ControlFrame::stop_all();
        let Some(id) = frame.id.clone() else {
            return StopOutcome::Forced;
        };
        if let Err(err) = self.send_frame(&frame).await {
            debug!(instance = %self.id, error = %err, "stop request not delivered");
            return StopOutcome::Forced;
        }
        info!(instance = %self.id, "stop requested");

        let deadline = tokio::time::sleep(self.timings.stop_deadline);
        tokio::pin!(deadline);
        loop {
            let notified = self.responses_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.take_response(&id) {
                if payload == Some(already_stopped_payload()) {
                    return StopOutcome::AlreadyStopped;
                }
            }

            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(frame) if frame.is_event(ALL_STOPPED_EVENT) => return StopOutcome::Graceful,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return StopOutcome::Forced,
                },
                _ = &mut notified => {}
                _ = closed.cancelled() => return StopOutcome::Forced,
                _ = cancel.cancelled() => return StopOutcome::Forced,
                _ = &mut deadline => {
                    warn!(instance = %self.id, "stop request unacknowledged before the deadline");
                    return StopOutcome::Forced;
                }
            }
        }
    }

    /// Terminates the launcher and the whole process tree. Idempotent.
    pub async fn kill(&self) {
        self.kill_once
            .get_or_init(|| async {
                self.advance(Lifecycle::Killed);
                self.launch_cancel.cancel();
                let (pid, socket, launcher) = {
                    let mut state = self.state.lock();
                    (state.pid, state.socket.take(), state.launcher.take())
                };
                if let Some(socket) = socket {
                    socket.closed.cancel();
                }
                self.connected.send_replace(false);
                self.responses_changed.notify_waiters();

                if let Some(pid) = pid.filter(|pid| process_exists(*pid)) {
                    if let Err(err) = kill_tree(pid, &self.kill_options).await {
                        warn!(instance = %self.id, pid, error = %err, "process tree kill failed");
                    }
                }
                if let Some(launcher) = launcher {
                    if tokio::time::timeout(LAUNCHER_JOIN_TIMEOUT, launcher)
                        .await
                        .is_err()
                    {
                        warn!(instance = %self.id, "launcher did not wind down in time");
                    }
                }
                counter!("warden_instances_killed_total", 1);
                debug!(instance = %self.id, ?pid, "instance killed");
            })
            .await;
    }
}

impl Lifecycle {
    fn rank(self) -> u8 {
        match self {
            Lifecycle::Running => 0,
            Lifecycle::StopRequested => 1,
            Lifecycle::StoppedGracefully | Lifecycle::Killed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::StoppedGracefully | Lifecycle::Killed)
    }
}

impl StopOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            StopOutcome::Graceful => "graceful",
            StopOutcome::AlreadyStopped => "already_stopped",
            StopOutcome::Forced => "forced",
        }
    }
}
