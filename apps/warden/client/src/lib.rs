//! Runtime-side end of the warden control channel. A supervised program
//! connects with the URL it was launched with, answers requests through a
//! [`RequestHandler`] and may push events back to the supervisor.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use warden_core::{ControlFrame, FrameError, FrameKind, STOP_ALL_METHOD};

const OUTBOUND_DEPTH: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control server refused the connection with status {0}")]
    Rejected(u16),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connection attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("control channel is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Answers requests sent by the supervisor.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, payload: Option<Value>) -> Value;

    /// Called once, on the first stop request. The supervisor is told that
    /// everything stopped when this returns.
    async fn stop_all(&self) {}
}

/// Cloneable handle for pushing events while [`ControlClient::serve`] runs.
#[derive(Debug, Clone)]
pub struct Emitter {
    outbound: mpsc::Sender<Message>,
}

impl Emitter {
    pub async fn emit(&self, name: &str, payload: Option<Value>) -> Result<(), ClientError> {
        self.send(ControlFrame::event(name, payload)).await
    }

    async fn send(&self, frame: ControlFrame) -> Result<(), ClientError> {
        let text = frame.encode()?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| ClientError::Closed)
    }
}

pub struct ControlClient {
    stream: WsStream,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: mpsc::Receiver<Message>,
}

impl ControlClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let (stream, _) = match tokio::time::timeout(timeout, connect_async(url)).await {
            Err(_) => return Err(ClientError::TimedOut(timeout)),
            Ok(Err(tungstenite::Error::Http(response))) => {
                return Err(ClientError::Rejected(response.status().as_u16()))
            }
            Ok(result) => result?,
        };
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        Ok(Self {
            stream,
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn emitter(&self) -> Emitter {
        Emitter {
            outbound: self.outbound_tx.clone(),
        }
    }

    /// Serves requests until the supervisor closes the channel. Requests are
    /// handled concurrently, so responses may leave out of order.
    pub async fn serve<H: RequestHandler>(self, handler: Arc<H>) -> Result<(), ClientError> {
        let Self {
            stream,
            outbound_tx,
            mut outbound_rx,
        } = self;
        let (mut ws_tx, mut ws_rx) = stream.split();
        let emitter = Emitter {
            outbound: outbound_tx,
        };
        let stopped = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let result = loop {
            let text = match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => break Err(ClientError::Transport(err)),
            };
            let frame = match ControlFrame::decode(&text) {
                Ok(frame) if frame.kind == FrameKind::Request => frame,
                Ok(_) => continue,
                Err(err) => {
                    debug!(error = %err, "ignoring undecodable control frame");
                    continue;
                }
            };
            tokio::spawn(dispatch(
                frame,
                Arc::clone(&handler),
                emitter.clone(),
                Arc::clone(&stopped),
            ));
        };

        drop(emitter);
        writer.abort();
        result
    }
}

async fn dispatch<H: RequestHandler>(
    frame: ControlFrame,
    handler: Arc<H>,
    emitter: Emitter,
    stopped: Arc<AtomicBool>,
) {
    let (Some(id), Some(method)) = (frame.id, frame.method) else {
        return;
    };
    let reply = if method == STOP_ALL_METHOD {
        if stopped.swap(true, Ordering::AcqRel) {
            ControlFrame::already_stopped(id)
        } else {
            handler.stop_all().await;
            ControlFrame::all_stopped()
        }
    } else {
        let value = handler.handle(&method, frame.payload).await;
        ControlFrame::response(id, Some(value))
    };
    if let Err(err) = emitter.send(reply).await {
        warn!(method = %method, error = %err, "failed to deliver reply");
    }
}
