//! The node socket.
//!
//! [`open`] dials the service, and once the handshake succeeds spawns the tasks
//! that share the connection: the [`HeartbeatTimer`] producing liveness frames,
//! a writer that owns the sending half and drains the outbound slot, and a
//! driver that reads inbound frames, dispatches them to a [`PointsObserver`] and
//! watches the close signal. The session never reconnects on its own; the
//! supervisor decides what happens after it ends.

pub mod error;
pub mod heartbeat;
pub mod observer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;
use webnode_proto::{HeartbeatFrame, InboundMessage, JobReport, NODE_SOCKET_PATH};

use crate::auth::AccessCredential;
use crate::config::NodeConfig;
use crate::identity::{ClientMetadata, Identity};

pub use error::{CloseReason, ParseError, TransportError};
pub use heartbeat::HeartbeatTimer;
pub use observer::{LogObserver, PointsObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closing,
    Closed,
    Faulted,
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    Closed(CloseReason),
    Faulted(TransportError),
}

/// Counters kept for one socket lifetime.
#[derive(Debug, Default)]
pub struct SessionStats {
    heartbeats_sent: AtomicU64,
    heartbeats_skipped: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    updates_delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub heartbeats_sent: u64,
    pub heartbeats_skipped: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub updates_delivered: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_skipped: self.heartbeats_skipped.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_skipped_heartbeat(&self) {
        self.heartbeats_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Socket parameters resolved from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ws_base: Url,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub job_report: JobReport,
    pub user_agent: String,
}

impl SessionSettings {
    pub fn new(config: &NodeConfig, metadata: &ClientMetadata) -> Self {
        Self {
            ws_base: config.ws_base.clone(),
            connect_timeout: config.connect_timeout,
            write_timeout: config.write_timeout,
            heartbeat_interval: config.heartbeat_interval,
            job_report: config.job_report,
            user_agent: metadata.user_agent.clone(),
        }
    }

    pub fn socket_url(
        &self,
        access: &AccessCredential,
        identity: &Identity,
    ) -> Result<Url, TransportError> {
        let mut url = self.ws_base.join(NODE_SOCKET_PATH)?;
        url.query_pairs_mut()
            .append_pair("token", access.expose())
            .append_pair("device_id", &identity.device_id().to_string());
        Ok(url)
    }
}

/// Owner of one open socket. Dropping it tears the session down.
#[derive(Debug)]
pub struct SessionHandle {
    state: watch::Receiver<StreamState>,
    close_tx: watch::Sender<bool>,
    stats: Arc<SessionStats>,
    driver: Option<JoinHandle<SessionEnd>>,
}

impl SessionHandle {
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Asks the driver to close the socket. Safe to call any number of times.
    pub fn request_close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Waits for the session to end. Cancel-safe; once the end has been
    /// observed, later calls report [`CloseReason::Local`].
    pub async fn finished(&mut self) -> SessionEnd {
        let Some(driver) = self.driver.as_mut() else {
            return SessionEnd::Closed(CloseReason::Local);
        };
        let end = match driver.await {
            Ok(end) => end,
            Err(err) => SessionEnd::Faulted(TransportError::Driver(err.to_string())),
        };
        self.driver = None;
        end
    }

    pub async fn close(mut self) -> SessionEnd {
        self.request_close();
        self.finished().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Dials the node socket and starts the heartbeat and receive activities.
pub async fn open(
    settings: &SessionSettings,
    access: &AccessCredential,
    identity: &Identity,
    observer: Arc<dyn PointsObserver>,
) -> Result<SessionHandle, TransportError> {
    let url = settings.socket_url(access, identity)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| TransportError::Request(err.to_string()))?;
    let agent = HeaderValue::from_str(&settings.user_agent)
        .map_err(|err| TransportError::Request(err.to_string()))?;
    request.headers_mut().insert(USER_AGENT, agent);

    let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
    debug!(
        target: "webnode::session",
        host = url.host_str().unwrap_or_default(),
        generation = access.generation(),
        "connecting node socket"
    );
    let (socket, response) = timeout(settings.connect_timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::ConnectTimeout(settings.connect_timeout))?
        .map_err(TransportError::Connect)?;

    state_tx.send_replace(StreamState::Open);
    info!(
        target: "webnode::session",
        status = %response.status(),
        device_id = %identity.device_id(),
        "node socket open"
    );

    let stats = Arc::new(SessionStats::default());
    let writing = Arc::new(AtomicBool::new(false));
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let (close_tx, close_rx) = watch::channel(false);

    let heartbeat = HeartbeatTimer::start(
        settings.heartbeat_interval,
        settings.job_report,
        outbound_tx,
        state_rx.clone(),
        writing.clone(),
        stats.clone(),
    );

    let (sink, stream) = socket.split();
    let driver = tokio::spawn(drive(Driver {
        sink,
        stream,
        outbound: outbound_rx,
        close_rx,
        state_tx,
        heartbeat,
        observer,
        writing,
        stats: stats.clone(),
        write_timeout: settings.write_timeout,
    }));

    Ok(SessionHandle {
        state: state_rx,
        close_tx,
        stats,
        driver: Some(driver),
    })
}

/// Time the writer gets to send a close frame once the session has ended.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Driver<S, R> {
    sink: S,
    stream: R,
    outbound: mpsc::Receiver<HeartbeatFrame>,
    close_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<StreamState>,
    heartbeat: HeartbeatTimer,
    observer: Arc<dyn PointsObserver>,
    writing: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    write_timeout: Duration,
}

/// Reads the socket and watches the close signal. Writes happen on their own
/// task so a stalled write never holds up inbound frames or a close request.
async fn drive<S, R>(driver: Driver<S, R>) -> SessionEnd
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let Driver {
        sink,
        mut stream,
        outbound,
        mut close_rx,
        state_tx,
        heartbeat,
        observer,
        writing,
        stats,
        write_timeout,
    } = driver;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut writer = tokio::spawn(write_loop(Writer {
        sink,
        outbound,
        stop: stop_rx,
        writing,
        stats: stats.clone(),
        write_timeout,
    }));
    let mut writer_done = false;

    let end = loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    state_tx.send_replace(StreamState::Closing);
                    break SessionEnd::Closed(CloseReason::Local);
                }
            }
            written = &mut writer, if !writer_done => {
                writer_done = true;
                break match written {
                    Ok(Err(err)) => SessionEnd::Faulted(err),
                    Ok(Ok(())) => SessionEnd::Faulted(TransportError::Driver(
                        "socket writer stopped early".into(),
                    )),
                    Err(err) => SessionEnd::Faulted(TransportError::Driver(err.to_string())),
                };
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(text.as_bytes(), observer.as_ref(), &stats);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        dispatch(&bytes, observer.as_ref(), &stats);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        state_tx.send_replace(StreamState::Closing);
                        debug!(target: "webnode::session", ?frame, "close frame received");
                        break SessionEnd::Closed(CloseReason::Remote);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break SessionEnd::Faulted(TransportError::Read(err)),
                    None => break SessionEnd::Closed(CloseReason::StreamEnded),
                }
            }
        }
    };

    heartbeat.cancel();
    stop_tx.send_replace(true);
    if !writer_done {
        match timeout(CLOSE_GRACE, &mut writer).await {
            Ok(Ok(Err(err))) => {
                debug!(target: "webnode::session", error = %err, "writer failed while closing")
            }
            Ok(_) => {}
            Err(_) => {
                writer.abort();
                debug!(target: "webnode::session", "writer still busy after close; aborted");
            }
        }
    }

    let final_state = match &end {
        SessionEnd::Closed(_) => StreamState::Closed,
        SessionEnd::Faulted(_) => StreamState::Faulted,
    };
    state_tx.send_replace(final_state);
    match &end {
        SessionEnd::Closed(reason) => {
            info!(target: "webnode::session", %reason, stats = ?stats.snapshot(), "node socket closed")
        }
        SessionEnd::Faulted(err) => {
            warn!(target: "webnode::session", error = %err, stats = ?stats.snapshot(), "node socket faulted")
        }
    }
    end
}

struct Writer<S> {
    sink: S,
    outbound: mpsc::Receiver<HeartbeatFrame>,
    stop: watch::Receiver<bool>,
    writing: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    write_timeout: Duration,
}

/// Sends queued heartbeats until told to stop, then closes the sink. A failed
/// write ends the loop with the error after a best-effort close.
async fn write_loop<S>(writer: Writer<S>) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let Writer {
        mut sink,
        mut outbound,
        mut stop,
        writing,
        stats,
        write_timeout,
    } = writer;

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    stopped(&mut stop).await;
                    break;
                };
                writing.store(true, Ordering::Release);
                let sent = write_frame(&mut sink, &frame, write_timeout).await;
                writing.store(false, Ordering::Release);
                match sent {
                    Ok(()) => {
                        stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                        debug!(target: "webnode::session", "heartbeat sent");
                    }
                    Err(err) => {
                        close_quietly(&mut sink).await;
                        return Err(err);
                    }
                }
            }
        }
    }
    close_quietly(&mut sink).await;
    Ok(())
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn write_frame<S>(
    sink: &mut S,
    frame: &HeartbeatFrame,
    limit: Duration,
) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let json = serde_json::to_string(frame)?;
    timeout(limit, sink.send(Message::Text(json)))
        .await
        .map_err(|_| TransportError::WriteTimeout(limit))?
        .map_err(TransportError::Write)
}

/// Best-effort close: failures are logged and dropped.
async fn close_quietly<S>(sink: &mut S)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(CLOSE_GRACE, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(target: "webnode::session", error = %err, "error while closing socket"),
        Err(_) => debug!(target: "webnode::session", "timed out closing socket"),
    }
}

fn dispatch(bytes: &[u8], observer: &dyn PointsObserver, stats: &SessionStats) {
    stats.frames_received.fetch_add(1, Ordering::Relaxed);
    match parse_frame(bytes) {
        Ok(message) => {
            if let Some(update) = message.user_data_update {
                stats.updates_delivered.fetch_add(1, Ordering::Relaxed);
                observer.on_points(&update);
            }
        }
        Err(err) => {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(target: "webnode::session", error = %err, "dropping inbound frame");
        }
    }
}

fn parse_frame(bytes: &[u8]) -> Result<InboundMessage, ParseError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(InboundMessage::parse(text)?)
}
