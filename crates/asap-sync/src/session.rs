//! Sessions: one per connected peer.
//!
//! A session owns the read half of a duplex stream and shares the write half.
//! Its reader task sends one INTEREST per registered format, then loops:
//! read a PDU header under the watchdog timeout, hand it together with the
//! reader to a short-lived executor task, and take the reader back once the
//! executor has consumed and drained the payload. INTEREST carries no
//! payload; its answer is written by a responder task while the reader goes
//! on draining the stream, so two peers answering each other never wait on
//! each other's reads.
//!
//! ```text
//! Handshake ──> Reading ⇄ Executing
//!                  │          │
//!                  └────┬─────┘
//!                       v
//!                  Terminated
//! ```
//!
//! Writers (responders and live sends) take turns on the [`SharedWriter`]
//! mutex, one PDU at a time. The watchdog bounds reads, executors and each
//! write. Killing a session is idempotent and aborts the in-flight executor
//! and responders; connection listeners hear about the termination exactly
//! once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use asap_core::{Crypto, Format, Medium, PeerId};

use crate::codec::{self, BoxedReader, BoxedWriter, Inbound, Payload, PduSink, Signature};
use crate::config::SyncConfig;
use crate::engine::{EngineHandle, EngineRegistry, ReceiveContext};
use crate::error::{Result, SyncError};
use crate::listener::ListenerRegistry;
use crate::pdu::{AssimilateHeader, Interest, Pdu};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Reading,
    Executing,
    Terminated,
}

/// Properties of the underlying link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// Transport address of the remote end, if known.
    pub address: Option<String>,
    pub medium: Medium,
    /// The transport encrypts this link.
    pub encrypted: bool,
}

impl LinkInfo {
    pub fn new(medium: Medium) -> Self {
        Self {
            address: None,
            medium,
            encrypted: false,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }
}

/// Observer of session lifecycles.
pub trait ConnectionListener: Send + Sync {
    fn session_started(&self, _session: &SessionHandle) {}

    /// Called once per session. Local kills report [`SyncError::Cancelled`].
    fn session_terminated(&self, session: &SessionHandle, reason: &SyncError);
}

/// The write half of a connection, shared by everyone who writes PDUs.
///
/// Each PDU must be written within `timeout` once the writer is held; a
/// write that takes longer fails with [`SyncError::Timeout`].
#[derive(Clone)]
pub struct SharedWriter {
    writer: Arc<Mutex<BoxedWriter>>,
    crypto: Arc<dyn Crypto>,
    timeout: Duration,
}

impl SharedWriter {
    pub fn new<W>(writer: W, crypto: Arc<dyn Crypto>, timeout: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            crypto,
            timeout,
        }
    }

    /// Shut the write half down unless someone is writing right now.
    async fn shutdown(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "shutdown of write half failed");
            }
        }
    }
}

#[async_trait]
impl PduSink for SharedWriter {
    async fn send(&self, pdu: &Pdu, payload: &[Bytes]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let write = codec::write_pdu(&mut **writer, pdu, payload, self.crypto.as_ref());
        match tokio::time::timeout(self.timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }
}

/// Everything sessions share with their host.
#[derive(Clone)]
pub struct SessionContext {
    pub config: SyncConfig,
    pub engines: EngineRegistry,
    pub crypto: Arc<dyn Crypto>,
    pub listeners: Arc<ListenerRegistry<dyn ConnectionListener>>,
}

impl SessionContext {
    pub fn new(config: SyncConfig, engines: EngineRegistry, crypto: Arc<dyn Crypto>) -> Self {
        Self {
            config,
            engines,
            crypto,
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Start a session with `remote` over the given stream halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, W>(&self, remote: PeerId, link: LinkInfo, reader: R, writer: W) -> SessionHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (kill_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SessionState::Handshake);
        let inner = Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            link,
            writer: SharedWriter::new(writer, self.crypto.clone(), self.config.read_timeout),
            killed: AtomicBool::new(false),
            kill_tx,
            state_tx,
            context: self.clone(),
        });

        tracing::info!(session = inner.id, peer = %inner.remote, medium = %inner.link.medium, "session started");
        tokio::spawn(run(inner.clone(), Box::new(reader)));
        SessionHandle { inner }
    }
}

struct SessionInner {
    id: u64,
    remote: PeerId,
    link: LinkInfo,
    writer: SharedWriter,
    killed: AtomicBool,
    kill_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
    context: SessionContext,
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.inner.remote
    }

    pub fn link(&self) -> &LinkInfo {
        &self.inner.link
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// Stop the session. Further calls do nothing.
    pub fn kill(&self) {
        if !self.inner.killed.swap(true, Ordering::SeqCst) {
            tracing::debug!(session = self.inner.id, peer = %self.inner.remote, "killing session");
            self.inner.kill_tx.send_replace(true);
        }
    }

    /// Wait until the session has terminated and its listeners have run.
    pub async fn terminated(&self) {
        let mut state = self.inner.state_tx.subscribe();
        let _ = state.wait_for(|state| *state == SessionState::Terminated).await;
    }

    /// Push live content to the remote peer between PDUs of the reader loop.
    pub async fn send_live(&self, header: AssimilateHeader, messages: Vec<Bytes>) -> Result<()> {
        if self.inner.killed.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        let result = self
            .inner
            .writer
            .send(&Pdu::Assimilate(header), &messages)
            .await;
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!(session = self.inner.id, error = %e, "live send failed");
                self.kill();
            }
        }
        result
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// A spawned task that is aborted when dropped.
struct Task<T>(JoinHandle<T>);

impl<T: Send + 'static> Task<T> {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    async fn join(&mut self) -> Result<T> {
        (&mut self.0)
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(format!("task failed: {}", e))))
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn wait_killed(kill: &mut watch::Receiver<bool>) {
    loop {
        if *kill.borrow_and_update() {
            return;
        }
        if kill.changed().await.is_err() {
            return;
        }
    }
}

async fn run(inner: Arc<SessionInner>, reader: BoxedReader) {
    let handle = SessionHandle {
        inner: inner.clone(),
    };
    for listener in inner.context.listeners.snapshot() {
        listener.session_started(&handle);
    }

    let mut kill = inner.kill_tx.subscribe();
    let reason = tokio::select! {
        biased;
        _ = wait_killed(&mut kill) => SyncError::Cancelled,
        result = drive(&inner, reader) => match result {
            Ok(()) => SyncError::Closed,
            Err(e) => e,
        },
    };

    inner.killed.store(true, Ordering::SeqCst);
    if !matches!(reason, SyncError::Cancelled) {
        inner.writer.shutdown().await;
    }

    match &reason {
        SyncError::Closed | SyncError::Cancelled => {
            tracing::info!(session = inner.id, peer = %inner.remote, reason = %reason, "session terminated")
        }
        other => {
            tracing::warn!(session = inner.id, peer = %inner.remote, error = %other, "session failed")
        }
    }

    for listener in inner.context.listeners.snapshot() {
        listener.session_terminated(&handle, &reason);
    }
    inner.set_state(SessionState::Terminated);
}

async fn drive(inner: &Arc<SessionInner>, reader: BoxedReader) -> Result<()> {
    inner.set_state(SessionState::Handshake);
    for engine in inner.context.engines.all() {
        let interest = engine.lock().await.interest(&inner.remote);
        inner.writer.send(&Pdu::Interest(interest), &[]).await?;
    }

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    let mut responders = Vec::new();
    tokio::select! {
        result = read_loop(inner, reader, &mut responders, &failed_tx) => result,
        Some(e) = failed_rx.recv() => Err(e),
    }
}

async fn read_loop(
    inner: &Arc<SessionInner>,
    mut reader: BoxedReader,
    responders: &mut Vec<Task<()>>,
    failed: &mpsc::UnboundedSender<SyncError>,
) -> Result<()> {
    let timeout = inner.context.config.read_timeout;
    let max_payload_len = inner.context.config.max_payload_len;

    loop {
        inner.set_state(SessionState::Reading);
        let inbound = match tokio::time::timeout(timeout, codec::read_pdu(reader.as_mut(), max_payload_len)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(timeout)),
        };

        inner.set_state(SessionState::Executing);
        tracing::trace!(session = inner.id, pdu = inbound.pdu.name(), format = %inbound.pdu.format(), "read PDU");
        responders.retain(|task| !task.is_finished());

        let Inbound { pdu, signature } = inbound;
        let header = match pdu {
            Pdu::Interest(interest) => {
                match screen(inner, "INTEREST", &interest.format, signature.as_ref()) {
                    Ok(Some((engine, ctx))) => {
                        responders.push(respond(inner, engine, interest, ctx, failed.clone()));
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(session = inner.id, peer = %inner.remote, error = %e, "PDU failed"),
                }
                continue;
            }
            Pdu::Assimilate(header) => header,
        };

        let task_inner = inner.clone();
        let mut executor = Task::spawn(async move {
            let result = execute(&task_inner, &header, signature.as_ref(), reader.as_mut()).await;
            (reader, result)
        });
        let (returned, result) = match tokio::time::timeout(timeout, executor.join()).await {
            Ok(joined) => joined?,
            Err(_) => return Err(SyncError::Timeout(timeout)),
        };
        reader = returned;

        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!(session = inner.id, peer = %inner.remote, error = %e, "PDU failed");
        }
    }
}

/// Answer an INTEREST beside the reader. Fatal failures end the session
/// through `failed`.
fn respond(
    inner: &Arc<SessionInner>,
    engine: EngineHandle,
    interest: Interest,
    ctx: ReceiveContext,
    failed: mpsc::UnboundedSender<SyncError>,
) -> Task<()> {
    let inner = inner.clone();
    Task::spawn(async move {
        match answer(&inner, &engine, &interest, &ctx).await {
            Ok(sent) => tracing::trace!(session = inner.id, chunks = sent, "INTEREST answered"),
            Err(e) if e.is_fatal() => {
                let _ = failed.send(e);
            }
            Err(e) => tracing::warn!(session = inner.id, peer = %inner.remote, error = %e, "INTEREST failed"),
        }
    })
}

/// The engine is held while picking chunks and while recording the
/// delivery, never while writing.
async fn answer(inner: &SessionInner, engine: &EngineHandle, interest: &Interest, ctx: &ReceiveContext) -> Result<usize> {
    let reply = engine.lock().await.prepare_interest(interest, ctx).await?;
    let sent = reply.send(&inner.writer).await?;
    engine.lock().await.complete_interest(&reply).await;
    Ok(sent)
}

/// Store one ASSIMILATE and drain whatever of its payload is left.
async fn execute(
    inner: &SessionInner,
    header: &AssimilateHeader,
    signature: Option<&Signature>,
    reader: &mut (dyn AsyncRead + Unpin + Send),
) -> Result<()> {
    let mut payload = Payload::new(reader, header.framing.payload_len);

    let result = assimilate(inner, header, signature, &mut payload).await;
    if matches!(&result, Err(e) if e.is_fatal()) {
        return result;
    }

    let skipped = payload.drain().await?;
    if skipped > 0 {
        tracing::trace!(session = inner.id, bytes = skipped, "drained payload");
    }
    result
}

async fn assimilate(
    inner: &SessionInner,
    header: &AssimilateHeader,
    signature: Option<&Signature>,
    payload: &mut Payload<'_>,
) -> Result<()> {
    let Some((engine, ctx)) = screen(inner, "ASSIMILATE", &header.format, signature)? else {
        return Ok(());
    };
    engine.lock().await.handle_assimilate(header, payload, &ctx).await?;
    Ok(())
}

/// Apply the security policy and find the engine of `format`.
///
/// `None` means the PDU is ignored.
fn screen(
    inner: &SessionInner,
    pdu: &'static str,
    format: &Format,
    signature: Option<&Signature>,
) -> Result<Option<(EngineHandle, ReceiveContext)>> {
    let crypto = inner.context.crypto.as_ref();
    let verified = signature
        .map(|signature| crypto.verify(&inner.remote, &signature.covered, &signature.bytes))
        .unwrap_or(false);

    if crypto.must_sign() && !verified {
        tracing::debug!(session = inner.id, pdu, "ignoring unverified PDU");
        return Ok(None);
    }
    if crypto.must_encrypt() && !inner.link.encrypted {
        tracing::debug!(session = inner.id, pdu, "ignoring PDU from unencrypted link");
        return Ok(None);
    }

    let engine = inner
        .context
        .engines
        .get(format)
        .ok_or_else(|| SyncError::UnknownFormat(format.to_string()))?;

    let ctx = ReceiveContext {
        remote: inner.remote.clone(),
        medium: inner.link.medium,
        verified,
        encrypted: inner.link.encrypted,
    };
    Ok(Some((engine, ctx)))
}
