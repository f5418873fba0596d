//! Stack lifecycle and event dispatch
//!
//! [`Stack`] owns the packet engine (behind the [`StackLock`]), the stream
//! and datagram registries, the session recorder and the timeout scheduler.
//!
//! # Dispatch
//!
//! Every entry into the engine goes through `StackInner::with_engine`:
//!
//! ```text
//!   lock ─► f(engine) ─► drain poll_event() ─► unlock ─► run handlers
//!                           │
//!                           ├─ Accepted   → registry insert, session record
//!                           ├─ Received   → adapter.on_received
//!                           ├─ Sent/Poll  → adapter flush / stall check
//!                           ├─ Errored    → adapter.on_errored
//!                           ├─ Datagram   → flow lookup-or-create
//!                           └─ Output     → output channel
//! ```
//!
//! Handlers run after the lock is released, so they can call back into the
//! connection they were given without deadlocking the non-reentrant engine.
//!
//! # Lock Order
//!
//! Stack Lock → adapter state mutex → registry shard. Adapters are cloned out
//! of the registries before they run.

pub mod lock;
pub mod registry;
pub mod stats;
mod timer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

pub use lock::{EngineGuard, StackLock};
pub use registry::ConnectionRegistry;
pub use stats::{StackStats, StatsSnapshot};

use self::timer::{SchedulerConfig, TimeoutScheduler};
use crate::addr::{packet, FlowId, Protocol, StreamId};
use crate::config::{Config, TcpConfig};
use crate::engine::{ConnHandle, EngineEvent, PacketEngine};
use crate::error::{ConfigError, ConnError, EngineError, StackError};
use crate::handler::{DatagramHandler, ProcessResolver, StreamHandler};
use crate::session::{
    render_report, SessionId, SessionMeta, SessionRecorder, SessionsSnapshot, StatsServer,
};
use crate::tcp::{AbortCause, StreamAdapter, StreamConnection};
use crate::udp::DatagramFlow;

/// Lifecycle state of a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    /// Accepting connections
    Running,
    /// Shut down on request
    Stopped,
    /// Shut down after a fatal engine fault
    Failed(String),
}

/// Handler work collected during dispatch, run after the lock is released
enum Deferred {
    Stream(StreamConnection),
    FlowOpened {
        flow: DatagramFlow,
        dst: SocketAddr,
    },
    FlowData {
        flow: DatagramFlow,
        data: Bytes,
        dst: SocketAddr,
    },
}

pub(crate) struct StackInner {
    me: Weak<StackInner>,
    lock: StackLock,
    streams: ConnectionRegistry<StreamId, Arc<StreamAdapter>>,
    handles: ConnectionRegistry<ConnHandle, StreamId>,
    flows: ConnectionRegistry<FlowId, DatagramFlow>,
    recorder: Arc<SessionRecorder>,
    stats: StackStats,
    stream_handler: Arc<dyn StreamHandler>,
    datagram_handler: Arc<dyn DatagramHandler>,
    process_resolver: Option<Arc<dyn ProcessResolver>>,
    output: Option<mpsc::Sender<Bytes>>,
    config: Config,
    closed: AtomicBool,
    state_tx: watch::Sender<StackState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StackInner {
    /// Enter the engine, dispatch what it queued, then run handlers unlocked
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut dyn PacketEngine) -> R) -> R {
        let mut guard = self.lock.lock();
        let result = f(&mut *guard);
        let deferred = self.drain(&mut *guard);
        drop(guard);
        self.run_deferred(deferred);
        result
    }

    fn drain(&self, engine: &mut dyn PacketEngine) -> Vec<Deferred> {
        let mut deferred = Vec::new();
        while let Some(event) = engine.poll_event() {
            self.dispatch(engine, event, &mut deferred);
        }
        deferred
    }

    fn dispatch(&self, engine: &mut dyn PacketEngine, event: EngineEvent, deferred: &mut Vec<Deferred>) {
        match event {
            EngineEvent::Accepted { handle, src, dst } => {
                if let Some(conn) = self.accept(engine, handle, src, dst) {
                    deferred.push(Deferred::Stream(conn));
                }
            }
            EngineEvent::Received { handle, data } => match self.stream_for(handle) {
                Some(adapter) => adapter.on_received(engine, data),
                None => {
                    debug!("{} bytes for unknown connection {}", data.len(), handle);
                    engine.tcp_recved(handle, data.len());
                }
            },
            EngineEvent::PeerClosed { handle } => {
                if let Some(adapter) = self.stream_for(handle) {
                    adapter.on_peer_closed();
                }
            }
            EngineEvent::Sent { handle, len } => {
                if let Some(adapter) = self.stream_for(handle) {
                    adapter.on_sent(engine, len);
                }
            }
            EngineEvent::Poll { handle } => {
                if let Some(adapter) = self.stream_for(handle) {
                    adapter.on_poll(engine);
                }
            }
            EngineEvent::Errored { handle, reason } => match self.stream_for(handle) {
                Some(adapter) => adapter.on_errored(reason),
                None => trace!("Teardown of unknown connection {}: {:?}", handle, reason),
            },
            EngineEvent::Datagram { src, dst, data } => self.receive_datagram(src, dst, data, deferred),
            EngineEvent::Output(packet) => self.forward_output(packet),
        }
    }

    fn accept(
        &self,
        engine: &mut dyn PacketEngine,
        handle: ConnHandle,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Option<StreamConnection> {
        let id = StreamId::new(src, dst);

        if self.closed.load(Ordering::Acquire) {
            debug!("Refusing {} on stopped stack", id);
            engine.tcp_abort(handle);
            self.stats.record_rejected();
            return None;
        }

        if self.streams.contains(&id) {
            warn!(
                "Duplicate accept for {}: aborting new connection {}, keeping existing",
                id, handle
            );
            engine.tcp_abort(handle);
            self.stats.record_rejected();
            return None;
        }

        let process_name = self
            .process_resolver
            .as_ref()
            .and_then(|resolver| resolver.process_name(id.local, id.remote))
            .unwrap_or_default();
        let session = self.recorder.record(SessionMeta {
            process_name,
            protocol: Protocol::Tcp,
            local: id.local,
            remote: id.remote,
        });

        let adapter = Arc::new(StreamAdapter::new(
            id,
            handle,
            session,
            self.config.tcp.clone(),
            self.me.clone(),
            Arc::clone(&self.recorder),
        ));

        if let Err(e) = self.streams.insert(id, Arc::clone(&adapter)) {
            warn!("Failed to register {}: {}", id, e);
            engine.tcp_abort(handle);
            self.recorder.finalize(session);
            self.stats.record_rejected();
            return None;
        }
        if let Err(e) = self.handles.insert(handle, id) {
            warn!("Engine reused live handle {}: {}", handle, e);
        }

        if let Err(e) = engine.tcp_set_poll_interval(handle, self.config.stack.poll_interval_ticks) {
            warn!("Engine refused connection {}: {}", id, e);
            adapter.abort_locked(engine, AbortCause::Engine(e));
            self.stats.record_rejected();
            return None;
        }

        adapter.establish();
        self.stats.record_accepted();
        debug!("Accepted {} as {}", id, handle);
        Some(StreamConnection::new(adapter))
    }

    fn stream_for(&self, handle: ConnHandle) -> Option<Arc<StreamAdapter>> {
        let id = self.handles.lookup(&handle)?;
        self.streams
            .lookup(&id)
            .filter(|adapter| adapter.handle() == handle)
    }

    fn receive_datagram(&self, src: SocketAddr, dst: SocketAddr, data: Bytes, deferred: &mut Vec<Deferred>) {
        if self.closed.load(Ordering::Acquire) {
            trace!("Dropping datagram from {} on stopped stack", src);
            return;
        }

        let id = FlowId::new(src);
        let flow = match self.flows.lookup(&id) {
            Some(flow) => flow,
            None => {
                let process_name = self
                    .process_resolver
                    .as_ref()
                    .and_then(|resolver| resolver.process_name(id.source, dst))
                    .unwrap_or_default();
                let session = self.recorder.record(SessionMeta {
                    process_name,
                    protocol: Protocol::Udp,
                    local: id.source,
                    remote: dst,
                });
                let flow = DatagramFlow::new(
                    id,
                    dst,
                    session,
                    self.me.clone(),
                    Arc::clone(&self.recorder),
                );
                if let Err(e) = self.flows.insert(id, flow.clone()) {
                    warn!("Failed to register {}: {}", id, e);
                    self.recorder.finalize(session);
                    return;
                }
                self.stats.record_flow_created();
                debug!("New flow {} (first destination {})", id, dst);
                deferred.push(Deferred::FlowOpened {
                    flow: flow.clone(),
                    dst,
                });
                flow
            }
        };

        flow.record_inbound(data.len());
        deferred.push(Deferred::FlowData { flow, data, dst });
    }

    fn forward_output(&self, packet: Bytes) {
        let Some(output) = &self.output else {
            trace!("No output channel, dropping {} byte packet", packet.len());
            return;
        };
        match output.try_send(packet) {
            Ok(()) => self.stats.record_output(),
            Err(TrySendError::Full(packet)) => {
                warn!("Output channel full, dropping {} byte packet", packet.len());
                self.stats.record_output_dropped();
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Output channel closed, dropping packet");
                self.stats.record_output_dropped();
            }
        }
    }

    fn run_deferred(&self, deferred: Vec<Deferred>) {
        for action in deferred {
            match action {
                Deferred::Stream(conn) => {
                    if let Err(e) = self.stream_handler.handle(conn.clone()) {
                        warn!(
                            "Stream {}: {}",
                            conn.id(),
                            ConnError::HandlerRejected(format!("{e:#}"))
                        );
                        conn.abort();
                    }
                }
                Deferred::FlowOpened { flow, dst } => {
                    if let Err(e) = self.datagram_handler.connect(&flow, dst) {
                        warn!(
                            "Flow {}: {}",
                            flow.id(),
                            ConnError::HandlerRejected(format!("{e:#}"))
                        );
                        flow.close();
                    }
                }
                Deferred::FlowData { flow, data, dst } => {
                    if flow.is_closed() {
                        trace!("Dropping datagram for closed flow {}", flow.id());
                        continue;
                    }
                    if let Err(e) = self.datagram_handler.receive_to(&flow, data, dst) {
                        debug!("Flow {} receive to {} failed: {:#}", flow.id(), dst, e);
                    }
                }
            }
        }
    }

    /// Drop a finished stream from both indexes
    pub(crate) fn forget_stream(&self, id: &StreamId, handle: ConnHandle) {
        self.handles.remove_if(&handle, |mapped| mapped == id);
        self.streams
            .remove_if(id, |adapter| adapter.handle() == handle);
    }

    /// Drop a closed flow, unless its identity was already reused
    pub(crate) fn forget_flow(&self, id: &FlowId, session: SessionId) {
        self.flows
            .remove_if(id, |flow| flow.session_id() == session);
    }

    /// One scheduler tick
    pub(crate) fn tick(&self) -> Result<(), EngineError> {
        self.with_engine(|engine| engine.check_timeouts())
    }

    /// Close every flow idle for at least `timeout`
    pub(crate) fn expire_idle_flows(&self, timeout: Duration) -> usize {
        let expired: Vec<DatagramFlow> = self
            .flows
            .values()
            .into_iter()
            .filter(|flow| flow.idle_for() >= timeout)
            .collect();
        for flow in &expired {
            debug!("Flow {} idle for {:?}, reclaiming", flow.id(), flow.idle_for());
            flow.close();
        }
        if !expired.is_empty() {
            self.stats.record_flows_expired(expired.len() as u64);
        }
        expired.len()
    }

    /// Fatal fault: shut down and publish the reason
    pub(crate) fn fail(&self, reason: String) {
        self.shutdown_with(StackState::Failed(reason));
    }

    fn shutdown_with(&self, final_state: StackState) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let streams = self.streams.values();
        let flows = self.flows.values();
        info!(
            "Stack shutting down: aborting {} streams, closing {} flows",
            streams.len(),
            flows.len()
        );

        self.with_engine(|engine| {
            for adapter in &streams {
                adapter.abort_locked(engine, AbortCause::Local);
            }
        });
        for flow in &flows {
            flow.close();
        }

        self.state_tx.send_replace(final_state);
    }
}

/// Builder for [`Stack`]
///
/// Both handlers are required; [`build`](Self::build) fails with
/// `ConfigError::MissingHandler` otherwise.
pub struct StackBuilder {
    engine: Box<dyn PacketEngine>,
    config: Config,
    stream_handler: Option<Arc<dyn StreamHandler>>,
    datagram_handler: Option<Arc<dyn DatagramHandler>>,
    process_resolver: Option<Arc<dyn ProcessResolver>>,
    output: Option<mpsc::Sender<Bytes>>,
    recorder: Option<Arc<SessionRecorder>>,
}

impl StackBuilder {
    /// Start building a stack around `engine`
    pub fn new(engine: impl PacketEngine + 'static) -> Self {
        Self {
            engine: Box::new(engine),
            config: Config::default(),
            stream_handler: None,
            datagram_handler: None,
            process_resolver: None,
            output: None,
            recorder: None,
        }
    }

    /// Use `config` instead of the defaults
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register the stream handler
    #[must_use]
    pub fn stream_handler(mut self, handler: impl StreamHandler + 'static) -> Self {
        self.stream_handler = Some(Arc::new(handler));
        self
    }

    /// Register the datagram handler
    #[must_use]
    pub fn datagram_handler(mut self, handler: impl DatagramHandler + 'static) -> Self {
        self.datagram_handler = Some(Arc::new(handler));
        self
    }

    /// Register a best-effort process name lookup for sessions
    #[must_use]
    pub fn process_resolver(mut self, resolver: impl ProcessResolver + 'static) -> Self {
        self.process_resolver = Some(Arc::new(resolver));
        self
    }

    /// Forward engine output packets to `output`
    #[must_use]
    pub fn output(mut self, output: mpsc::Sender<Bytes>) -> Self {
        self.output = Some(output);
        self
    }

    /// Record sessions into an existing recorder
    #[must_use]
    pub fn recorder(mut self, recorder: Arc<SessionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Validate, bind the engine and start the timeout scheduler
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the config is invalid, a handler is missing,
    /// no tokio runtime is running, or the engine refuses to bind.
    pub fn build(self) -> Result<Stack, ConfigError> {
        let Self {
            mut engine,
            config,
            stream_handler,
            datagram_handler,
            process_resolver,
            output,
            recorder,
        } = self;

        config.validate()?;
        let stream_handler = stream_handler.ok_or(ConfigError::MissingHandler("stream"))?;
        let datagram_handler = datagram_handler.ok_or(ConfigError::MissingHandler("datagram"))?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        engine
            .bind()
            .map_err(|e| ConfigError::Bind(e.to_string()))?;

        let recorder =
            recorder.unwrap_or_else(|| Arc::new(SessionRecorder::new(config.stats.max_completed)));
        let (state_tx, _) = watch::channel(StackState::Running);
        let (shutdown_tx, _) = broadcast::channel(1);
        let scheduler = SchedulerConfig {
            tick: config.stack.timer_interval(),
            sweep_interval: config.udp.sweep_interval(),
            idle_timeout: config.udp.idle_timeout(),
        };

        let inner = Arc::new_cyclic(|me| StackInner {
            me: me.clone(),
            lock: StackLock::new(engine),
            streams: ConnectionRegistry::new(),
            handles: ConnectionRegistry::new(),
            flows: ConnectionRegistry::new(),
            recorder,
            stats: StackStats::new(),
            stream_handler,
            datagram_handler,
            process_resolver,
            output,
            config,
            closed: AtomicBool::new(false),
            state_tx,
            shutdown_tx,
        });

        TimeoutScheduler::spawn(
            &runtime,
            Arc::downgrade(&inner),
            scheduler,
            inner.shutdown_tx.subscribe(),
        );

        info!(
            "Stack started (timer {:?}, idle flow timeout {:?})",
            scheduler.tick, scheduler.idle_timeout
        );

        Ok(Stack { inner })
    }
}

/// A running connection adapter stack
///
/// Cheap to clone. Connections and flows hold only weak references to the
/// stack; once every `Stack` handle is dropped the scheduler stops and
/// further engine access fails with `ConnError::StackClosed`.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

impl Stack {
    /// Start building a stack around `engine`
    pub fn builder(engine: impl PacketEngine + 'static) -> StackBuilder {
        StackBuilder::new(engine)
    }

    /// Feed one raw IP packet from the TUN device and dispatch its effects
    ///
    /// # Errors
    ///
    /// Returns `StackClosed` after shutdown, or the engine's error if it
    /// refuses the packet. Packets are never filtered before the engine.
    pub fn input(&self, packet: Bytes) -> Result<(), StackError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnError::StackClosed.into());
        }
        match packet::inspect(&packet) {
            Ok(info) => trace!(
                "Input {} {} -> {} ({} bytes)",
                info.protocol,
                info.src,
                info.dst,
                packet.len()
            ),
            Err(e) => trace!("Input {} bytes ({})", packet.len(), e),
        }
        self.inner.with_engine(|engine| engine.input(packet))?;
        Ok(())
    }

    /// Dispatch whatever the engine has queued
    ///
    /// For engines fed from their own I/O thread.
    pub fn pump(&self) {
        self.inner.with_engine(|_| ());
    }

    /// Re-arm engine timers after the process resumes from suspension
    pub fn restart_timeouts(&self) {
        info!("Restarting engine timers");
        self.inner.with_engine(|engine| engine.restart_timeouts());
    }

    /// Close every datagram flow idle for at least `timeout`; returns the
    /// number reclaimed
    pub fn expire_idle_flows(&self, timeout: Duration) -> usize {
        self.inner.expire_idle_flows(timeout)
    }

    /// Abort every stream, close every flow and stop the scheduler
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown_with(StackState::Stopped);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> StackState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StackState> {
        self.inner.state_tx.subscribe()
    }

    /// Session recorder
    #[must_use]
    pub fn recorder(&self) -> Arc<SessionRecorder> {
        Arc::clone(&self.inner.recorder)
    }

    /// Point-in-time session lists
    #[must_use]
    pub fn sessions(&self) -> SessionsSnapshot {
        self.inner.recorder.snapshot()
    }

    /// Plain-text session report
    #[must_use]
    pub fn report(&self) -> String {
        render_report(&self.sessions())
    }

    /// Stats endpoint serving this stack's sessions
    #[must_use]
    pub fn stats_server(&self) -> StatsServer {
        StatsServer::new(self.inner.config.stats.clone(), self.recorder())
    }

    /// Event counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Live stream connection for an identity
    #[must_use]
    pub fn stream(&self, id: &StreamId) -> Option<StreamConnection> {
        self.inner.streams.lookup(id).map(StreamConnection::new)
    }

    /// Live datagram flow for an identity
    #[must_use]
    pub fn flow(&self, id: &FlowId) -> Option<DatagramFlow> {
        self.inner.flows.lookup(id)
    }

    /// Number of registered stream connections
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Number of registered datagram flows
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.inner.flows.len()
    }

    /// Stream limits in effect
    #[must_use]
    pub fn tcp_config(&self) -> &TcpConfig {
        &self.inner.config.tcp
    }
}
