//! The session layer context object

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vnet_session_core::{
    AcceptedSession, ConnectFailReason, ConnectFailure, EndpointArg, EstablishedSession,
    HandleCodec, Result, SegmentInfo, SessionCallbacks, SessionError, SessionHandle,
    TransportEndpoint, TransportLayer, TransportSession, UnbindTarget,
};
use vnet_session_shm::{EventQueueManager, SegmentManager};

use crate::bind_table::BindTable;
use crate::broker::{ConnectArgs, ConnectStatus, ConnectionBroker};
use crate::config::SessionLayerConfig;
use crate::registry::{AppMap, Application, ApplicationRegistry, AttachArgs, AttachReply};
use crate::sessions::{SessionKind, SessionRecord, SessionTable};

/// Worker whose pool holds listener slots
const MAIN_THREAD_INDEX: u32 = 0;

/// Bind reply returned to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindReply {
    pub listener_handle: SessionHandle,
    pub uri: String,
    pub segment_name: String,
    pub segment_size: u64,
    pub event_queue_address: u64,
}

/// State serialized by the control-plane lock
struct ControlPlane {
    registry: ApplicationRegistry,
    binds: BindTable,
    broker: ConnectionBroker,
}

/// Notification to deliver once the control-plane lock is released
enum Deferred {
    SegmentAdded(Arc<dyn SessionCallbacks>, SegmentInfo),
    Established(Arc<dyn SessionCallbacks>, EstablishedSession),
    Failed(Arc<dyn SessionCallbacks>, ConnectFailure),
    Disconnected(Arc<dyn SessionCallbacks>, SessionHandle),
}

impl Deferred {
    fn deliver(self) {
        match self {
            Deferred::SegmentAdded(to, segment) => to.segment_added(&segment),
            Deferred::Established(to, session) => to.connection_established(&session),
            Deferred::Failed(to, failure) => to.connection_failed(&failure),
            Deferred::Disconnected(to, handle) => to.session_disconnected(handle),
        }
    }
}

fn deliver_all(notifications: Vec<Deferred>) {
    for notification in notifications {
        notification.deliver();
    }
}

/// Session layer: application attachment and connection establishment.
///
/// Control operations serialize on one lock. Application callbacks run
/// after it is released, so they may call back into the layer, with one
/// exception: `redirect_connect` runs inside `connect`'s critical section
/// and must not re-enter.
pub struct SessionLayer {
    config: SessionLayerConfig,
    transport: Arc<dyn TransportLayer>,
    segments: Arc<SegmentManager>,
    queues: Arc<EventQueueManager>,
    sessions: SessionTable,
    published: Arc<ArcSwap<AppMap>>,
    control: Mutex<ControlPlane>,
}

impl SessionLayer {
    pub fn new(config: SessionLayerConfig, transport: Arc<dyn TransportLayer>) -> Result<Self> {
        if config.num_workers == 0 || config.num_workers - 1 > HandleCodec::MAX_THREAD_INDEX {
            return Err(SessionError::InvalidArgument(format!(
                "worker count {} not in 1..={}",
                config.num_workers,
                HandleCodec::MAX_THREAD_INDEX as u64 + 1
            )));
        }

        let segments = Arc::new(SegmentManager::new(config.segment_manager_config()));
        let queues = Arc::new(EventQueueManager::new());
        let published = Arc::new(ArcSwap::from_pointee(AppMap::new()));
        let registry = ApplicationRegistry::new(&config, segments.clone(), queues.clone(), published.clone());

        info!(
            "Session layer up: {} workers, {:?} segments",
            config.num_workers, config.segment_backing
        );

        Ok(Self {
            sessions: SessionTable::new(config.num_workers),
            config,
            transport,
            segments,
            queues,
            published,
            control: Mutex::new(ControlPlane {
                registry,
                binds: BindTable::new(),
                broker: ConnectionBroker::new(),
            }),
        })
    }

    pub fn config(&self) -> &SessionLayerConfig {
        &self.config
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn event_queues(&self) -> &EventQueueManager {
        &self.queues
    }

    /// Published application record; lock-free
    pub fn application(&self, app_index: u32) -> Option<Arc<Application>> {
        self.published.load().get(&app_index).cloned()
    }

    pub fn application_count(&self) -> usize {
        self.published.load().len()
    }

    /// Live session slots, listeners included
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn listener_count(&self) -> usize {
        self.control.lock().binds.len()
    }

    #[instrument(skip(self, args), fields(builtin = args.builtin))]
    pub fn attach(&self, args: AttachArgs) -> Result<AttachReply> {
        let mut control = self.control.lock();
        let (_, reply) = control.registry.attach(args)?;
        Ok(reply)
    }

    /// Detach an application that holds no listeners, sessions or
    /// pending connects
    #[instrument(skip(self))]
    pub fn detach(&self, app_index: u32) -> Result<()> {
        let mut control = self.control.lock();
        if control.registry.get(app_index).is_none() {
            return Err(SessionError::NotFound(format!("application {}", app_index)));
        }

        let listeners = control.binds.listeners_of(app_index).len();
        let sessions = self.sessions.sessions_of(app_index);
        let pending = control.broker.pending_for(app_index);
        if listeners + sessions + pending > 0 {
            return Err(SessionError::ResourceBusy(format!(
                "application {} still has {} listeners, {} sessions, {} pending connects",
                app_index, listeners, sessions, pending
            )));
        }

        control.registry.detach(app_index)?;
        Ok(())
    }

    /// Give an application another segment and tell it so
    #[instrument(skip(self))]
    pub fn add_segment(&self, app_index: u32, size: u64) -> Result<String> {
        let (app, info) = self.control.lock().registry.add_segment(app_index, size)?;
        app.notifier().segment_added(&info);
        Ok(info.name)
    }

    #[instrument(skip(self, target))]
    pub fn bind(&self, app_index: u32, target: EndpointArg) -> Result<BindReply> {
        let mut control = self.control.lock();
        let control = &mut *control;
        let app = control
            .registry
            .get(app_index)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("application {}", app_index)))?;
        let key = target.resolve()?;

        let listener = control.binds.bind(key, app_index, |key| {
            let handle = self
                .sessions
                .alloc(MAIN_THREAD_INDEX, SessionRecord::listener(app_index, *key))?;
            if let Err(e) = self.transport.listen(key, handle) {
                let _ = self.sessions.remove(handle);
                return Err(e);
            }
            Ok(handle)
        })?;

        info!("Application {} listening on {} ({})", app_index, key, listener.handle);
        Ok(BindReply {
            listener_handle: listener.handle,
            uri: key.uri(),
            segment_name: app.primary_segment().name().to_string(),
            segment_size: app.primary_segment().size(),
            event_queue_address: app.event_queue().address(),
        })
    }

    #[instrument(skip(self, target))]
    pub fn unbind(&self, app_index: u32, target: impl Into<UnbindTarget>) -> Result<()> {
        let target = target.into();
        let mut control = self.control.lock();
        let listener = control.binds.unbind(&target, app_index)?;

        if let Err(e) = self.transport.unlisten(&listener.key, listener.handle) {
            warn!("Transport failed to stop listening on {}: {}", listener.key, e);
        }
        if let Err(e) = self.sessions.remove(listener.handle) {
            warn!("Listener slot {} already gone: {}", listener.handle, e);
        }

        info!("Application {} stopped listening on {}", app_index, listener.key);
        Ok(())
    }

    #[instrument(skip(self, args), fields(app_index = args.app_index))]
    pub fn connect(&self, args: ConnectArgs) -> Result<ConnectStatus> {
        let mut control = self.control.lock();
        let control = &mut *control;
        control
            .broker
            .connect(&args, &control.registry, &control.binds, self.transport.as_ref())
    }

    #[instrument(skip(self))]
    pub fn disconnect(&self, handle: SessionHandle, app_index: u32) -> Result<()> {
        let control = self.control.lock();
        control
            .broker
            .disconnect(handle, app_index, &self.sessions, self.transport.as_ref())?;
        Ok(())
    }

    /// Transport completion of a pending connect.
    ///
    /// Exactly one of `connection_established` or `connection_failed`
    /// reaches the requesting application. Returns the new session handle,
    /// or `None` when the transport reported a failure.
    #[instrument(skip(self, result))]
    pub fn connect_notify(
        &self,
        request_id: u32,
        result: std::result::Result<TransportSession, ConnectFailReason>,
    ) -> Result<Option<SessionHandle>> {
        let mut deferred = Vec::new();
        let outcome = self.complete_connect(request_id, result, &mut deferred);
        deliver_all(deferred);
        outcome
    }

    fn complete_connect(
        &self,
        request_id: u32,
        result: std::result::Result<TransportSession, ConnectFailReason>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<Option<SessionHandle>> {
        let mut control = self.control.lock();
        let pending = control.broker.complete(request_id)?;
        let app = control
            .registry
            .get(pending.app_index)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("application {}", pending.app_index)))?;

        let fail = |reason: ConnectFailReason| ConnectFailure {
            api_context: pending.api_context,
            external_token: pending.external_token,
            reason,
        };

        let transport_session = match result {
            Ok(session) => session,
            Err(reason) => {
                debug!("Connect {} failed: {}", request_id, reason);
                deferred.push(Deferred::Failed(app.notifier(), fail(reason)));
                return Ok(None);
            }
        };

        let (fifos, added) = match control.registry.alloc_fifos(pending.app_index) {
            Ok(placed) => placed,
            Err(e) => {
                warn!("Connect {}: {}", request_id, e);
                deferred.push(Deferred::Failed(app.notifier(), fail(ConnectFailReason::FifoExhausted)));
                return Err(e);
            }
        };
        if let Some(info) = added {
            deferred.push(Deferred::SegmentAdded(app.notifier(), info));
        }

        let location = fifos.location();
        let record = SessionRecord {
            app_index: pending.app_index,
            kind: SessionKind::Connected,
            fifos: Some(fifos.clone()),
        };
        let handle = match self.sessions.alloc(transport_session.thread_index, record) {
            Ok(handle) => handle,
            Err(e) => {
                fifos.release();
                deferred.push(Deferred::Failed(app.notifier(), fail(ConnectFailReason::Other(e.code()))));
                return Err(e);
            }
        };

        debug!("Connect {} established as {}", request_id, handle);
        deferred.push(Deferred::Established(
            app.notifier(),
            EstablishedSession {
                api_context: pending.api_context,
                external_token: pending.external_token,
                handle,
                remote: transport_session.remote,
                fifos: location,
            },
        ));
        Ok(Some(handle))
    }

    /// Transport accepted a connection on `listener`.
    ///
    /// The session belongs to the listener's application, which may refuse
    /// it from `session_accepted`.
    #[instrument(skip(self))]
    pub fn accept_notify(
        &self,
        listener: SessionHandle,
        thread_index: u32,
        remote: TransportEndpoint,
    ) -> Result<SessionHandle> {
        let mut deferred = Vec::new();
        let accepted = self.place_accepted(listener, thread_index, remote, &mut deferred);
        deliver_all(deferred);
        let (app, session) = accepted?;

        if let Err(e) = app.notifier().session_accepted(&session) {
            debug!("Application {} refused session {}: {}", app.index(), session.handle, e);
            if let Ok(mut record) = self.sessions.remove(session.handle) {
                if let Some(fifos) = record.fifos.take() {
                    fifos.release();
                }
            }
            return Err(e);
        }

        Ok(session.handle)
    }

    fn place_accepted(
        &self,
        listener: SessionHandle,
        thread_index: u32,
        remote: TransportEndpoint,
        deferred: &mut Vec<Deferred>,
    ) -> Result<(Arc<Application>, AcceptedSession)> {
        let mut control = self.control.lock();
        let owner = control
            .binds
            .by_handle(listener)
            .map(|l| l.app_index)
            .ok_or_else(|| SessionError::NotFound(format!("listener {}", listener)))?;
        let app = control
            .registry
            .get(owner)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("application {}", owner)))?;

        let (fifos, added) = control.registry.alloc_fifos(owner)?;
        if let Some(info) = added {
            deferred.push(Deferred::SegmentAdded(app.notifier(), info));
        }

        let location = fifos.location();
        let record = SessionRecord {
            app_index: owner,
            kind: SessionKind::Accepted { listener },
            fifos: Some(fifos.clone()),
        };
        let handle = match self.sessions.alloc(thread_index, record) {
            Ok(handle) => handle,
            Err(e) => {
                fifos.release();
                return Err(e);
            }
        };

        let session = AcceptedSession {
            handle,
            listener,
            remote,
            accept_cookie: app.options().accept_cookie,
            fifos: location,
        };
        Ok((app, session))
    }

    /// Transport closed a session; its owner is told after cleanup
    #[instrument(skip(self))]
    pub fn disconnect_notify(&self, handle: SessionHandle) -> Result<()> {
        let mut deferred = Vec::new();
        {
            let control = self.control.lock();
            let record = self.sessions.get(handle)?;
            if record.is_listener() {
                return Err(SessionError::InvalidArgument(format!(
                    "{} is a listener, not a connection",
                    handle
                )));
            }

            let mut record = self.sessions.remove(handle)?;
            if let Some(fifos) = record.fifos.take() {
                fifos.release();
            }
            if let Some(app) = control.registry.get(record.app_index) {
                deferred.push(Deferred::Disconnected(app.notifier(), handle));
            }
        }

        debug!("Transport closed session {}", handle);
        deliver_all(deferred);
        Ok(())
    }
}
