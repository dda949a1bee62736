//! Session layer integration tests: attach, bind, connect and teardown

use mockall::mock;
use parking_lot::Mutex;
use std::sync::Arc;
use vnet_session::{AttachArgs, ConnectArgs, ConnectStatus, SessionLayer, SessionLayerConfig};
use vnet_session_core::{
    AcceptedSession, AppEvent, AppOptions, CallbackMask, ConnectFailReason, ConnectFailure,
    EndpointArg, EstablishedSession, HandleCodec, ListenKey, OptionFlags, Protocol,
    RedirectedConnect, Result, SegmentInfo, SessionCallbacks, SessionError, SessionHandle,
    TransportConnect, TransportEndpoint, TransportLayer, TransportSession, UnbindTarget,
    VNET_CONNECT_REDIRECTED,
};

mock! {
    pub Transport {}

    impl TransportLayer for Transport {
        fn listen(&self, key: &ListenKey, listener: SessionHandle) -> Result<()>;
        fn unlisten(&self, key: &ListenKey, listener: SessionHandle) -> Result<()>;
        fn connect(&self, request: &TransportConnect) -> Result<()>;
        fn disconnect(&self, handle: SessionHandle) -> Result<()>;
    }
}

/// Records every notification as the event an external client would see
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<AppEvent>>,
    refuse_accepts: bool,
}

impl Recorder {
    fn refusing() -> Self {
        Self {
            refuse_accepts: true,
            ..Default::default()
        }
    }

    fn take(&self) -> Vec<AppEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: AppEvent) {
        self.events.lock().push(event);
    }
}

impl SessionCallbacks for Recorder {
    fn connection_established(&self, session: &EstablishedSession) {
        self.push(session.into());
    }

    fn connection_failed(&self, failure: &ConnectFailure) {
        self.push(failure.into());
    }

    fn session_accepted(&self, session: &AcceptedSession) -> Result<()> {
        self.push(session.into());
        if self.refuse_accepts {
            return Err(SessionError::PermissionDenied("not accepting".into()));
        }
        Ok(())
    }

    fn session_disconnected(&self, handle: SessionHandle) {
        self.push(AppEvent::Disconnected { handle });
    }

    fn segment_added(&self, segment: &SegmentInfo) {
        self.push(AppEvent::SegmentAdded(segment.clone()));
    }

    fn redirect_connect(&self, request: &RedirectedConnect) -> Result<()> {
        self.push(request.into());
        Ok(())
    }
}

fn permissive() -> MockTransport {
    let mut transport = MockTransport::new();
    transport.expect_listen().returning(|_, _| Ok(()));
    transport.expect_unlisten().returning(|_, _| Ok(()));
    transport.expect_connect().returning(|_| Ok(()));
    transport.expect_disconnect().returning(|_| Ok(()));
    transport
}

fn layer(transport: MockTransport) -> SessionLayer {
    SessionLayer::new(SessionLayerConfig::anonymous(2), Arc::new(transport)).unwrap()
}

fn small() -> AppOptions {
    AppOptions {
        segment_size: 64 * 1024,
        evt_queue_size: 16,
        rx_fifo_size: 8192,
        tx_fifo_size: 8192,
        ..Default::default()
    }
}

fn attach(layer: &SessionLayer, options: AppOptions) -> (u32, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let reply = layer.attach(AttachArgs::builtin(recorder.clone(), options)).unwrap();
    (reply.app_index, recorder)
}

fn uri(s: &str) -> EndpointArg {
    EndpointArg::uri(s)
}

fn remote() -> TransportEndpoint {
    TransportEndpoint::new([10, 0, 0, 9], 50000)
}

fn pending_id(status: ConnectStatus) -> u32 {
    match status {
        ConnectStatus::Pending { request_id } => request_id,
        other => panic!("expected pending connect, got {:?}", other),
    }
}

#[test]
fn test_attach_bind_redirect_detach_scenario() {
    let mut transport = MockTransport::new();
    transport.expect_listen().times(1).returning(|_, _| Ok(()));
    transport.expect_unlisten().times(1).returning(|_, _| Ok(()));
    transport.expect_connect().never();
    let layer = layer(transport);

    let server = Arc::new(Recorder::default());
    let options = AppOptions {
        segment_size: 1024 * 1024,
        evt_queue_size: 256,
        ..Default::default()
    }
    .with_flags(OptionFlags::USE_FIFO);
    let a = layer.attach(AttachArgs::builtin(server.clone(), options)).unwrap();
    assert_eq!(a.app_index, 0);
    assert_eq!(a.segment_size, 1024 * 1024);
    assert_eq!(layer.event_queues().get(&a.segment_name, a.event_queue_address).unwrap().capacity(), 256);

    let bind = layer
        .bind(0, EndpointArg::endpoint(TransportEndpoint::new([1, 2, 3, 4], 80), Protocol::Tcp))
        .unwrap();
    assert_eq!(bind.uri, "tcp://1.2.3.4/80");
    assert_eq!(bind.segment_name, a.segment_name);
    assert_eq!(bind.event_queue_address, a.event_queue_address);

    let (b, _) = attach(&layer, small());
    assert!(matches!(
        layer.bind(b, uri("tcp://1.2.3.4/80")),
        Err(SessionError::AlreadyBound(_))
    ));

    let (c, _) = attach(&layer, small());
    let mut args = ConnectArgs::new(c, uri("tcp://1.2.3.4/80"));
    args.api_context = 77;
    args.mp = bytes::Bytes::from_static(b"hello");
    let status = layer.connect(args).unwrap();
    assert_eq!(status.code(), VNET_CONNECT_REDIRECTED);
    match status {
        ConnectStatus::Redirected {
            server_app_index,
            listener,
            payload,
        } => {
            assert_eq!(server_app_index, 0);
            assert_eq!(listener, bind.listener_handle);
            assert_eq!(&payload[..], b"hello");
        }
        other => panic!("expected redirect, got {:?}", other),
    }
    assert!(matches!(
        server.take().as_slice(),
        [AppEvent::RedirectConnect { client_app_index, api_context: 77, .. }] if *client_app_index == c
    ));

    layer.unbind(0, uri("tcp://1.2.3.4/80")).unwrap();
    layer.detach(0).unwrap();
    assert!(layer.segments().get(&a.segment_name).is_none());
    assert!(layer.event_queues().get(&a.segment_name, a.event_queue_address).is_none());
    assert!(layer.application(0).is_none());
}

#[test]
fn test_app_indices_unique_and_reused_after_detach() {
    let layer = layer(permissive());
    let indices: Vec<u32> = (0..4).map(|_| attach(&layer, small()).0).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    layer.detach(1).unwrap();
    assert!(matches!(layer.detach(1), Err(SessionError::NotFound(_))));
    assert_eq!(attach(&layer, small()).0, 1);
    assert_eq!(attach(&layer, small()).0, 4);
    assert_eq!(layer.application_count(), 5);
}

#[test]
fn test_rebind_after_unbind() {
    let layer = layer(permissive());
    let (a, _) = attach(&layer, small());
    let (b, _) = attach(&layer, small());

    let first = layer.bind(a, uri("udp://0.0.0.0/53")).unwrap();
    assert!(matches!(layer.bind(b, uri("udp://0.0.0.0/53")), Err(SessionError::AlreadyBound(_))));
    assert!(matches!(
        layer.unbind(b, uri("udp://0.0.0.0/53")),
        Err(SessionError::PermissionDenied(_))
    ));

    layer.unbind(a, UnbindTarget::Handle(first.listener_handle)).unwrap();
    assert!(matches!(
        layer.unbind(a, first.listener_handle),
        Err(SessionError::NotFound(_))
    ));
    layer.bind(b, uri("udp://0.0.0.0/53")).unwrap();
    assert_eq!(layer.listener_count(), 1);
}

#[test]
fn test_bind_errors() {
    let mut transport = MockTransport::new();
    transport
        .expect_listen()
        .returning(|_, _| Err(SessionError::PermissionDenied("privileged port".into())));
    let layer = layer(transport);
    let (a, _) = attach(&layer, small());

    assert!(matches!(layer.bind(a, uri("tcp://1.2.3.4")), Err(SessionError::InvalidArgument(_))));
    assert!(matches!(layer.bind(9, uri("tcp://1.2.3.4/80")), Err(SessionError::NotFound(_))));
    assert!(matches!(
        layer.bind(a, uri("tcp://1.2.3.4/80")),
        Err(SessionError::PermissionDenied(_))
    ));
    assert_eq!(layer.listener_count(), 0);
    assert_eq!(layer.session_count(), 0);
}

#[test]
fn test_listener_handles_live_on_main_thread() {
    let layer = layer(permissive());
    let (a, _) = attach(&layer, small());
    let first = layer.bind(a, uri("tcp://1.2.3.4/80")).unwrap();
    let second = layer.bind(a, uri("tcp://1.2.3.4/81")).unwrap();

    assert_eq!(first.listener_handle.decode().unwrap(), (0, 0));
    assert_eq!(second.listener_handle.decode().unwrap(), (0, 1));
}

#[test]
fn test_connect_without_use_fifo_goes_to_transport() {
    let mut transport = MockTransport::new();
    transport.expect_listen().returning(|_, _| Ok(()));
    transport
        .expect_connect()
        .withf(|request| request.destination == ListenKey::parse_uri("tcp://1.2.3.4/80").unwrap())
        .times(1)
        .returning(|_| Ok(()));
    let layer = layer(transport);

    let (server, server_events) = attach(&layer, small());
    layer.bind(server, uri("tcp://1.2.3.4/80")).unwrap();

    let (client, _) = attach(&layer, small());
    let status = layer.connect(ConnectArgs::new(client, uri("tcp://1.2.3.4/80"))).unwrap();
    assert_eq!(status.code(), 0);
    assert!(!status.is_redirected());
    assert!(server_events.take().is_empty());
}

#[test]
fn test_wildcard_listener_receives_redirect() {
    let mut transport = MockTransport::new();
    transport.expect_listen().returning(|_, _| Ok(()));
    transport.expect_connect().never();
    let layer = layer(transport);

    let (server, events) = attach(&layer, small().with_flags(OptionFlags::USE_FIFO));
    let bind = layer.bind(server, uri("tcp://0.0.0.0/8080")).unwrap();

    let (client, _) = attach(&layer, small());
    let status = layer.connect(ConnectArgs::new(client, uri("tcp://127.0.0.1/8080"))).unwrap();
    assert!(matches!(status, ConnectStatus::Redirected { listener, .. } if listener == bind.listener_handle));
    assert_eq!(events.take().len(), 1);
}

#[test]
fn test_connect_errors() {
    let mut transport = MockTransport::new();
    transport
        .expect_connect()
        .returning(|_| Err(SessionError::ResourceExhausted("no ports".into())));
    let layer = layer(transport);
    let (client, _) = attach(&layer, small());

    assert!(matches!(
        layer.connect(ConnectArgs::new(42, uri("tcp://1.2.3.4/80"))),
        Err(SessionError::NotFound(_))
    ));
    assert!(matches!(
        layer.connect(ConnectArgs::new(client, uri("bogus"))),
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        layer.connect(ConnectArgs::new(client, uri("tcp://1.2.3.4/80"))),
        Err(SessionError::ResourceExhausted(_))
    ));

    // The rejected request left nothing pending
    layer.detach(client).unwrap();
}

#[test]
fn test_connect_completion_and_disconnect() {
    let layer = layer(permissive());
    let (client, events) = attach(&layer, small());
    let (other, _) = attach(&layer, small());

    let mut args = ConnectArgs::new(client, uri("tcp://5.6.7.8/443"));
    args.api_context = 11;
    args.external_token = Some(99);
    let request_id = pending_id(layer.connect(args).unwrap());

    // Pending connects keep the application attached
    assert!(matches!(layer.detach(client), Err(SessionError::ResourceBusy(_))));

    let handle = layer
        .connect_notify(
            request_id,
            Ok(TransportSession {
                thread_index: 1,
                remote: remote(),
            }),
        )
        .unwrap()
        .unwrap();
    assert_eq!(handle.thread_index(), 1);

    let events = events.take();
    assert_eq!(events.len(), 1);
    match &events[0] {
        AppEvent::Connected {
            api_context,
            external_token,
            handle: notified,
            remote: peer,
            fifos,
        } => {
            assert_eq!(*api_context, 11);
            assert_eq!(*external_token, Some(99));
            assert_eq!(*notified, handle);
            assert_eq!(*peer, remote());
            assert_eq!(fifos.rx_size, 8192);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // A second completion of the same request is unknown
    assert!(matches!(
        layer.connect_notify(request_id, Err(ConnectFailReason::Reset)),
        Err(SessionError::NotFound(_))
    ));

    assert!(matches!(layer.detach(client), Err(SessionError::ResourceBusy(_))));
    assert!(matches!(layer.disconnect(handle, other), Err(SessionError::PermissionDenied(_))));
    layer.disconnect(handle, client).unwrap();
    assert!(matches!(layer.disconnect(handle, client), Err(SessionError::NotFound(_))));
    assert!(matches!(
        layer.disconnect(HandleCodec::encode(1, 4000).unwrap(), client),
        Err(SessionError::NotFound(_))
    ));

    layer.detach(client).unwrap();
}

#[test]
fn test_failed_connect_notifies_once() {
    let layer = layer(permissive());
    let (client, events) = attach(&layer, small());
    let request_id = pending_id(layer.connect(ConnectArgs::new(client, uri("tcp://5.6.7.8/443"))).unwrap());

    assert_eq!(layer.connect_notify(request_id, Err(ConnectFailReason::Refused)).unwrap(), None);
    assert!(matches!(
        events.take().as_slice(),
        [AppEvent::ConnectFailed { reason: ConnectFailReason::Refused, .. }]
    ));
    assert!(layer.connect_notify(request_id, Err(ConnectFailReason::Refused)).is_err());
    assert!(events.take().is_empty());

    layer.detach(client).unwrap();
}

#[test]
fn test_completion_on_unknown_worker_fails_connect() {
    let layer = layer(permissive());
    let (client, events) = attach(&layer, small());
    let request_id = pending_id(layer.connect(ConnectArgs::new(client, uri("tcp://5.6.7.8/443"))).unwrap());

    let result = layer.connect_notify(
        request_id,
        Ok(TransportSession {
            thread_index: 7,
            remote: remote(),
        }),
    );
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    assert!(matches!(events.take().as_slice(), [AppEvent::ConnectFailed { .. }]));
    layer.detach(client).unwrap();
}

#[test]
fn test_fifo_exhaustion_fails_only_that_session() {
    let layer = layer(permissive());
    let options = AppOptions {
        rx_fifo_size: 16384,
        tx_fifo_size: 16384,
        ..small()
    };
    let (client, events) = attach(&layer, options);

    let first = pending_id(layer.connect(ConnectArgs::new(client, uri("tcp://5.6.7.8/1"))).unwrap());
    let second = pending_id(layer.connect(ConnectArgs::new(client, uri("tcp://5.6.7.8/2"))).unwrap());
    let established = TransportSession {
        thread_index: 0,
        remote: remote(),
    };

    let handle = layer.connect_notify(first, Ok(established)).unwrap().unwrap();
    assert!(matches!(
        layer.connect_notify(second, Ok(established)),
        Err(SessionError::ResourceExhausted(_))
    ));
    assert!(matches!(
        events.take().as_slice(),
        [
            AppEvent::Connected { .. },
            AppEvent::ConnectFailed { reason: ConnectFailReason::FifoExhausted, .. }
        ]
    ));

    // The first session is unaffected
    layer.disconnect(handle, client).unwrap();
}

#[test]
fn test_fifo_exhaustion_adds_segment_when_allowed() {
    let layer = layer(permissive());
    let options = AppOptions {
        rx_fifo_size: 16384,
        tx_fifo_size: 16384,
        ..small()
    }
    .with_flags(OptionFlags::ADD_SEGMENT);
    let (client, events) = attach(&layer, options);
    let established = TransportSession {
        thread_index: 1,
        remote: remote(),
    };

    for port in [1, 2] {
        let request_id = pending_id(
            layer
                .connect(ConnectArgs::new(client, uri(&format!("tcp://5.6.7.8/{}", port))))
                .unwrap(),
        );
        layer.connect_notify(request_id, Ok(established)).unwrap().unwrap();
    }

    let app = layer.application(client).unwrap();
    assert_eq!(app.segments().len(), 2);
    let events = events.take();
    assert!(matches!(
        events.as_slice(),
        [AppEvent::Connected { .. }, AppEvent::SegmentAdded(info), AppEvent::Connected { fifos, .. }]
            if info.name == fifos.segment_name
    ));
}

#[test]
fn test_accepted_sessions_belong_to_listener_app() {
    let layer = layer(permissive());
    let cookie_options = AppOptions {
        accept_cookie: 0xfeed,
        ..small()
    };
    let (server, events) = attach(&layer, cookie_options);
    let (stranger, _) = attach(&layer, small());
    let bind = layer.bind(server, uri("tcp://1.2.3.4/80")).unwrap();

    let handle = layer.accept_notify(bind.listener_handle, 1, remote()).unwrap();
    assert!(matches!(
        events.take().as_slice(),
        [AppEvent::Accepted { accept_cookie: 0xfeed, listener, .. }] if *listener == bind.listener_handle
    ));

    assert!(matches!(
        layer.disconnect(bind.listener_handle, server),
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(layer.disconnect(handle, stranger), Err(SessionError::PermissionDenied(_))));

    // Listener and session both hold the application
    layer.unbind(server, bind.listener_handle).unwrap();
    assert!(matches!(layer.detach(server), Err(SessionError::ResourceBusy(_))));

    layer.disconnect_notify(handle).unwrap();
    assert_eq!(events.take(), vec![AppEvent::Disconnected { handle }]);
    assert!(matches!(layer.disconnect(handle, server), Err(SessionError::NotFound(_))));
    layer.detach(server).unwrap();
}

#[test]
fn test_refused_accept_frees_session() {
    let layer = layer(permissive());
    let recorder = Arc::new(Recorder::refusing());
    let server = layer
        .attach(AttachArgs::builtin(recorder.clone(), small()))
        .unwrap()
        .app_index;
    let bind = layer.bind(server, uri("tcp://1.2.3.4/80")).unwrap();

    assert!(matches!(
        layer.accept_notify(bind.listener_handle, 0, remote()),
        Err(SessionError::PermissionDenied(_))
    ));
    assert_eq!(recorder.take().len(), 1);
    assert_eq!(layer.session_count(), 1);

    assert!(matches!(
        layer.accept_notify(SessionHandle::from_raw(12345), 0, remote()),
        Err(SessionError::NotFound(_))
    ));
    assert!(matches!(
        layer.disconnect_notify(bind.listener_handle),
        Err(SessionError::InvalidArgument(_))
    ));
}

#[test]
fn test_detach_busy_with_listener() {
    let layer = layer(permissive());
    let (a, _) = attach(&layer, small());
    let segment = layer.application(a).unwrap().primary_segment().name().to_string();
    layer.bind(a, uri("tcp://1.2.3.4/80")).unwrap();

    assert!(matches!(layer.detach(a), Err(SessionError::ResourceBusy(_))));
    assert!(layer.segments().get(&segment).is_some());

    layer.unbind(a, uri("tcp://1.2.3.4/80")).unwrap();
    layer.detach(a).unwrap();
    assert!(layer.segments().get(&segment).is_none());
    assert_eq!(layer.session_count(), 0);
}

#[test]
fn test_add_segment_signals_application() {
    let layer = layer(permissive());
    let (plain, _) = attach(&layer, small());
    assert!(matches!(layer.add_segment(plain, 0), Err(SessionError::ResourceExhausted(_))));

    let (growing, events) = attach(&layer, small().with_flags(OptionFlags::ADD_SEGMENT));
    let before = layer.application(growing).unwrap();
    let name = layer.add_segment(growing, 128 * 1024).unwrap();

    assert_eq!(before.segments().len(), 1);
    let after = layer.application(growing).unwrap();
    assert_eq!(after.segments().len(), 2);
    assert_eq!(after.segments()[1].name(), name);
    assert!(matches!(events.take().as_slice(), [AppEvent::SegmentAdded(info)] if info.name == name));

    layer.detach(growing).unwrap();
    assert!(layer.segments().get(&name).is_none());
}

#[test]
fn test_external_app_receives_events_through_queue() {
    let layer = layer(permissive());
    let reply = layer
        .attach(AttachArgs::external(5, CallbackMask::REQUIRED, small()))
        .unwrap();
    let app = layer.application(reply.app_index).unwrap();
    assert_eq!(app.api_client_index(), Some(5));

    let request_id = pending_id(
        layer
            .connect(ConnectArgs::new(reply.app_index, uri("tcp://5.6.7.8/443")))
            .unwrap(),
    );
    let handle = layer
        .connect_notify(
            request_id,
            Ok(TransportSession {
                thread_index: 0,
                remote: remote(),
            }),
        )
        .unwrap()
        .unwrap();

    let queue = app.event_queue();
    assert_eq!(queue.address(), reply.event_queue_address);
    assert!(matches!(
        queue.try_recv().unwrap(),
        Some(AppEvent::Connected { handle: notified, .. }) if notified == handle
    ));
    assert_eq!(queue.try_recv().unwrap(), None);
}

#[test]
fn test_external_app_needs_redirect_subscription_for_use_fifo() {
    let layer = layer(permissive());
    let options = small().with_flags(OptionFlags::USE_FIFO);
    assert!(matches!(
        layer.attach(AttachArgs::external(5, CallbackMask::REQUIRED, options)),
        Err(SessionError::InvalidArgument(_))
    ));
    layer
        .attach(AttachArgs::external(5, CallbackMask::all(), options))
        .unwrap();
}
