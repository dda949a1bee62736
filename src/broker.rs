//! Connection broker: outbound connects, local redirects, disconnects

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;
use vnet_session_core::{
    EndpointArg, ListenKey, RedirectedConnect, Result, SessionError, SessionHandle,
    TransportConnect, TransportLayer, VNET_CONNECT_REDIRECTED,
};

use crate::bind_table::BindTable;
use crate::registry::ApplicationRegistry;
use crate::sessions::{SessionKind, SessionRecord, SessionTable};

/// Connect request from an application
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub target: EndpointArg,
    pub app_index: u32,
    /// Echoed back in the completion notification
    pub api_context: u32,
    pub external_token: Option<u32>,
    /// Opaque request replayed to a local listener on redirect
    pub mp: Bytes,
}

impl ConnectArgs {
    pub fn new(app_index: u32, target: EndpointArg) -> Self {
        Self {
            target,
            app_index,
            api_context: 0,
            external_token: None,
            mp: Bytes::new(),
        }
    }
}

/// Outcome of a connect call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectStatus {
    /// Handed to the transport; completes through `connect_notify`
    Pending { request_id: u32 },
    /// Handed to the local listener; the transport was never involved
    Redirected {
        server_app_index: u32,
        listener: SessionHandle,
        #[serde(skip)]
        payload: Bytes,
    },
}

impl ConnectStatus {
    /// API return code: 0, or the redirect sentinel
    pub fn code(&self) -> i32 {
        match self {
            ConnectStatus::Pending { .. } => 0,
            ConnectStatus::Redirected { .. } => VNET_CONNECT_REDIRECTED,
        }
    }

    pub fn is_redirected(&self) -> bool {
        matches!(self, ConnectStatus::Redirected { .. })
    }
}

/// Connect waiting for its transport completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnect {
    pub request_id: u32,
    pub app_index: u32,
    pub api_context: u32,
    pub external_token: Option<u32>,
    pub destination: ListenKey,
}

#[derive(Debug, Default)]
pub struct ConnectionBroker {
    pending: HashMap<u32, PendingConnect>,
    next_request_id: u32,
}

impl ConnectionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_request_id(&mut self) -> u32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Redirect to a local listener or hand the request to the transport.
    ///
    /// A redirect notifies the listening application before returning; the
    /// caller holds the control-plane lock throughout. A notification the
    /// listener cannot take fails the connect.
    pub fn connect(
        &mut self,
        args: &ConnectArgs,
        registry: &ApplicationRegistry,
        binds: &BindTable,
        transport: &dyn TransportLayer,
    ) -> Result<ConnectStatus> {
        if registry.get(args.app_index).is_none() {
            return Err(SessionError::NotFound(format!("application {}", args.app_index)));
        }
        let destination = args.target.resolve()?;

        let redirect = binds.lookup_for_connect(&destination).and_then(|listener| {
            registry
                .get(listener.app_index)
                .filter(|server| server.options().use_fifo_for_redirect())
                .map(|server| (listener, server))
        });

        if let Some((listener, server)) = redirect {
            if let Err(e) = server.notifier().redirect_connect(&RedirectedConnect {
                client_app_index: args.app_index,
                api_context: args.api_context,
                external_token: args.external_token,
                listener: listener.handle,
                payload: args.mp.clone(),
            }) {
                debug!(
                    "Application {} could not take redirected connect from {}: {}",
                    listener.app_index, args.app_index, e
                );
                return Err(e);
            }
            debug!(
                "Redirected connect from application {} to listener {} of application {}",
                args.app_index, listener.handle, listener.app_index
            );
            return Ok(ConnectStatus::Redirected {
                server_app_index: listener.app_index,
                listener: listener.handle,
                payload: args.mp.clone(),
            });
        }

        let request_id = self.next_request_id();
        self.pending.insert(
            request_id,
            PendingConnect {
                request_id,
                app_index: args.app_index,
                api_context: args.api_context,
                external_token: args.external_token,
                destination,
            },
        );

        if let Err(e) = transport.connect(&TransportConnect {
            request_id,
            destination,
        }) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        debug!("Connect {} to {} pending", request_id, destination);
        Ok(ConnectStatus::Pending { request_id })
    }

    /// Take the pending request a transport completion refers to
    pub fn complete(&mut self, request_id: u32) -> Result<PendingConnect> {
        self.pending
            .remove(&request_id)
            .ok_or_else(|| SessionError::NotFound(format!("connect request {}", request_id)))
    }

    pub fn pending_for(&self, app_index: u32) -> usize {
        self.pending.values().filter(|p| p.app_index == app_index).count()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Close a connection session owned by `app_index`.
    ///
    /// Accepted sessions belong to the application owning their listener.
    pub fn disconnect(
        &self,
        handle: SessionHandle,
        app_index: u32,
        sessions: &SessionTable,
        transport: &dyn TransportLayer,
    ) -> Result<SessionRecord> {
        let record = sessions.get(handle)?;
        if let SessionKind::Listener { key } = record.kind {
            return Err(SessionError::InvalidArgument(format!(
                "{} is the listener on {}, unbind it instead",
                handle, key
            )));
        }
        if record.app_index != app_index {
            return Err(SessionError::PermissionDenied(format!(
                "session {} belongs to application {}, not {}",
                handle, record.app_index, app_index
            )));
        }

        transport.disconnect(handle)?;

        let mut record = sessions.remove(handle)?;
        if let Some(fifos) = record.fifos.take() {
            fifos.release();
        }
        debug!("Disconnected session {}", handle);
        Ok(record)
    }
}
