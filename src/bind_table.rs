//! Listen key to listener mapping

use std::collections::HashMap;
use vnet_session_core::{ListenKey, Result, SessionError, SessionHandle, UnbindTarget};

/// A bound listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub key: ListenKey,
    pub app_index: u32,
    pub handle: SessionHandle,
}

#[derive(Debug, Default)]
pub struct BindTable {
    by_key: HashMap<ListenKey, Listener>,
    by_handle: HashMap<SessionHandle, ListenKey>,
}

impl BindTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` for `app_index`.
    ///
    /// `register` runs only when the key is free; it allocates the listener
    /// handle and gets the transport's acceptance. Its error aborts the bind.
    pub fn bind<F>(&mut self, key: ListenKey, app_index: u32, register: F) -> Result<Listener>
    where
        F: FnOnce(&ListenKey) -> Result<SessionHandle>,
    {
        if let Some(existing) = self.by_key.get(&key) {
            return Err(SessionError::AlreadyBound(format!(
                "{} is bound by application {}",
                key, existing.app_index
            )));
        }

        let handle = register(&key)?;
        let listener = Listener {
            key,
            app_index,
            handle,
        };
        self.by_key.insert(key, listener);
        self.by_handle.insert(handle, key);
        Ok(listener)
    }

    /// Remove the listener `target` names, if `app_index` owns it
    pub fn unbind(&mut self, target: &UnbindTarget, app_index: u32) -> Result<Listener> {
        let key = match target {
            UnbindTarget::Key(arg) => arg.resolve()?,
            UnbindTarget::Handle(handle) => *self
                .by_handle
                .get(handle)
                .ok_or_else(|| SessionError::NotFound(format!("listener {}", handle)))?,
        };

        let listener = self
            .by_key
            .get(&key)
            .ok_or_else(|| SessionError::NotFound(format!("no listener on {}", key)))?;

        if listener.app_index != app_index {
            return Err(SessionError::PermissionDenied(format!(
                "{} belongs to application {}, not {}",
                key, listener.app_index, app_index
            )));
        }

        let listener = *listener;
        self.by_key.remove(&key);
        self.by_handle.remove(&listener.handle);
        Ok(listener)
    }

    pub fn lookup(&self, key: &ListenKey) -> Option<&Listener> {
        self.by_key.get(key)
    }

    /// Listener a connect to `key` reaches: exact match, then wildcard
    pub fn lookup_for_connect(&self, key: &ListenKey) -> Option<&Listener> {
        self.by_key
            .get(key)
            .or_else(|| self.by_key.get(&key.wildcard()))
    }

    pub fn by_handle(&self, handle: SessionHandle) -> Option<&Listener> {
        self.by_handle.get(&handle).and_then(|key| self.by_key.get(key))
    }

    pub fn listeners_of(&self, app_index: u32) -> Vec<Listener> {
        self.by_key
            .values()
            .filter(|l| l.app_index == app_index)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vnet_session_core::{EndpointArg, HandleCodec};

    fn key(uri: &str) -> ListenKey {
        ListenKey::parse_uri(uri).unwrap()
    }

    fn handle(n: u32) -> SessionHandle {
        HandleCodec::encode(0, n).unwrap()
    }

    #[test]
    fn test_duplicate_bind() {
        let mut table = BindTable::new();
        table.bind(key("tcp://1.2.3.4/80"), 0, |_| Ok(handle(1))).unwrap();

        let mut called = false;
        let err = table
            .bind(key("tcp://1.2.3.4/80"), 1, |_| {
                called = true;
                Ok(handle(2))
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyBound(_)));
        assert!(!called);

        // Different protocol is a different key
        table.bind(key("udp://1.2.3.4/80"), 1, |_| Ok(handle(3))).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rejected_registration_leaves_no_entry() {
        let mut table = BindTable::new();
        let err = table
            .bind(key("tcp://1.2.3.4/80"), 0, |_| {
                Err(SessionError::PermissionDenied("port reserved".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unbind_by_key_or_handle() {
        let mut table = BindTable::new();
        table.bind(key("tcp://1.2.3.4/80"), 0, |_| Ok(handle(1))).unwrap();
        table.bind(key("tcp://1.2.3.4/81"), 0, |_| Ok(handle(2))).unwrap();

        let target = UnbindTarget::from(EndpointArg::uri("tcp://1.2.3.4/80"));
        assert!(matches!(table.unbind(&target, 5), Err(SessionError::PermissionDenied(_))));
        assert_eq!(table.unbind(&target, 0).unwrap().handle, handle(1));
        assert!(matches!(table.unbind(&target, 0), Err(SessionError::NotFound(_))));

        let removed = table.unbind(&UnbindTarget::from(handle(2)), 0).unwrap();
        assert_eq!(removed.key, key("tcp://1.2.3.4/81"));
        assert!(table.by_handle(handle(2)).is_none());
        assert!(table.is_empty());

        // Rebind after unbind
        table.bind(key("tcp://1.2.3.4/80"), 1, |_| Ok(handle(4))).unwrap();
    }

    #[test]
    fn test_unbind_bad_uri() {
        let mut table = BindTable::new();
        let target = UnbindTarget::from(EndpointArg::uri("tcp:/1.2.3.4"));
        assert!(matches!(table.unbind(&target, 0), Err(SessionError::InvalidArgument(_))));
    }

    #[test]
    fn test_connect_lookup_falls_back_to_wildcard() {
        let mut table = BindTable::new();
        table.bind(key("tcp://0.0.0.0/80"), 3, |_| Ok(handle(1))).unwrap();

        let hit = table.lookup_for_connect(&key("tcp://10.0.0.1/80")).unwrap();
        assert_eq!(hit.app_index, 3);
        assert!(table.lookup(&key("tcp://10.0.0.1/80")).is_none());
        assert!(table.lookup_for_connect(&key("tcp://10.0.0.1/81")).is_none());
        assert!(table.lookup_for_connect(&key("tcp://[::1]/80")).is_none());

        table.bind(key("tcp://10.0.0.1/80"), 4, |_| Ok(handle(2))).unwrap();
        assert_eq!(table.lookup_for_connect(&key("tcp://10.0.0.1/80")).unwrap().app_index, 4);
        assert_eq!(table.listeners_of(3).len(), 1);
    }
}
