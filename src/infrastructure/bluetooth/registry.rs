//! Session registry
//!
//! Process-wide table of every peripheral the central has heard of, plus the
//! map of live sessions. Both live under one lock: registration is a single
//! check-and-insert, so two concurrent connects for one identity can never both
//! succeed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::models::{AppEvent, Identity, PeripheralSnapshot};

use super::peripheral::Peripheral;
use super::session::Session;
use super::BleError;

#[derive(Default)]
struct Inner {
    sessions: HashMap<Identity, Arc<Session>>,
    /// Held strongly: a peripheral stays listed after its last session ends and
    /// after the scan that found it is dropped.
    known: Vec<Arc<Peripheral>>,
    index: HashMap<Identity, usize>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live session for `identity`, if any.
    pub fn resolve(&self, identity: &Identity) -> Option<Arc<Session>> {
        self.lock().sessions.get(identity).cloned()
    }

    pub fn register(&self, session: Arc<Session>) -> Result<(), BleError> {
        let mut inner = self.lock();
        let identity = session.identity().clone();
        if inner.sessions.contains_key(&identity) {
            return Err(BleError::AlreadyActive(identity));
        }
        debug!("Registered session for {}", identity);
        inner.sessions.insert(identity, session);
        Ok(())
    }

    /// End whatever session is registered for `identity`. Unregistering an
    /// absent entry is a no-op.
    ///
    /// The session is asked to disconnect and keeps its entry until its
    /// supervisor has finished, so no second session can start while the first
    /// one is still driving the peripheral.
    pub fn unregister(&self, identity: &Identity) -> Option<Arc<Session>> {
        let session = self.resolve(identity)?;
        if session.request_disconnect() {
            debug!("Unregistering session for {}", identity);
        }
        Some(session)
    }

    /// Remove `session` only if it is still the registered one.
    pub(crate) fn unregister_session(&self, session: &Session) {
        let mut inner = self.lock();
        let current = inner
            .sessions
            .get(session.identity())
            .map(|s| std::ptr::eq(Arc::as_ptr(s), session))
            .unwrap_or(false);
        if current {
            inner.sessions.remove(session.identity());
            debug!("Session for {} ended", session.identity());
        }
    }

    /// Look up or create the peripheral handle for `identity`. The flag is `true`
    /// when the handle was created by this call.
    pub fn track(
        &self,
        identity: &Identity,
        name: Option<&str>,
        events: &mpsc::UnboundedSender<AppEvent>,
    ) -> (Arc<Peripheral>, bool) {
        let mut inner = self.lock();
        if let Some(&i) = inner.index.get(identity) {
            let peripheral = inner.known[i].clone();
            drop(inner);
            peripheral.update_name(name);
            return (peripheral, false);
        }

        let peripheral = Arc::new(Peripheral::new(
            identity.clone(),
            name.map(str::to_string),
            events.clone(),
        ));
        let position = inner.known.len();
        inner.known.push(peripheral.clone());
        inner.index.insert(identity.clone(), position);
        (peripheral, true)
    }

    pub fn peripheral(&self, identity: &Identity) -> Option<Arc<Peripheral>> {
        let inner = self.lock();
        inner.index.get(identity).map(|&i| inner.known[i].clone())
    }

    /// Known peripherals in the order they were first seen.
    pub fn peripherals(&self) -> Vec<Arc<Peripheral>> {
        self.lock().known.clone()
    }

    pub fn snapshot(&self) -> Vec<PeripheralSnapshot> {
        self.peripherals().iter().map(|p| p.snapshot()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> mpsc::UnboundedSender<AppEvent> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_track_keeps_insertion_order() {
        let registry = SessionRegistry::new();
        let tx = events();
        let b = Identity::le("BB:00:00:00:00:00");
        let a = Identity::le("AA:00:00:00:00:00");

        let (_, created) = registry.track(&b, Some("B"), &tx);
        assert!(created);
        registry.track(&a, None, &tx);
        let (again, created) = registry.track(&b, Some("Renamed"), &tx);
        assert!(!created);
        assert_eq!(again.name().as_deref(), Some("B"));

        let order: Vec<Identity> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.identity)
            .collect();
        assert_eq!(order, vec![b, a]);
    }

    #[tokio::test]
    async fn test_register_rejects_second_session() {
        let registry = SessionRegistry::new();
        let tx = events();
        let identity = Identity::le("CC:00:00:00:00:00");
        let (peripheral, _) = registry.track(&identity, None, &tx);

        let first = Arc::new(Session::new(peripheral.clone()));
        let second = Arc::new(Session::new(peripheral));
        registry.register(first.clone()).unwrap();
        assert_eq!(
            registry.register(second.clone()),
            Err(BleError::AlreadyActive(identity.clone()))
        );

        // Only the registered session may remove itself.
        registry.unregister_session(&second);
        assert_eq!(registry.active_count(), 1);
        registry.unregister_session(&first);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_unregister_keeps_entry_until_session_ends() {
        let registry = SessionRegistry::new();
        let identity = Identity::le("EE:00:00:00:00:00");
        let (peripheral, _) = registry.track(&identity, None, &events());
        let session = Arc::new(Session::new(peripheral.clone()));
        registry.register(session.clone()).unwrap();

        let removed = registry.unregister(&identity).unwrap();
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(session.is_ending());
        assert_eq!(
            registry.register(Arc::new(Session::new(peripheral))),
            Err(BleError::AlreadyActive(identity.clone()))
        );

        registry.unregister_session(&session);
        assert!(registry.resolve(&identity).is_none());
        assert!(registry.unregister(&identity).is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let identity = Identity::le("DD:00:00:00:00:00");
        assert!(registry.unregister(&identity).is_none());
        assert!(registry.unregister(&identity).is_none());
        assert!(registry.resolve(&identity).is_none());
    }
}
