//! Handler bookkeeping for the realtime channel.

use std::collections::HashMap;

use super::event::{EventKind, Handler};

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl HandlerRegistry {
    /// Append a handler. Registering the same handler twice means it runs twice.
    pub fn add(&mut self, kind: EventKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Remove every registration of `handler` under `kind`.
    ///
    /// Returns how many registrations were removed.
    pub fn remove(&mut self, kind: &EventKind, handler: &Handler) -> usize {
        let Some(list) = self.handlers.get_mut(kind) else {
            return 0;
        };
        let before = list.len();
        list.retain(|h| !h.same_as(handler));
        let removed = before - list.len();
        if list.is_empty() {
            self.handlers.remove(kind);
        }
        removed
    }

    /// Remove all handlers for `kind`.
    pub fn remove_all(&mut self, kind: &EventKind) -> usize {
        self.handlers.remove(kind).map(|list| list.len()).unwrap_or(0)
    }

    /// Drop every handler; returns how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.handlers.clear();
        count
    }

    /// Handlers for `kind` in registration order, detached from the registry
    /// so they can run without holding any lock.
    pub fn snapshot(&self, kind: &EventKind) -> Vec<Handler> {
        self.handlers.get(kind).cloned().unwrap_or_default()
    }

    pub fn count(&self, kind: &EventKind) -> usize {
        self.handlers.get(kind).map(Vec::len).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::ChannelEvent;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = Arc::clone(log);
        Handler::new(move |_| log.lock().unwrap().push(name))
    }

    fn fire(registry: &HandlerRegistry, kind: &EventKind) {
        let event = ChannelEvent::Custom {
            event: kind.to_string(),
            data: serde_json::Value::Null,
        };
        for handler in registry.snapshot(kind) {
            handler.call(&event);
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        let ping = EventKind::from("ping");
        registry.add(ping.clone(), recording(&log, "h1"));
        registry.add(ping.clone(), recording(&log, "h2"));

        fire(&registry, &ping);
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2"]);
    }

    #[test]
    fn duplicate_registration_is_not_deduplicated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        let ping = EventKind::from("ping");
        let h = recording(&log, "h");
        registry.add(ping.clone(), h.clone());
        registry.add(ping.clone(), h.clone());
        assert_eq!(registry.count(&ping), 2);

        fire(&registry, &ping);
        assert_eq!(log.lock().unwrap().len(), 2);

        assert_eq!(registry.remove(&ping, &h), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn selective_and_bulk_removal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        let ping = EventKind::from("ping");
        let h1 = recording(&log, "h1");
        let h2 = recording(&log, "h2");
        registry.add(ping.clone(), h1.clone());
        registry.add(ping.clone(), h2.clone());
        registry.add(EventKind::Announcement, h1.clone());

        assert_eq!(registry.remove(&ping, &h1), 1);
        fire(&registry, &ping);
        assert_eq!(*log.lock().unwrap(), vec!["h2"]);
        assert_eq!(registry.count(&EventKind::Announcement), 1);

        assert_eq!(registry.remove_all(&ping), 1);
        assert_eq!(registry.remove_all(&ping), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
