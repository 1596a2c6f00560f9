//! In-memory transport for tests.
//!
//! Sockets never touch the network. Tests drive them by calling the
//! `simulate_*` methods, which feed events into the channel synchronously.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lms_shared::Frame;
use serde_json::Value;

use super::transport::{
    ConnectRequest, DisconnectReason, EventSink, Socket, Transport, TransportError,
    TransportEvent,
};

#[derive(Clone, Default)]
pub struct MockTransport {
    sockets: Arc<Mutex<Vec<Arc<MockSocket>>>>,
    refuse: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail as if no runtime were available.
    pub fn refuse_open(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of sockets opened so far.
    pub fn opened(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.sockets.lock().unwrap()[index])
    }

    pub fn last_socket(&self) -> Arc<MockSocket> {
        let sockets = self.sockets.lock().unwrap();
        Arc::clone(sockets.last().expect("no socket opened"))
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Arc<dyn Socket>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::NoRuntime);
        }
        let mut sockets = self.sockets.lock().unwrap();
        let socket = Arc::new(MockSocket {
            index: sockets.len(),
            request,
            sink,
            id: Mutex::new(None),
            live: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        });
        sockets.push(Arc::clone(&socket));
        Ok(socket)
    }
}

pub struct MockSocket {
    index: usize,
    request: ConnectRequest,
    sink: EventSink,
    id: Mutex<Option<String>>,
    live: AtomicBool,
    closed: AtomicBool,
    reconnects: AtomicU32,
    sent: Mutex<Vec<Frame>>,
}

impl MockSocket {
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Feed a raw transport event to the owner.
    pub fn simulate(&self, event: TransportEvent) {
        (self.sink)(event)
    }

    pub fn simulate_connected(&self) {
        let id = format!("mock-{}", self.index);
        *self.id.lock().unwrap() = Some(id.clone());
        self.live.store(true, Ordering::SeqCst);
        self.simulate(TransportEvent::Connected { connection_id: id });
    }

    pub fn simulate_disconnect(&self, reason: DisconnectReason) {
        *self.id.lock().unwrap() = None;
        self.live.store(false, Ordering::SeqCst);
        self.simulate(TransportEvent::Disconnected { reason });
    }

    /// Drop the connection without telling anyone.
    pub fn simulate_silent_drop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn simulate_frame(&self, event: &str, data: Value) {
        self.simulate(TransportEvent::Frame(Frame::new(event, data)));
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent().into_iter().map(|f| f.event).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reconnect_requests(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl Socket for MockSocket {
    fn id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.is_live() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }
}
