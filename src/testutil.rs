//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::engine::{Event, ProtocolSession};
use crate::envelope::DeliveryRequest;

/// In-memory log sink that can be cloned into a `Logger`.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf).lines().map(str::to_string).collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Accept,
    Reject,
    ContinueAuth(Vec<u8>),
    Raw(Vec<u8>),
}

/// Replays a fixed list of events and records every call made on it.
pub struct ScriptedSession {
    events: VecDeque<Event>,
    pub calls: Vec<Call>,
    pub pulled: usize,
}

impl ScriptedSession {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into(),
            calls: Vec::new(),
            pulled: 0,
        }
    }
}

#[async_trait]
impl ProtocolSession for ScriptedSession {
    async fn next(&mut self) -> Event {
        self.pulled += 1;
        self.events
            .pop_front()
            .unwrap_or_else(|| Event::Abort("script exhausted".to_string()))
    }

    async fn accept(&mut self) {
        self.calls.push(Call::Accept);
    }

    async fn reject(&mut self) {
        self.calls.push(Call::Reject);
    }

    async fn continue_authentication(&mut self, client_bytes: &[u8]) {
        self.calls.push(Call::ContinueAuth(client_bytes.to_vec()));
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.calls.push(Call::Raw(bytes.to_vec()));
        Ok(())
    }
}

/// Delivery engine that records requests and answers with a fixed result.
pub struct RecordingDelivery {
    result: Result<(), DeliveryError>,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl RecordingDelivery {
    pub fn succeeding() -> Self {
        Self {
            result: Ok(()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: DeliveryError) -> Self {
        Self {
            result: Err(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryEngine for RecordingDelivery {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        self.requests.lock().unwrap().push(request.clone());
        self.result.clone()
    }
}
