//! Scripted in-memory transport for bus-level tests.
//!
//! A `MockBus` is the shared test handle: push inbound chunks, install a
//! responder that maps transmitted frames to replies, and inspect what the
//! code under test wrote. `MockBus::transport()` hands out the
//! `ByteTransport` half that gets moved into the frame link.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{ByteTransport, TransportFactory};
use crate::core::protocol::frame::Frame;
use crate::utils::error::Result;

type Responder = Box<dyn FnMut(&Frame) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockBusInner {
    rx: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

/// Shared handle over the scripted bus state.
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Arc<Mutex<MockBusInner>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport half, to be boxed into a `FrameLink`.
    pub fn transport(&self) -> MockTransport {
        MockTransport { bus: self.clone() }
    }

    /// Queue raw bytes for the reader (one OS read chunk).
    pub fn push_bytes(&self, bytes: Vec<u8>) {
        self.inner.lock().unwrap().rx.push_back(bytes);
    }

    /// Queue an encoded frame as a single read chunk.
    pub fn push_frame(&self, frame: &Frame) {
        self.push_bytes(frame.encode());
    }

    /// Script replies: the responder sees every frame the code under test
    /// transmits and returns the chunks to feed back.
    pub fn set_responder(&self, responder: impl FnMut(&Frame) -> Vec<Vec<u8>> + Send + 'static) {
        self.inner.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Raw write history.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Write history decoded into frames (panics on malformed output, which
    /// is itself a test failure).
    pub fn written_frames(&self) -> Vec<Frame> {
        self.written()
            .iter()
            .map(|bytes| Frame::decode(bytes).expect("transmitted frame must be well-formed"))
            .collect()
    }

    pub fn clear_written(&self) {
        self.inner.lock().unwrap().written.clear();
    }
}

/// The `ByteTransport` half of a `MockBus`.
pub struct MockTransport {
    bus: MockBus,
}

#[async_trait]
impl ByteTransport for MockTransport {
    async fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deliver = |inner: &mut MockBusInner, buf: &mut [u8]| -> Option<usize> {
            let mut chunk = inner.rx.pop_front()?;
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                chunk.drain(..n);
                inner.rx.push_front(chunk);
            }
            Some(n)
        };

        if let Some(n) = deliver(&mut self.bus.inner.lock().unwrap(), buf) {
            return Ok(n);
        }

        // Nothing queued: model the read timeout so virtual time advances
        // under tokio's paused clock.
        tokio::time::sleep(timeout).await;
        Ok(deliver(&mut self.bus.inner.lock().unwrap(), buf).unwrap_or(0))
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.bus.inner.lock().unwrap();
        inner.written.push(data.to_vec());

        if let Some(responder) = inner.responder.as_mut() {
            if let Ok(frame) = Frame::decode(data) {
                let mut replies = responder(&frame);
                for reply in replies.drain(..) {
                    inner.rx.push_back(reply);
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[async_trait]
impl TransportFactory for MockBus {
    async fn open(&self) -> Result<Box<dyn ByteTransport>> {
        Ok(Box::new(self.transport()))
    }
}
