//! Frame-level serial link: rolling receive buffer, sync recovery and
//! half-duplex write discipline.
//!
//! The parser never resyncs on the BEGIN byte alone. SERVICE frames carry
//! CMD = 0x68, the same value as the BEGIN marker, so a candidate start is
//! only accepted once its declared length, END marker and CRC all validate;
//! otherwise a single byte is discarded and the scan resumes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::traits::ByteTransport;
use crate::core::protocol::constants::{
    BEGIN_FRAME, END_FRAME, FRAME_BASE_LEN, FRAME_MAX_LEN,
};
use crate::core::protocol::frame::Frame;
use crate::utils::error::Result;

/// Quiet period before every transmission (RS-485 bus turnaround).
pub const TURNAROUND_DELAY: Duration = Duration::from_millis(20);
/// Upper bound for a single transport read call.
pub const READ_SLICE: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 512;

/// Spaced uppercase hex for TX/RX debug lines ("68 05 00 ...").
fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Link counters, surfaced through diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub frames_invalid: u64,
    pub resyncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_frame_at: Option<Instant>,
}

/// Owns a byte transport and turns it into a stream of validated frames.
pub struct FrameLink {
    transport: Box<dyn ByteTransport>,
    rx_buffer: Vec<u8>,
    stats: LinkStats,
}

impl FrameLink {
    pub fn new(transport: Box<dyn ByteTransport>) -> Self {
        Self {
            transport,
            rx_buffer: Vec::with_capacity(4096),
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Discard buffered receive data. Only used when a transport is
    /// replaced after reconnection; the token handshake depends on buffered
    /// bytes surviving writes, so this is never called on the send path.
    pub fn clear_buffer(&mut self) {
        self.rx_buffer.clear();
    }

    /// Return the next complete frame observed within `timeout`.
    ///
    /// Reads in short bursts (at most [`READ_SLICE`] per transport call) so
    /// a caller-supplied deadline is honoured to roughly that granularity.
    pub async fn poll_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if let Some(frame) = self.extract_frame() {
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let slice = (deadline - now).min(READ_SLICE);
            let n = self.transport.read_chunk(&mut buf, slice).await?;
            if n > 0 {
                self.stats.bytes_read += n as u64;
                self.rx_buffer.extend_from_slice(&buf[..n]);
            }
        }
    }

    /// Block until `silence` has elapsed with no bytes on the wire.
    ///
    /// Traffic observed while waiting restarts the window and is discarded,
    /// so this does not return until the bus has genuinely gone quiet. On a
    /// permanently busy bus this never returns; callers bound it with their
    /// own deadline if they need one.
    pub async fn drain_idle(&mut self, silence: Duration) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = self.transport.read_chunk(&mut buf, silence).await?;
            if n == 0 {
                return Ok(());
            }
            self.stats.bytes_read += n as u64;
            trace!("drain_idle: {} bytes discarded, window restarted", n);
        }
    }

    /// Transmit a frame, observing the 20 ms turnaround delay.
    ///
    /// The receive buffer is deliberately left intact: a token-grant SERVICE
    /// frame can arrive in the same OS read chunk as the IDENTIFY that
    /// triggered our answer, and flushing here would lose it.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        tokio::time::sleep(TURNAROUND_DELAY).await;

        let bytes = frame.encode();
        self.transport.write_all(&bytes).await?;
        self.stats.frames_written += 1;
        self.stats.bytes_written += bytes.len() as u64;

        debug!(hex = %hex_dump(&bytes), "TX {}", frame);
        Ok(())
    }

    /// Try to extract one validated frame from the rolling buffer.
    fn extract_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(begin) = self.rx_buffer.iter().position(|&b| b == BEGIN_FRAME) else {
                if !self.rx_buffer.is_empty() {
                    trace!("no BEGIN marker, discarding {} bytes", self.rx_buffer.len());
                    self.stats.resyncs += 1;
                    self.rx_buffer.clear();
                }
                return None;
            };

            if begin > 0 {
                trace!("discarding {} bytes before BEGIN marker", begin);
                self.stats.resyncs += 1;
                self.rx_buffer.drain(..begin);
            }

            if self.rx_buffer.len() < 3 {
                return None;
            }

            let declared = usize::from(u16::from_le_bytes([self.rx_buffer[1], self.rx_buffer[2]]));
            let total = declared + 6;

            if declared < usize::from(FRAME_BASE_LEN) || total > FRAME_MAX_LEN {
                // Implausible length: this 0x68 was payload, not a start.
                self.drop_false_start();
                continue;
            }

            if self.rx_buffer.len() < total {
                // Wait for the rest of the candidate frame.
                return None;
            }

            if self.rx_buffer[total - 1] != END_FRAME {
                self.drop_false_start();
                continue;
            }

            match Frame::decode(&self.rx_buffer[..total]) {
                Ok(frame) => {
                    self.rx_buffer.drain(..total);
                    self.stats.frames_read += 1;
                    self.stats.last_frame_at = Some(Instant::now());
                    trace!("RX {}", frame);
                    return Some(frame);
                }
                Err(e) => {
                    debug!(
                        "frame candidate rejected ({e}): {}",
                        hex_dump(&self.rx_buffer[..total.min(32)])
                    );
                    self.drop_false_start();
                }
            }
        }
    }

    fn drop_false_start(&mut self) {
        self.rx_buffer.drain(..1);
        self.stats.frames_invalid += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::constants::{Command, PANEL_ADDRESS};
    use crate::core::transport::mock::MockBus;

    fn link_over(bus: &MockBus) -> FrameLink {
        FrameLink::new(Box::new(bus.transport()))
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex_dump(&[]), "");
        assert_eq!(hex_dump(&[0x68]), "68");
        assert_eq!(hex_dump(&[0x68, 0x05, 0x00, 0x16]), "68 05 00 16");
    }

    #[tokio::test]
    async fn parses_frame_split_across_chunks() {
        let bus = MockBus::new();
        let frame = Frame::new(131, 1, 0xC0, vec![0x00, 0x00, 42]);
        let bytes = frame.encode();
        bus.push_bytes(bytes[..5].to_vec());
        bus.push_bytes(bytes[5..].to_vec());

        let mut link = link_over(&bus);
        let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(frame));
    }

    #[tokio::test]
    async fn resyncs_over_leading_garbage() {
        let bus = MockBus::new();
        let frame = Frame::new(131, 100, Command::Identify.code(), vec![]);
        let mut stream = vec![0xDE, 0xAD, 0x16, 0x68, 0x03]; // noise, including a lone BEGIN
        stream.extend(frame.encode());
        bus.push_bytes(stream);

        let mut link = link_over(&bus);
        let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(frame));
        assert!(link.stats().frames_invalid > 0 || link.stats().resyncs > 0);
    }

    #[tokio::test]
    async fn service_command_byte_does_not_confuse_framing() {
        // A SERVICE frame's CMD byte is 0x68. Feed two back-to-back SERVICE
        // frames plus a data frame in one chunk; boundaries must match a
        // structural parse.
        let bus = MockBus::new();
        let grant = Frame::new(131, PANEL_ADDRESS, 0x68, vec![0x01, 0x08, 0x00, 0x00]);
        let clock = Frame::new(0xFFFF, PANEL_ADDRESS, 0x68, vec![0x23, 0x00, 0x01, 0x02]);
        let data = Frame::new(131, 1, 0xC0, vec![0x00, 0x00, 7]);

        let mut stream = Vec::new();
        stream.extend(grant.encode());
        stream.extend(clock.encode());
        stream.extend(data.encode());
        bus.push_bytes(stream);

        let mut link = link_over(&bus);
        for expected in [&grant, &clock, &data] {
            let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
            assert_eq!(got.as_ref(), Some(expected));
        }
        assert_eq!(link.stats().frames_read, 3);
        assert_eq!(link.stats().frames_invalid, 0);
    }

    #[tokio::test]
    async fn corrupted_frame_is_skipped_and_sync_recovers() {
        let bus = MockBus::new();
        let good = Frame::new(131, 1, 0x82, vec![1, 0, 0]);
        let mut bad = Frame::new(131, 1, 0x82, vec![2, 0, 0]).encode();
        bad[9] ^= 0xFF; // corrupt payload; CRC now fails

        let mut stream = bad;
        stream.extend(good.encode());
        bus.push_bytes(stream);

        let mut link = link_over(&bus);
        let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(good));
        assert!(link.stats().frames_invalid > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_frame_times_out_quietly() {
        let bus = MockBus::new();
        let mut link = link_over(&bus);

        let start = Instant::now();
        let got = link.poll_frame(Duration::from_millis(600)).await.unwrap();
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_idle_waits_for_silence() {
        let bus = MockBus::new();
        let mut link = link_over(&bus);

        let start = Instant::now();
        link.drain_idle(Duration::from_millis(1500)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn send_does_not_flush_receive_buffer() {
        // IDENTIFY and the following token grant arrive in one chunk; sending
        // our answer in between must not lose the grant.
        let bus = MockBus::new();
        let identify = Frame::new(131, PANEL_ADDRESS, Command::Identify.code(), vec![]);
        let grant = Frame::new(131, PANEL_ADDRESS, 0x68, vec![0x01, 0x08, 0x00, 0x00]);
        let mut chunk = identify.encode();
        chunk.extend(grant.encode());
        bus.push_bytes(chunk);

        let mut link = link_over(&bus);
        let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(identify));

        let answer = Frame::new(PANEL_ADDRESS, 131, Command::IdentifyAns.code(), vec![0; 16]);
        link.send_frame(&answer).await.unwrap();

        let got = link.poll_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(grant));
    }

    #[tokio::test(start_paused = true)]
    async fn send_observes_turnaround_delay() {
        let bus = MockBus::new();
        let mut link = link_over(&bus);

        let start = Instant::now();
        link.send_frame(&Frame::new(1, 131, 0x00, vec![]))
            .await
            .unwrap();
        assert!(start.elapsed() >= TURNAROUND_DELAY);
        assert_eq!(bus.written_frames().len(), 1);
    }
}
