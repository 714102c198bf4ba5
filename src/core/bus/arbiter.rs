//! Bus arbitration state machine.
//!
//! The GM3 bus is multi-master: the display panel (address 100) probes for
//! devices with IDENTIFY frames and hands out transmit tokens via SERVICE
//! frames. This module is the single authority for that dance:
//!
//! ```text
//! UNREGISTERED ─► CLAIMING ─► IDLE ─► TOKEN_HELD ─► RETURNING ─► IDLE
//! ```
//!
//! All arbitration edge cases live here on purpose: answering an IDENTIFY
//! probe that arrives while we hold the token, picking up a token grant that
//! landed in the same read chunk as the IDENTIFY preceding it, and the
//! BEGIN/SERVICE byte collision (handled below us in the frame link).
//!
//! Callers get a mutex-like contract through [`BusArbiter::run_with_token`]:
//! the closure runs with exclusive bus access and the token is returned when
//! it finishes, normally or not.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::address_book::AddressBook;
use crate::core::protocol::constants::{
    is_reserved_address, Command, ServiceFunction, BROADCAST_ADDRESS, IDENTIFY_RESPONSE_DATA,
    IDENTIFY_SCAN_BAND, PANEL_ADDRESS, TOKEN_RETURN_DATA,
};
use crate::core::protocol::frame::Frame;
use crate::core::protocol::pdu::{struct_response_first_index, values_response_first_index};
use crate::core::transport::link::{FrameLink, LinkStats};
use crate::core::transport::traits::ByteTransport;
use crate::utils::error::{GatewayError, Result};

/// Read slice while waiting for a token or an IDENTIFY probe.
const TOKEN_WAIT_SLICE: Duration = Duration::from_millis(500);
/// Read slice while holding the token.
const HELD_READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Empty 500 ms reads that count as "bus idle" for the opportunistic path.
const IDLE_FALLBACK_READS: u32 = 3;
/// Observed silence required before an opportunistic transmission.
const IDLE_FALLBACK_SILENCE: Duration = Duration::from_millis(1500);
/// Consecutive empty reads that end a reply wait (the answer is not coming).
const SILENT_READS_PER_ATTEMPT: u32 = 3;
/// The panel grants a token to a freshly identified device within one
/// scanning cycle; give up on a claim candidate after this window.
const CLAIM_GRANT_WINDOW: Duration = Duration::from_secs(10);
/// Delay between attempts when transmitting without a token.
const OPPORTUNISTIC_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default attempt budget for request/reply exchanges.
pub const BATCH_ATTEMPTS: u32 = 5;

/// Arbiter state, in bus-cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Unregistered,
    Claiming,
    Idle,
    TokenHeld,
    Returning,
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// When false, 1.5 s of bus silence is accepted in place of a token.
    pub token_required: bool,
    /// Per-attempt reply deadline.
    pub request_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            token_required: true,
            request_timeout: Duration::from_millis(1500),
        }
    }
}

/// Reply-payload validation for request/reply exchanges: responses echo the
/// first wire index of the request, which filters out stale frames from
/// earlier exchanges.
#[derive(Debug, Clone, Copy)]
pub enum EchoCheck {
    None,
    /// Struct responses: `[paramsNo][first_lo][first_hi] ...`
    StructFirstIndex(u16),
    /// Value responses: leading `[index_lo][index_hi]` of the first triple.
    ValuesFirstIndex(u16),
}

/// One request/reply exchange on the bus.
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub destination: u16,
    pub command: Command,
    pub payload: Vec<u8>,
    pub expect: u8,
    pub also_accept: Vec<u8>,
    pub echo: EchoCheck,
    pub attempts: u32,
}

impl BusRequest {
    pub fn new(destination: u16, command: Command, payload: Vec<u8>) -> Self {
        Self {
            destination,
            command,
            payload,
            expect: command.reply_code(),
            also_accept: Vec::new(),
            echo: EchoCheck::None,
            attempts: BATCH_ATTEMPTS,
        }
    }

    /// Accept the controller's error sentinels (NO_DATA, DATA_SIZE_ERROR) as
    /// terminal replies.
    pub fn accept_error_sentinels(mut self) -> Self {
        self.also_accept = vec![Command::NoData.code(), Command::DataSizeError.code()];
        self
    }

    pub fn echo(mut self, check: EchoCheck) -> Self {
        self.echo = check;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

/// The bus arbiter. Owns the frame link and the address book; everything
/// that transmits goes through it.
pub struct BusArbiter {
    link: FrameLink,
    book: AddressBook,
    config: ArbiterConfig,
    state: ArbiterState,
    address: Option<u16>,
    has_token: bool,
}

impl BusArbiter {
    pub fn new(link: FrameLink, book: AddressBook, config: ArbiterConfig) -> Self {
        let address = book.claimed();
        let state = if address.is_some() {
            ArbiterState::Idle
        } else {
            ArbiterState::Unregistered
        };
        Self {
            link,
            book,
            config,
            state,
            address,
            has_token: false,
        }
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    pub fn address(&self) -> Option<u16> {
        self.address
    }

    /// The adopted bus address; 0 until registration completes.
    pub fn local_address(&self) -> u16 {
        self.address.unwrap_or(0)
    }

    pub fn has_token(&self) -> bool {
        self.has_token
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Replace the transport after a reconnect. The claimed address is kept;
    /// any token state is gone with the old connection.
    pub fn swap_transport(&mut self, transport: Box<dyn ByteTransport>) {
        self.link = FrameLink::new(transport);
        self.has_token = false;
        self.state = if self.address.is_some() {
            ArbiterState::Idle
        } else {
            ArbiterState::Unregistered
        };
    }

    /// Run `body` with exclusive bus access.
    ///
    /// Blocks until a token is granted (or, with `token_required = false`,
    /// until the bus has been idle for 1.5 s), invokes `body`, then returns
    /// the token. `timeout` bounds registration and the token wait;
    /// `None` waits indefinitely.
    pub async fn run_with_token<T, F>(&mut self, timeout: Option<Duration>, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut BusArbiter) -> BoxFuture<'s, Result<T>>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.ensure_registered(deadline).await?;
        self.wait_for_token(deadline).await?;

        let result = body(&mut *self).await;

        self.release_token().await;
        result
    }

    /// Make sure we own a bus address, auto-claiming one if needed.
    pub async fn ensure_registered(&mut self, deadline: Option<Instant>) -> Result<u16> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        if let Some(address) = self.book.claimed() {
            self.address = Some(address);
            self.state = ArbiterState::Idle;
            return Ok(address);
        }
        self.auto_claim(deadline).await
    }

    /// Passively observe the panel's IDENTIFY scan and claim a free address.
    ///
    /// The panel cycles a scanning address. When a probe targets an address
    /// in the scanning band (and outside the reserved set) we tentatively
    /// assume that identity and answer; if the panel follows up with a token
    /// grant to that address within one cycle window, the address is adopted
    /// and persisted.
    async fn auto_claim(&mut self, deadline: Option<Instant>) -> Result<u16> {
        self.state = ArbiterState::Claiming;
        info!("No claimed bus address, listening for IDENTIFY probes");

        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.state = ArbiterState::Unregistered;
                    return Err(GatewayError::ClaimFailed(
                        "no claimable IDENTIFY probe observed before deadline".to_string(),
                    ));
                }
            }

            let Some(frame) = self.link.poll_frame(TOKEN_WAIT_SLICE).await? else {
                continue;
            };
            trace!("bus: {}", frame);

            if frame.command != Command::Identify.code() {
                continue;
            }

            let candidate = frame.destination;
            if candidate == BROADCAST_ADDRESS
                || is_reserved_address(candidate)
                || !IDENTIFY_SCAN_BAND.contains(&candidate)
            {
                continue;
            }

            self.answer_identify_as(candidate).await?;
            info!("Answered IDENTIFY probe as candidate address {}", candidate);

            let grant_deadline = Instant::now() + CLAIM_GRANT_WINDOW;
            while Instant::now() < grant_deadline {
                let Some(frame) = self.link.poll_frame(TOKEN_WAIT_SLICE).await? else {
                    continue;
                };

                if frame.command == Command::Identify.code() && frame.destination == candidate {
                    // Panel re-probed before granting; keep answering.
                    self.answer_identify_as(candidate).await?;
                    continue;
                }

                if frame.destination == candidate
                    && frame.service_function() == Some(ServiceFunction::TokenGrant.code())
                {
                    self.book.persist(candidate).await?;
                    self.address = Some(candidate);
                    self.has_token = true;
                    self.state = ArbiterState::TokenHeld;
                    info!("Adopted bus address {} (token granted by panel)", candidate);
                    return Ok(candidate);
                }
            }

            debug!(
                "No token grant for candidate {} within the cycle window, resuming scan",
                candidate
            );
        }
    }

    /// Wait until the panel grants us the token.
    ///
    /// With `token_required = false` the wait degrades to the bus-idle
    /// fallback: three consecutive empty 500 ms reads license transmission.
    /// The fallback never persists token state; the caller proceeds
    /// token-less and every opportunistic transmission re-acquires idle.
    pub async fn wait_for_token(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.has_token {
            self.state = ArbiterState::TokenHeld;
            return Ok(());
        }

        let mut silent_reads = 0u32;
        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(GatewayError::TokenTimeout);
                }
            }

            match self.link.poll_frame(TOKEN_WAIT_SLICE).await? {
                Some(frame) => {
                    silent_reads = 0;
                    trace!("bus: {}", frame);
                    self.handle_frame(&frame).await?;
                    if self.has_token {
                        return Ok(());
                    }
                }
                None => {
                    silent_reads += 1;
                    if !self.config.token_required && silent_reads >= IDLE_FALLBACK_READS {
                        debug!("Bus idle, proceeding without token (opportunistic mode)");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Hand the token back to the panel.
    ///
    /// A failed TOKEN_RETURN write is logged but never blocks further
    /// arbitration; the token is considered released locally either way.
    pub async fn release_token(&mut self) {
        if !self.has_token {
            self.state = ArbiterState::Idle;
            return;
        }

        self.state = ArbiterState::Returning;
        if let Some(address) = self.address {
            let frame = Frame::new(
                PANEL_ADDRESS,
                address,
                Command::Service.code(),
                TOKEN_RETURN_DATA.to_vec(),
            );
            match self.link.send_frame(&frame).await {
                Ok(()) => debug!("Token returned to panel"),
                Err(e) => warn!("TOKEN_RETURN write failed ({e}), token released locally"),
            }
        }

        self.has_token = false;
        self.state = ArbiterState::Idle;
    }

    /// Run one request/reply exchange with retries. Meant to be called from
    /// inside a `run_with_token` body.
    ///
    /// Each attempt transmits the request and reads replies until a match,
    /// an accepted error sentinel, the per-attempt deadline, or bus silence
    /// (three consecutive empty 200 ms reads). Without a token, every
    /// attempt independently re-acquires 1.5 s of bus idle first and waits
    /// 500 ms between attempts.
    pub async fn transact(&mut self, request: &BusRequest) -> Result<Option<Frame>> {
        for attempt in 1..=request.attempts {
            if !self.has_token {
                self.link.drain_idle(IDLE_FALLBACK_SILENCE).await?;
            }

            let frame = Frame::new(
                request.destination,
                self.local_address(),
                request.command.code(),
                request.payload.clone(),
            );
            self.link.send_frame(&frame).await?;

            if let Some(reply) = self.await_reply(request).await? {
                return Ok(Some(reply));
            }

            if attempt < request.attempts {
                debug!(
                    "No reply to cmd 0x{:02X} (attempt {}/{})",
                    request.command.code(),
                    attempt,
                    request.attempts
                );
                if !self.has_token {
                    tokio::time::sleep(OPPORTUNISTIC_RETRY_DELAY).await;
                }
            }
        }
        Ok(None)
    }

    async fn await_reply(&mut self, request: &BusRequest) -> Result<Option<Frame>> {
        let deadline = Instant::now() + self.config.request_timeout;
        let our = self.local_address();
        let mut silent_reads = 0u32;
        let mut skipped = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let slice = (deadline - now).min(HELD_READ_TIMEOUT);
            let Some(reply) = self.link.poll_frame(slice).await? else {
                silent_reads += 1;
                if silent_reads >= SILENT_READS_PER_ATTEMPT {
                    break;
                }
                continue;
            };
            silent_reads = 0;

            if reply.destination != our && reply.destination != BROADCAST_ADDRESS {
                skipped += 1;
                continue;
            }

            // Panel control frames are served in-line, even mid-exchange:
            // an IDENTIFY while we hold the token is answered without
            // dropping the token. Data replies from the panel (it owns the
            // panel parameter space) fall through to matching below.
            if reply.source == PANEL_ADDRESS
                && (reply.command == Command::Identify.code()
                    || reply.command == Command::Service.code())
            {
                self.handle_frame(&reply).await?;
                continue;
            }

            if request.destination != BROADCAST_ADDRESS && reply.source != request.destination {
                skipped += 1;
                continue;
            }

            if request.also_accept.contains(&reply.command) {
                return Ok(Some(reply));
            }

            if reply.command != request.expect {
                skipped += 1;
                continue;
            }

            let echo_ok = match request.echo {
                EchoCheck::None => true,
                EchoCheck::StructFirstIndex(first) => {
                    struct_response_first_index(&reply.payload) == Some(first)
                }
                EchoCheck::ValuesFirstIndex(first) => {
                    values_response_first_index(&reply.payload) == Some(first)
                }
            };
            if !echo_ok {
                trace!("stale reply for cmd 0x{:02X} skipped", request.command.code());
                skipped += 1;
                continue;
            }

            return Ok(Some(reply));
        }

        if skipped > 0 {
            debug!(
                "No matching reply for cmd 0x{:02X} ({} frames skipped)",
                request.command.code(),
                skipped
            );
        }
        Ok(None)
    }

    /// React to a bus frame addressed to us (or broadcast): answer IDENTIFY
    /// probes, accept token grants, and log the panel's periodic SERVICE
    /// traffic for diagnostics without acting on it.
    async fn handle_frame(&mut self, frame: &Frame) -> Result<()> {
        let Some(our) = self.address else {
            return Ok(());
        };
        if frame.destination != our && frame.destination != BROADCAST_ADDRESS {
            return Ok(());
        }

        if frame.command == Command::Identify.code() && frame.destination == our {
            self.answer_identify_as(our).await?;
            debug!("Answered IDENTIFY probe from {}", frame.source);
            return Ok(());
        }

        if frame.command == Command::Service.code() {
            match frame.service_function().map(ServiceFunction::from_code) {
                Some(Some(ServiceFunction::TokenGrant)) if frame.destination == our => {
                    if !self.has_token {
                        info!("Token granted by panel");
                    }
                    self.has_token = true;
                    self.state = ArbiterState::TokenHeld;
                }
                Some(Some(ServiceFunction::TokenReturn)) => {}
                Some(Some(ServiceFunction::ClockSync)) => debug!("SERVICE: clock sync"),
                Some(Some(ServiceFunction::DeviceTable)) => debug!("SERVICE: device table"),
                Some(Some(ServiceFunction::PairingBeacon)) => debug!("SERVICE: pairing beacon"),
                other => trace!("SERVICE: unhandled function {:?}", other),
            }
        }

        Ok(())
    }

    async fn answer_identify_as(&mut self, source: u16) -> Result<()> {
        let answer = Frame::new(
            PANEL_ADDRESS,
            source,
            Command::IdentifyAns.code(),
            IDENTIFY_RESPONSE_DATA.to_vec(),
        );
        self.link.send_frame(&answer).await
    }
}
