//! Per-address session state machine
//!
//! A [`PeripheralSession`] decides what to send on its address's turn
//! ([`prepare`](PeripheralSession::prepare)) and digests what came back
//! ([`complete`](PeripheralSession::complete)). It never touches the
//! transport; the bus owns the line and the clock.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use osdp_core::{
    CommandCode, Frame, Integrity, ReplyCode, SecretKey, SecureChannel, SecureChannelState,
    SecurityBlock, registry,
};
use osdp_types::{CommandFields, EventKind, FileFragment, FileTransferStatus, KeySet, Reply};

use crate::config::{BusConfig, PeripheralConfig, Security};
use crate::error::{Error, Result};

/// Status reported when the controller gives up on a file transfer
pub const TRANSFER_ABORTED: i16 = -1;

/// Bytes of a FILETRANSFER message that are not fragment data
const FRAGMENT_OVERHEAD: usize = 32;

/// Consecutive BUSY replies tolerated for one command
const BUSY_LIMIT: u32 = 16;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in flight
    Idle,

    /// Command sent, reply outstanding (or a resend is due)
    AwaitingReply,

    /// Secure channel handshake in progress
    SecureHandshake,

    /// Retry budget exhausted; waiting for backoff to elapse
    Faulted,
}

/// Result of one exchange, as seen by the bus
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// A complete frame arrived
    Reply(Frame),

    /// Nothing arrived within the reply timeout
    Timeout,

    /// Something arrived but could not be decoded
    Corrupt(osdp_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// POLL issued because nothing else was due
    Automatic,
    Console,
    Handshake,
    FileTransfer,
    KeySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resend {
    /// Same bytes, same sequence number
    Same,
    /// Next sequence number, rebuilt (and re-secured) frame
    Rebuild,
}

#[derive(Debug, Clone)]
struct Pending {
    code: CommandCode,
    fields: CommandFields,
    security: Option<SecurityBlock>,
    origin: Origin,
    sequence: u8,
    bytes: Bytes,
}

#[derive(Debug)]
struct QueuedCommand {
    code: CommandCode,
    fields: CommandFields,
    origin: Origin,
}

#[derive(Debug)]
struct FileTransfer {
    file_type: u8,
    data: Bytes,
    offset: usize,
    in_flight: usize,
    fragment_size: usize,
    not_before: Option<Instant>,
    finishing: bool,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    reply_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    handshake_cooldown: Duration,
    fragment_size: usize,
}

fn next_sequence(last: Option<u8>) -> u8 {
    match last {
        None => 0,
        Some(3) => 1,
        Some(n) => n + 1,
    }
}

/// Session of one configured peripheral
pub struct PeripheralSession {
    address: u8,
    integrity: Integrity,
    retry_limit: u32,
    allow_plaintext_fallback: bool,
    timing: Timing,
    channel: Option<SecureChannel>,
    state: SessionState,
    sequence: Option<u8>,
    pending: Option<Pending>,
    resend: Option<Resend>,
    retries: u32,
    busy: u32,
    fault_count: u32,
    retry_at: Option<Instant>,
    handshake_at: Option<Instant>,
    handshake_next: Option<(CommandFields, SecurityBlock)>,
    queue: VecDeque<QueuedCommand>,
    transfer: Option<FileTransfer>,
    new_key: Option<SecretKey>,
    last_command: Option<CommandCode>,
    last_seen: Option<Instant>,
    events: Vec<EventKind>,
}

impl PeripheralSession {
    pub fn new(peripheral: &PeripheralConfig, config: &BusConfig) -> Self {
        let channel = match &peripheral.security {
            Security::Plain => None,
            Security::Secure { key, .. } => Some(SecureChannel::new(peripheral.address, key.clone(), false)),
            Security::Install { .. } => Some(SecureChannel::new(
                peripheral.address,
                SecretKey::install_mode(),
                true,
            )),
        };

        Self {
            address: peripheral.address,
            integrity: config.integrity(),
            retry_limit: config.retries(),
            allow_plaintext_fallback: peripheral.security.allows_plaintext_fallback(),
            timing: Timing {
                reply_timeout: config.reply_timeout(),
                backoff_base: config.backoff_base(),
                backoff_cap: config.backoff_cap(),
                handshake_cooldown: config.handshake_cooldown(),
                fragment_size: config.fragment_size(),
            },
            channel,
            state: SessionState::Idle,
            sequence: None,
            pending: None,
            resend: None,
            retries: 0,
            busy: 0,
            fault_count: 0,
            retry_at: None,
            handshake_at: None,
            handshake_next: None,
            queue: VecDeque::new(),
            transfer: None,
            new_key: None,
            last_command: None,
            last_seen: None,
            events: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Secure channel state, `None` for plaintext peripherals
    pub fn secure_state(&self) -> Option<SecureChannelState> {
        self.channel.as_ref().map(SecureChannel::state)
    }

    /// Last sequence number sent
    pub fn sequence(&self) -> Option<u8> {
        self.sequence
    }

    pub fn last_command(&self) -> Option<CommandCode> {
        self.last_command
    }

    /// When the last valid reply arrived
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn is_transferring(&self) -> bool {
        self.transfer.is_some()
    }

    /// Whether this address should get a turn at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        self.state != SessionState::Faulted || self.retry_at.is_none_or(|at| now >= at)
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<EventKind> {
        std::mem::take(&mut self.events)
    }

    fn is_established(&self) -> bool {
        self.channel.as_ref().is_some_and(SecureChannel::is_established)
    }

    /// Queue a console command
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if the fields do not fit the command.
    /// Handshake and KEYSET commands are managed by the session and
    /// cannot be queued directly.
    pub fn enqueue(&mut self, code: CommandCode, fields: CommandFields) -> Result<()> {
        if code.is_handshake() || code == CommandCode::KeySet {
            return Err(osdp_core::Error::SchemaMismatch {
                code: code.into(),
                reason: format!("{} is issued by the session itself", code.name()),
            }
            .into());
        }

        registry::encode_command(code, &fields)?;

        debug!(address = self.address, command = %code, "Queued command");
        self.queue.push_back(QueuedCommand {
            code,
            fields,
            origin: Origin::Console,
        });
        Ok(())
    }

    /// Queue an explicit POLL
    pub fn request_poll(&mut self) -> Result<()> {
        self.enqueue(CommandCode::Poll, CommandFields::Empty)
    }

    /// Queue a KEYSET with a new base key
    ///
    /// The key is adopted once the peripheral acknowledges it and is used
    /// from the next handshake on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSecureState` unless a secure session is established.
    pub fn set_key(&mut self, key: SecretKey) -> Result<()> {
        if !self.is_established() {
            return Err(osdp_core::Error::InvalidSecureState(
                "key rotation requires an established secure channel".into(),
            )
            .into());
        }

        self.queue.push_back(QueuedCommand {
            code: CommandCode::KeySet,
            fields: CommandFields::KeySet(KeySet::scbk(*key.as_bytes())),
            origin: Origin::KeySet,
        });
        self.new_key = Some(key);
        Ok(())
    }

    /// Start sending a file, one fragment per turn
    ///
    /// # Errors
    ///
    /// Returns `TransferInProgress` if a transfer is already active.
    pub fn start_file_transfer(&mut self, file_type: u8, data: Bytes) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::TransferInProgress(self.address));
        }
        if data.is_empty() || u32::try_from(data.len()).is_err() {
            return Err(osdp_types::Error::Validation(format!(
                "file size {} not transferable",
                data.len()
            ))
            .into());
        }

        info!(address = self.address, file_type, size = data.len(), "Starting file transfer");

        self.transfer = Some(FileTransfer {
            file_type,
            data,
            offset: 0,
            in_flight: 0,
            fragment_size: self.timing.fragment_size,
            not_before: None,
            finishing: false,
        });
        Ok(())
    }

    /// Restart the session: sequence back to 0, secure channel back to
    /// Uninitiated
    pub fn reset(&mut self) {
        info!(address = self.address, "Session reset");

        self.clear_exchange();
        self.sequence = None;
        self.fault_count = 0;
        self.retry_at = None;
        self.handshake_at = None;
        if let Some(channel) = self.channel.as_mut() {
            channel.reset();
        }
        self.abort_transfer();
        self.state = SessionState::Idle;
        self.events.push(EventKind::Reset);
    }

    fn clear_exchange(&mut self) {
        self.pending = None;
        self.resend = None;
        self.retries = 0;
        self.busy = 0;
        self.handshake_next = None;
    }

    /// Give up on the exchange in flight without an outcome
    ///
    /// The command goes out again, unchanged, on the next turn. Nothing is
    /// charged to the retry budget.
    pub fn abandon(&mut self) {
        if let Some(pending) = self.pending.as_ref() {
            if self.resend.is_none() {
                debug!(address = self.address, sequence = pending.sequence, "Exchange abandoned");
                self.resend = Some(Resend::Same);
            }
        }
    }

    fn abort_transfer(&mut self) {
        if self.transfer.take().is_some() {
            self.events.push(EventKind::FileTransferAborted(TRANSFER_ABORTED));
        }
    }

    /// Encoded bytes of the next command to send, if any
    ///
    /// Sources, in order: pending resend, handshake step, file transfer
    /// fragment, queued command, POLL.
    pub fn prepare(&mut self, now: Instant) -> Option<Bytes> {
        if self.state == SessionState::Faulted {
            if !self.is_due(now) {
                return None;
            }
            self.recover();
        }

        if let Some(resend) = self.resend.take() {
            return self.resend(resend);
        }
        if self.pending.is_some() {
            return None;
        }

        if let Some(bytes) = self.handshake_step(now) {
            return Some(bytes);
        }
        if self.state == SessionState::SecureHandshake {
            return None;
        }

        // Without fallback nothing goes out in plaintext once security is configured
        if self.channel.is_some() && !self.is_established() && !self.allow_plaintext_fallback {
            return None;
        }

        self.transfer_step(now)
            .or_else(|| self.queued_step())
            .or_else(|| {
                self.dispatch(
                    CommandCode::Poll,
                    CommandFields::Empty,
                    None,
                    Origin::Automatic,
                )
            })
    }

    fn recover(&mut self) {
        info!(address = self.address, faults = self.fault_count, "Recovering faulted peripheral");

        self.clear_exchange();
        self.sequence = None;
        self.retry_at = None;
        self.handshake_at = None;
        if let Some(channel) = self.channel.as_mut() {
            channel.reset();
        }
        self.state = SessionState::Idle;
        self.events.push(EventKind::Reset);
    }

    fn resend(&mut self, resend: Resend) -> Option<Bytes> {
        match resend {
            Resend::Same => {
                let pending = self.pending.as_ref()?;
                trace!(address = self.address, sequence = pending.sequence, "Resending");
                Some(pending.bytes.clone())
            }
            Resend::Rebuild => {
                let pending = self.pending.take()?;
                self.dispatch(pending.code, pending.fields, pending.security, pending.origin)
            }
        }
    }

    fn handshake_step(&mut self, now: Instant) -> Option<Bytes> {
        if let Some((fields, block)) = self.handshake_next.take() {
            return self.dispatch(
                CommandCode::ServerCryptogram,
                fields,
                Some(block),
                Origin::Handshake,
            );
        }

        let handshake_at = self.handshake_at;
        let channel = self.channel.as_mut()?;
        match channel.state() {
            SecureChannelState::Uninitiated => {}
            SecureChannelState::Broken if handshake_at.is_none_or(|at| now >= at) => channel.reset(),
            _ => return None,
        }

        let mut rnd_a = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut rnd_a);

        let block = match channel.start_handshake(rnd_a) {
            Ok(block) => block,
            Err(e) => {
                warn!(address = self.address, error = %e, "Cannot start handshake");
                return None;
            }
        };

        self.handshake_at = None;
        self.events.push(EventKind::HandshakeStarted);

        let bytes = self.dispatch(
            CommandCode::Challenge,
            CommandFields::Challenge(rnd_a),
            Some(block),
            Origin::Handshake,
        );
        if bytes.is_none() {
            if let Some(channel) = self.channel.as_mut() {
                channel.reset();
            }
        }
        bytes
    }

    fn transfer_step(&mut self, now: Instant) -> Option<Bytes> {
        let transfer = self.transfer.as_mut()?;
        if transfer.not_before.is_some_and(|at| now < at) {
            return None;
        }

        let fragment = if transfer.finishing {
            Bytes::new()
        } else {
            let end = (transfer.offset + transfer.fragment_size).min(transfer.data.len());
            transfer.data.slice(transfer.offset..end)
        };
        transfer.in_flight = fragment.len();

        let fields = CommandFields::FileTransfer(FileFragment {
            file_type: transfer.file_type,
            total_size: transfer.data.len() as u32,
            offset: transfer.offset as u32,
            data: fragment,
        });

        self.dispatch(CommandCode::FileTransfer, fields, None, Origin::FileTransfer)
    }

    fn queued_step(&mut self) -> Option<Bytes> {
        while let Some(command) = self.queue.pop_front() {
            if command.origin == Origin::KeySet && !self.is_established() {
                warn!(address = self.address, "Dropping KEYSET, secure channel not established");
                self.new_key = None;
                continue;
            }
            if let Some(bytes) = self.dispatch(command.code, command.fields, None, command.origin) {
                return Some(bytes);
            }
        }
        None
    }

    fn build(
        &mut self,
        code: CommandCode,
        fields: &CommandFields,
        security: Option<&SecurityBlock>,
        sequence: u8,
    ) -> osdp_core::Result<Bytes> {
        let data = registry::encode_command(code, fields)?;
        let mut frame = Frame::new(self.address, sequence, self.integrity, code.into(), data);

        if let Some(block) = security {
            frame = frame.with_security(block.clone());
        } else if let Some(channel) = self.channel.as_mut().filter(|c| c.is_established()) {
            frame = channel.wrap(frame)?;
        }

        Ok(frame.encode()?.freeze())
    }

    fn dispatch(
        &mut self,
        code: CommandCode,
        fields: CommandFields,
        security: Option<SecurityBlock>,
        origin: Origin,
    ) -> Option<Bytes> {
        let sequence = next_sequence(self.sequence);

        match self.build(code, &fields, security.as_ref(), sequence) {
            Ok(bytes) => {
                debug!(address = self.address, command = %code, sequence, "Dispatching command");

                self.sequence = Some(sequence);
                self.last_command = Some(code);
                self.state = if origin == Origin::Handshake {
                    SessionState::SecureHandshake
                } else {
                    SessionState::AwaitingReply
                };
                self.pending = Some(Pending {
                    code,
                    fields,
                    security,
                    origin,
                    sequence,
                    bytes: bytes.clone(),
                });
                Some(bytes)
            }
            Err(e) => {
                warn!(address = self.address, command = %code, error = %e, "Dropping command");
                if origin == Origin::KeySet {
                    self.new_key = None;
                }
                None
            }
        }
    }

    /// Digest the outcome of the exchange started by the last `prepare`
    pub fn complete(&mut self, outcome: ExchangeOutcome, now: Instant) {
        let Some(pending) = self.pending.clone() else {
            debug!(address = self.address, "No exchange in flight, outcome dropped");
            return;
        };

        match outcome {
            ExchangeOutcome::Timeout => {
                self.events.push(EventKind::Timeout);
                let error = osdp_core::Error::Timeout {
                    millis: self.timing.reply_timeout.as_millis() as u64,
                };
                if pending.origin == Origin::Handshake {
                    self.handshake_failed(&format!("{} to {}", error, pending.code.name()), now);
                } else {
                    self.retry(Resend::Same, &error.to_string(), now);
                }
            }
            ExchangeOutcome::Corrupt(e) => self.corrupt(&pending, e, now),
            ExchangeOutcome::Reply(frame) => self.handle_reply(pending, frame, now),
        }
    }

    fn corrupt(&mut self, pending: &Pending, error: osdp_core::Error, now: Instant) {
        debug!(
            address = self.address,
            error = %error,
            recoverable = error.is_recoverable(),
            "Invalid reply"
        );

        if pending.origin == Origin::Handshake {
            self.handshake_failed(&error.to_string(), now);
        } else {
            self.retry(Resend::Rebuild, &error.to_string(), now);
        }
    }

    fn retry(&mut self, resend: Resend, reason: &str, now: Instant) {
        self.retries += 1;

        if self.retries > self.retry_limit {
            self.fault(format!("{} after {} retries", reason, self.retry_limit), now);
        } else {
            debug!(
                address = self.address,
                retry = self.retries,
                limit = self.retry_limit,
                "Retrying: {}",
                reason
            );
            self.resend = Some(resend);
            self.state = SessionState::AwaitingReply;
        }
    }

    fn fault(&mut self, reason: String, now: Instant) {
        self.fault_count = self.fault_count.saturating_add(1);

        let exponent = (self.fault_count - 1).min(16);
        let backoff = self
            .timing
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.timing.backoff_cap);

        warn!(
            address = self.address,
            backoff_ms = backoff.as_millis() as u64,
            "Peripheral faulted: {}",
            reason
        );

        self.clear_exchange();
        self.retry_at = Some(now + backoff);
        self.state = SessionState::Faulted;
        self.abort_transfer();
        self.events.push(EventKind::Faulted(reason));
    }

    fn handshake_failed(&mut self, reason: &str, now: Instant) {
        if let Some(channel) = self.channel.as_mut() {
            if channel.state() != SecureChannelState::Broken {
                channel.fail_handshake(reason);
            }
        }
        self.events.push(EventKind::HandshakeFailed(reason.to_string()));
        self.clear_exchange();

        if self.allow_plaintext_fallback {
            info!(address = self.address, "Continuing without secure channel");
            self.handshake_at = Some(now + self.timing.handshake_cooldown);
            self.state = SessionState::Idle;
        } else {
            self.fault("secure channel handshake failed".into(), now);
        }
    }

    fn session_broken(&mut self, error: &osdp_core::Error, now: Instant) {
        if let Some(channel) = self.channel.as_mut() {
            channel.break_session(&error.to_string());
        }
        if matches!(error, osdp_core::Error::ReplayDetected { .. }) {
            self.events.push(EventKind::ReplayDetected);
        }
        self.events.push(EventKind::SessionBroken(error.to_string()));

        self.clear_exchange();
        self.handshake_at = Some(now + self.timing.handshake_cooldown);
        self.state = SessionState::Idle;
    }

    fn handle_reply(&mut self, pending: Pending, frame: Frame, now: Instant) {
        if !frame.reply || frame.address != self.address {
            let error = osdp_core::Error::AddressMismatch {
                expected: self.address,
                actual: frame.address,
            };
            return self.corrupt(&pending, error, now);
        }

        let frame = match self.channel.as_mut() {
            Some(channel) if channel.is_established() => {
                match channel.unwrap(frame, pending.sequence) {
                    Ok(frame) => frame,
                    Err(e) => return self.session_broken(&e, now),
                }
            }
            _ => frame,
        };

        if frame.sequence != pending.sequence {
            let error = osdp_core::Error::MalformedFrame(format!(
                "reply sequence {} does not echo {}",
                frame.sequence, pending.sequence
            ));
            return self.corrupt(&pending, error, now);
        }

        let code = match registry::check_reply(pending.code, frame.code) {
            Ok(code) => code,
            Err(osdp_core::Error::UnexpectedReply { command, reply }) => {
                warn!(address = self.address, command, reply, "Unexpected reply");
                self.events.push(EventKind::UnexpectedReply { command, reply });
                if pending.origin == Origin::Handshake {
                    return self.handshake_failed("unexpected reply during handshake", now);
                }
                self.clear_exchange();
                self.state = SessionState::Idle;
                return;
            }
            Err(e) => return self.corrupt(&pending, e, now),
        };

        if code == ReplyCode::Busy {
            self.busy += 1;
            if self.busy > BUSY_LIMIT {
                return self.fault(format!("peripheral busy more than {} times in a row", BUSY_LIMIT), now);
            }
            debug!(address = self.address, busy = self.busy, "Peripheral busy");
            self.resend = Some(Resend::Same);
            return;
        }

        let reply = match registry::decode_reply(frame.code, &frame.data) {
            Ok(reply) => reply,
            Err(e) => return self.corrupt(&pending, e, now),
        };

        trace!(address = self.address, "Reply {}", reply);

        self.last_seen = Some(now);
        self.fault_count = 0;
        self.clear_exchange();
        self.state = SessionState::Idle;

        match (pending.origin, reply) {
            (Origin::Handshake, reply) => self.handshake_reply(&frame, reply, now),

            (_, Reply::Nak(reason)) if reason.is_security_related() && self.is_established() => {
                self.session_broken(
                    &osdp_core::Error::InvalidSecureState(format!("peripheral NAK: {}", reason)),
                    now,
                );
            }

            (Origin::FileTransfer, Reply::FileTransferStatus(status)) => {
                self.transfer_status(status, now);
            }

            (Origin::FileTransfer, reply) => {
                self.abort_transfer();
                self.events.push(EventKind::ReplyReceived(reply));
            }

            (Origin::KeySet, Reply::Ack) => {
                if let (Some(channel), Some(key)) = (self.channel.as_mut(), self.new_key.take()) {
                    channel.set_master_key(key);
                    info!(address = self.address, "Secure channel base key rotated");
                    self.events.push(EventKind::KeyRotated);
                }
            }

            (Origin::KeySet, reply) => {
                self.new_key = None;
                self.events.push(EventKind::ReplyReceived(reply));
            }

            (Origin::Automatic, Reply::Ack) => {}

            (_, reply) => self.events.push(EventKind::ReplyReceived(reply)),
        }
    }

    fn handshake_reply(&mut self, frame: &Frame, reply: Reply, now: Instant) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let error = match reply {
            Reply::ClientCryptogram(cryptogram) => {
                match channel.accept_client_cryptogram(frame.security.as_ref(), &cryptogram) {
                    Ok((server_cryptogram, block)) => {
                        self.handshake_next =
                            Some((CommandFields::ServerCryptogram(server_cryptogram), block));
                        self.state = SessionState::SecureHandshake;
                        return;
                    }
                    Err(e) => e,
                }
            }
            Reply::InitialRmac(rmac) => {
                match channel.accept_initial_rmac(frame.security.as_ref(), &rmac) {
                    Ok(()) => {
                        self.events.push(EventKind::SessionEstablished);
                        return;
                    }
                    Err(e) => e,
                }
            }
            Reply::Nak(reason) => {
                osdp_core::Error::HandshakeFailed(format!("peripheral NAK: {}", reason))
            }
            other => osdp_core::Error::HandshakeFailed(format!(
                "unexpected {} during handshake",
                other.name()
            )),
        };

        self.handshake_failed(&error.to_string(), now);
    }

    fn transfer_status(&mut self, status: FileTransferStatus, now: Instant) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        if status.is_error() {
            warn!(address = self.address, status = status.status, "File transfer aborted");
            self.transfer = None;
            self.events.push(EventKind::FileTransferAborted(status.status));
            return;
        }

        transfer.offset += transfer.in_flight;
        transfer.in_flight = 0;

        if status.is_done() {
            info!(address = self.address, size = transfer.data.len(), "File transfer complete");
            self.transfer = None;
            self.events.push(EventKind::FileTransferComplete);
            return;
        }

        if status.is_finishing() || transfer.offset >= transfer.data.len() {
            transfer.finishing = true;
        }
        if status.update_msg_max > 0 {
            transfer.fragment_size = (status.update_msg_max as usize)
                .saturating_sub(FRAGMENT_OVERHEAD)
                .max(1);
        }
        transfer.not_before =
            (status.delay_ms > 0).then(|| now + Duration::from_millis(status.delay_ms as u64));
    }
}

impl std::fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("address", &format!("0x{:02X}", self.address))
            .field("state", &self.state)
            .field("secure", &self.secure_state())
            .field("sequence", &self.sequence)
            .field("retries", &self.retries)
            .field("queued", &self.queue.len())
            .finish()
    }
}
