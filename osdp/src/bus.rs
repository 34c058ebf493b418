//! Bus scheduler
//!
//! Round-robin over the configured addresses with exactly one command in
//! flight. The only suspend point of a turn is the reply wait.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use osdp_core::{CommandCode, FrameBuffer, FrameCodec, SecretKey};
use osdp_transport::Transport;
use osdp_types::{CommandFields, Event};

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::peripheral::{ExchangeOutcome, PeripheralSession};

/// Requests from the console layer
#[derive(Debug)]
pub enum Intent {
    Poll(u8),
    SendCommand {
        address: u8,
        code: CommandCode,
        fields: CommandFields,
    },
    ResetSession(u8),
    SetKey {
        address: u8,
        key: SecretKey,
    },
    TransferFile {
        address: u8,
        file_type: u8,
        data: Bytes,
    },
}

impl Intent {
    pub fn address(&self) -> u8 {
        match self {
            Self::Poll(address) | Self::ResetSession(address) => *address,
            Self::SendCommand { address, .. }
            | Self::SetKey { address, .. }
            | Self::TransferFile { address, .. } => *address,
        }
    }
}

/// Handle for issuing intents to a running bus
///
/// Cheap to clone; every clone feeds the same bus.
#[derive(Debug, Clone)]
pub struct ControlPanel {
    addresses: Vec<u8>,
    intents: mpsc::UnboundedSender<Intent>,
}

impl ControlPanel {
    fn submit(&self, intent: Intent) -> Result<()> {
        let address = intent.address();
        if !self.addresses.contains(&address) {
            return Err(Error::UnknownAddress(address));
        }
        self.intents.send(intent).map_err(|_| Error::Shutdown)
    }

    /// Configured addresses
    pub fn addresses(&self) -> &[u8] {
        &self.addresses
    }

    pub fn poll(&self, address: u8) -> Result<()> {
        self.submit(Intent::Poll(address))
    }

    pub fn send_command(&self, address: u8, code: CommandCode, fields: CommandFields) -> Result<()> {
        self.submit(Intent::SendCommand {
            address,
            code,
            fields,
        })
    }

    pub fn reset_session(&self, address: u8) -> Result<()> {
        self.submit(Intent::ResetSession(address))
    }

    /// Rotate the secure channel base key of a peripheral
    pub fn set_key(&self, address: u8, key: SecretKey) -> Result<()> {
        self.submit(Intent::SetKey { address, key })
    }

    pub fn transfer_file(&self, address: u8, file_type: u8, data: impl Into<Bytes>) -> Result<()> {
        self.submit(Intent::TransferFile {
            address,
            file_type,
            data: data.into(),
        })
    }
}

/// One OSDP bus: a transport and the peripherals behind it
pub struct Bus<T: Transport> {
    transport: T,
    codec: FrameCodec,
    buffer: FrameBuffer,
    sessions: BTreeMap<u8, PeripheralSession>,
    reply_timeout: Duration,
    idle_delay: Duration,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedSender<Event>,
}

impl<T: Transport> Bus<T> {
    /// Create a bus, its control handle and its event stream
    pub fn new(config: BusConfig, transport: T) -> (Self, ControlPanel, mpsc::UnboundedReceiver<Event>) {
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sessions: BTreeMap<u8, PeripheralSession> = config
            .peripherals()
            .iter()
            .map(|peripheral| (peripheral.address, PeripheralSession::new(peripheral, &config)))
            .collect();
        let addresses: Vec<u8> = sessions.keys().copied().collect();

        let bus = Self {
            transport,
            codec: FrameCodec::new(addresses.iter().copied()),
            buffer: FrameBuffer::new(),
            sessions,
            reply_timeout: config.reply_timeout(),
            idle_delay: config.idle_delay(),
            intents: intent_rx,
            events: event_tx,
        };
        let panel = ControlPanel {
            addresses,
            intents: intent_tx,
        };

        (bus, panel, event_rx)
    }

    pub fn session(&self, address: u8) -> Option<&PeripheralSession> {
        self.sessions.get(&address)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Connects the transport if needed. An exchange in progress when the
    /// token fires is abandoned and its command is resent on the
    /// peripheral's next turn.
    ///
    /// # Errors
    ///
    /// Returns transport errors other than read timeouts; peripheral
    /// failures never stop the bus.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }

        info!(
            remote = %self.transport.remote_addr(),
            peripherals = self.sessions.len(),
            "Bus started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_cycle() => result?,
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.idle_delay) => {}
            }
        }

        for session in self.sessions.values_mut() {
            session.abandon();
        }

        info!("Bus stopped");
        Ok(())
    }

    /// Give every address one turn
    pub async fn run_cycle(&mut self) -> Result<()> {
        let addresses: Vec<u8> = self.sessions.keys().copied().collect();

        for address in addresses {
            self.drain_intents();
            self.turn(address).await?;
        }

        Ok(())
    }

    fn drain_intents(&mut self) {
        while let Ok(intent) = self.intents.try_recv() {
            self.apply(intent);
        }
    }

    fn apply(&mut self, intent: Intent) {
        let address = intent.address();
        let Some(session) = self.sessions.get_mut(&address) else {
            warn!(address, "Intent for unconfigured address dropped");
            return;
        };

        trace!(address, ?intent, "Applying intent");

        let result = match intent {
            Intent::Poll(_) => session.request_poll(),
            Intent::SendCommand { code, fields, .. } => session.enqueue(code, fields),
            Intent::ResetSession(_) => {
                session.reset();
                Ok(())
            }
            Intent::SetKey { key, .. } => session.set_key(key),
            Intent::TransferFile {
                file_type, data, ..
            } => session.start_file_transfer(file_type, data),
        };

        if let Err(e) = result {
            warn!(address, error = %e, "Intent rejected");
        }

        self.publish(address);
    }

    async fn turn(&mut self, address: u8) -> Result<()> {
        let now = Instant::now();
        let Some(session) = self.sessions.get_mut(&address) else {
            return Ok(());
        };
        if !session.is_due(now) {
            trace!(address, "Skipping faulted peripheral");
            return Ok(());
        }

        let command = session.prepare(now);
        self.publish(address);

        let Some(command) = command else {
            return Ok(());
        };

        let outcome = match self.exchange(&command).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(session) = self.sessions.get_mut(&address) {
                    session.abandon();
                }
                return Err(e);
            }
        };
        debug!(address, ?outcome, "Exchange finished");

        if let Some(session) = self.sessions.get_mut(&address) {
            session.complete(outcome, Instant::now());
        }
        self.publish(address);

        Ok(())
    }

    async fn exchange(&mut self, command: &[u8]) -> Result<ExchangeOutcome> {
        self.buffer.clear();
        self.transport.send(command).await?;
        self.await_reply().await
    }

    async fn await_reply(&mut self) -> Result<ExchangeOutcome> {
        let deadline = Instant::now() + self.reply_timeout;

        loop {
            while let Some(result) = self.buffer.next_frame(&self.codec) {
                match result {
                    Ok(frame) if frame.reply => return Ok(ExchangeOutcome::Reply(frame)),
                    // Our own command echoed by a half-duplex line
                    Ok(frame) => trace!("Ignoring echoed {}", frame),
                    Err(e) => return Ok(ExchangeOutcome::Corrupt(e)),
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ExchangeOutcome::Timeout);
            }

            match self.transport.receive(remaining).await {
                Ok(chunk) => self.buffer.extend(&chunk),
                Err(e) if e.is_timeout() => return Ok(ExchangeOutcome::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn publish(&mut self, address: u8) {
        let Some(session) = self.sessions.get_mut(&address) else {
            return;
        };

        for kind in session.drain_events() {
            let event = Event::new(address, kind);
            debug!("{}", event);
            // Nobody listening is not an error for the bus
            let _ = self.events.send(event);
        }
    }
}
