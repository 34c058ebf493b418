//! Bus scheduler against simulated peripherals on an in-memory line

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use osdp::{Bus, BusConfig, Error, Event, EventKind, PeripheralConfig, Reply, Security, SessionState};
use osdp_core::constants::{MAC_SIZE, scb};
use osdp_core::crypto::{self, Block};
use osdp_core::keys::SessionKeys;
use osdp_core::{CommandCode, Frame, Integrity, SecretKey, SecureChannelState};
use osdp_transport::Transport;
use osdp_types::{CommandFields, PdId};

const RND_B: [u8; 8] = [0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE];
const PD_ID: [u8; 12] = [0x5C, 0x26, 0x23, 7, 1, 0x78, 0x56, 0x34, 0x12, 2, 1, 0];

/// Peripheral behind the simulated line
struct SimulatedPeripheral {
    key: Option<SecretKey>,
    silent: bool,
    commands: Vec<u8>,
    keys: Option<SessionKeys>,
    rnd_a: [u8; 8],
    last_reply_mac: Block,
    last_command_mac: Block,
    /// Command count at which the first secured reply is sent again
    replay_on: Option<usize>,
    first_secured: Option<Frame>,
}

impl SimulatedPeripheral {
    fn plain() -> Self {
        Self {
            key: None,
            silent: false,
            commands: Vec::new(),
            keys: None,
            rnd_a: [0; 8],
            last_reply_mac: [0; 16],
            last_command_mac: [0; 16],
            replay_on: None,
            first_secured: None,
        }
    }

    fn secure(key: SecretKey) -> Self {
        Self {
            key: Some(key),
            ..Self::plain()
        }
    }

    fn silent() -> Self {
        Self {
            silent: true,
            ..Self::plain()
        }
    }

    fn replaying_on(mut self, command: usize) -> Self {
        self.replay_on = Some(command);
        self
    }

    fn polls(&self) -> usize {
        self.commands.iter().filter(|&&code| code == 0x60).count()
    }

    fn handle(&mut self, command: Frame) -> Option<Frame> {
        self.commands.push(command.code);
        if self.silent {
            return None;
        }
        if self.replay_on == Some(self.commands.len()) {
            return self.first_secured.clone();
        }

        match command.code {
            0x76 => Some(self.client_cryptogram(&command)),
            0x77 => Some(self.initial_rmac(&command)),
            0x61 => {
                assert_eq!(self.open(&command).as_ref(), &[0x00]);
                Some(self.seal(&command, 0x45, &PD_ID))
            }
            0x75 => {
                let data = self.open(&command);
                assert_eq!(&data[..2], &[0x01, 16]);
                let reply = self.seal(&command, 0x40, &[]);
                self.key = Some(SecretKey::from_slice(&data[2..]).unwrap());
                Some(reply)
            }
            _ => {
                self.open(&command);
                Some(self.seal(&command, 0x40, &[]))
            }
        }
    }

    fn client_cryptogram(&mut self, command: &Frame) -> Frame {
        let key = self.key.clone().unwrap_or_else(|| SecretKey::new([0; 16]));
        self.rnd_a.copy_from_slice(&command.data[..8]);

        let keys = crypto::derive_session_keys(&key, &self.rnd_a);
        let cryptogram = crypto::client_cryptogram(&keys, &self.rnd_a, &RND_B);
        self.keys = Some(keys);

        let mut data = vec![0xA5; 8];
        data.extend_from_slice(&RND_B);
        data.extend_from_slice(&cryptogram);

        Frame::reply(command.address, command.sequence, command.integrity, 0x76, data)
            .with_security(osdp_core::SecurityBlock::new(scb::SCS_12, vec![scb::KEY_SCBK]))
    }

    fn initial_rmac(&mut self, command: &Frame) -> Frame {
        let keys = self.keys.as_ref().unwrap();
        let expected = crypto::server_cryptogram(keys, &self.rnd_a, &RND_B);
        assert_eq!(command.data.as_ref(), &expected[..]);

        self.last_reply_mac = crypto::initial_rmac(keys, &expected);

        Frame::reply(
            command.address,
            command.sequence,
            command.integrity,
            0x78,
            self.last_reply_mac.to_vec(),
        )
        .with_security(osdp_core::SecurityBlock::new(
            scb::SCS_14,
            vec![scb::CRYPTOGRAM_ACCEPTED],
        ))
    }

    /// Verify the MAC of a secured command and return its plaintext data
    fn open(&mut self, command: &Frame) -> Bytes {
        if !command.is_secured() {
            return command.data.clone();
        }

        let keys = self.keys.as_ref().unwrap();
        let mac = crypto::compute_mac(
            keys,
            &self.last_reply_mac,
            &command.authenticated_bytes().unwrap(),
        );
        assert_eq!(&mac[..MAC_SIZE], &command.mac.unwrap());
        self.last_command_mac = mac;

        if command.security_kind() == Some(scb::SCS_17) {
            let iv = crypto::invert(&self.last_reply_mac);
            Bytes::from(crypto::decrypt_data(keys, &iv, &command.data).unwrap())
        } else {
            command.data.clone()
        }
    }

    fn seal(&mut self, command: &Frame, code: u8, data: &[u8]) -> Frame {
        if !command.is_secured() {
            return Frame::reply(
                command.address,
                command.sequence,
                command.integrity,
                code,
                Bytes::copy_from_slice(data),
            );
        }

        let keys = self.keys.as_ref().unwrap();
        let (kind, data) = if data.is_empty() {
            (scb::SCS_16, Vec::new())
        } else {
            let iv = crypto::invert(&self.last_command_mac);
            (scb::SCS_18, crypto::encrypt_data(keys, &iv, data))
        };

        let mut reply = Frame::reply(command.address, command.sequence, command.integrity, code, data)
            .with_security(osdp_core::SecurityBlock::new(kind, Bytes::new()));
        let mac = crypto::compute_mac(keys, &self.last_command_mac, &reply.authenticated_bytes().unwrap());
        reply.mac = Some(mac[..MAC_SIZE].try_into().unwrap());
        self.last_reply_mac = mac;
        if self.first_secured.is_none() {
            self.first_secured = Some(reply.clone());
        }
        reply
    }
}

/// In-memory multidrop line
struct SimulatedLine {
    connected: bool,
    peripherals: BTreeMap<u8, SimulatedPeripheral>,
    inbound: VecDeque<BytesMut>,
}

impl SimulatedLine {
    fn new(peripherals: impl IntoIterator<Item = (u8, SimulatedPeripheral)>) -> Self {
        Self {
            connected: false,
            peripherals: peripherals.into_iter().collect(),
            inbound: VecDeque::new(),
        }
    }

    fn peripheral(&self, address: u8) -> &SimulatedPeripheral {
        &self.peripherals[&address]
    }
}

#[async_trait]
impl Transport for SimulatedLine {
    async fn connect(&mut self) -> osdp_transport::Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> osdp_transport::Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> osdp_transport::Result<()> {
        let command = Frame::decode(data).unwrap();
        if let Some(peripheral) = self.peripherals.get_mut(&command.address) {
            if let Some(reply) = peripheral.handle(command) {
                self.inbound.push_back(reply.encode().unwrap());
            }
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> osdp_transport::Result<BytesMut> {
        match self.inbound.pop_front() {
            Some(bytes) => Ok(bytes),
            None => {
                tokio::time::sleep(timeout).await;
                Err(osdp_transport::Error::ReadTimeout)
            }
        }
    }

    fn remote_addr(&self) -> String {
        "simulated".to_string()
    }
}

fn config(peripherals: Vec<PeripheralConfig>) -> BusConfig {
    BusConfig::builder()
        .peripherals(peripherals)
        .integrity(Integrity::Crc16)
        .retries(1)
        .reply_timeout(Duration::from_millis(100))
        .idle_delay(Duration::from_millis(10))
        .handshake_cooldown(Duration::from_secs(1))
        .build()
        .unwrap()
}

fn drain(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<(u8, EventKind)> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push((event.address, event.kind));
    }
    drained
}

fn kinds(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<EventKind> {
    drain(events).into_iter().map(|(_, kind)| kind).collect()
}

fn key() -> SecretKey {
    SecretKey::new([0x42; 16])
}

fn secured(address: u8) -> PeripheralConfig {
    PeripheralConfig::new(address, Security::Secure {
        key: key(),
        allow_plaintext_fallback: false,
    })
}

#[tokio::test(start_paused = true)]
async fn test_id_request_reports_pd_id() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::plain())]);
    let (mut bus, panel, mut events) = Bus::new(config(vec![PeripheralConfig::plain(0x01)]), line);

    bus.run_cycle().await.unwrap();
    assert!(drain(&mut events).is_empty());

    panel
        .send_command(0x01, CommandCode::Id, CommandFields::Empty)
        .unwrap();
    bus.run_cycle().await.unwrap();

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        (0x01, EventKind::ReplyReceived(Reply::PdId(PdId { serial_number: 0x12345678, model: 7, .. })))
    ));
    assert_eq!(bus.transport().peripheral(0x01).commands, vec![0x60, 0x61]);
    assert_eq!(bus.session(0x01).unwrap().state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_secure_session_carries_encrypted_exchange() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::secure(key()))]);
    let peripheral = PeripheralConfig::new(0x01, Security::Secure {
        key: key(),
        allow_plaintext_fallback: false,
    });
    let (mut bus, panel, mut events) = Bus::new(config(vec![peripheral]), line);

    // CHLNG/CCRYPT, then SCRYPT/RMAC_I
    bus.run_cycle().await.unwrap();
    bus.run_cycle().await.unwrap();

    let kinds: Vec<EventKind> = drain(&mut events).into_iter().map(|(_, kind)| kind).collect();
    assert_eq!(kinds, vec![EventKind::HandshakeStarted, EventKind::SessionEstablished]);
    assert_eq!(
        bus.session(0x01).unwrap().secure_state(),
        Some(SecureChannelState::SessionEstablished)
    );

    bus.run_cycle().await.unwrap();
    panel
        .send_command(0x01, CommandCode::Id, CommandFields::Empty)
        .unwrap();
    bus.run_cycle().await.unwrap();

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        (0x01, EventKind::ReplyReceived(Reply::PdId(PdId { vendor_code: [0x5C, 0x26, 0x23], .. })))
    ));
    assert_eq!(bus.transport().peripheral(0x01).commands, vec![0x76, 0x77, 0x60, 0x61]);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_key_fails_handshake_and_faults() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::secure(SecretKey::new([0x43; 16])))]);
    let peripheral = PeripheralConfig::new(0x01, Security::Secure {
        key: key(),
        allow_plaintext_fallback: false,
    });
    let (mut bus, _panel, mut events) = Bus::new(config(vec![peripheral]), line);

    bus.run_cycle().await.unwrap();

    let kinds: Vec<EventKind> = drain(&mut events).into_iter().map(|(_, kind)| kind).collect();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[0], EventKind::HandshakeStarted);
    assert!(matches!(kinds[1], EventKind::HandshakeFailed(_)));
    assert!(matches!(kinds[2], EventKind::Faulted(_)));
    assert_eq!(bus.session(0x01).unwrap().state(), SessionState::Faulted);

    // Nothing goes out in plaintext while faulted
    bus.run_cycle().await.unwrap();
    assert_eq!(bus.transport().peripheral(0x01).commands, vec![0x76]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peripheral_does_not_starve_others() {
    let line = SimulatedLine::new([
        (0x01, SimulatedPeripheral::plain()),
        (0x02, SimulatedPeripheral::silent()),
    ]);
    let (mut bus, _panel, mut events) = Bus::new(
        config(vec![PeripheralConfig::plain(0x02), PeripheralConfig::plain(0x01)]),
        line,
    );

    for _ in 0..4 {
        bus.run_cycle().await.unwrap();
    }

    let events = drain(&mut events);
    assert!(events.iter().all(|(address, _)| *address == 0x02));
    let kinds: Vec<&EventKind> = events.iter().map(|(_, kind)| kind).collect();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[0], &EventKind::Timeout);
    assert_eq!(kinds[1], &EventKind::Timeout);
    assert!(matches!(kinds[2], EventKind::Faulted(_)));

    assert_eq!(bus.transport().peripheral(0x01).polls(), 4);
    // Timeout resends the same POLL once, then the backoff holds the address
    assert_eq!(bus.transport().peripheral(0x02).polls(), 2);
    assert_eq!(bus.session(0x02).unwrap().state(), SessionState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_control_panel_rejects_unknown_address() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::plain())]);
    let (_bus, panel, _events) = Bus::new(config(vec![PeripheralConfig::plain(0x01)]), line);

    assert_eq!(panel.addresses(), &[0x01]);
    assert!(matches!(panel.poll(0x05), Err(Error::UnknownAddress(0x05))));
    assert!(panel.poll(0x01).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_cancel() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::plain())]);
    let (mut bus, panel, mut events) = Bus::new(config(vec![PeripheralConfig::plain(0x01)]), line);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = bus.run(shutdown).await;
            (result, bus)
        }
    });

    panel
        .send_command(0x01, CommandCode::Id, CommandFields::Empty)
        .unwrap();
    let event = events.recv().await.unwrap();
    assert!(matches!(event.kind, EventKind::ReplyReceived(Reply::PdId(_))));

    shutdown.cancel();
    let (result, bus) = task.await.unwrap();
    assert!(result.is_ok());
    assert!(bus.transport().is_connected());
    assert!(bus.transport().peripheral(0x01).commands.contains(&0x61));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_exchange_resends_on_next_turn() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::silent())]);
    let (mut bus, _panel, mut events) = Bus::new(config(vec![PeripheralConfig::plain(0x01)]), line);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = bus.run(shutdown).await;
            (result, bus)
        }
    });

    // Cancel while the first POLL waits for its reply
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    let (result, mut bus) = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(bus.transport().peripheral(0x01).polls(), 1);
    assert!(drain(&mut events).is_empty());

    bus.run_cycle().await.unwrap();
    bus.run_cycle().await.unwrap();

    let kinds = kinds(&mut events);
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[0], EventKind::Timeout);
    assert_eq!(kinds[1], EventKind::Timeout);
    assert!(matches!(kinds[2], EventKind::Faulted(_)));
    assert_eq!(bus.transport().peripheral(0x01).polls(), 3);
    assert_eq!(bus.session(0x01).unwrap().state(), SessionState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn test_key_rotation_used_at_next_handshake() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::secure(key()))]);
    let (mut bus, panel, mut events) = Bus::new(config(vec![secured(0x01)]), line);
    let new_key = SecretKey::new([0x24; 16]);

    // Rejected until the session is established
    panel.set_key(0x01, new_key.clone()).unwrap();
    bus.run_cycle().await.unwrap();
    bus.run_cycle().await.unwrap();
    assert_eq!(
        kinds(&mut events),
        vec![EventKind::HandshakeStarted, EventKind::SessionEstablished]
    );
    assert_eq!(bus.transport().peripheral(0x01).commands, vec![0x76, 0x77]);

    panel.set_key(0x01, new_key.clone()).unwrap();
    bus.run_cycle().await.unwrap();
    assert_eq!(kinds(&mut events), vec![EventKind::KeyRotated]);
    assert_eq!(
        bus.transport().peripheral(0x01).key.as_ref().map(SecretKey::as_bytes),
        Some(new_key.as_bytes())
    );

    panel.reset_session(0x01).unwrap();
    bus.run_cycle().await.unwrap();
    bus.run_cycle().await.unwrap();
    assert_eq!(
        kinds(&mut events),
        vec![EventKind::Reset, EventKind::HandshakeStarted, EventKind::SessionEstablished]
    );
    assert_eq!(
        bus.transport().peripheral(0x01).commands,
        vec![0x76, 0x77, 0x75, 0x76, 0x77]
    );
}

#[tokio::test(start_paused = true)]
async fn test_replayed_reply_breaks_session_until_cooldown() {
    let line = SimulatedLine::new([(0x01, SimulatedPeripheral::secure(key()).replaying_on(4))]);
    let (mut bus, _panel, mut events) = Bus::new(config(vec![secured(0x01)]), line);

    // CHLNG, SCRYPT, POLL, then a POLL answered with the first POLL's reply
    for _ in 0..4 {
        bus.run_cycle().await.unwrap();
    }

    let kinds_seen = kinds(&mut events);
    assert_eq!(kinds_seen.len(), 4);
    assert_eq!(kinds_seen[..3], [
        EventKind::HandshakeStarted,
        EventKind::SessionEstablished,
        EventKind::ReplayDetected,
    ]);
    assert!(matches!(kinds_seen[3], EventKind::SessionBroken(_)));
    assert_eq!(
        bus.session(0x01).unwrap().secure_state(),
        Some(SecureChannelState::Broken)
    );

    // Cooling down: nothing goes out
    bus.run_cycle().await.unwrap();
    assert_eq!(bus.transport().peripheral(0x01).commands.len(), 4);

    tokio::time::sleep(Duration::from_secs(1)).await;
    bus.run_cycle().await.unwrap();
    bus.run_cycle().await.unwrap();

    assert_eq!(
        kinds(&mut events),
        vec![EventKind::HandshakeStarted, EventKind::SessionEstablished]
    );
    assert_eq!(
        bus.transport().peripheral(0x01).commands,
        vec![0x76, 0x77, 0x60, 0x60, 0x76, 0x77]
    );
}
