//! Secure channel state machine for one peripheral
//!
//! A channel tracks:
//! - Handshake progress (CHLNG/CCRYPT, then SCRYPT/RMAC_I)
//! - Session keys, which exist only while establishing or established
//! - The MAC chain and the sequence counters used for replay detection

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    command::ReplyCode,
    constants::{BLOCK_SIZE, MAC_SIZE, scb},
    crypto::{self, Block},
    error::{Error, Result},
    frame::{Frame, SecurityBlock},
    keys::{SecretKey, SessionKeys, constant_time_eq},
};

use osdp_types::ClientCryptogram;

/// Secure channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelState {
    /// No handshake attempted since the last reset
    Uninitiated,

    /// Handshake in progress
    ChallengeSent,

    /// Session keys established, frames are MACed and encrypted
    SessionEstablished,

    /// Handshake failed or session torn down; needs an explicit reset
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    AwaitingClientCryptogram,
    AwaitingInitialRmac,
}

/// Secrets and chain state of one handshake or session
///
/// Dropping this value wipes the session keys.
struct SessionContext {
    phase: Option<HandshakePhase>,
    rnd_a: [u8; 8],
    keys: Option<SessionKeys>,
    server_cryptogram: Block,
    last_reply_mac: Block,
    last_command_mac: Block,
}

impl SessionContext {
    fn new(rnd_a: [u8; 8]) -> Self {
        Self {
            phase: Some(HandshakePhase::AwaitingClientCryptogram),
            rnd_a,
            keys: None,
            server_cryptogram: [0; BLOCK_SIZE],
            last_reply_mac: [0; BLOCK_SIZE],
            last_command_mac: [0; BLOCK_SIZE],
        }
    }

    fn keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::InvalidSecureState("session keys not derived".into()))
    }
}

/// Keyed fingerprint of a secured frame, independent of the MAC chain
fn reply_fingerprint(keys: &SessionKeys, frame: &Frame) -> Result<Block> {
    let mut bytes = frame.authenticated_bytes()?;
    if let Some(mac) = frame.mac {
        bytes.extend_from_slice(&mac);
    }
    Ok(crypto::compute_mac(keys, &[0; BLOCK_SIZE], &bytes))
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.rnd_a = [0; 8];
        self.server_cryptogram = [0; BLOCK_SIZE];
        self.last_reply_mac = [0; BLOCK_SIZE];
        self.last_command_mac = [0; BLOCK_SIZE];
    }
}

/// Secure channel of one peripheral
///
/// # Examples
///
/// ```
/// use osdp_core::keys::SecretKey;
/// use osdp_core::secure::{SecureChannel, SecureChannelState};
///
/// let mut channel = SecureChannel::new(0x01, SecretKey::install_mode(), true);
/// assert_eq!(channel.state(), SecureChannelState::Uninitiated);
///
/// let block = channel.start_handshake([0x11; 8]).unwrap();
/// assert_eq!(block.kind, 0x11);
/// assert_eq!(channel.state(), SecureChannelState::ChallengeSent);
/// ```
pub struct SecureChannel {
    address: u8,
    master_key: SecretKey,
    install_mode: bool,
    state: SecureChannelState,
    context: Option<SessionContext>,
    tx_sequence: u64,
    rx_sequence: u64,
    /// Fingerprint of every reply accepted in this session
    accepted: HashMap<Block, u64>,
}

impl SecureChannel {
    /// Create a channel using `master_key` as base key
    ///
    /// With `install_mode` the handshake announces the default key (SCBK-D).
    pub fn new(address: u8, master_key: SecretKey, install_mode: bool) -> Self {
        Self {
            address,
            master_key,
            install_mode,
            state: SecureChannelState::Uninitiated,
            context: None,
            tx_sequence: 0,
            rx_sequence: 0,
            accepted: HashMap::new(),
        }
    }

    pub fn state(&self) -> SecureChannelState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SecureChannelState::SessionEstablished
    }

    /// Whether any key material is currently held
    pub fn has_session_keys(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.keys.is_some())
    }

    /// Number of secured commands sent in this session
    pub fn tx_sequence(&self) -> u64 {
        self.tx_sequence
    }

    /// Number of secured replies accepted in this session
    pub fn rx_sequence(&self) -> u64 {
        self.rx_sequence
    }

    fn key_flag(&self) -> u8 {
        if self.install_mode {
            scb::KEY_SCBK_D
        } else {
            scb::KEY_SCBK
        }
    }

    /// Begin a handshake with the controller random number RND.A
    ///
    /// Returns the security block for the CHLNG command.
    pub fn start_handshake(&mut self, rnd_a: [u8; 8]) -> Result<SecurityBlock> {
        if self.state != SecureChannelState::Uninitiated {
            return Err(Error::InvalidSecureState(format!(
                "cannot start handshake from {:?}",
                self.state
            )));
        }

        debug!(address = self.address, "Starting secure channel handshake");

        self.context = Some(SessionContext::new(rnd_a));
        self.state = SecureChannelState::ChallengeSent;

        Ok(SecurityBlock::new(scb::SCS_11, vec![self.key_flag()]))
    }

    fn expect_phase(&self, phase: HandshakePhase) -> Result<&SessionContext> {
        match &self.context {
            Some(ctx) if self.state == SecureChannelState::ChallengeSent && ctx.phase == Some(phase) => {
                Ok(ctx)
            }
            _ => Err(Error::InvalidSecureState(format!(
                "not awaiting {:?} (state {:?})",
                phase, self.state
            ))),
        }
    }

    /// Verify the CCRYPT reply
    ///
    /// Derives the session keys and checks the client cryptogram. Returns
    /// the server cryptogram and security block for the SCRYPT command.
    /// On failure the channel is broken and no key material is kept.
    pub fn accept_client_cryptogram(
        &mut self,
        block: Option<&SecurityBlock>,
        reply: &ClientCryptogram,
    ) -> Result<(Block, SecurityBlock)> {
        let rnd_a = self
            .expect_phase(HandshakePhase::AwaitingClientCryptogram)?
            .rnd_a;

        if block.map(|b| b.kind) != Some(scb::SCS_12) {
            return Err(self.fail_handshake("CCRYPT without SCS_12 security block"));
        }

        let keys = crypto::derive_session_keys(&self.master_key, &rnd_a);
        let expected = crypto::client_cryptogram(&keys, &rnd_a, &reply.rnd_b);

        if !constant_time_eq(&expected, &reply.cryptogram) {
            return Err(self.fail_handshake("client cryptogram mismatch"));
        }

        let server_cryptogram = crypto::server_cryptogram(&keys, &rnd_a, &reply.rnd_b);

        trace!(
            address = self.address,
            client_uid = hex::encode(reply.client_uid),
            "Client cryptogram verified"
        );

        let key_flag = self.key_flag();
        if let Some(ctx) = self.context.as_mut() {
            ctx.keys = Some(keys);
            ctx.server_cryptogram = server_cryptogram;
            ctx.phase = Some(HandshakePhase::AwaitingInitialRmac);
        }

        Ok((server_cryptogram, SecurityBlock::new(scb::SCS_13, vec![key_flag])))
    }

    /// Verify the RMAC_I reply and establish the session
    pub fn accept_initial_rmac(&mut self, block: Option<&SecurityBlock>, rmac: &Block) -> Result<()> {
        let ctx = self.expect_phase(HandshakePhase::AwaitingInitialRmac)?;

        let accepted = block.is_some_and(|b| {
            b.kind == scb::SCS_14 && b.data.first() == Some(&scb::CRYPTOGRAM_ACCEPTED)
        });
        if !accepted {
            return Err(self.fail_handshake("server cryptogram rejected by peripheral"));
        }

        let expected = crypto::initial_rmac(ctx.keys()?, &ctx.server_cryptogram);
        if !constant_time_eq(&expected, rmac) {
            return Err(self.fail_handshake("initial R-MAC mismatch"));
        }

        if let Some(ctx) = self.context.as_mut() {
            ctx.phase = None;
            ctx.last_reply_mac = expected;
        }
        self.tx_sequence = 0;
        self.rx_sequence = 0;
        self.accepted.clear();
        self.state = SecureChannelState::SessionEstablished;

        info!(address = self.address, "Secure channel established");

        Ok(())
    }

    /// Abort a handshake in progress (timeout, malformed reply, NAK)
    ///
    /// Returns the `HandshakeFailed` error describing the failure.
    pub fn fail_handshake(&mut self, reason: &str) -> Error {
        warn!(address = self.address, reason, "Secure channel handshake failed");
        self.wipe(SecureChannelState::Broken);
        Error::HandshakeFailed(reason.to_string())
    }

    /// Tear down the channel after a security violation
    pub fn break_session(&mut self, reason: &str) {
        if self.state != SecureChannelState::Broken {
            warn!(address = self.address, reason, "Secure channel broken");
        }
        self.wipe(SecureChannelState::Broken);
    }

    /// Return to Uninitiated, discarding all session state
    pub fn reset(&mut self) {
        debug!(address = self.address, "Secure channel reset");
        self.wipe(SecureChannelState::Uninitiated);
    }

    /// Replace the base key (after a successful KEYSET)
    ///
    /// The current session is unaffected; the new key is used from the
    /// next handshake on.
    pub fn set_master_key(&mut self, key: SecretKey) {
        self.master_key = key;
        self.install_mode = false;
    }

    fn wipe(&mut self, state: SecureChannelState) {
        self.context = None;
        self.accepted.clear();
        self.tx_sequence = 0;
        self.rx_sequence = 0;
        self.state = state;
    }

    fn established_context(&self) -> Result<&SessionContext> {
        match &self.context {
            Some(ctx) if self.is_established() => Ok(ctx),
            _ => Err(Error::InvalidSecureState(format!(
                "no established session (state {:?})",
                self.state
            ))),
        }
    }

    fn out_of_order(&mut self, received: u8, expected: u8) -> Error {
        self.break_session("reply sequence number out of order");
        Error::ReplayDetected {
            sequence: received as u64,
            last_accepted: expected as u64,
        }
    }

    /// Secure an outgoing command frame
    ///
    /// Encrypts non-empty data (SCS_17, otherwise SCS_15), computes the
    /// command MAC chained from the last reply MAC, and advances the
    /// transmit sequence.
    pub fn wrap(&mut self, mut frame: Frame) -> Result<Frame> {
        let ctx = self.established_context()?;
        let keys = ctx.keys()?;

        let kind = if frame.data.is_empty() {
            scb::SCS_15
        } else {
            let iv = crypto::invert(&ctx.last_reply_mac);
            frame.data = Bytes::from(crypto::encrypt_data(keys, &iv, &frame.data));
            scb::SCS_17
        };
        frame.security = Some(SecurityBlock::new(kind, Bytes::new()));

        let mac = crypto::compute_mac(keys, &ctx.last_reply_mac, &frame.authenticated_bytes()?);
        let mut truncated = [0u8; MAC_SIZE];
        truncated.copy_from_slice(&mac[..MAC_SIZE]);
        frame.mac = Some(truncated);

        if let Some(ctx) = self.context.as_mut() {
            ctx.last_command_mac = mac;
        }
        self.tx_sequence += 1;

        trace!(address = self.address, tx_sequence = self.tx_sequence, "Wrapped {}", frame);

        Ok(frame)
    }

    /// Verify and decrypt an incoming reply frame
    ///
    /// The MAC is verified before anything else. A frame identical to any
    /// reply accepted in this session, or one whose sequence number does
    /// not echo the command's, is a replay. Any failure breaks the session.
    ///
    /// Unsecured BUSY and NAK replies are passed through untouched and do
    /// not advance the MAC chain. They must still echo the sequence number.
    pub fn unwrap(&mut self, frame: Frame, expected_sequence: u8) -> Result<Frame> {
        let ctx = self.established_context()?;

        if !frame.is_secured() {
            if !matches!(ReplyCode::try_from(frame.code), Ok(ReplyCode::Nak | ReplyCode::Busy)) {
                self.break_session("unsecured reply inside secure session");
                return Err(Error::MacMismatch);
            }
            if frame.sequence != expected_sequence {
                return Err(self.out_of_order(frame.sequence, expected_sequence));
            }
            return Ok(frame);
        }

        let keys = ctx.keys()?;
        let mac = crypto::compute_mac(keys, &ctx.last_command_mac, &frame.authenticated_bytes()?);
        let fingerprint = reply_fingerprint(keys, &frame)?;
        let mac_ok = frame
            .mac
            .is_some_and(|received| constant_time_eq(&mac[..MAC_SIZE], &received));

        if !mac_ok {
            let error = match self.accepted.get(&fingerprint) {
                Some(&sequence) => Error::ReplayDetected {
                    sequence,
                    last_accepted: self.rx_sequence,
                },
                None => Error::MacMismatch,
            };
            self.break_session(&error.to_string());
            return Err(error);
        }

        if frame.sequence != expected_sequence {
            return Err(self.out_of_order(frame.sequence, expected_sequence));
        }

        let decrypted = if frame.security_kind() == Some(scb::SCS_18) && !frame.data.is_empty() {
            let iv = crypto::invert(&ctx.last_command_mac);
            match crypto::decrypt_data(keys, &iv, &frame.data) {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) => {
                    self.break_session("reply decryption failed");
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.rx_sequence += 1;
        self.accepted.insert(fingerprint, self.rx_sequence);
        if let Some(ctx) = self.context.as_mut() {
            ctx.last_reply_mac = mac;
        }

        trace!(address = self.address, rx_sequence = self.rx_sequence, "Unwrapped {}", frame);

        let mut frame = frame;
        if let Some(data) = decrypted {
            frame.data = data;
        }
        Ok(frame)
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("address", &format!("0x{:02X}", self.address))
            .field("state", &self.state)
            .field("install_mode", &self.install_mode)
            .field("tx_sequence", &self.tx_sequence)
            .field("rx_sequence", &self.rx_sequence)
            .finish()
    }
}
