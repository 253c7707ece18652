use tracing::debug;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::constant::{
    CapabilityFlags, MAX_PACKET_SIZE, PROTOCOL_VERSION, ServerStatusFlags, UTF8MB4_GENERAL_CI,
};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::{ErrPayloadBytes, OkPayload};

/// Fixed fields that every greeting carries after the server version
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct GreetingHead {
    connection_id: U32LE,
    auth_data_part1: [u8; 8],
    _filler: u8,
    capability_flags_lower: U16LE,
}

/// Fixed fields of a protocol 4.1 greeting
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct GreetingTail {
    charset: u8,
    status_flags: U16LE,
    capability_flags_upper: U16LE,
    auth_data_len: u8,
    _reserved: [u8; 10],
}

#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: ServerStatusFlags,
    pub auth_plugin_name: Option<String>,
}

/// Read initial handshake packet from server
pub fn read_initial_handshake(payload: &[u8]) -> Result<InitialHandshake> {
    let (protocol_version, data) = read_int_1(payload)?;

    if protocol_version == 0xFF {
        Err(ErrPayloadBytes(payload))?
    }
    if protocol_version != PROTOCOL_VERSION {
        return Err(Error::ProtocolError(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }

    let (server_version, data) = read_string_null(data)?;
    let server_version = String::from_utf8_lossy(server_version).into_owned();

    let (head, data) = GreetingHead::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    let mut auth_plugin_data = head.auth_data_part1.to_vec();
    let mut cap_bits = u32::from(head.capability_flags_lower.get());

    let mut handshake = InitialHandshake {
        protocol_version,
        server_version,
        connection_id: head.connection_id.get(),
        auth_plugin_data: Vec::new(),
        capability_flags: CapabilityFlags::from_bits_truncate(cap_bits),
        charset: 0,
        status_flags: ServerStatusFlags::empty(),
        auth_plugin_name: None,
    };

    if data.is_empty() {
        handshake.auth_plugin_data = auth_plugin_data;
        return Ok(handshake);
    }

    let (tail, mut data) = GreetingTail::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)?;
    cap_bits |= u32::from(tail.capability_flags_upper.get()) << 16;
    let capability_flags = CapabilityFlags::from_bits_truncate(cap_bits);

    if capability_flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let len = match tail.auth_data_len {
            0 => 12,
            declared => usize::from(declared).saturating_sub(8).min(12),
        };
        let (auth_data_2, rest) = read_string_fix(data, len)?;
        auth_plugin_data.extend_from_slice(auth_data_2);
        // scramble filler
        data = rest.strip_prefix(&[0]).unwrap_or(rest);
    }

    if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !data.is_empty() {
        // Some servers omit the terminating NUL
        let name = match read_string_null(data) {
            Ok((name, _rest)) => name,
            Err(_) => data,
        };
        handshake.auth_plugin_name = Some(String::from_utf8_lossy(name).into_owned());
    }

    handshake.auth_plugin_data = auth_plugin_data;
    handshake.capability_flags = capability_flags;
    handshake.charset = tail.charset;
    handshake.status_flags = ServerStatusFlags::from_bits_truncate(tail.status_flags.get());
    Ok(handshake)
}

/// Handshake response packet sent by client (HandshakeResponse41)
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin_name: Option<&'a str>,
}

/// Write handshake response packet (HandshakeResponse41)
pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse41) {
    write_int_4(out, response.capability_flags.bits());
    write_int_4(out, response.max_packet_size);
    write_int_1(out, response.charset);

    // reserved (23 bytes of 0x00)
    out.extend_from_slice(&[0u8; 23]);

    write_string_null(out, response.username);

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        write_bytes_lenenc(out, response.auth_response);
    } else {
        // 1-byte length + data (older protocol); scrambles never exceed 255 bytes
        write_int_1(out, response.auth_response.len() as u8);
        out.extend_from_slice(response.auth_response);
    }

    if let Some(db) = response.database
        && response
            .capability_flags
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
    {
        write_string_null(out, db);
    }

    if let Some(plugin) = response.auth_plugin_name
        && response
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    {
        write_string_null(out, plugin);
    }
}

/// Auth switch request from server
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest<'a> {
    pub plugin_name: &'a [u8],
    pub plugin_data: &'a [u8],
}

/// Read auth switch request (`0xFE`, plugin name, scramble)
pub fn read_auth_switch_request(payload: &[u8]) -> Result<AuthSwitchRequest<'_>> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::InvalidPacket);
    }

    let (plugin_name, data) = read_string_null(data)?;
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    Ok(AuthSwitchRequest {
        plugin_name,
        plugin_data: &data[..data.len().min(20)],
    })
}

// ============================================================================
// Authentication Plugins
// ============================================================================

/// Authentication plugins the client can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    MysqlNativePassword,
    CachingSha2Password,
    MysqlClearPassword,
}

impl AuthPlugin {
    pub fn from_name(name: &[u8]) -> Result<Self> {
        match name {
            b"mysql_native_password" => Ok(Self::MysqlNativePassword),
            b"caching_sha2_password" => Ok(Self::CachingSha2Password),
            b"mysql_clear_password" => Ok(Self::MysqlClearPassword),
            plugin => Err(Error::UnsupportedAuthPlugin(
                String::from_utf8_lossy(plugin).into_owned(),
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MysqlNativePassword => "mysql_native_password",
            Self::CachingSha2Password => "caching_sha2_password",
            Self::MysqlClearPassword => "mysql_clear_password",
        }
    }

    /// Scramble `password` with the server nonce. An empty password always yields an empty response.
    pub fn auth_response(self, password: &str, challenge: &[u8]) -> Vec<u8> {
        if password.is_empty() {
            return Vec::new();
        }
        match self {
            Self::MysqlNativePassword => auth_mysql_native_password(password, challenge).to_vec(),
            Self::CachingSha2Password => auth_caching_sha2_password(password, challenge).to_vec(),
            Self::MysqlClearPassword => auth_mysql_clear_password(password),
        }
    }
}

/// mysql_native_password authentication
///
/// Formula: SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))
pub fn auth_mysql_native_password(password: &str, challenge: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};

    let stage1_hash = Sha1::digest(password.as_bytes());
    let stage2_hash = Sha1::digest(stage1_hash);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2_hash);
    let token_hash = hasher.finalize();

    let mut result = [0u8; 20];
    for (out, (a, b)) in result.iter_mut().zip(stage1_hash.iter().zip(token_hash.iter())) {
        *out = a ^ b;
    }
    result
}

/// caching_sha2_password authentication (fast path)
///
/// Formula: XOR(SHA256(password), SHA256(SHA256(SHA256(password)), challenge))
pub fn auth_caching_sha2_password(password: &str, challenge: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(challenge);
    let scramble = hasher.finalize();

    let mut result = [0u8; 32];
    for (out, (a, b)) in result.iter_mut().zip(stage1.iter().zip(scramble.iter())) {
        *out = a ^ b;
    }
    result
}

/// mysql_clear_password authentication: the password followed by NUL
pub fn auth_mysql_clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    write_string_null(&mut out, password);
    out
}

/// caching_sha2_password fast auth result
///
/// After the scrambled password, the server sends `0x01` followed by:
/// - 0x03 (fast auth success) - cached authentication succeeded
/// - 0x04 (full auth required) - the password has to be sent in full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2PasswordFastAuthResult {
    Success,
    FullAuthRequired,
}

/// Read caching_sha2_password fast auth result (`0x01` + status byte)
pub fn read_caching_sha2_password_fast_auth_result(
    payload: &[u8],
) -> Result<CachingSha2PasswordFastAuthResult> {
    match payload {
        [0x01, 0x03, ..] => Ok(CachingSha2PasswordFastAuthResult::Success),
        [0x01, 0x04, ..] => Ok(CachingSha2PasswordFastAuthResult::FullAuthRequired),
        _ => Err(Error::ProtocolError(
            "unexpected caching_sha2_password auth data".to_string(),
        )),
    }
}

// ============================================================================
// State Machine API for Handshake
// ============================================================================

/// Configuration for handshake
#[derive(Clone)]
pub struct HandshakeConfig {
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// Capabilities the client asks for, before intersecting with the server's
    pub capabilities: CapabilityFlags,
}

impl std::fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("username", &self.username)
            .field("database", &self.database)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Result of driving the handshake state machine
#[derive(Debug)]
pub enum HandshakeResult {
    /// Greeting parsed; send `handshake_response` to the server
    InitialHandshake {
        handshake_response: Vec<u8>,
        initial_handshake: InitialHandshake,
    },
    /// Send this payload to the server, then read the next packet
    Write(Vec<u8>),
    /// Nothing to send; read the next packet
    Read,
    /// Authentication succeeded
    Connected {
        capability_flags: CapabilityFlags,
        ok: OkPayload,
    },
}

/// State machine for MySQL handshake
///
/// Pure parsing and packet generation state machine without I/O dependencies.
#[derive(Debug)]
pub enum Handshake {
    /// Waiting for the server greeting
    Connecting { config: HandshakeConfig },
    /// Handshake response sent, waiting for the auth result
    Authenticating {
        config: HandshakeConfig,
        plugin: AuthPlugin,
        capability_flags: CapabilityFlags,
    },
    /// Answered an auth switch request, waiting for the auth result
    AuthSwitchRequest {
        config: HandshakeConfig,
        plugin: AuthPlugin,
        capability_flags: CapabilityFlags,
    },
    /// caching_sha2_password fast auth succeeded, waiting for the final OK
    CachingSha2FastAuth { capability_flags: CapabilityFlags },
    /// Connected (terminal state)
    Ready,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self::Connecting { config }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Drive the state machine with the next payload
    pub fn drive(&mut self, payload: &[u8]) -> Result<HandshakeResult> {
        match std::mem::replace(self, Self::Ready) {
            Self::Connecting { config } => self.on_greeting(config, payload),

            Self::Authenticating {
                config,
                plugin,
                capability_flags,
            }
            | Self::AuthSwitchRequest {
                config,
                plugin,
                capability_flags,
            } => {
                // Restore the state; transitions below overwrite it
                *self = Self::Authenticating {
                    config: config.clone(),
                    plugin,
                    capability_flags,
                };
                self.on_auth_packet(config, plugin, capability_flags, payload)
            }

            Self::CachingSha2FastAuth { capability_flags } => match payload.first() {
                Some(0x00) => {
                    let ok = OkPayload::parse(payload)?;
                    Ok(HandshakeResult::Connected {
                        capability_flags,
                        ok,
                    })
                }
                Some(0xFF) => Err(ErrPayloadBytes(payload).into()),
                _ => Err(Error::ProtocolError(
                    "expected OK after caching_sha2_password fast auth".to_string(),
                )),
            },

            Self::Ready => Err(Error::ProtocolError(
                "handshake packet received after authentication".to_string(),
            )),
        }
    }

    fn on_greeting(&mut self, config: HandshakeConfig, payload: &[u8]) -> Result<HandshakeResult> {
        let handshake = read_initial_handshake(payload)?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = ?handshake.auth_plugin_name,
            "received server greeting"
        );

        let mut client_caps = config.capabilities;
        if config.database.is_some() {
            client_caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        let capability_flags = client_caps & handshake.capability_flags;

        let plugin = match &handshake.auth_plugin_name {
            Some(name) => AuthPlugin::from_name(name.as_bytes())?,
            None => AuthPlugin::MysqlNativePassword,
        };
        let auth_response = plugin.auth_response(&config.password, &handshake.auth_plugin_data);

        let response = HandshakeResponse41 {
            capability_flags,
            max_packet_size: MAX_PACKET_SIZE,
            charset: UTF8MB4_GENERAL_CI,
            username: &config.username,
            auth_response: &auth_response,
            database: config.database.as_deref(),
            auth_plugin_name: Some(plugin.name()),
        };

        let mut handshake_response = Vec::new();
        write_handshake_response(&mut handshake_response, &response);

        *self = Self::Authenticating {
            config,
            plugin,
            capability_flags,
        };

        Ok(HandshakeResult::InitialHandshake {
            handshake_response,
            initial_handshake: handshake,
        })
    }

    fn on_auth_packet(
        &mut self,
        config: HandshakeConfig,
        plugin: AuthPlugin,
        capability_flags: CapabilityFlags,
        payload: &[u8],
    ) -> Result<HandshakeResult> {
        match payload.first() {
            Some(0x00) => {
                let ok = OkPayload::parse(payload)?;
                *self = Self::Ready;
                Ok(HandshakeResult::Connected {
                    capability_flags,
                    ok,
                })
            }
            Some(0xFF) => Err(ErrPayloadBytes(payload).into()),
            Some(0xFE) => {
                let auth_switch = read_auth_switch_request(payload)?;
                let plugin = AuthPlugin::from_name(auth_switch.plugin_name)?;
                debug!(plugin = plugin.name(), "auth switch requested");
                let auth_response = plugin.auth_response(&config.password, auth_switch.plugin_data);
                *self = Self::AuthSwitchRequest {
                    config,
                    plugin,
                    capability_flags,
                };
                Ok(HandshakeResult::Write(auth_response))
            }
            Some(0x01) => {
                if plugin != AuthPlugin::CachingSha2Password {
                    return Err(Error::ProtocolError(format!(
                        "unexpected auth data for {}",
                        plugin.name()
                    )));
                }
                match read_caching_sha2_password_fast_auth_result(payload)? {
                    CachingSha2PasswordFastAuthResult::Success => {
                        *self = Self::CachingSha2FastAuth { capability_flags };
                        Ok(HandshakeResult::Read)
                    }
                    CachingSha2PasswordFastAuthResult::FullAuthRequired => {
                        // Cleartext: the transport is assumed to be secure
                        debug!("caching_sha2_password full authentication");
                        Ok(HandshakeResult::Write(auth_mysql_clear_password(
                            &config.password,
                        )))
                    }
                }
            }
            _ => Err(Error::ProtocolError(
                "unexpected packet during authentication".to_string(),
            )),
        }
    }
}
