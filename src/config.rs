//! # Configuration Management
//!
//! Centralized configuration for listeners, dialers and protocol tasks.
//!
//! Two layers live here:
//!
//! - **Validated runtime types**: [`EndpointConfig`] and [`TaskConfig`]. An
//!   `EndpointConfig` can only be obtained through a constructor that checks
//!   every field, and it is immutable afterwards.
//! - **File-facing settings**: [`EngineConfig`] and its sections, loaded from
//!   TOML or environment variables and turned into runtime types with
//!   [`EndpointSettings::build`].
//!
//! ## Configuration Sources
//! - TOML files via [`EngineConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides via [`EngineConfig::from_env`]
//!
//! ## Security Considerations
//! - Symmetric security modes require a passphrase of at least 36 characters
//! - Passphrases are redacted from `Debug` output

use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Byte exchanged to acknowledge every protocol sub-message
pub const ACK_SENTINEL: u8 = 0xA5;

/// Minimum passphrase length for symmetric security modes
pub const MIN_PASSPHRASE_LEN: usize = 36;

/// Smallest TCP buffer able to carry a 4-byte length field
pub const MIN_TCP_BUFFER_SIZE: usize = 4;

/// Smallest UDP buffer
pub const MIN_UDP_BUFFER_SIZE: usize = 1;

/// Largest datagram payload the engine will try to send or receive
pub const MAX_UDP_BUFFER_SIZE: usize = 65_507;

/// Retries allowed for an ACK or size indicator before the exchange fails
pub const PROTOCOL_RETRY_LIMIT: u32 = 40;

/// Progress callbacks fire every time this many more bytes have moved
pub const PROGRESS_INTERVAL_BYTES: u64 = 100 * 1024;

/// Consecutive failures a "just once" dialer tolerates before giving up
pub const DIALER_EXCEPTION_BUDGET: u32 = 10;

/// Default number of short reads the receive tolerance loop attempts
pub const DEFAULT_TOLERANCE_CYCLES: u32 = 5;

/// Default cap for transmissions of unknown size, in MiB
pub const DEFAULT_MAX_UNKNOWN_SIZE_MIB: usize = 16;

/// Sentinel for "no termination limit"
pub const UNBOUNDED_TERMINATIONS: i64 = -1;

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

impl TransportKind {
    /// Smallest buffer size this transport accepts
    pub fn min_buffer_size(self) -> usize {
        match self {
            TransportKind::Tcp => MIN_TCP_BUFFER_SIZE,
            TransportKind::Udp => MIN_UDP_BUFFER_SIZE,
        }
    }
}

/// The protocol role a task plays on its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CommunicationType {
    #[default]
    TcpSend,
    TcpSendWithAnswer,
    TcpReceive,
    TcpReceiveWithAnswer,
    TcpBidirectional,
    UdpSend,
    UdpSendWithAck,
    UdpReceive,
    UdpReceiveWithAck,
}

impl CommunicationType {
    /// Transport this communication type runs over
    pub fn transport(self) -> TransportKind {
        match self {
            CommunicationType::TcpSend
            | CommunicationType::TcpSendWithAnswer
            | CommunicationType::TcpReceive
            | CommunicationType::TcpReceiveWithAnswer
            | CommunicationType::TcpBidirectional => TransportKind::Tcp,
            CommunicationType::UdpSend
            | CommunicationType::UdpSendWithAck
            | CommunicationType::UdpReceive
            | CommunicationType::UdpReceiveWithAck => TransportKind::Udp,
        }
    }

    /// Whether a run starts by sending an outbound message
    pub fn initiates_with_send(self) -> bool {
        matches!(
            self,
            CommunicationType::TcpSend
                | CommunicationType::TcpSendWithAnswer
                | CommunicationType::UdpSend
                | CommunicationType::UdpSendWithAck
        )
    }
}

/// How message boxes map onto a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    /// A single box serves both directions
    #[default]
    OneToOne,
    /// Many boxes share a socket; the envelope's box id selects the box
    ManyToOne,
    /// Box 0 is outbound, box 1 inbound
    EqualBidirectional,
}

/// Transport encryption applied to every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    #[default]
    None,
    #[serde(rename = "sym128-low")]
    Symmetric128Low,
    #[serde(rename = "sym256-low")]
    Symmetric256Low,
    #[serde(rename = "sym128-high")]
    Symmetric128High,
    #[serde(rename = "sym256-high")]
    Symmetric256High,
}

impl SecurityMode {
    /// Whether the mode encrypts at all
    pub fn is_symmetric(self) -> bool {
        !matches!(self, SecurityMode::None)
    }

    /// Whether the mode uses random per-frame nonces
    pub fn is_high(self) -> bool {
        matches!(
            self,
            SecurityMode::Symmetric128High | SecurityMode::Symmetric256High
        )
    }

    /// Key strength in bits (0 for `None`)
    pub fn key_bits(self) -> u32 {
        match self {
            SecurityMode::None => 0,
            SecurityMode::Symmetric128Low | SecurityMode::Symmetric128High => 128,
            SecurityMode::Symmetric256Low | SecurityMode::Symmetric256High => 256,
        }
    }

    /// Bytes each encrypted frame grows by
    pub fn overhead(self) -> usize {
        match self {
            SecurityMode::None => 0,
            SecurityMode::Symmetric128Low | SecurityMode::Symmetric256Low => 16,
            SecurityMode::Symmetric128High | SecurityMode::Symmetric256High => 28,
        }
    }
}

/// TLS material for an endpoint.
///
/// Listeners need `cert_path` and `key_path`. Dialers verify the server
/// against native roots unless `ca_path`, `pinned_sha256` or
/// `accept_invalid_certs` says otherwise.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsSettings {
    /// PEM certificate chain (listener)
    pub cert_path: Option<PathBuf>,
    /// PEM PKCS#8 or RSA private key (listener)
    pub key_path: Option<PathBuf>,
    /// Password of an encrypted PKCS#8 key (listener)
    pub key_password: Option<String>,
    /// Extra PEM roots to trust (dialer)
    pub ca_path: Option<PathBuf>,
    /// SNI name; defaults to the endpoint host (dialer)
    pub server_name: Option<String>,
    /// Hex SHA-256 fingerprint of the only certificate to accept (dialer)
    pub pinned_sha256: Option<String>,
    /// Skip certificate verification entirely (dialer, testing only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .field("ca_path", &self.ca_path)
            .field("server_name", &self.server_name)
            .field("pinned_sha256", &self.pinned_sha256)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl TlsSettings {
    /// Server-side material
    pub fn server<P: Into<PathBuf>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            ..Self::default()
        }
    }

    /// Client-side settings verifying against native roots
    pub fn client() -> Self {
        Self::default()
    }

    /// Decrypt the private key with `password`
    pub fn with_key_password<S: Into<String>>(mut self, password: S) -> Self {
        self.key_password = Some(password.into());
        self
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push("TLS cert_path and key_path must be set together".to_string());
        }
        if self.key_password.is_some() && self.key_path.is_none() {
            errors.push("TLS key_password requires key_path".to_string());
        }
        if let Some(pin) = &self.pinned_sha256 {
            let clean: String = pin.chars().filter(|c| *c != ':').collect();
            if clean.len() != 64 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
                errors.push(format!(
                    "Invalid pinned_sha256 '{pin}' (expected 64 hex digits)"
                ));
            }
        }
        errors
    }
}

/// Validated, immutable endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    transport: TransportKind,
    host: String,
    port: u16,
    buffer_size: usize,
    timeout: Duration,
    max_terminations: i64,
    tls: Option<TlsSettings>,
    multicast_ttl: Option<u32>,
}

impl EndpointConfig {
    /// Build and validate an endpoint. Fails fast on any invalid field.
    pub fn new<S: Into<String>>(
        transport: TransportKind,
        host: S,
        port: u16,
        buffer_size: usize,
        timeout_ms: u64,
        max_terminations: i64,
    ) -> Result<Self> {
        let config = Self {
            transport,
            host: host.into(),
            port,
            buffer_size,
            timeout: Duration::from_millis(timeout_ms),
            max_terminations,
            tls: None,
            multicast_ttl: None,
        };
        config.check()?;
        Ok(config)
    }

    /// TCP endpoint shorthand
    pub fn tcp<S: Into<String>>(
        host: S,
        port: u16,
        buffer_size: usize,
        timeout_ms: u64,
        max_terminations: i64,
    ) -> Result<Self> {
        Self::new(
            TransportKind::Tcp,
            host,
            port,
            buffer_size,
            timeout_ms,
            max_terminations,
        )
    }

    /// UDP endpoint shorthand
    pub fn udp<S: Into<String>>(
        host: S,
        port: u16,
        buffer_size: usize,
        timeout_ms: u64,
        max_terminations: i64,
    ) -> Result<Self> {
        Self::new(
            TransportKind::Udp,
            host,
            port,
            buffer_size,
            timeout_ms,
            max_terminations,
        )
    }

    /// Attach TLS material (TCP only)
    pub fn with_tls(mut self, tls: TlsSettings) -> Result<Self> {
        self.tls = Some(tls);
        self.check()?;
        Ok(self)
    }

    /// Enable multicast with the given TTL (UDP only, host must be a group address)
    pub fn with_multicast(mut self, ttl: u32) -> Result<Self> {
        self.multicast_ttl = Some(ttl);
        self.check()?;
        Ok(self)
    }

    fn check(&self) -> Result<()> {
        let errors = endpoint_errors(
            self.transport,
            &self.host,
            self.port,
            self.buffer_size,
            self.timeout.as_millis() as u64,
            self.max_terminations,
            self.tls.as_ref(),
            self.multicast_ttl,
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(errors.join("; ")))
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Per-operation timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Termination limit, `-1` for unbounded
    pub fn max_terminations(&self) -> i64 {
        self.max_terminations
    }

    /// Whether `count` terminations reach the limit
    pub fn termination_limit_reached(&self, count: i64) -> bool {
        self.max_terminations != UNBOUNDED_TERMINATIONS && count >= self.max_terminations
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    pub fn multicast_ttl(&self) -> Option<u32> {
        self.multicast_ttl
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast_ttl.is_some()
    }

    /// `host:port` for resolution
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Validate a multicast group address.
///
/// IPv4 groups must lie in 224.0.0.0–239.255.255.255, IPv6 groups in ff00::/8.
pub fn validate_multicast_group(host: &str) -> Result<IpAddr> {
    let ip = host.parse::<IpAddr>().map_err(|_| {
        ProtocolError::ConfigError(format!("Multicast host '{host}' is not an IP address"))
    })?;
    if !ip.is_multicast() {
        return Err(ProtocolError::ConfigError(format!(
            "Address {ip} is outside the multicast range"
        )));
    }
    Ok(ip)
}

#[allow(clippy::too_many_arguments)]
fn endpoint_errors(
    transport: TransportKind,
    host: &str,
    port: u16,
    buffer_size: usize,
    timeout_ms: u64,
    max_terminations: i64,
    tls: Option<&TlsSettings>,
    multicast_ttl: Option<u32>,
) -> Vec<String> {
    let mut errors = Vec::new();

    if host.trim().is_empty() {
        errors.push("Host cannot be empty".to_string());
    }

    if port == 0 {
        errors.push("Port must be in 1..=65535".to_string());
    }

    let min_buffer = transport.min_buffer_size();
    if buffer_size < min_buffer {
        errors.push(format!(
            "Buffer size too small for {transport:?}: {buffer_size} (minimum: {min_buffer})"
        ));
    }
    if transport == TransportKind::Udp && buffer_size > MAX_UDP_BUFFER_SIZE {
        errors.push(format!(
            "Buffer size too large for Udp: {buffer_size} (maximum: {MAX_UDP_BUFFER_SIZE})"
        ));
    }

    if timeout_ms < 1 {
        errors.push("Timeout must be at least 1ms".to_string());
    }

    if max_terminations == 0 || max_terminations < UNBOUNDED_TERMINATIONS {
        errors.push(format!(
            "Invalid max terminations: {max_terminations} (use -1 for unbounded or a positive count)"
        ));
    }

    if let Some(tls) = tls {
        if transport == TransportKind::Udp {
            errors.push("TLS is only supported on TCP endpoints".to_string());
        }
        errors.extend(tls.validate());
    }

    if let Some(ttl) = multicast_ttl {
        if transport == TransportKind::Tcp {
            errors.push("Multicast is only supported on UDP endpoints".to_string());
        }
        if ttl > 255 {
            errors.push(format!("Multicast TTL too large: {ttl} (maximum: 255)"));
        }
        if let Err(ProtocolError::ConfigError(msg)) = validate_multicast_group(host) {
            errors.push(msg);
        }
    }

    errors
}

/// ACK / size-indicator retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first failed read
    pub retries: u32,
    /// Backoff after each failed read
    #[serde(with = "duration_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: PROTOCOL_RETRY_LIMIT,
            delay: timeout::RETRY_DELAY,
        }
    }
}

/// Protocol task configuration.
///
/// Cloned into every engine instance; never shared between units.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TaskConfig {
    /// Protocol role
    #[serde(default)]
    pub communication: CommunicationType,

    /// Box-to-socket mapping
    #[serde(default)]
    pub cardinality: Cardinality,

    /// Transport encryption
    #[serde(default)]
    pub security: SecurityMode,

    /// Shared secret for symmetric modes
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Chunk size for stream reads and writes
    pub buffer_length: usize,

    /// How long a task waits on an empty or full message box
    #[serde(with = "duration_serde")]
    pub queue_timeout: Duration,

    /// Cap for transmissions of unknown size, in MiB
    pub max_unknown_size_mib: usize,

    /// Short reads attempted after a partial read before giving up
    pub tolerance_cycles: u32,

    /// Read timeout of each tolerance cycle
    #[serde(with = "duration_serde")]
    pub tolerance_delay: Duration,

    /// ACK / size-indicator retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("communication", &self.communication)
            .field("cardinality", &self.cardinality)
            .field("security", &self.security)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("buffer_length", &self.buffer_length)
            .field("queue_timeout", &self.queue_timeout)
            .field("max_unknown_size_mib", &self.max_unknown_size_mib)
            .field("tolerance_cycles", &self.tolerance_cycles)
            .field("tolerance_delay", &self.tolerance_delay)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            communication: CommunicationType::default(),
            cardinality: Cardinality::default(),
            security: SecurityMode::None,
            passphrase: None,
            buffer_length: 1500,
            queue_timeout: Duration::from_millis(500),
            max_unknown_size_mib: DEFAULT_MAX_UNKNOWN_SIZE_MIB,
            tolerance_cycles: DEFAULT_TOLERANCE_CYCLES,
            tolerance_delay: timeout::TOLERANCE_DELAY,
            retry: RetryPolicy::default(),
        }
    }
}

impl TaskConfig {
    /// Defaults for the given communication type
    pub fn new(communication: CommunicationType) -> Self {
        Self {
            communication,
            ..Self::default()
        }
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_security<S: Into<String>>(mut self, mode: SecurityMode, passphrase: S) -> Self {
        self.security = mode;
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_buffer_length(mut self, buffer_length: usize) -> Self {
        self.buffer_length = buffer_length;
        self
    }

    pub fn with_queue_timeout(mut self, queue_timeout: Duration) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn with_max_unknown_size_mib(mut self, mib: usize) -> Self {
        self.max_unknown_size_mib = mib;
        self
    }

    pub fn with_tolerance(mut self, cycles: u32, delay: Duration) -> Self {
        self.tolerance_cycles = cycles;
        self.tolerance_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cap for transmissions of unknown size, in bytes
    pub fn max_unknown_size(&self) -> usize {
        self.max_unknown_size_mib.saturating_mul(1024 * 1024)
    }

    /// Validate the task configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.security.is_symmetric() {
            match &self.passphrase {
                Some(p) if p.chars().count() >= MIN_PASSPHRASE_LEN => {}
                _ => errors.push(constants::ERR_PASSPHRASE_REQUIRED.to_string()),
            }
        }

        let min_buffer = self.communication.transport().min_buffer_size();
        if self.buffer_length < min_buffer {
            errors.push(format!(
                "Task buffer length too small: {} (minimum: {min_buffer})",
                self.buffer_length
            ));
        }

        if self.queue_timeout.is_zero() {
            errors.push("Queue timeout must be greater than 0".to_string());
        }

        if self.max_unknown_size_mib == 0 {
            errors.push("Max unknown size must be at least 1 MiB".to_string());
        }

        if self.tolerance_delay.is_zero() && self.tolerance_cycles > 0 {
            errors.push("Tolerance delay must be greater than 0".to_string());
        }

        if self.communication == CommunicationType::TcpBidirectional
            && self.cardinality != Cardinality::EqualBidirectional
        {
            errors.push(
                "tcp-bidirectional requires equal-bidirectional cardinality".to_string(),
            );
        }

        errors
    }

    /// Validate and return Result
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(errors.join("; ")))
        }
    }
}

/// Main engine configuration as loaded from files or the environment
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Endpoint settings
    #[serde(default)]
    pub endpoint: EndpointSettings,

    /// Protocol task settings
    #[serde(default)]
    pub task: TaskConfig,

    /// Server-mode listener settings
    #[serde(default)]
    pub server: ServerOptions,

    /// Dialer settings
    #[serde(default)]
    pub dialer: DialerOptions,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("SOCKET_ENGINE_HOST") {
            config.endpoint.host = host;
        }

        if let Some(port) = env_parsed::<u16>("SOCKET_ENGINE_PORT")? {
            config.endpoint.port = port;
        }

        if let Some(timeout) = env_parsed::<u64>("SOCKET_ENGINE_TIMEOUT_MS")? {
            config.endpoint.timeout = Duration::from_millis(timeout);
        }

        if let Some(limit) = env_parsed::<i64>("SOCKET_ENGINE_MAX_TERMINATIONS")? {
            config.endpoint.max_terminations = limit;
        }

        if let Some(pool) = env_parsed::<usize>("SOCKET_ENGINE_POOL_SIZE")? {
            config.server.pool_size = Some(pool);
        }

        if let Ok(passphrase) = std::env::var("SOCKET_ENGINE_PASSPHRASE") {
            config.task.passphrase = Some(passphrase);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.endpoint.validate());
        errors.extend(self.task.validate());
        errors.extend(self.server.validate());
        errors.extend(self.dialer.validate());
        errors.extend(self.logging.validate());

        if self.task.communication.transport() != self.endpoint.transport {
            errors.push(format!(
                "Communication type {:?} does not run over {:?}",
                self.task.communication, self.endpoint.transport
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Endpoint section of [`EngineConfig`]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointSettings {
    /// Transport protocol
    #[serde(default)]
    pub transport: TransportKind,

    /// Host name or IP address
    pub host: String,

    /// Port in 1..=65535
    pub port: u16,

    /// Socket buffer size
    pub buffer_size: usize,

    /// Per-operation timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Termination limit, -1 for unbounded
    pub max_terminations: i64,

    /// TLS material (TCP only)
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Multicast TTL; presence enables multicast (UDP only)
    #[serde(default)]
    pub multicast_ttl: Option<u32>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            host: String::from("127.0.0.1"),
            port: 9000,
            buffer_size: 1500,
            timeout: Duration::from_millis(1000),
            max_terminations: UNBOUNDED_TERMINATIONS,
            tls: None,
            multicast_ttl: None,
        }
    }
}

impl EndpointSettings {
    /// Validate endpoint settings
    pub fn validate(&self) -> Vec<String> {
        endpoint_errors(
            self.transport,
            &self.host,
            self.port,
            self.buffer_size,
            self.timeout.as_millis() as u64,
            self.max_terminations,
            self.tls.as_ref(),
            self.multicast_ttl,
        )
    }

    /// Turn the settings into a validated [`EndpointConfig`]
    pub fn build(&self) -> Result<EndpointConfig> {
        let mut endpoint = EndpointConfig::new(
            self.transport,
            self.host.clone(),
            self.port,
            self.buffer_size,
            self.timeout.as_millis() as u64,
            self.max_terminations,
        )?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint.with_tls(tls.clone())?;
        }
        if let Some(ttl) = self.multicast_ttl {
            endpoint = endpoint.with_multicast(ttl)?;
        }
        Ok(endpoint)
    }
}

/// Server-mode listener options
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerOptions {
    /// Concurrently admitted units; `None` disables the admission gate
    pub pool_size: Option<usize>,

    /// How long a unit waits for an admission ticket
    #[serde(with = "duration_serde")]
    pub admission_timeout: Duration,

    /// Grace period for outstanding units after a stop
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            pool_size: None,
            admission_timeout: Duration::from_millis(500),
            shutdown_grace: timeout::SHUTDOWN_GRACE,
        }
    }
}

impl ServerOptions {
    /// Gate the listener to `pool_size` concurrent units
    pub fn with_pool(pool_size: usize, admission_timeout: Duration) -> Self {
        Self {
            pool_size: Some(pool_size),
            admission_timeout,
            ..Self::default()
        }
    }

    /// Validate server options
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.pool_size == Some(0) {
            errors.push("Worker pool size must be greater than 0".to_string());
        }

        if self.admission_timeout.as_millis() < 1 {
            errors.push("Admission timeout must be at least 1ms".to_string());
        }

        if self.shutdown_grace.as_secs() > 60 {
            errors.push("Shutdown grace too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// SOCKS5 proxy configuration
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy hostname
    pub host: String,

    /// Proxy port
    pub port: u16,

    /// Proxy username (optional)
    pub username: Option<String>,

    /// Proxy password (optional)
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxyConfig {
    /// Unauthenticated proxy
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Username/password authenticated proxy
    pub fn with_credentials<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.host.is_empty() {
            errors.push("Proxy host cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("Proxy port must be in 1..=65535".to_string());
        }
        if self.username.is_some() != self.password.is_some() {
            errors.push("Proxy username and password must be set together".to_string());
        }
        for value in [&self.username, &self.password].into_iter().flatten() {
            if value.is_empty() || value.len() > 255 {
                errors.push("Proxy credentials must be 1..=255 bytes".to_string());
            }
        }
        errors
    }
}

/// Dialer options
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DialerOptions {
    /// Wait between cycles and between idle polls
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Stop once no cycle has succeeded for this long
    #[serde(with = "duration_serde")]
    pub reconnect_timeout: Duration,

    /// Optional SOCKS5 proxy
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            reconnect_timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

impl DialerOptions {
    /// Validate dialer options
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.interval.is_zero() {
            errors.push("Dialer interval must be greater than 0".to_string());
        } else if self.interval.as_secs() > 3600 {
            errors.push("Dialer interval too long (maximum: 1 hour)".to_string());
        }

        if self.reconnect_timeout.as_millis() < 1 {
            errors.push("Reconnect timeout must be at least 1ms".to_string());
        }

        if let Some(proxy) = &self.proxy {
            errors.extend(proxy.validate());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("socket-engine"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

/// Parse an environment override, failing on a value that does not parse
fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}
