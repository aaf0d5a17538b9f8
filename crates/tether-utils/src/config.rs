//! # Environment Configuration
//!
//! Settings shared by the stub server and the debugger front end, read from
//! `TETHER_*` environment variables. Command-line flags override them.
//!
//! | Variable            | Default          | Meaning                                   |
//! |---------------------|------------------|-------------------------------------------|
//! | `TETHER_ADDRESS`    | `127.0.0.1:4014` | Listen / connect address (`A.B.C.D:port`) |
//! | `TETHER_TIMEOUT_MS` | `5000`           | Request and acknowledgement wait budget   |
//! | `TETHER_POLL_MS`    | `10`             | Stub idle poll interval                   |
//! | `TETHER_WIRE_LOG`   | off              | Log every framed packet                   |
//! | `TETHER_SEQUENCE`   | off              | Send `SS:` sequence numbers               |
//! | `TETHER_NO_ACK`     | off              | Skip `+`/`-` acknowledgements             |
//!
//! Switches accept `1`, `true`, `yes`, `on` and `0`, `false`, `no`, `off`
//! (or an empty value). Anything else is a [`ConfigError`].

use std::env;
use std::time::Duration;

use tether_protocol::{SocketAddress, TransportFlags};

/// Default address of the stub server.
pub const DEFAULT_ADDRESS: SocketAddress = SocketAddress::new([127, 0, 0, 1], 4014);

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default stub poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError
{
    /// A variable holds a value that cannot be parsed
    #[error("Invalid value for {variable}: {value:?}")]
    InvalidValue
    {
        /// The environment variable
        variable: &'static str,
        /// The rejected value
        value: String,
    },
}

/// Settings for the `tether` binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TetherConfig
{
    /// Stub listen address, or the address the client connects to.
    pub address: SocketAddress,
    /// Wait budget for requests and acknowledgements.
    pub timeout: Duration,
    /// How long the stub sleeps between idle polls.
    pub poll_interval: Duration,
    /// Log every framed packet sent and received.
    pub wire_log: bool,
    /// Number client requests with `SS:` prefixes.
    pub sequence: bool,
    /// Neither send nor expect acknowledgements.
    pub no_ack: bool,
}

impl Default for TetherConfig
{
    fn default() -> Self
    {
        Self {
            address: DEFAULT_ADDRESS,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wire_log: false,
            sequence: false,
            no_ack: false,
        }
    }
}

impl TetherConfig
{
    /// Load the configuration from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first variable that
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use tether_utils::TetherConfig;
    ///
    /// let config = TetherConfig::from_lookup(|name| match name {
    ///     "TETHER_TIMEOUT_MS" => Some("250".to_string()),
    ///     "TETHER_SEQUENCE" => Some("yes".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    ///
    /// assert_eq!(config.timeout, Duration::from_millis(250));
    /// assert!(config.sequence);
    /// assert_eq!(config.address.to_string(), "127.0.0.1:4014");
    /// ```
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first variable that
    /// does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("TETHER_ADDRESS") {
            let address = SocketAddress::parse(&value);
            if address.port() == 0 {
                return Err(invalid("TETHER_ADDRESS", value));
            }
            config.address = address;
        }
        if let Some(value) = lookup("TETHER_TIMEOUT_MS") {
            config.timeout = parse_millis("TETHER_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("TETHER_POLL_MS") {
            config.poll_interval = parse_millis("TETHER_POLL_MS", value)?;
        }
        if let Some(value) = lookup("TETHER_WIRE_LOG") {
            config.wire_log = parse_switch("TETHER_WIRE_LOG", value)?;
        }
        if let Some(value) = lookup("TETHER_SEQUENCE") {
            config.sequence = parse_switch("TETHER_SEQUENCE", value)?;
        }
        if let Some(value) = lookup("TETHER_NO_ACK") {
            config.no_ack = parse_switch("TETHER_NO_ACK", value)?;
        }

        Ok(config)
    }

    /// Transport flags for the debugger side.
    #[must_use]
    pub fn client_flags(&self) -> TransportFlags
    {
        TransportFlags {
            ignore_ack: self.no_ack,
            use_sequence: self.sequence,
            ..TransportFlags::default()
        }
        .with_wire_log(self.wire_log)
    }

    /// Transport flags for the stub side.
    ///
    /// The stub never numbers its own packets; it echoes the numbers it
    /// receives.
    #[must_use]
    pub fn stub_flags(&self) -> TransportFlags
    {
        TransportFlags {
            ignore_ack: self.no_ack,
            ..TransportFlags::default()
        }
        .with_wire_log(self.wire_log)
    }
}

fn invalid(variable: &'static str, value: String) -> ConfigError
{
    ConfigError::InvalidValue { variable, value }
}

fn parse_millis(variable: &'static str, value: String) -> Result<Duration, ConfigError>
{
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Duration::from_millis(millis)),
        _ => Err(invalid(variable, value)),
    }
}

fn parse_switch(variable: &'static str, value: String) -> Result<bool, ConfigError>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(variable, value)),
    }
}
