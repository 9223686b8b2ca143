//! The bootstrap line a plugin prints on stdout when it starts listening.
//!
//! ```text
//! <core_protocol_version>|<app_protocol_version>|<network>|<address>\n
//! ```
//!
//! The line must be the first thing on the child's stdout, terminated by a
//! single newline. `network` is `tcp` or `unix`; for `tcp` the address is
//! `host:port` (an empty host means any interface), for `unix` it is a
//! filesystem path.
//!
//! A bare `<network>|<address>` announcement is also accepted, since the
//! version fields are advisory: the core version gates nothing at parse
//! time and the app version is reserved for user-level versioning.

use std::path::PathBuf;

/// Protocol version of the plugin system itself.
///
/// Incremented whenever the transport behavior changes; a bump invalidates
/// every existing plugin.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Default application-level protocol version announced by plugins.
pub const DEFAULT_APP_PROTOCOL_VERSION: u32 = 1;

/// A plugin's announced listening address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginAddr {
    /// `host:port`; the host may be empty, meaning any interface.
    Tcp(String),
    /// A unix-domain socket path.
    Unix(PathBuf),
}

impl PluginAddr {
    /// The address family as announced on the wire.
    #[must_use]
    pub const fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }
}

impl std::fmt::Display for PluginAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A parsed handshake line.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Announced core protocol version.
    pub core_protocol: u32,
    /// Announced application protocol version; not enforced by the runtime.
    pub app_protocol: u32,
    /// Where the plugin is listening.
    pub addr: PluginAddr,
}

impl Handshake {
    /// Parse one line read from a plugin's stdout.
    ///
    /// Surrounding whitespace is trimmed. A full four-field line carries the
    /// family and address in fields three and four (the address absorbs any
    /// further `|`); a two-field line is read as `<network>|<address>`.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Unrecognized`] for anything else, and
    /// [`HandshakeError::UnknownAddressType`] for a family that is neither
    /// `tcp` nor `unix`.
    pub fn parse_line(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim();
        let parts: Vec<&str> = line.splitn(4, '|').collect();

        let (core_protocol, app_protocol, network, address) = match parts.as_slice() {
            [network, address] => (
                CORE_PROTOCOL_VERSION,
                DEFAULT_APP_PROTOCOL_VERSION,
                *network,
                *address,
            ),
            [core, app, network, address] => {
                let core = core
                    .parse()
                    .map_err(|_| HandshakeError::Unrecognized(line.to_string()))?;
                let app = app
                    .parse()
                    .map_err(|_| HandshakeError::Unrecognized(line.to_string()))?;
                (core, app, *network, *address)
            },
            _ => return Err(HandshakeError::Unrecognized(line.to_string())),
        };

        let addr = match network {
            "tcp" => PluginAddr::Tcp(address.to_string()),
            "unix" => PluginAddr::Unix(PathBuf::from(address)),
            other => return Err(HandshakeError::UnknownAddressType(other.to_string())),
        };

        Ok(Self {
            core_protocol,
            app_protocol,
            addr,
        })
    }

    /// Render the four-field announcement line, without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.core_protocol,
            self.app_protocol,
            self.addr.network(),
            self.addr
        )
    }
}

/// Handshake parse errors.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The line does not look like a plugin announcement at all.
    #[error(
        "Unrecognized remote plugin message: {0}\n\n\
         This usually means that the plugin is either invalid or simply\n\
         needs to be recompiled to support the latest protocol."
    )]
    Unrecognized(String),

    /// The announced address family is not supported.
    #[error("Unknown address type: {0}")]
    UnknownAddressType(String),
}
