use std::fmt;

/// Direction of an observed connection relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Unspecified,
    Incoming,
    Outgoing,
    Local,
    None,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Local => "local",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Family {
    #[default]
    V4,
    V6,
}

/// Transport of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionType {
    #[default]
    Tcp,
    Udp,
}

/// One side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Addr {
    pub ip: String,
    pub port: u16,
}

impl Addr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

/// A connection record supplied by a connection sampler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connection {
    pub laddr: Addr,
    pub raddr: Addr,
    pub direction: Direction,
    pub family: Family,
    pub conn_type: ConnectionType,
}

impl Connection {
    /// Convenience constructor for an outgoing IPv4 TCP connection.
    pub fn outgoing(laddr: Addr, raddr: Addr) -> Self {
        Self {
            laddr,
            raddr,
            direction: Direction::Outgoing,
            ..Default::default()
        }
    }
}
