//! Address/identity newtypes shared by the coordinator, worker, and client CLIs, plus the
//! `clap` parsing glue for them.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use url::Url;

/// The coordinator's externally reachable HTTP endpoint, e.g. `http://10.0.0.1:9000`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoordinatorAddr(Url);

impl CoordinatorAddr {
    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl FromStr for CoordinatorAddr {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Url::parse(s)?))
    }
}

impl fmt::Display for CoordinatorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker's identity: a URL string embedding its own externally reachable endpoint. Other
/// workers use this to fetch artifacts peer-to-peer; the coordinator uses it purely as an opaque
/// key.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

/// The address a server should bind to, distinct from the address it advertises to others (the
/// two differ behind NAT or in containers exposing a different port).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BindAddr(pub SocketAddr);

impl FromStr for BindAddr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
