use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-byte opaque identifier. Used for builds, jobs, source files, and artifacts (a job and
/// its output artifact share an ID).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Id(pub [u8; 16]);

impl Id {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random ID. Used by the coordinator to mint build IDs.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdParseError)?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| IdParseError)?;
        Ok(Self(bytes))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdParseError;

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid id: expected 32 hex characters")
    }
}

impl std::error::Error for IdParseError {}

impl From<Id> for String {
    fn from(id: Id) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for Id {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let id = Id([0xAAu8; 16]);
        let s = id.to_string();
        assert_eq!(s, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(s.parse::<Id>().unwrap(), id);
    }

    #[test]
    fn rejects_short_input() {
        assert!("aabb".parse::<Id>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let id = Id([0x31u8; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"31313131313131313131313131313131\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
