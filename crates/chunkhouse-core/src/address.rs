//! Content Addresses
//!
//! Every chunk and every container file in ChunkHouse is identified by the
//! same kind of address: a 20-byte truncated SHA-512 digest of its content.
//! Addresses render as 32 lowercase base32 characters (160 bits / 5 bits per
//! symbol, no padding) over the alphabet `0123456789abcdefghijklmnopqrstuv`,
//! which sorts the string form the same way as the raw bytes.
//!
//! The all-ones address (`vvvv…`, 32 `v`s) is reserved as the journal
//! container sentinel and never collides with a real digest in practice.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::error::Error;

#[allow(unused_imports)]
use data_encoding_macro::{internal_new_encoding, new_encoding};

/// Raw byte length of an address.
pub const ADDRESS_LEN: usize = 20;

/// Length of the base32 string form.
pub const ADDRESS_STRING_LEN: usize = 32;

const BASE32: data_encoding::Encoding = new_encoding! {
    symbols: "0123456789abcdefghijklmnopqrstuv",
};

/// A set of addresses.
pub type AddressSet = std::collections::HashSet<Address>;

/// 20-byte content address of a chunk or container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// The empty (all-zero) address.
    pub const EMPTY: Address = Address([0u8; ADDRESS_LEN]);

    /// Sentinel address of the chunk journal container. The journal is
    /// managed by the commit machinery and is never archived.
    pub const JOURNAL: Address = Address([0xFF; ADDRESS_LEN]);

    /// Hash arbitrary bytes into an address (SHA-512 truncated to 20 bytes).
    pub fn of(data: &[u8]) -> Address {
        let digest = Sha512::digest(data);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(out)
    }

    /// Parse the 32-character base32 string form.
    pub fn parse(s: &str) -> Result<Address, Error> {
        if s.len() != ADDRESS_STRING_LEN {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        let bytes = BASE32
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }

    /// Construct from a raw 20-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Address, Error> {
        if bytes.len() != ADDRESS_LEN {
            return Err(Error::InvalidAddress(format!(
                "expected {} bytes, got {}",
                ADDRESS_LEN,
                bytes.len()
            )));
        }
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(bytes);
        Ok(Address(out))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Address::EMPTY
    }

    pub fn is_journal(&self) -> bool {
        *self == Address::JOURNAL
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32.encode(&self.0))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}
