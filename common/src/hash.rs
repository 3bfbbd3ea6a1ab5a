use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, ops::Deref, str::FromStr};

/// Data that is a cryptographic digest of `BYTES` long.
///
/// This is a generic wrapper around a fixed-size byte array that provides:
/// - Hexadecimal serialization/deserialization
/// - Type-safe conversions from various byte representations
/// - Display and debug formatting
///
/// # Common sizes
///
/// - **32 bytes**: block roots, transaction hashes
/// - **20 bytes**: account addresses
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash<const BYTES: usize>([u8; BYTES]);

impl<const BYTES: usize> Default for Hash<BYTES> {
    fn default() -> Self {
        Self::new([0u8; BYTES])
    }
}

// Implement Serialize/Deserialize manually since generic const arrays don't auto-derive
impl<const BYTES: usize> Serialize for Hash<BYTES> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de, const BYTES: usize> Deserialize<'de> for Hash<BYTES> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl<const BYTES: usize> Hash<BYTES> {
    /// Creates a new hash from a byte array.
    ///
    /// This is a const function, allowing hashes to be created at compile time.
    #[inline]
    pub const fn new(bytes: [u8; BYTES]) -> Self {
        Self(bytes)
    }

    /// Converts the hash to a `Vec<u8>`.
    #[inline]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Consumes the hash and returns the inner byte array.
    #[inline]
    pub fn into_inner(self) -> [u8; BYTES] {
        self.0
    }

    /// True if every byte is zero (the uninitialized/placeholder value).
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl<const BYTES: usize> From<[u8; BYTES]> for Hash<BYTES> {
    #[inline]
    fn from(bytes: [u8; BYTES]) -> Self {
        Self::new(bytes)
    }
}

impl<const BYTES: usize> TryFrom<&[u8]> for Hash<BYTES> {
    type Error = std::array::TryFromSliceError;

    /// Attempts to create a hash from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length does not match `BYTES`.
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let hash: [u8; BYTES] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl<const BYTES: usize> TryFrom<Vec<u8>> for Hash<BYTES> {
    type Error = Vec<u8>;

    /// Attempts to create a hash from a `Vec<u8>`.
    ///
    /// # Errors
    ///
    /// Returns the original vector if its length does not match `BYTES`.
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let hash: [u8; BYTES] = value.try_into()?;
        Ok(Self::new(hash))
    }
}

impl<const BYTES: usize> From<Hash<BYTES>> for Vec<u8> {
    fn from(hash: Hash<BYTES>) -> Self {
        hash.0.to_vec()
    }
}

impl<const BYTES: usize> From<Hash<BYTES>> for [u8; BYTES] {
    fn from(hash: Hash<BYTES>) -> Self {
        hash.0
    }
}

impl<const BYTES: usize> AsRef<[u8]> for Hash<BYTES> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const BYTES: usize> Deref for Hash<BYTES> {
    type Target = [u8; BYTES];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const BYTES: usize> PartialEq<[u8]> for Hash<BYTES> {
    fn eq(&self, other: &[u8]) -> bool {
        self.0.eq(other)
    }
}

impl<const BYTES: usize> fmt::Debug for Hash<BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(&format!("Hash<{BYTES}>")).field(&hex::encode(self)).finish()
    }
}

impl<const BYTES: usize> fmt::Display for Hash<BYTES> {
    /// Formats the hash as a lowercase hexadecimal string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self))
    }
}

impl<const BYTES: usize> FromStr for Hash<BYTES> {
    type Err = hex::FromHexError;

    /// Parses a hash from a hexadecimal string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The string is not valid hexadecimal
    /// - The decoded bytes do not match the expected length `BYTES`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; BYTES];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;
        Ok(Self::new(bytes))
    }
}

impl<const BYTES: usize> hex::FromHex for Hash<BYTES> {
    type Error = hex::FromHexError;

    /// Decodes a hash from hexadecimal bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoded length does not match `BYTES`.
    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        match Self::try_from(Vec::<u8>::from_hex(hex)?) {
            Ok(h) => Ok(h),
            Err(_) => Err(hex::FromHexError::InvalidStringLength),
        }
    }
}

/// A 32-byte block content root.
pub type Root = Hash<32>;

/// A 32-byte transaction hash.
pub type TxHash = Hash<32>;

/// A 20-byte account address.
pub type Address = Hash<20>;
