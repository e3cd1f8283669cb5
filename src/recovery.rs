//! Recovery keys and the cache that hands a used recovery key to later
//! boot stages.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const RECOVERY_KEY_SIZE: usize = 16;
const GROUPS: usize = RECOVERY_KEY_SIZE / 2;
const GROUP_DIGITS: usize = 5;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKeyError {
    #[error("incorrectly formatted (insufficient characters)")]
    InsufficientCharacters,
    #[error("incorrectly formatted (invalid base-10 number)")]
    InvalidNumber,
    #[error("incorrectly formatted (too many characters)")]
    TooManyCharacters,
}

/// A 128-bit key, shown to the user as eight groups of five decimal digits.
/// Each group is one little-endian 16-bit word of the key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_SIZE]);

impl RecoveryKey {
    pub fn new(bytes: [u8; RECOVERY_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; RECOVERY_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; RECOVERY_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(..)")
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:05}", u16::from_le_bytes([word[0], word[1]]))?;
        }
        Ok(())
    }
}

/// Hyphens between groups are optional. Every group must have exactly five
/// digits.
impl FromStr for RecoveryKey {
    type Err = RecoveryKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut key = [0u8; RECOVERY_KEY_SIZE];
        let mut rest = s;
        for i in 0..GROUPS {
            if rest.len() < GROUP_DIGITS {
                return Err(RecoveryKeyError::InsufficientCharacters);
            }
            let group = rest
                .get(..GROUP_DIGITS)
                .filter(|g| g.bytes().all(|b| b.is_ascii_digit()))
                .ok_or(RecoveryKeyError::InvalidNumber)?;
            // groups above 65535 don't fit a word and are rejected as malformed
            let word: u16 = group.parse().map_err(|_| RecoveryKeyError::InvalidNumber)?;
            key[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());

            rest = &rest[GROUP_DIGITS..];
            if rest.len() > 1 && rest.starts_with('-') {
                rest = &rest[1..];
            }
        }
        if !rest.is_empty() {
            key.zeroize();
            return Err(RecoveryKeyError::TooManyCharacters);
        }
        Ok(Self(key))
    }
}

/// Why the recovery key was needed, recorded with the cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKeyUsageReason {
    UnexpectedError = 1,
    Requested,
    InvalidKeyFile,
    TpmLockout,
    TpmProvisioningError,
    PinFail,
}

impl RecoveryKeyUsageReason {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for RecoveryKeyUsageReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Description of the recovery key that `program` used to activate
/// `volume_name`, for `reason`.
pub fn cache_description(program: &str, volume_name: &str, reason: RecoveryKeyUsageReason) -> String {
    format!("{}:{}:reason={}", program, volume_name, reason)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("the secret cache already has an entry with description {0:?}")]
    Exists(String),
}

type Entries = BTreeMap<String, Zeroizing<Vec<u8>>>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    // entries are inserted whole, so a poisoned map is still consistent
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Secrets recovered during activation, keyed by description. Entries can
/// be added but never replaced or removed.
#[derive(Default)]
pub struct SecretCache {
    entries: Arc<Mutex<Entries>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> CacheWriter {
        CacheWriter {
            entries: Arc::clone(&self.entries),
        }
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader {
            entries: Arc::clone(&self.entries),
        }
    }
}

#[derive(Clone)]
pub struct CacheWriter {
    entries: Arc<Mutex<Entries>>,
}

impl CacheWriter {
    pub fn add(&self, description: &str, secret: &[u8]) -> Result<(), CacheError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(description) {
            return Err(CacheError::Exists(description.to_string()));
        }
        entries.insert(description.to_string(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct CacheReader {
    entries: Arc<Mutex<Entries>>,
}

impl CacheReader {
    pub fn get(&self, description: &str) -> Option<Zeroizing<Vec<u8>>> {
        lock(&self.entries).get(description).cloned()
    }

    pub fn descriptions(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [
        0xe1, 0x5f, 0x40, 0x9d, 0x4a, 0x11, 0x0b, 0x38, 0xf2, 0x2c, 0x00, 0x00, 0xff, 0xff, 0x01, 0x00,
    ];

    #[test]
    fn display_groups() {
        assert_eq!(
            RecoveryKey::new(KEY).to_string(),
            "24545-40256-04426-14347-11506-00000-65535-00001"
        );
    }

    #[test]
    fn parse_with_and_without_hyphens() -> Result<()> {
        let key: RecoveryKey = "24545-40256-04426-14347-11506-00000-65535-00001".parse()?;
        assert_eq!(key.as_bytes(), &KEY);
        let key: RecoveryKey = "2454540256044261434711506000006553500001".parse()?;
        assert_eq!(key.as_bytes(), &KEY);
        Ok(())
    }

    #[test]
    fn parse_errors() {
        let cases = [
            ("1234", RecoveryKeyError::InsufficientCharacters),
            ("00000-1234", RecoveryKeyError::InsufficientCharacters),
            ("00000-123bc", RecoveryKeyError::InvalidNumber),
            ("00000-+1234", RecoveryKeyError::InvalidNumber),
            ("00000-65536-00000-00000-00000-00000-00000-00000", RecoveryKeyError::InvalidNumber),
            ("00000-00000-00000-00000-00000-00000-00000-99999", RecoveryKeyError::InvalidNumber),
            ("00000-00000-00000-00000-00000-00000-00000-00000-", RecoveryKeyError::TooManyCharacters),
            ("00000-00000-00000-00000-00000-00000-00000-000001", RecoveryKeyError::TooManyCharacters),
            ("00000-00000-00000-00000-00000-00000-00000-0000é", RecoveryKeyError::InvalidNumber),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<RecoveryKey>().err(), Some(expected), "{}", input);
        }
    }

    #[test]
    fn cache_is_append_only() -> Result<()> {
        let cache = SecretCache::new();
        let writer = cache.writer();
        let reader = cache.reader();
        let description = cache_description("prog", "data", RecoveryKeyUsageReason::Requested);
        assert_eq!(description, "prog:data:reason=2");
        assert_eq!(
            cache_description("prog", "home", RecoveryKeyUsageReason::PinFail),
            "prog:home:reason=6"
        );

        writer.add(&description, b"first")?;
        assert_eq!(
            writer.add(&description, b"second"),
            Err(CacheError::Exists(description.clone()))
        );
        assert_eq!(reader.get(&description).as_deref().map(Vec::as_slice), Some(&b"first"[..]));
        assert_eq!(reader.descriptions(), vec![description]);
        Ok(())
    }

    proptest! {
        #[test]
        fn display_parses_back(bytes in any::<[u8; 16]>()) {
            let key = RecoveryKey::new(bytes);
            let parsed: RecoveryKey = key.to_string().parse().map_err(|e| TestCaseError::fail(format!("{}", e)))?;
            prop_assert_eq!(parsed.as_bytes(), &bytes);
        }
    }
}
