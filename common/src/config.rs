//! Persisted station configuration.
//!
//! The configuration lives in a 20 byte non-volatile region:
//!
//! ```text
//! 0               16          20
//! +---------------+-----------+
//! | Credential    | Interval  |
//! +---------------+-----------+
//! ```
//!
//! - `Credential`: upload API key, NUL padded (16 bytes)
//! - `Interval`: seconds between wake cycles (4 bytes, u32, LE)
//!
//! There is no version byte and no checksum. Whatever bytes are present are
//! decoded as-is.

use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

pub const CREDENTIAL_LEN: usize = 16;
pub const INTERVAL_OFFSET: usize = CREDENTIAL_LEN;
pub const CONFIG_LEN: usize = INTERVAL_OFFSET + 4;

pub const DEFAULT_INTERVAL_SECONDS: u32 = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationConfig {
    pub credential: String,
    pub interval_seconds: u32,
}

impl StationConfig {
    pub fn new(credential: &str, interval_seconds: u32) -> Self {
        Self {
            credential: truncate_credential(credential).to_string(),
            interval_seconds,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        !self.credential.is_empty()
    }

    /// Sleep duration between wake cycles. An interval of zero falls back to
    /// [`DEFAULT_INTERVAL_SECONDS`].
    pub fn sleep_duration(&self) -> Duration {
        let seconds = if self.interval_seconds == 0 {
            DEFAULT_INTERVAL_SECONDS
        } else {
            self.interval_seconds
        };
        Duration::from_secs(u64::from(seconds))
    }

    pub fn encode(&self) -> [u8; CONFIG_LEN] {
        let mut bytes = [0_u8; CONFIG_LEN];
        let credential = truncate_credential(&self.credential).as_bytes();
        bytes[..credential.len()].copy_from_slice(credential);
        bytes[INTERVAL_OFFSET..].copy_from_slice(&self.interval_seconds.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; CONFIG_LEN]) -> Self {
        let raw = &bytes[..CREDENTIAL_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(CREDENTIAL_LEN);
        let credential = match std::str::from_utf8(&raw[..end]) {
            Ok(value) => value,
            // Garbage region: keep the valid prefix only.
            Err(err) => std::str::from_utf8(&raw[..err.valid_up_to()]).unwrap_or_default(),
        };

        let mut interval = [0_u8; 4];
        interval.copy_from_slice(&bytes[INTERVAL_OFFSET..]);

        Self {
            credential: credential.to_string(),
            interval_seconds: u32::from_le_bytes(interval),
        }
    }
}

/// Cuts `value` to at most [`CREDENTIAL_LEN`] bytes without splitting a
/// character.
pub fn truncate_credential(value: &str) -> &str {
    if value.len() <= CREDENTIAL_LEN {
        return value;
    }
    let mut end = CREDENTIAL_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read configuration region: {0}")]
    Read(String),
    #[error("failed to write configuration region: {0}")]
    Write(String),
    #[error("failed to commit configuration region: {0}")]
    Commit(String),
}

/// An opened non-volatile region holding exactly [`CONFIG_LEN`] bytes.
pub trait ConfigRegion {
    fn read(&mut self, buf: &mut [u8; CONFIG_LEN]) -> Result<(), StorageError>;
    fn write(&mut self, bytes: &[u8; CONFIG_LEN]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// Owns an opened [`ConfigRegion`]. Dropping the store closes the region.
pub struct ConfigStore<R> {
    region: R,
}

impl<R: ConfigRegion> ConfigStore<R> {
    pub fn open(region: R) -> Self {
        Self { region }
    }

    pub fn load(&mut self) -> StationConfig {
        let mut bytes = [0_u8; CONFIG_LEN];
        if let Err(err) = self.region.read(&mut bytes) {
            warn!("{err}; treating configuration region as empty");
            bytes = [0_u8; CONFIG_LEN];
        }

        let config = StationConfig::decode(&bytes);
        info!(
            "config loaded: apiKeySet={} interval={}s",
            config.is_provisioned(),
            config.interval_seconds
        );
        config
    }

    pub fn save(&mut self, config: &StationConfig) -> Result<(), StorageError> {
        self.region.write(&config.encode())?;
        self.region.commit()
    }

    /// Saves only when the encoded bytes differ from what the region holds.
    /// Returns whether a write happened.
    pub fn save_if_changed(&mut self, config: &StationConfig) -> Result<bool, StorageError> {
        let mut current = [0_u8; CONFIG_LEN];
        if self.region.read(&mut current).is_ok() && current == config.encode() {
            return Ok(false);
        }
        self.save(config)?;
        Ok(true)
    }

    pub fn into_region(self) -> R {
        self.region
    }
}

/// RAM-backed region. Writes become visible to reads only after `commit`.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    committed: [u8; CONFIG_LEN],
    pending: Option<[u8; CONFIG_LEN]>,
    pub fail_commit: bool,
    pub commits: u32,
}

impl MemoryRegion {
    pub fn new(bytes: [u8; CONFIG_LEN]) -> Self {
        Self {
            committed: bytes,
            pending: None,
            fail_commit: false,
            commits: 0,
        }
    }

    pub fn bytes(&self) -> &[u8; CONFIG_LEN] {
        &self.committed
    }
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self::new([0_u8; CONFIG_LEN])
    }
}

impl ConfigRegion for MemoryRegion {
    fn read(&mut self, buf: &mut [u8; CONFIG_LEN]) -> Result<(), StorageError> {
        buf.copy_from_slice(&self.committed);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8; CONFIG_LEN]) -> Result<(), StorageError> {
        self.pending = Some(*bytes);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_commit {
            self.pending = None;
            return Err(StorageError::Commit("simulated flash failure".to_string()));
        }
        if let Some(bytes) = self.pending.take() {
            self.committed = bytes;
            self.commits = self.commits.saturating_add(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn save_then_load_returns_same_config() {
        let mut store = ConfigStore::open(MemoryRegion::default());
        let config = StationConfig::new("ABCDEF0123456789", 300);

        store.save(&config).unwrap();

        assert_eq!(store.load(), config);
    }

    #[test]
    fn long_credential_is_truncated_on_save() {
        let mut store = ConfigStore::open(MemoryRegion::default());
        let config = StationConfig {
            credential: "0123456789ABCDEFXYZ".to_string(),
            interval_seconds: 60,
        };

        store.save(&config).unwrap();
        let loaded = store.load();

        assert_eq!(loaded.credential, "0123456789ABCDEF");
        assert_eq!(loaded.interval_seconds, 60);
    }

    #[test]
    fn truncation_keeps_char_boundary() {
        // 15 ASCII bytes followed by a two byte character.
        let value = "aaaaaaaaaaaaaaaé";
        assert_eq!(truncate_credential(value), "aaaaaaaaaaaaaaa");
    }

    #[test]
    fn all_zero_region_loads_empty_config() {
        let mut store = ConfigStore::open(MemoryRegion::default());
        let config = store.load();

        assert_eq!(config.credential, "");
        assert_eq!(config.interval_seconds, 0);
        assert!(!config.is_provisioned());
    }

    #[test]
    fn layout_is_fixed() {
        let bytes = StationConfig::new("KEY", 0x0102_0304).encode();

        assert_eq!(&bytes[..3], b"KEY");
        assert!(bytes[3..16].iter().all(|b| *b == 0));
        assert_eq!(&bytes[16..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn garbage_region_decodes_without_panicking() {
        let mut bytes = [0xFF_u8; CONFIG_LEN];
        bytes[0] = b'o';
        bytes[1] = b'k';

        let config = StationConfig::decode(&bytes);

        assert_eq!(config.credential, "ok");
        assert_eq!(config.interval_seconds, u32::MAX);
    }

    #[test]
    fn full_width_credential_has_no_terminator() {
        let mut bytes = [0_u8; CONFIG_LEN];
        bytes[..16].copy_from_slice(b"ABCDEFGHIJKLMNOP");
        bytes[16] = 30;

        let config = StationConfig::decode(&bytes);

        assert_eq!(config.credential, "ABCDEFGHIJKLMNOP");
        assert_eq!(config.interval_seconds, 30);
    }

    #[test]
    fn commit_failure_is_reported() {
        let region = MemoryRegion {
            fail_commit: true,
            ..MemoryRegion::default()
        };
        let mut store = ConfigStore::open(region);

        let result = store.save(&StationConfig::new("KEY", 60));

        assert!(matches!(result, Err(StorageError::Commit(_))));
        assert_eq!(store.into_region().bytes(), &[0_u8; CONFIG_LEN]);
    }

    /// Region whose reads scribble over the buffer and then fail.
    struct UnreadableRegion;

    impl ConfigRegion for UnreadableRegion {
        fn read(&mut self, buf: &mut [u8; CONFIG_LEN]) -> Result<(), StorageError> {
            *buf = [0xAA_u8; CONFIG_LEN];
            Err(StorageError::Read("nvs handle closed".to_string()))
        }

        fn write(&mut self, _bytes: &[u8; CONFIG_LEN]) -> Result<(), StorageError> {
            Ok(())
        }

        fn commit(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn read_error_loads_empty_config() {
        let mut store = ConfigStore::open(UnreadableRegion);

        assert_eq!(store.load(), StationConfig::default());
    }

    #[test]
    fn unchanged_config_is_not_rewritten() {
        let mut store = ConfigStore::open(MemoryRegion::default());
        let config = StationConfig::new("KEY", 60);

        assert!(store.save_if_changed(&config).unwrap());
        assert!(!store.save_if_changed(&config).unwrap());
        assert_eq!(store.into_region().commits, 1);
    }

    #[test]
    fn zero_interval_sleeps_for_default() {
        let config = StationConfig::new("KEY", 0);
        assert_eq!(
            config.sleep_duration(),
            Duration::from_secs(u64::from(DEFAULT_INTERVAL_SECONDS))
        );
        assert_eq!(
            StationConfig::new("KEY", 45).sleep_duration(),
            Duration::from_secs(45)
        );
    }
}
