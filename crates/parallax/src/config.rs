//! Persistent device configuration.
//!
//! A [`ConfigStore`] is a small key/value store that survives restarts: on
//! the terminal it is NVS flash, in a std process it is a postcard file.
//! [`DeviceConfig`] puts typed accessors on top of whichever store is used.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    Guarded,
    logging::{debug, error, warn},
    settings::{MANUFACTURING_DEVICE_ID, MAX_DEVICE_NAME, MAX_SERVER_IP},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    DeviceId,
    FwCookie,
    Journal,
    JournalValid,
    DeviceName,
    Ssid,
    Password,
    ServerIp,
    ServerPort,
    Bricked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    Io(ErrorKind),
    Encode,
    Decode,
    TooLong { max: usize, got: usize },
    /// The stored value has the wrong shape for its key.
    Corrupt(ConfigKey),
    /// The backing medium refused the write.
    WriteFailed,
    NoSpace,
    NotFound,
}

pub trait ConfigStore: Send + Sync + 'static {
    fn get(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError>;
}

/// Why the device refuses logins, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickedCode(pub u8);

impl BrickedCode {
    pub const NOT_BRICKED: Self = Self(0);
    pub const UNKNOWN_LOGIN: Self = Self(1);
    pub const FAILED_TO_DELETE_THUMB: Self = Self(2);

    pub fn is_bricked(&self) -> bool {
        *self != Self::NOT_BRICKED
    }
}

/// Keeps everything in memory. Writes can be made to fail on demand.
pub struct MemConfigStore {
    items: Guarded<BTreeMap<ConfigKey, Vec<u8>>>,
    fail_writes: AtomicBool,
}

/// A postcard encoded map in a single file, rewritten on every set.
pub struct FileConfigStore {
    path: PathBuf,
    items: Guarded<BTreeMap<ConfigKey, Vec<u8>>>,
    /// Held across a snapshot and its file write so snapshots land in order.
    /// The `items` guard is never held during file IO.
    disk: Mutex<()>,
}

/// Typed view over a [`ConfigStore`].
#[derive(Clone)]
pub struct DeviceConfig {
    store: Arc<dyn ConfigStore>,
}

// ---- impls ----

impl MemConfigStore {
    pub fn new() -> Self {
        Self {
            items: Guarded::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following `set` fail with [`StoreError::WriteFailed`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Default for MemConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemConfigStore {
    fn get(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.with_lock(|items| items.get(&key).cloned()))
    }

    fn set(&self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StoreError::WriteFailed);
        }
        self.items.with_lock(|items| {
            items.insert(key, value.to_vec());
        });
        Ok(())
    }
}

impl FileConfigStore {
    /// Loads `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let items = match std::fs::read(&path) {
            Ok(raw) => postcard::from_bytes(&raw).map_err(|e| {
                error!("Config file {} unreadable: {e:?}", path.display());
                StoreError::Decode
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(StoreError::Io(e.kind())),
        };
        Ok(Self {
            path,
            items: Guarded::new(items),
            disk: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(path: &Path, raw: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| StoreError::Io(e.kind()))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::Io(e.kind()))
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, key: ConfigKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.with_lock(|items| items.get(&key).cloned()))
    }

    fn set(&self, key: ConfigKey, value: &[u8]) -> Result<(), StoreError> {
        let _disk = self.disk.lock().unwrap_or_else(PoisonError::into_inner);
        let (old, raw) = self.items.with_lock(|items| {
            let old = items.insert(key, value.to_vec());
            (old, postcard::to_stdvec(items))
        });
        let res = match raw {
            Ok(raw) => Self::persist(&self.path, &raw),
            Err(_) => Err(StoreError::Encode),
        };
        if res.is_err() {
            // keep memory and disk in agreement
            self.items.with_lock(|items| match old {
                Some(old) => items.insert(key, old),
                None => items.remove(&key),
            });
        }
        res
    }
}

impl DeviceConfig {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    fn get_fixed<const N: usize>(&self, key: ConfigKey) -> Result<Option<[u8; N]>, StoreError> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(raw) => raw.try_into().map(Some).map_err(|_| StoreError::Corrupt(key)),
        }
    }

    fn get_string(&self, key: ConfigKey) -> Result<Option<String>, StoreError> {
        match self.store.get(key)? {
            None => Ok(None),
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| StoreError::Corrupt(key)),
        }
    }

    fn set_string(&self, key: ConfigKey, value: &str, max: usize) -> Result<(), StoreError> {
        if value.len() >= max {
            return Err(StoreError::TooLong {
                max: max - 1,
                got: value.len(),
            });
        }
        self.store.set(key, value.as_bytes())
    }

    /// The server assigned id, or the manufacturing id when none is stored
    /// or the store cannot be read.
    pub fn device_id(&self) -> u64 {
        match self.get_fixed::<8>(ConfigKey::DeviceId) {
            Ok(Some(raw)) => u64::from_le_bytes(raw),
            Ok(None) => MANUFACTURING_DEVICE_ID,
            Err(e) => {
                error!("Failed to read device id: {e:?}");
                MANUFACTURING_DEVICE_ID
            }
        }
    }

    pub fn set_device_id(&self, id: u64) -> Result<(), StoreError> {
        self.store.set(ConfigKey::DeviceId, &id.to_le_bytes())
    }

    pub fn device_name(&self) -> Option<String> {
        self.get_string(ConfigKey::DeviceName)
            .inspect_err(|e| warn!("Failed to read device name: {e:?}"))
            .ok()
            .flatten()
    }

    pub fn set_device_name(&self, name: &str) -> Result<(), StoreError> {
        self.set_string(ConfigKey::DeviceName, name, MAX_DEVICE_NAME)
    }

    pub fn bricked(&self) -> BrickedCode {
        match self.get_fixed::<1>(ConfigKey::Bricked) {
            Ok(Some([code])) => BrickedCode(code),
            Ok(None) => BrickedCode::NOT_BRICKED,
            Err(e) => {
                error!("Failed to read bricked code: {e:?}");
                BrickedCode::NOT_BRICKED
            }
        }
    }

    pub fn set_bricked(&self, code: BrickedCode) -> Result<(), StoreError> {
        self.store.set(ConfigKey::Bricked, &[code.0])
    }

    pub fn fw_cookie(&self) -> u8 {
        match self.get_fixed::<1>(ConfigKey::FwCookie) {
            Ok(Some([c])) => c,
            _ => 0,
        }
    }

    pub fn set_fw_cookie(&self, cookie: u8) -> Result<(), StoreError> {
        self.store.set(ConfigKey::FwCookie, &[cookie])
    }

    /// The slot an interrupted user edit was working on, if any.
    pub fn journal(&self) -> Result<Option<u16>, StoreError> {
        let valid = self.get_fixed::<1>(ConfigKey::JournalValid)?;
        if valid != Some([1]) {
            return Ok(None);
        }
        match self.get_fixed::<2>(ConfigKey::Journal)? {
            Some(raw) => Ok(Some(u16::from_le_bytes(raw))),
            None => Err(StoreError::Corrupt(ConfigKey::Journal)),
        }
    }

    pub fn set_journal(&self, slot: u16) -> Result<(), StoreError> {
        self.store.set(ConfigKey::Journal, &slot.to_le_bytes())?;
        self.store.set(ConfigKey::JournalValid, &[1])
    }

    pub fn clear_journal(&self) -> Result<(), StoreError> {
        self.store.set(ConfigKey::JournalValid, &[0])
    }

    /// Backend host and port.
    pub fn server_addr(&self) -> Option<(String, u16)> {
        let ip = self.get_string(ConfigKey::ServerIp).ok()??;
        let port = self.get_fixed::<2>(ConfigKey::ServerPort).ok()??;
        Some((ip, u16::from_le_bytes(port)))
    }

    pub fn set_server_addr(&self, ip: &str, port: u16) -> Result<(), StoreError> {
        self.set_string(ConfigKey::ServerIp, ip, MAX_SERVER_IP)?;
        self.store.set(ConfigKey::ServerPort, &port.to_le_bytes())
    }

    pub fn wifi_credentials(&self) -> Option<(String, String)> {
        let ssid = self.get_string(ConfigKey::Ssid).ok()??;
        let pass = self.get_string(ConfigKey::Password).ok()??;
        Some((ssid, pass))
    }

    pub fn set_wifi_credentials(&self, ssid: &str, password: &str) -> Result<(), StoreError> {
        self.set_string(ConfigKey::Ssid, ssid, 33)?;
        self.set_string(ConfigKey::Password, password, 65)
    }

    /// Which of the items needed to join the backend are missing.
    pub fn verify_required(&self) -> Vec<ConfigKey> {
        let mut missing = vec![];
        for key in [
            ConfigKey::DeviceId,
            ConfigKey::DeviceName,
            ConfigKey::ServerIp,
            ConfigKey::ServerPort,
        ] {
            match self.store.get(key) {
                Ok(Some(_)) => {}
                Ok(None) => missing.push(key),
                Err(e) => {
                    warn!("Failed to check {key:?}: {e:?}");
                    missing.push(key);
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mem() -> (Arc<MemConfigStore>, DeviceConfig) {
        let store = Arc::new(MemConfigStore::new());
        (store.clone(), DeviceConfig::new(store))
    }

    #[test]
    fn defaults() {
        let (_, cfg) = mem();
        assert_eq!(cfg.device_id(), MANUFACTURING_DEVICE_ID);
        assert_eq!(cfg.bricked(), BrickedCode::NOT_BRICKED);
        assert_eq!(cfg.fw_cookie(), 0);
        assert_eq!(cfg.journal(), Ok(None));
        assert_eq!(cfg.device_name(), None);
        assert_eq!(cfg.server_addr(), None);
    }

    #[test]
    fn journal_marker() {
        let (_, cfg) = mem();
        cfg.set_journal(17).unwrap();
        assert_eq!(cfg.journal(), Ok(Some(17)));
        cfg.clear_journal().unwrap();
        assert_eq!(cfg.journal(), Ok(None));
    }

    #[test]
    fn corrupt_values_are_reported() {
        let (store, cfg) = mem();
        store.set(ConfigKey::JournalValid, &[1]).unwrap();
        store.set(ConfigKey::Journal, &[1, 2, 3]).unwrap();
        assert_eq!(cfg.journal(), Err(StoreError::Corrupt(ConfigKey::Journal)));

        store.set(ConfigKey::DeviceId, &[1]).unwrap();
        assert_eq!(cfg.device_id(), MANUFACTURING_DEVICE_ID);
    }

    #[test]
    fn failing_writes() {
        let (store, cfg) = mem();
        store.fail_writes(true);
        assert_eq!(cfg.set_bricked(BrickedCode::UNKNOWN_LOGIN), Err(StoreError::WriteFailed));
        assert_eq!(cfg.bricked(), BrickedCode::NOT_BRICKED);
    }

    #[test]
    fn required_items() {
        let (_, cfg) = mem();
        assert_eq!(cfg.verify_required().len(), 4);
        cfg.set_device_id(42).unwrap();
        cfg.set_device_name("lobby").unwrap();
        cfg.set_server_addr("10.0.0.2", 7000).unwrap();
        assert!(cfg.verify_required().is_empty());
        assert_eq!(cfg.server_addr(), Some(("10.0.0.2".into(), 7000)));
        assert!(cfg.set_device_name(&"n".repeat(60)).is_err());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cfg");
        {
            let cfg = DeviceConfig::new(Arc::new(FileConfigStore::open(&path).unwrap()));
            cfg.set_device_id(0x1234_5678_9ABC).unwrap();
            cfg.set_journal(3).unwrap();
            cfg.set_bricked(BrickedCode::FAILED_TO_DELETE_THUMB).unwrap();
        }
        let cfg = DeviceConfig::new(Arc::new(FileConfigStore::open(&path).unwrap()));
        assert_eq!(cfg.device_id(), 0x1234_5678_9ABC);
        assert_eq!(cfg.journal(), Ok(Some(3)));
        assert_eq!(cfg.bricked(), BrickedCode::FAILED_TO_DELETE_THUMB);
    }

    #[test]
    fn file_store_rolls_back_failed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cfg");
        let store = FileConfigStore::open(&path).unwrap();
        store.set(ConfigKey::DeviceName, b"lobby").unwrap();

        // a directory where the temp file should go makes every write fail
        std::fs::create_dir(path.with_extension("tmp")).unwrap();
        assert!(matches!(
            store.set(ConfigKey::DeviceName, b"garage"),
            Err(StoreError::Io(_))
        ));
        assert!(store.set(ConfigKey::Ssid, b"net").is_err());
        assert_eq!(store.get(ConfigKey::DeviceName), Ok(Some(b"lobby".to_vec())));
        assert_eq!(store.get(ConfigKey::Ssid), Ok(None));
    }

    #[test]
    fn file_store_concurrent_sets_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cfg");
        let store = Arc::new(FileConfigStore::open(&path).unwrap());
        let keys = [
            ConfigKey::DeviceName,
            ConfigKey::Ssid,
            ConfigKey::Password,
            ConfigKey::ServerIp,
        ];
        let writers: Vec<_> = keys
            .into_iter()
            .enumerate()
            .map(|(n, key)| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..10u8 {
                        store.set(key, &[n as u8, round]).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let reopened = FileConfigStore::open(&path).unwrap();
        for (n, key) in keys.into_iter().enumerate() {
            assert_eq!(reopened.get(key), Ok(Some(vec![n as u8, 9])));
        }
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cfg");
        std::fs::write(&path, [0xFF; 7]).unwrap();
        assert!(matches!(FileConfigStore::open(&path), Err(StoreError::Decode)));
    }
}
