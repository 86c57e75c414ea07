//! Settings store persisted in a string key-value store.
//!
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
};

use common::settings::{
    validate_detector_kind, validate_min_confidence, validate_poll_interval, FieldUpdate,
    Settings, ValidationError, DEFAULT_MIN_CONFIDENCE, DEFAULT_POLL_INTERVAL_MS,
};
use serde::Deserialize;

pub const KEY_DETECTOR_KIND: &str = "faceDetectionModel";
pub const KEY_MIN_CONFIDENCE: &str = "minConfidence";
pub const KEY_POLL_INTERVAL: &str = "frequency";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access settings file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistent string key-value store.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;

    /// Write all entries or none of them.
    fn set_many(&mut self, entries: Vec<(&str, String)>) -> Result<(), StoreError>;
}

/// Volatile store, e.g. for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_many(&mut self, entries: Vec<(&str, String)>) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.values.insert(key.to_owned(), value);
        }
        Ok(())
    }
}

/// Store backed by a JSON object of strings. The whole file is rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Open the store. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed settings file {}: {e}", path.display());
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("Could not read settings file {}: {e}", path.display());
                BTreeMap::new()
            }
        };

        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_vec_pretty(values)?;
        std::fs::write(&self.path, data).map_err(io_err)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_many(&mut self, entries: Vec<(&str, String)>) -> Result<(), StoreError> {
        let mut values = self.values.clone();
        for (key, value) in entries {
            values.insert(key.to_owned(), value);
        }
        // Memory only changes once the file is written
        self.flush(&values)?;
        self.values = values;
        Ok(())
    }
}

/// Raw form input, either typed text or a JSON number.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawField {
    Text(String),
    Number(f64),
}

impl fmt::Display for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawField::Text(text) => f.write_str(text),
            RawField::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for RawField {
    fn from(text: &str) -> Self {
        RawField::Text(text.to_owned())
    }
}

/// Partial settings update as entered by the user.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub min_confidence: Option<RawField>,
    pub poll_interval_ms: Option<RawField>,
    pub detector_kind: Option<RawField>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validated settings with write-through persistence.
pub struct SettingsStore {
    settings: Settings,
    store: Box<dyn KeyValueStore>,
}

impl SettingsStore {
    /// Read persisted settings, falling back to defaults per key.
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let defaults = Settings::default();

        let min_confidence = store
            .get(KEY_MIN_CONFIDENCE)
            .and_then(|raw| validate_min_confidence(&raw).ok())
            .map_or(defaults.min_confidence, |update| {
                update.resolve(DEFAULT_MIN_CONFIDENCE)
            });
        let poll_interval_ms = store
            .get(KEY_POLL_INTERVAL)
            .and_then(|raw| validate_poll_interval(&raw).ok())
            .map_or(defaults.poll_interval_ms, |update| {
                update.resolve(DEFAULT_POLL_INTERVAL_MS)
            });
        let detector_kind = store
            .get(KEY_DETECTOR_KIND)
            .and_then(|raw| validate_detector_kind(&raw).ok())
            .unwrap_or(defaults.detector_kind);

        let settings = Settings {
            min_confidence,
            poll_interval_ms,
            detector_kind,
        };
        log::info!("Loaded settings {:?}", settings);

        Self { settings, store }
    }

    pub fn get(&self) -> Settings {
        self.settings
    }

    /// Apply a partial update.
    ///
    /// The whole patch is validated before anything changes. Rejected input leaves the store
    /// untouched. Empty or unparseable numbers reset the field to its default.
    pub fn set(&mut self, patch: &SettingsPatch) -> Result<Settings, SettingsError> {
        let min_confidence = patch
            .min_confidence
            .as_ref()
            .map(|raw| validate_min_confidence(&raw.to_string()))
            .transpose();
        let poll_interval = patch
            .poll_interval_ms
            .as_ref()
            .map(|raw| validate_poll_interval(&raw.to_string()))
            .transpose();
        let detector_kind = patch
            .detector_kind
            .as_ref()
            .map(|raw| validate_detector_kind(&raw.to_string()))
            .transpose();

        let (min_confidence, poll_interval, detector_kind) =
            match (min_confidence, poll_interval, detector_kind) {
                (Ok(c), Ok(p), Ok(k)) => (c, p, k),
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                    log::warn!("Rejected settings change: {e}");
                    return Err(e.into());
                }
            };

        let mut updated = self.settings;
        let mut writes = Vec::new();
        if let Some(update) = min_confidence {
            if update == FieldUpdate::ResetToDefault {
                log::info!("Resetting minimum confidence to {DEFAULT_MIN_CONFIDENCE}");
            }
            updated.min_confidence = update.resolve(DEFAULT_MIN_CONFIDENCE);
            writes.push((KEY_MIN_CONFIDENCE, updated.min_confidence.to_string()));
        }
        if let Some(update) = poll_interval {
            if update == FieldUpdate::ResetToDefault {
                log::info!("Resetting frequency to {DEFAULT_POLL_INTERVAL_MS}");
            }
            updated.poll_interval_ms = update.resolve(DEFAULT_POLL_INTERVAL_MS);
            writes.push((KEY_POLL_INTERVAL, updated.poll_interval_ms.to_string()));
        }
        if let Some(kind) = detector_kind {
            updated.detector_kind = kind;
            writes.push((KEY_DETECTOR_KIND, kind.to_string()));
        }

        self.store.set_many(writes)?;
        self.settings = updated;

        Ok(updated)
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod test {

    use common::models::DetectorKind;

    use super::*;

    /// Refuses every write.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn set_many(&mut self, _entries: Vec<(&str, String)>) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: PathBuf::from("session.json"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    fn patch(field: &str, value: &str) -> SettingsPatch {
        let mut patch = SettingsPatch::default();
        let raw = Some(RawField::from(value));
        match field {
            "minConfidence" => patch.min_confidence = raw,
            "pollIntervalMs" => patch.poll_interval_ms = raw,
            "detectorKind" => patch.detector_kind = raw,
            _ => unreachable!(),
        }
        patch
    }

    #[test]
    fn fresh_store_has_defaults() {
        let store = SettingsStore::load(Box::new(MemoryStore::new()));
        assert_eq!(
            store.get(),
            Settings {
                min_confidence: 0.5,
                poll_interval_ms: 1000,
                detector_kind: DetectorKind::Tiny,
            }
        );
    }

    #[test]
    fn out_of_range_confidence_keeps_value() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));

        let err = store.set(&patch("minConfidence", "2")).unwrap_err();

        assert!(matches!(
            err,
            SettingsError::Validation(ValidationError::MinConfidenceOutOfRange(_))
        ));
        assert_eq!(store.get().min_confidence, 0.5);
        assert_eq!(store.store().get(KEY_MIN_CONFIDENCE), None);
    }

    #[test]
    fn valid_confidences_round_trip() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        for raw in ["0.1", "0.25", "0.5", "0.9", "0.99"] {
            let value: f32 = raw.parse().unwrap();
            store.set(&patch("minConfidence", raw)).unwrap();
            assert_eq!(store.get().min_confidence, value);
            assert_eq!(store.store().get(KEY_MIN_CONFIDENCE).as_deref(), Some(raw));
        }
    }

    #[test]
    fn valid_intervals_round_trip() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        for value in [10_u64, 11, 500, 1999, 2000] {
            store.set(&patch("pollIntervalMs", &value.to_string())).unwrap();
            assert_eq!(store.get().poll_interval_ms, value);
        }
        for raw in ["9", "0", "2001", "-1"] {
            assert!(store.set(&patch("pollIntervalMs", raw)).is_err());
            assert_eq!(store.get().poll_interval_ms, 2000);
        }
    }

    #[test]
    fn empty_interval_resets_and_persists_default() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::with_values([(
            KEY_POLL_INTERVAL,
            "250",
        )])));
        assert_eq!(store.get().poll_interval_ms, 250);

        let settings = store.set(&patch("pollIntervalMs", "")).unwrap();

        assert_eq!(settings.poll_interval_ms, 1000);
        assert_eq!(store.store().get(KEY_POLL_INTERVAL).as_deref(), Some("1000"));
    }

    #[test]
    fn unparseable_confidence_resets_and_persists_default() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        store.set(&patch("minConfidence", "0.8")).unwrap();

        let settings = store.set(&patch("minConfidence", "high")).unwrap();

        assert_eq!(settings.min_confidence, 0.5);
        assert_eq!(store.store().get(KEY_MIN_CONFIDENCE).as_deref(), Some("0.5"));
    }

    #[test]
    fn invalid_field_rejects_whole_patch() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        let patch = SettingsPatch {
            min_confidence: Some("0.7".into()),
            poll_interval_ms: Some(RawField::Number(5000.0)),
            detector_kind: Some("blaze-short".into()),
        };

        assert!(store.set(&patch).is_err());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn numbers_are_accepted_like_text() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        let patch = SettingsPatch {
            min_confidence: Some(RawField::Number(0.75)),
            poll_interval_ms: Some(RawField::Number(250.0)),
            detector_kind: None,
        };

        let settings = store.set(&patch).unwrap();

        assert_eq!(settings.min_confidence, 0.75);
        assert_eq!(settings.poll_interval_ms, 250);
    }

    #[test]
    fn unknown_stored_model_falls_back_to_tiny() {
        let store = SettingsStore::load(Box::new(MemoryStore::with_values([
            (KEY_DETECTOR_KIND, "yolo"),
            (KEY_MIN_CONFIDENCE, "7"),
            (KEY_POLL_INTERVAL, "300"),
        ])));

        assert_eq!(store.get().detector_kind, DetectorKind::Tiny);
        assert_eq!(store.get().min_confidence, 0.5);
        assert_eq!(store.get().poll_interval_ms, 300);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let mut store = SettingsStore::load(Box::new(MemoryStore::new()));
        let err = store.set(&patch("detectorKind", "yolo")).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Validation(ValidationError::UnknownDetector(_))
        ));
    }

    #[test]
    fn json_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facecount").join("session.json");

        let mut store = SettingsStore::load(Box::new(JsonFileStore::open(&path)));
        let patch = SettingsPatch {
            min_confidence: Some("0.3".into()),
            poll_interval_ms: Some("40".into()),
            detector_kind: Some("ssd-mobilenet".into()),
        };
        let written = store.set(&patch).unwrap();

        let reloaded = SettingsStore::load(Box::new(JsonFileStore::open(&path)));
        assert_eq!(reloaded.get(), written);
        assert_eq!(
            reloaded.store().get(KEY_DETECTOR_KIND).as_deref(),
            Some("ssd-mobilenet")
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::load(Box::new(JsonFileStore::open(&path)));

        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn failed_write_changes_nothing() {
        let mut store = SettingsStore::load(Box::new(ReadOnlyStore::default()));
        let patch = SettingsPatch {
            min_confidence: Some("0.8".into()),
            poll_interval_ms: Some("40".into()),
            detector_kind: None,
        };

        let err = store.set(&patch).unwrap_err();

        assert!(matches!(err, SettingsError::Store(StoreError::Io { .. })));
        assert_eq!(store.get(), Settings::default());
        assert_eq!(store.store().get(KEY_MIN_CONFIDENCE), None);
        assert_eq!(store.store().get(KEY_POLL_INTERVAL), None);
    }

    #[test]
    fn unwritable_json_file_keeps_previous_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut store = JsonFileStore::open(&path);
        store
            .set_many(vec![(KEY_MIN_CONFIDENCE, "0.3".to_owned())])
            .unwrap();

        // A directory in place of the file makes the next write fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let result = store.set_many(vec![
            (KEY_MIN_CONFIDENCE, "0.8".to_owned()),
            (KEY_POLL_INTERVAL, "40".to_owned()),
        ]);

        assert!(result.is_err());
        assert_eq!(store.get(KEY_MIN_CONFIDENCE).as_deref(), Some("0.3"));
        assert_eq!(store.get(KEY_POLL_INTERVAL), None);
        assert_eq!(store.path(), path.as_path());
    }
}
