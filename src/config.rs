//! Settings store.
//!
//! The persisted configuration is a single JSON document that other oiling tools read
//! and write too, so the field names are a stable contract:
//!
//! ```json
//! {
//!   "slidebook": { "host": "127.0.0.1", "port": 65432 },
//!   "oilboy": { "serial_number": "A002", "known_devices": { "A002": "DC:54:75:EB:81:B1" } },
//!   "settings": {
//!     "stage_offset_microns": 0.0,
//!     "oilboy_objective_location": 0,
//!     "oilboy_offset_microns": 50.0,
//!     "default_oil_amount": 50,
//!     "default_z_drop": 50.0
//!   }
//! }
//! ```
//!
//! Loading layers the file over built-in defaults and then over `OILBOY_`-prefixed
//! environment variables (`OILBOY_SLIDEBOOK__PORT=65433`), using `figment`. A missing file
//! yields the defaults; a malformed file or an out-of-range value is rejected with the
//! offending field named, never silently replaced.
//!
//! Saving writes a temporary file next to the target and renames it into place, so an
//! interrupted save leaves either the old or the new document on disk.
//!
//! `Settings` values are snapshots: every update (`remember_peripheral`,
//! `select_peripheral`) returns a new value and performs no I/O.

use crate::error::{AppResult, OilerError};
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{debug, info, warn};

/// Default settings file name, relative to the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "oilboy_config.json";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "OILBOY_";

const STAGE_OFFSET_RANGE: RangeInclusive<f64> = -10_000.0..=10_000.0;
const SERVICE_OBJECTIVE_RANGE: RangeInclusive<u32> = 0..=15;
const RAISE_RANGE: RangeInclusive<f64> = 0.0..=5_000.0;
const DISPENSE_RANGE: RangeInclusive<u32> = 1..=1_000;
const Z_DROP_RANGE: RangeInclusive<f64> = 0.0..=5_000.0;

/// Complete persisted configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Where the stage/objective controller listens
    #[serde(rename = "slidebook")]
    pub instrument: InstrumentEndpoint,
    /// Selected oiler and the identity → address cache
    #[serde(rename = "oilboy")]
    pub peripheral: PeripheralSettings,
    /// Operational parameters for the procedures
    #[serde(rename = "settings")]
    pub operation: OperationalSettings,
}

/// Network address of the stage/objective controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentEndpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port, 1..=65535
    pub port: u16,
}

impl InstrumentEndpoint {
    /// `host:port` form used for connecting and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for InstrumentEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 65432,
        }
    }
}

/// Oiler selection and the known-device cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralSettings {
    /// Identity (serial number) of the currently selected oiler
    #[serde(rename = "serial_number")]
    pub identity: String,
    /// Identity → wireless hardware address. Entries are added or overwritten, never pruned.
    #[serde(rename = "known_devices", default)]
    pub known_peripherals: BTreeMap<String, String>,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        let known_peripherals = BTreeMap::from([
            ("A002".to_string(), "DC:54:75:EB:81:B1".to_string()),
            ("A003".to_string(), "DC:54:75:EB:6F:2D".to_string()),
        ]);
        Self {
            identity: "A002".to_string(),
            known_peripherals,
        }
    }
}

/// Numeric parameters consumed by the procedures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalSettings {
    #[serde(default)]
    pub stage_offset_microns: f64,
    /// Turret position reserved for oil application
    #[serde(rename = "oilboy_objective_location")]
    pub service_objective_index: u32,
    /// How far the stage is raised (and lowered back) while oiling
    #[serde(rename = "oilboy_offset_microns")]
    pub service_raise_microns: f64,
    /// Dispense amount in pump steps
    #[serde(rename = "default_oil_amount")]
    pub default_dispense_amount: u32,
    /// Manual focus drop distance
    #[serde(rename = "default_z_drop")]
    pub default_z_drop_microns: f64,
}

impl Default for OperationalSettings {
    fn default() -> Self {
        Self {
            stage_offset_microns: 0.0,
            service_objective_index: 0,
            service_raise_microns: 50.0,
            default_dispense_amount: 50,
            default_z_drop_microns: 50.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instrument: InstrumentEndpoint::default(),
            peripheral: PeripheralSettings::default(),
            operation: OperationalSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// A missing file is not an error and yields the built-in defaults (still subject
    /// to environment overrides). Keys absent from the file keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();

        // Dictionaries merge recursively, so the stock device cache only seeds a fresh
        // install; an existing file owns its cache completely.
        let figment = if path.exists() {
            debug!(path = %path.display(), "Loading settings file");
            let mut base = Settings::default();
            base.peripheral.known_peripherals.clear();
            Figment::from(Serialized::defaults(base)).merge(Json::file_exact(path))
        } else {
            info!(path = %path.display(), "Settings file not found, using defaults");
            Figment::from(Serialized::defaults(Settings::default()))
        };

        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        let settings = settings.normalized();
        settings.validate()?;
        Ok(settings)
    }

    /// Atomically replace the file at `path` with this snapshot.
    ///
    /// Invalid settings are refused before anything touches the disk.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        self.validate()?;

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(json.as_bytes())?;
        staged.write_all(b"\n")?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Check every field against its physical range.
    ///
    /// Values are rejected, never clamped.
    pub fn validate(&self) -> AppResult<()> {
        if self.instrument.host.trim().is_empty() {
            return Err(OilerError::config("slidebook.host", "must not be empty"));
        }
        if self.instrument.port == 0 {
            return Err(OilerError::config("slidebook.port", "must be in 1..=65535"));
        }

        let op = &self.operation;
        check_f64(
            "settings.stage_offset_microns",
            op.stage_offset_microns,
            &STAGE_OFFSET_RANGE,
        )?;
        check_u32(
            "settings.oilboy_objective_location",
            op.service_objective_index,
            &SERVICE_OBJECTIVE_RANGE,
        )?;
        check_f64(
            "settings.oilboy_offset_microns",
            op.service_raise_microns,
            &RAISE_RANGE,
        )?;
        if op.service_raise_microns == 0.0 {
            return Err(OilerError::config(
                "settings.oilboy_offset_microns",
                "must be greater than zero",
            ));
        }
        check_u32(
            "settings.default_oil_amount",
            op.default_dispense_amount,
            &DISPENSE_RANGE,
        )?;
        check_f64(
            "settings.default_z_drop",
            op.default_z_drop_microns,
            &Z_DROP_RANGE,
        )?;

        for (identity, address) in &self.peripheral.known_peripherals {
            if identity.trim().is_empty() || address.trim().is_empty() {
                return Err(OilerError::config(
                    "oilboy.known_devices",
                    format!("empty identity or address in entry '{identity}'"),
                ));
            }
        }
        Ok(())
    }

    /// Record the address learned for `identity`, returning the updated snapshot.
    ///
    /// Last write wins; other entries are untouched.
    #[must_use]
    pub fn remember_peripheral(&self, identity: &str, address: &str) -> Settings {
        let mut next = self.clone();
        next.peripheral
            .known_peripherals
            .insert(normalize_identity(identity), address.to_string());
        next
    }

    /// Select `identity` as the current oiler, returning the updated snapshot.
    #[must_use]
    pub fn select_peripheral(&self, identity: &str) -> Settings {
        let mut next = self.clone();
        next.peripheral.identity = normalize_identity(identity);
        next
    }

    /// Identities as stored by `remember_peripheral`, whatever case the file used.
    ///
    /// Of entries that collide after normalization, the first in key order wins.
    fn normalized(mut self) -> Settings {
        self.peripheral.identity = normalize_identity(&self.peripheral.identity);
        let mut known = BTreeMap::new();
        for (identity, address) in std::mem::take(&mut self.peripheral.known_peripherals) {
            let key = normalize_identity(&identity);
            if known.contains_key(&key) {
                warn!(%identity, "Duplicate oiler entry after normalizing case, ignored");
                continue;
            }
            known.insert(key, address);
        }
        self.peripheral.known_peripherals = known;
        self
    }

    /// Cached address for `identity`, if any.
    pub fn known_address(&self, identity: &str) -> Option<&str> {
        self.peripheral
            .known_peripherals
            .get(&normalize_identity(identity))
            .map(String::as_str)
    }
}

/// Identities are serial numbers; the device advertises them upper-cased.
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_ascii_uppercase()
}

fn check_f64(field: &str, value: f64, range: &RangeInclusive<f64>) -> AppResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(OilerError::config(
            field,
            format!(
                "{value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

fn check_u32(field: &str, value: u32, range: &RangeInclusive<u32>) -> AppResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(OilerError::config(
            field,
            format!(
                "{value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_raise() {
        let mut settings = Settings::default();
        settings.operation.service_raise_microns = 0.0;
        match settings.validate() {
            Err(OilerError::Config { field, .. }) => {
                assert_eq!(field, "settings.oilboy_offset_microns")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_nan() {
        let mut settings = Settings::default();
        settings.operation.default_z_drop_microns = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn identities_are_normalized() {
        let settings = Settings::default().remember_peripheral(" a009 ", "AA:BB");
        assert_eq!(settings.known_address("A009"), Some("AA:BB"));
        assert_eq!(settings.known_address("a009"), Some("AA:BB"));
    }

    #[test]
    fn select_does_not_touch_cache() {
        let before = Settings::default();
        let after = before.select_peripheral("a003");
        assert_eq!(after.peripheral.identity, "A003");
        assert_eq!(
            after.peripheral.known_peripherals,
            before.peripheral.known_peripherals
        );
    }
}
