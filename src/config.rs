//! # Configuration file
//!
//! Every section is optional and falls back to its defaults:
//!
//! ```toml
//! [store]
//! backend = "sqlite"          # or "memory"
//! path = "mop.sqlite"
//!
//! [queue]
//! run_every_hours = 4.0
//!
//! [fit]
//! cores = 4
//! min_points = 10
//!
//! [visibility]
//! max_airmass = 2.0
//!
//! [[visibility.sites]]
//! code = "lsc"
//! name = "Cerro Tololo"
//! longitude = -70.8049
//! latitude = -30.1673
//! elevation = 2198.0
//!
//! [policy]
//! planet_priority_min = 10.0
//!
//! [scheduler]
//! base_url = "https://observe.lco.global/api"
//! proposal = "KEY2020B-003"
//!
//! [harvest]
//! ogle_url = "https://www.astrouw.edu.pl/ogle/ogle4/ews"
//! ```
//!
//! Sites listed under `[visibility]` are added to (or replace) the LCO 1 m
//! network. The scheduler token is better given through the `MOP_LCO_TOKEN`
//! environment variable than written in the file.
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::constants::{Degree, Meter, DEFAULT_RUN_EVERY_HOURS};
use crate::fit::FitParams;
use crate::harvest::ogle::OGLE_EWS_URL;
use crate::mop_errors::MopError;
use crate::strategy::TapPolicy;
use crate::visibility::observatories::{Site, SiteRegistry};
use crate::visibility::VisibilityParams;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: Utf8PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Sqlite,
            path: Utf8PathBuf::from("mop.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum age of a model before the event is fitted again.
    pub run_every_hours: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            run_every_hours: DEFAULT_RUN_EVERY_HOURS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub code: String,
    pub name: String,
    pub longitude: Degree,
    pub latitude: Degree,
    #[serde(default)]
    pub elevation: Meter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    #[serde(flatten)]
    pub params: VisibilityParams,
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub base_url: String,
    pub proposal: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            base_url: "https://observe.lco.global/api".into(),
            proposal: String::new(),
            token: None,
            timeout_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub ogle_url: String,
    pub timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            ogle_url: OGLE_EWS_URL.into(),
            timeout_secs: 60,
        }
    }
}

/// Whole configuration of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MopConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub fit: FitParams,
    pub visibility: VisibilityConfig,
    pub policy: TapPolicy,
    pub scheduler: SchedulerConfig,
    pub harvest: HarvestConfig,
}

impl MopConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, MopError> {
        let content = std::fs::read_to_string(path)?;
        MopConfig::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, MopError> {
        let config: MopConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MopError> {
        if !(self.queue.run_every_hours.is_finite() && self.queue.run_every_hours > 0.0) {
            return Err(MopError::InvalidConfig(
                "queue.run_every_hours must be > 0".into(),
            ));
        }
        self.fit.validate()?;
        self.policy.validate()?;

        let v = &self.visibility.params;
        if !(v.max_airmass >= 1.0) || !(v.min_altitude < v.max_altitude) || !(v.grid_step_hours > 0.0) {
            return Err(MopError::InvalidConfig(
                "visibility: max_airmass >= 1, min_altitude < max_altitude and grid_step_hours > 0 required".into(),
            ));
        }
        for site in &self.visibility.sites {
            if !(-180.0..=360.0).contains(&site.longitude) || !(-90.0..=90.0).contains(&site.latitude) {
                return Err(MopError::InvalidConfig(format!(
                    "site {}: longitude or latitude out of range",
                    site.code
                )));
            }
        }
        let registry = self.site_registry();
        if let Some(unknown) = self.policy.sites.iter().find(|code| registry.get(code).is_err()) {
            return Err(MopError::UnknownObservatory(unknown.clone()));
        }
        Ok(())
    }

    /// LCO network plus the configured sites.
    pub fn site_registry(&self) -> SiteRegistry {
        let mut registry = SiteRegistry::lco_network();
        for s in &self.visibility.sites {
            registry.register(Site::new(&s.code, &s.name, s.longitude, s.latitude, s.elevation));
        }
        registry
    }
}
