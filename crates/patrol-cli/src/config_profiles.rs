//! Guard profiles saved on the device: which store to talk to and as whom.
//!
//! Settings are layered when a command runs: the saved profile, then the
//! `PATROL_*` environment, then command-line flags.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use patrol_core::util::{is_http_url, normalize_text_option};
use patrol_core::BackendConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PROFILES_FILE_NAME: &str = "profiles.json";
const PROFILES_FORMAT: u32 = 1;
const DEFAULT_PROFILE: &str = "default";
const MAX_GUARD_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Failed to read profiles at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse profiles at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to write profiles at {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize profiles: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Profiles file format {0} is newer than this patrol build")]
    UnsupportedFormat(u32),
    #[error("Profile '{profile}': store_url must include http:// or https://")]
    InvalidStoreUrl { profile: String },
    #[error(
        "Profile '{profile}': guard id '{guard_id}' must be one token of at most {max} characters",
        max = MAX_GUARD_ID_LEN
    )]
    InvalidGuardId { profile: String, guard_id: String },
}

/// One guard's enrollment on this device
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardProfile {
    pub guard_id: Option<String>,
    pub store_url: Option<String>,
    pub anon_key: Option<String>,
    pub access_token: Option<String>,
}

impl GuardProfile {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Settings named by the `PATROL_*` variables `lookup` can see
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            guard_id: lookup("PATROL_GUARD_ID"),
            store_url: lookup("PATROL_STORE_URL"),
            anon_key: lookup("PATROL_ANON_KEY"),
            access_token: lookup("PATROL_ACCESS_TOKEN"),
        }
        .normalized()
    }

    /// Layer `other` on top; its set fields win
    #[must_use]
    pub fn overlay(self, other: Self) -> Self {
        let base = self.normalized();
        let other = other.normalized();
        Self {
            guard_id: other.guard_id.or(base.guard_id),
            store_url: other.store_url.or(base.store_url),
            anon_key: other.anon_key.or(base.anon_key),
            access_token: other.access_token.or(base.access_token),
        }
    }

    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            guard_id: normalize_text_option(self.guard_id),
            store_url: normalize_text_option(self.store_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            anon_key: normalize_text_option(self.anon_key),
            access_token: normalize_text_option(self.access_token),
        }
    }

    pub fn validate(&self, profile: &str) -> Result<(), ProfileError> {
        if let Some(url) = self.store_url.as_deref() {
            if !is_http_url(url) {
                return Err(ProfileError::InvalidStoreUrl {
                    profile: profile.to_string(),
                });
            }
        }
        if let Some(guard_id) = self.guard_id.as_deref() {
            if guard_id.chars().count() > MAX_GUARD_ID_LEN || guard_id.contains(char::is_whitespace) {
                return Err(ProfileError::InvalidGuardId {
                    profile: profile.to_string(),
                    guard_id: guard_id.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn backend(&self) -> BackendConfig {
        BackendConfig {
            store_url: self.store_url.clone(),
            anon_key: self.anon_key.clone(),
            access_token: self.access_token.clone(),
        }
    }

    /// Fields that must be set before a patrol can start
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("guard_id", self.guard_id.is_none()),
            ("store_url", self.store_url.is_none()),
            ("anon_key", self.anon_key.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, missing)| missing.then_some(field))
        .collect()
    }
}

/// Every saved profile plus the one in use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileStore {
    #[serde(default = "profiles_format")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, GuardProfile>,
}

const fn profiles_format() -> u32 {
    PROFILES_FORMAT
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self {
            version: PROFILES_FORMAT,
            active_profile: None,
            profiles: BTreeMap::new(),
        }
    }
}

pub fn default_profiles_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patrol")
        .join(PROFILES_FILE_NAME)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    normalize_text_option(value.map(str::to_string))
}

impl ProfileStore {
    pub fn load() -> Result<Self, ProfileError> {
        Self::load_from_path(&default_profiles_path())
    }

    /// Read saved profiles; a profile with an unusable guard id or store URL fails the load
    pub fn load_from_path(path: &Path) -> Result<Self, ProfileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut store =
            serde_json::from_str::<Self>(&raw).map_err(|source| ProfileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if store.version > PROFILES_FORMAT {
            return Err(ProfileError::UnsupportedFormat(store.version));
        }

        store.active_profile = normalize_profile_name(store.active_profile.as_deref());
        for (name, profile) in &mut store.profiles {
            *profile = std::mem::take(profile).normalized();
            profile.validate(name)?;
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<PathBuf, ProfileError> {
        let path = default_profiles_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ProfileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ProfileError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = serde_json::to_string_pretty(self).map_err(ProfileError::Serialize)?;
        std::fs::write(path, serialized).map_err(|source| ProfileError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Explicit name, then `PATROL_PROFILE`, then the active profile
    pub fn resolve_name(&self, explicit: Option<&str>) -> String {
        normalize_profile_name(explicit)
            .or_else(|| normalize_profile_name(std::env::var("PATROL_PROFILE").ok().as_deref()))
            .or_else(|| self.active_profile.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&GuardProfile> {
        self.profiles.get(name)
    }

    /// The selected profile with `overrides` layered on top, validated
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        overrides: GuardProfile,
    ) -> Result<(String, GuardProfile), ProfileError> {
        let name = self.resolve_name(explicit);
        let profile = self.get(&name).cloned().unwrap_or_default().overlay(overrides);
        profile.validate(&name)?;
        Ok((name, profile))
    }

    /// Merge `update` into the named profile. Nothing changes when the result is invalid.
    pub fn apply(
        &mut self,
        name: &str,
        update: GuardProfile,
        activate: bool,
    ) -> Result<&GuardProfile, ProfileError> {
        let merged = self.get(name).cloned().unwrap_or_default().overlay(update);
        merged.validate(name)?;
        if activate {
            self.active_profile = Some(name.to_string());
        }
        let entry = self.profiles.entry(name.to_string()).or_default();
        *entry = merged;
        Ok(entry)
    }
}
