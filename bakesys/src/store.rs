/*!
Durable build data.

A JSON file beside the build root records resolved source image digests and
the (build hash, image digest) pair for every base image that has been
built, plus the hash salt that namespaces this project's content hashes.
Writes are atomic: data is written to a sibling temporary file, flushed,
then renamed over the target.
*/

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{IntoError, ResultExt};

use crate::config::BUILD_DATA_NAME;
use crate::error::{Result, StoreParseSnafu, StoreWriteSnafu};

/// Cached outcome of a base image build.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BaseRecord {
    pub build_hash: String,
    pub image_digest: String,
}

/// The persisted build data document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BuildData {
    /// repo -> tag -> platform -> manifest digest.
    #[serde(default)]
    pub source: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    /// profile -> stage -> platform -> base record.
    #[serde(default)]
    pub base: BTreeMap<String, BTreeMap<String, BTreeMap<String, BaseRecord>>>,
    /// Mixed into every base image content hash so that projects sharing a
    /// registry occupy disjoint hash spaces. Rotating it forces rebuilds.
    #[serde(default)]
    pub hash_salt: String,
}

impl BuildData {
    pub fn cached_source_digest(&self, repo: &str, tag: &str, platform: &str) -> Option<&str> {
        self.source
            .get(repo)?
            .get(tag)?
            .get(platform)
            .map(String::as_str)
    }

    pub fn set_source_digest(&mut self, repo: &str, tag: &str, platform: &str, digest: &str) {
        self.source
            .entry(repo.to_string())
            .or_default()
            .entry(tag.to_string())
            .or_default()
            .insert(platform.to_string(), digest.to_string());
    }

    pub fn cached_base(&self, profile: &str, stage: &str, platform: &str) -> Option<&BaseRecord> {
        self.base.get(profile)?.get(stage)?.get(platform)
    }

    pub fn set_base(&mut self, profile: &str, stage: &str, platform: &str, record: BaseRecord) {
        self.base
            .entry(profile.to_string())
            .or_default()
            .entry(stage.to_string())
            .or_default()
            .insert(platform.to_string(), record);
    }
}

/// Owner of the on-disk build data. All mutation goes through
/// [`BuildDataStore::update`], which persists after the change.
#[derive(Debug)]
pub struct BuildDataStore {
    path: PathBuf,
    data: BuildData,
}

impl BuildDataStore {
    /// Load build data from the build root, creating empty data (with a
    /// fresh salt) when the file does not exist.
    pub fn load(build_root: &Path) -> Result<Self> {
        let path = build_root.join(BUILD_DATA_NAME);
        let mut data = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).context(StoreParseSnafu { path: path.clone() })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} not found, using empty build data", path.display());
                BuildData::default()
            }
            Err(err) => return Err(err).context(StoreWriteSnafu { path }),
        };
        if data.hash_salt.is_empty() {
            data.hash_salt = uuid::Uuid::new_v4().to_string();
        }
        Ok(Self { path, data })
    }

    pub fn data(&self) -> &BuildData {
        &self.data
    }

    pub fn hash_salt(&self) -> &str {
        &self.data.hash_salt
    }

    /// Replace the salt with a fresh random value, forcing base image
    /// rebuilds, and persist.
    pub fn rotate_salt(&mut self) -> Result<()> {
        self.update(|data| data.hash_salt = uuid::Uuid::new_v4().to_string())
    }

    /// Apply a mutation and persist the result atomically.
    pub fn update<R>(&mut self, mutate: impl FnOnce(&mut BuildData) -> R) -> Result<R> {
        let result = mutate(&mut self.data);
        self.save()?;
        Ok(result)
    }

    pub fn save(&self) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(parent).context(StoreWriteSnafu {
            path: self.path.clone(),
        })?;
        let bytes = serde_json::to_vec_pretty(&self.data).map_err(|err| {
            StoreParseSnafu {
                path: self.path.clone(),
            }
            .into_error(err)
        })?;
        file.write_all(&bytes).context(StoreWriteSnafu {
            path: self.path.clone(),
        })?;
        file.flush().context(StoreWriteSnafu {
            path: self.path.clone(),
        })?;
        file.persist(&self.path).map_err(|err| {
            StoreWriteSnafu {
                path: self.path.clone(),
            }
            .into_error(err.error)
        })?;
        Ok(())
    }
}
