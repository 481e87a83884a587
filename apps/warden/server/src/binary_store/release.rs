use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InstallError;

/// Target triple a release asset was built for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn current() -> Result<Self, InstallError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_parts(os: &str, arch: &str) -> Result<Self, InstallError> {
        let triple = match (os, arch) {
            ("linux", "x86_64") => "x86_64-unknown-linux-gnu",
            ("linux", "aarch64") => "aarch64-unknown-linux-gnu",
            ("macos", "x86_64") => "x86_64-apple-darwin",
            ("macos", "aarch64") => "aarch64-apple-darwin",
            _ => {
                return Err(InstallError::UnsupportedPlatform {
                    os: os.to_owned(),
                    arch: arch.to_owned(),
                })
            }
        };
        Ok(Self(triple.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repository and tag identifying one runtime release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub repository: String,
    pub tag: String,
}

impl ReleaseRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn asset_url(&self, download_base: &str, archive_name: &str) -> String {
        format!(
            "{}/{}/releases/download/{}/{}",
            download_base.trim_end_matches('/'),
            self.repository,
            self.tag,
            archive_name
        )
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub archive_name: String,
    pub archive_sha256: String,
    /// File name of the executable inside the archive.
    pub binary_name: String,
    pub binary_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub repository: String,
    pub tag: String,
    pub assets: BTreeMap<Platform, ReleaseAsset>,
}

impl ReleaseDescriptor {
    pub fn asset_for(&self, platform: &Platform) -> Result<&ReleaseAsset, InstallError> {
        self.assets
            .get(platform)
            .ok_or_else(|| InstallError::MissingAsset {
                release: format!("{}@{}", self.repository, self.tag),
                platform: platform.clone(),
            })
    }
}

/// Resolves a release to its per-platform assets and expected checksums.
#[async_trait]
pub trait ReleaseResolver: Send + Sync {
    async fn resolve(&self, release: &ReleaseRef) -> Result<ReleaseDescriptor, InstallError>;
}

/// Reads release descriptors from a pinned JSON manifest on disk.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    path: PathBuf,
}

impl ManifestResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReleaseResolver for ManifestResolver {
    async fn resolve(&self, release: &ReleaseRef) -> Result<ReleaseDescriptor, InstallError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            InstallError::io(format!("read manifest {}", self.path.display()), err)
        })?;
        let descriptor: ReleaseDescriptor = serde_json::from_slice(&raw)
            .map_err(|err| InstallError::Manifest(err.to_string()))?;
        if descriptor.repository != release.repository || descriptor.tag != release.tag {
            return Err(InstallError::Manifest(format!(
                "manifest describes {}@{}, expected {release}",
                descriptor.repository, descriptor.tag
            )));
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_supported_hosts_to_triples() {
        assert_eq!(
            Platform::from_parts("linux", "x86_64").unwrap().as_str(),
            "x86_64-unknown-linux-gnu"
        );
        assert_eq!(
            Platform::from_parts("macos", "aarch64").unwrap().as_str(),
            "aarch64-apple-darwin"
        );
    }

    #[test]
    fn rejects_unsupported_hosts() {
        assert!(matches!(
            Platform::from_parts("plan9", "mips"),
            Err(InstallError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn builds_github_style_asset_urls() {
        let release = ReleaseRef::new("denoland/deno", "v1.46.3");
        assert_eq!(
            release.asset_url("https://github.com/", "deno-x86_64-unknown-linux-gnu.zip"),
            "https://github.com/denoland/deno/releases/download/v1.46.3/deno-x86_64-unknown-linux-gnu.zip"
        );
    }

    #[tokio::test]
    async fn manifest_must_match_the_requested_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.json");
        std::fs::write(
            &path,
            r#"{
                "repository": "denoland/deno",
                "tag": "v1.46.3",
                "assets": {
                    "x86_64-unknown-linux-gnu": {
                        "archive_name": "deno-x86_64-unknown-linux-gnu.zip",
                        "archive_sha256": "aa",
                        "binary_name": "deno",
                        "binary_sha256": "bb"
                    }
                }
            }"#,
        )
        .unwrap();
        let resolver = ManifestResolver::new(&path);

        let descriptor = resolver
            .resolve(&ReleaseRef::new("denoland/deno", "v1.46.3"))
            .await
            .unwrap();
        let platform = Platform::from_parts("linux", "x86_64").unwrap();
        assert_eq!(descriptor.asset_for(&platform).unwrap().binary_name, "deno");

        let mismatch = resolver
            .resolve(&ReleaseRef::new("denoland/deno", "v2.0.0"))
            .await;
        assert!(matches!(mismatch, Err(InstallError::Manifest(_))));
    }
}
