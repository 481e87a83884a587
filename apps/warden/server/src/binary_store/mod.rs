//! Installation and verification of the sandboxed runtime executable.
//!
//! An installed binary is trusted only while its mode, size and content
//! checksum all match the release descriptor. Anything else is deleted and
//! reinstalled from a checksum-verified archive before it can be executed.

mod fetch;
mod release;

use std::{
    fs::{self, OpenOptions},
    io::{self, Cursor, Read, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Artifact, InstallError};

pub use fetch::{HttpFetch, ReqwestFetcher};
pub use release::{
    ManifestResolver, Platform, ReleaseAsset, ReleaseDescriptor, ReleaseRef, ReleaseResolver,
};

/// Owner-only access; never group or world accessible.
pub const REQUIRED_MODE: u32 = 0o700;

pub const MAX_BINARY_SIZE: u64 = 512 * 1024 * 1024;

pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com";

pub struct BinaryStore {
    release: ReleaseRef,
    platform: Platform,
    download_base: String,
    resolver: Arc<dyn ReleaseResolver>,
    fetcher: Arc<dyn HttpFetch>,
    // Serializes install/verify within this process only.
    install_lock: Mutex<()>,
}

enum Installed {
    Valid,
    Missing,
    Invalid(String),
}

impl BinaryStore {
    pub fn new(
        release: ReleaseRef,
        resolver: Arc<dyn ReleaseResolver>,
        fetcher: Arc<dyn HttpFetch>,
    ) -> Result<Self, InstallError> {
        Ok(Self {
            release,
            platform: Platform::current()?,
            download_base: DEFAULT_DOWNLOAD_BASE.to_owned(),
            resolver,
            fetcher,
            install_lock: Mutex::new(()),
        })
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into();
        self
    }

    /// Makes sure a verified runtime binary is present at `path`, installing
    /// or repairing it when needed. Idempotent.
    pub async fn ensure_installed(&self, path: &Path) -> Result<(), InstallError> {
        let _guard = self.install_lock.lock().await;

        let descriptor = self.resolver.resolve(&self.release).await?;
        let asset = descriptor.asset_for(&self.platform)?.clone();

        let target = path.to_path_buf();
        let expected = asset.binary_sha256.clone();
        match blocking(move || inspect_installed(&target, &expected)).await? {
            Installed::Valid => {
                debug!(path = %path.display(), release = %self.release, "runtime binary verified");
                return Ok(());
            }
            Installed::Missing => {
                info!(path = %path.display(), release = %self.release, "installing runtime binary");
            }
            Installed::Invalid(reason) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "installed runtime failed verification; reinstalling"
                );
                let target = path.to_path_buf();
                blocking(move || remove_path(&target)).await?;
            }
        }

        let url = self.release.asset_url(&self.download_base, &asset.archive_name);
        let archive = self.fetcher.fetch(&url, MAX_BINARY_SIZE).await?;
        verify_sha256(Artifact::Archive, &archive, &asset.archive_sha256)?;

        let target = path.to_path_buf();
        blocking(move || install_from_archive(&archive, &asset, &target)).await?;

        counter!("warden_runtime_installs_total", 1);
        info!(path = %path.display(), release = %self.release, "runtime binary installed");
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, InstallError>
where
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| InstallError::io("install task failed", io::Error::other(err)))?
}

fn inspect_installed(path: &Path, expected_sha256: &str) -> Result<Installed, InstallError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Installed::Missing),
        Err(err) => return Err(InstallError::io(format!("stat {}", path.display()), err)),
    };

    if !meta.is_file() {
        return Ok(Installed::Invalid("not a regular file".into()));
    }
    let mode = meta.permissions().mode() & 0o7777;
    if mode != REQUIRED_MODE {
        return Ok(Installed::Invalid(format!("mode {mode:o}")));
    }
    if meta.len() > MAX_BINARY_SIZE {
        return Ok(Installed::Invalid(format!("{} bytes", meta.len())));
    }

    let mut file = fs::File::open(path)
        .map_err(|err| InstallError::io(format!("open {}", path.display()), err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|err| InstallError::io(format!("hash {}", path.display()), err))?;
    let actual = hex::encode(hasher.finalize());
    if !eq_sha256(&actual, expected_sha256) {
        return Ok(Installed::Invalid("checksum mismatch".into()));
    }
    Ok(Installed::Valid)
}

fn remove_path(path: &Path) -> Result<(), InstallError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(InstallError::io(format!("remove {}", path.display()), err))
        }
        _ => Ok(()),
    }
}

fn install_from_archive(
    archive: &[u8],
    asset: &ReleaseAsset,
    path: &Path,
) -> Result<(), InstallError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    let index = (0..zip.len())
        .find(|&i| {
            zip.by_index(i).is_ok_and(|entry| {
                entry.is_file()
                    && Path::new(entry.name())
                        .file_name()
                        .is_some_and(|name| name == asset.binary_name.as_str())
            })
        })
        .ok_or_else(|| InstallError::MissingBinary {
            archive: asset.archive_name.clone(),
            binary: asset.binary_name.clone(),
        })?;

    let entry = zip.by_index(index)?;
    if entry.size() > MAX_BINARY_SIZE {
        return Err(InstallError::Oversized {
            size: entry.size(),
            limit: MAX_BINARY_SIZE,
        });
    }
    // The declared size is not trusted; cap what is actually inflated.
    let mut binary = Vec::with_capacity(entry.size() as usize);
    entry
        .take(MAX_BINARY_SIZE + 1)
        .read_to_end(&mut binary)
        .map_err(|err| InstallError::io("inflate runtime binary", err))?;
    if binary.len() as u64 > MAX_BINARY_SIZE {
        return Err(InstallError::Oversized {
            size: binary.len() as u64,
            limit: MAX_BINARY_SIZE,
        });
    }
    verify_sha256(Artifact::Binary, &binary, &asset.binary_sha256)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| InstallError::io(format!("create {}", parent.display()), err))?;
    }
    write_binary(path, &binary)?;

    let mode = fs::metadata(path)
        .map_err(|err| InstallError::io(format!("stat {}", path.display()), err))?
        .permissions()
        .mode()
        & 0o7777;
    if mode != REQUIRED_MODE {
        return Err(InstallError::PermissionMismatch {
            expected: REQUIRED_MODE,
            actual: mode,
        });
    }
    Ok(())
}

fn write_binary(path: &Path, contents: &[u8]) -> Result<(), InstallError> {
    let context = |action: &str| format!("{action} {}", path.display());
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(REQUIRED_MODE)
        .open(path)
        .map_err(|err| InstallError::io(context("create"), err))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|err| InstallError::io(context("write"), err))?;
    // The creation mode is filtered through the umask.
    fs::set_permissions(path, fs::Permissions::from_mode(REQUIRED_MODE))
        .map_err(|err| InstallError::io(context("chmod"), err))
}

fn verify_sha256(artifact: Artifact, bytes: &[u8], expected: &str) -> Result<(), InstallError> {
    let actual = hex::encode(Sha256::digest(bytes));
    if eq_sha256(&actual, expected) {
        Ok(())
    } else {
        Err(InstallError::ChecksumMismatch {
            artifact,
            expected: expected.trim().to_owned(),
            actual,
        })
    }
}

fn eq_sha256(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Location of the runtime binary inside a state directory.
pub fn default_runtime_path(state_dir: &Path) -> PathBuf {
    state_dir.join("bin").join("runtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use zip::write::SimpleFileOptions;

    use crate::error::FetchError;

    const BINARY: &[u8] = b"#!/bin/sh\necho sandboxed runtime\n";

    struct StaticResolver(ReleaseDescriptor);

    #[async_trait]
    impl ReleaseResolver for StaticResolver {
        async fn resolve(&self, _release: &ReleaseRef) -> Result<ReleaseDescriptor, InstallError> {
            Ok(self.0.clone())
        }
    }

    struct CountingFetcher {
        archive: Bytes,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpFetch for CountingFetcher {
        async fn fetch(&self, url: &str, _limit: u64) -> Result<Bytes, FetchError> {
            assert!(url.ends_with("/releases/download/v1.0.0/runtime-linux.zip"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.archive.clone())
        }
    }

    fn archive_with(name: &str, contents: &[u8]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(
                format!("dist/{name}"),
                SimpleFileOptions::default().unix_permissions(0o755),
            )
            .unwrap();
        writer.write_all(contents).unwrap();
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn linux() -> Platform {
        Platform::from_parts("linux", "x86_64").unwrap()
    }

    struct Fixture {
        store: BinaryStore,
        fetcher: Arc<CountingFetcher>,
        _dir: tempfile::TempDir,
        path: PathBuf,
    }

    fn fixture_with(archive: Bytes, tweak: impl FnOnce(&mut ReleaseAsset)) -> Fixture {
        let mut asset = ReleaseAsset {
            archive_name: "runtime-linux.zip".into(),
            archive_sha256: sha256_hex(&archive),
            binary_name: "runtime".into(),
            binary_sha256: sha256_hex(BINARY),
        };
        tweak(&mut asset);
        let descriptor = ReleaseDescriptor {
            repository: "sandbox/runtime".into(),
            tag: "v1.0.0".into(),
            assets: BTreeMap::from([(linux(), asset)]),
        };
        let fetcher = Arc::new(CountingFetcher {
            archive,
            calls: AtomicUsize::new(0),
        });
        let store = BinaryStore::new(
            ReleaseRef::new("sandbox/runtime", "v1.0.0"),
            Arc::new(StaticResolver(descriptor)),
            fetcher.clone(),
        )
        .unwrap()
        .with_platform(linux());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin").join("runtime");
        Fixture {
            store,
            fetcher,
            _dir: dir,
            path,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(archive_with("runtime", BINARY), |_| {})
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[tokio::test]
    async fn installs_with_narrow_mode() {
        let fx = fixture();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        assert_eq!(fs::read(&fx.path).unwrap(), BINARY);
        assert_eq!(mode_of(&fx.path), REQUIRED_MODE);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verified_install_is_not_refetched() {
        let fx = fixture();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reinstalls_after_content_corruption() {
        let fx = fixture();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        fs::write(&fx.path, b"tampered").unwrap();

        fx.store.ensure_installed(&fx.path).await.unwrap();
        assert_eq!(fs::read(&fx.path).unwrap(), BINARY);
        assert_eq!(mode_of(&fx.path), REQUIRED_MODE);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reinstalls_after_permissions_widen() {
        let fx = fixture();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        fs::set_permissions(&fx.path, fs::Permissions::from_mode(0o755)).unwrap();

        fx.store.ensure_installed(&fx.path).await.unwrap();
        assert_eq!(mode_of(&fx.path), REQUIRED_MODE);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn replaces_a_directory_at_the_target() {
        let fx = fixture();
        fs::create_dir_all(fx.path.join("nested")).unwrap();
        fx.store.ensure_installed(&fx.path).await.unwrap();
        assert_eq!(fs::read(&fx.path).unwrap(), BINARY);
    }

    #[tokio::test]
    async fn archive_checksum_mismatch_installs_nothing() {
        let fx = fixture_with(archive_with("runtime", BINARY), |asset| {
            asset.archive_sha256 = sha256_hex(b"something else");
        });
        let err = fx.store.ensure_installed(&fx.path).await.unwrap_err();
        assert!(matches!(
            err,
            InstallError::ChecksumMismatch {
                artifact: Artifact::Archive,
                ..
            }
        ));
        assert!(!fx.path.exists());
    }

    #[tokio::test]
    async fn binary_checksum_mismatch_installs_nothing() {
        let fx = fixture_with(archive_with("runtime", b"evil payload"), |_| {});
        let err = fx.store.ensure_installed(&fx.path).await.unwrap_err();
        assert!(matches!(
            err,
            InstallError::ChecksumMismatch {
                artifact: Artifact::Binary,
                ..
            }
        ));
        assert!(!fx.path.exists());
    }

    #[tokio::test]
    async fn archive_without_the_binary_is_rejected() {
        let fx = fixture_with(archive_with("README.md", BINARY), |_| {});
        let err = fx.store.ensure_installed(&fx.path).await.unwrap_err();
        assert!(matches!(err, InstallError::MissingBinary { .. }));
    }

    #[tokio::test]
    async fn platform_without_asset_is_rejected() {
        let fx = fixture();
        let store = fx
            .store
            .with_platform(Platform::from_parts("macos", "aarch64").unwrap());
        let err = store.ensure_installed(&fx.path).await.unwrap_err();
        assert!(matches!(err, InstallError::MissingAsset { .. }));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
