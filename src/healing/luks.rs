//! LUKS devices and passphrases
//!
//! `CryptsetupDevice` drives the `cryptsetup` CLI. `MemoryLuksDevice` is an
//! in-memory stand-in with the same contract.

use super::run_command;
use crate::domain::ports::{LuksDevice, LuksDeviceProvider, PassphraseSource};
use crate::domain::{LuksDeviceState, LuksRef, Volume, VolumePublication};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Device-mapper name for an encrypted volume
pub fn mapped_name(volume: &Volume) -> String {
    format!("luks-{}", volume.internal_name)
}

/// udev by-path link for an iSCSI LUN
pub fn iscsi_device_path(publication: &VolumePublication) -> String {
    format!(
        "/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}",
        publication.target_portal.as_deref().unwrap_or_default(),
        publication.target_iqn.as_deref().unwrap_or_default(),
        publication.lun.unwrap_or(0)
    )
}

// =============================================================================
// cryptsetup
// =============================================================================

/// `cryptsetup isLuks` exit status for "not a LUKS device"
const CRYPTSETUP_NOT_LUKS: i32 = 1;

/// `cryptsetup status` exit status for an inactive mapping
const CRYPTSETUP_INACTIVE: i32 = 4;

pub struct CryptsetupDevice {
    binary: String,
    device_path: String,
    mapped_name: String,
}

impl CryptsetupDevice {
    pub fn new(device_path: impl Into<String>, mapped_name: impl Into<String>) -> Self {
        Self {
            binary: "cryptsetup".into(),
            device_path: device_path.into(),
            mapped_name: mapped_name.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn failure(&self, action: &str, stderr: &str) -> Error {
        Error::Luks {
            device: self.device_path.clone(),
            reason: format!("{} failed: {}", action, stderr.trim()),
        }
    }
}

#[async_trait]
impl LuksDevice for CryptsetupDevice {
    fn device_path(&self) -> &str {
        &self.device_path
    }

    async fn is_luks_formatted(&self) -> Result<bool> {
        let output = run_command(&self.binary, &["isLuks", &self.device_path], None).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(CRYPTSETUP_NOT_LUKS) => Ok(false),
            _ => Err(self.failure("isLuks", &output.stderr)),
        }
    }

    async fn is_open(&self) -> Result<bool> {
        let output = run_command(&self.binary, &["status", &self.mapped_name], None).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(CRYPTSETUP_INACTIVE) => Ok(false),
            _ => Err(self.failure("status", &output.stderr)),
        }
    }

    async fn luks_format(&self, passphrase: &str) -> Result<()> {
        let output = run_command(
            &self.binary,
            &[
                "-q",
                "luksFormat",
                "--type",
                "luks2",
                "--key-file",
                "-",
                &self.device_path,
            ],
            Some(passphrase),
        )
        .await?;
        if !output.success() {
            return Err(self.failure("luksFormat", &output.stderr));
        }
        info!("Formatted {} with LUKS", self.device_path);
        Ok(())
    }

    async fn open(&self, passphrase: &str) -> Result<()> {
        let output = run_command(
            &self.binary,
            &[
                "luksOpen",
                "--key-file",
                "-",
                &self.device_path,
                &self.mapped_name,
            ],
            Some(passphrase),
        )
        .await?;
        if !output.success() {
            return Err(self.failure("luksOpen", &output.stderr));
        }
        info!("Opened {} as {}", self.device_path, self.mapped_name);
        Ok(())
    }
}

/// Resolves iSCSI publications to their by-path block devices
#[derive(Default)]
pub struct CryptsetupDeviceProvider;

impl LuksDeviceProvider for CryptsetupDeviceProvider {
    fn device_for(&self, volume: &Volume, publication: &VolumePublication) -> Arc<dyn LuksDevice> {
        Arc::new(CryptsetupDevice::new(
            iscsi_device_path(publication),
            mapped_name(volume),
        ))
    }
}

// =============================================================================
// Passphrases
// =============================================================================

/// Reads passphrases from files named after the reference, as a mounted
/// Kubernetes secret lays them out
pub struct FilePassphraseSource {
    dir: PathBuf,
}

impl FilePassphraseSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PassphraseSource for FilePassphraseSource {
    async fn passphrase(&self, luks: &LuksRef) -> Result<String> {
        let name = &luks.passphrase_name;
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(Error::Validation(format!(
                "invalid passphrase name '{}'",
                name
            )));
        }
        let contents = tokio::fs::read_to_string(self.dir.join(name)).await?;
        let passphrase = contents.trim_end_matches(['\r', '\n']).to_string();
        if passphrase.is_empty() {
            return Err(Error::Validation(format!("passphrase '{}' is empty", name)));
        }
        Ok(passphrase)
    }
}

/// Passphrases held in memory
#[derive(Default)]
pub struct MemoryPassphraseSource {
    passphrases: RwLock<HashMap<String, String>>,
}

impl MemoryPassphraseSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, passphrase: impl Into<String>) {
        self.passphrases.write().insert(name.into(), passphrase.into());
    }
}

#[async_trait]
impl PassphraseSource for MemoryPassphraseSource {
    async fn passphrase(&self, luks: &LuksRef) -> Result<String> {
        self.passphrases
            .read()
            .get(&luks.passphrase_name)
            .cloned()
            .ok_or_else(|| Error::not_found("Passphrase", luks.passphrase_name.clone()))
    }
}

// =============================================================================
// In-Memory Device
// =============================================================================

/// In-memory LUKS device
pub struct MemoryLuksDevice {
    device_path: String,
    mapped_name: String,
    inner: Mutex<MemoryLuksInner>,
    formats: AtomicU32,
    opens: AtomicU32,
}

#[derive(Default)]
struct MemoryLuksInner {
    formatted: bool,
    open: bool,
    passphrase: Option<String>,
}

impl MemoryLuksDevice {
    pub fn new(device_path: impl Into<String>, mapped_name: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            mapped_name: mapped_name.into(),
            inner: Mutex::new(MemoryLuksInner::default()),
            formats: AtomicU32::new(0),
            opens: AtomicU32::new(0),
        }
    }

    /// A device that already carries a header for `passphrase`
    pub fn formatted(
        device_path: impl Into<String>,
        mapped_name: impl Into<String>,
        passphrase: &str,
    ) -> Self {
        let device = Self::new(device_path, mapped_name);
        {
            let mut inner = device.inner.lock();
            inner.formatted = true;
            inner.passphrase = Some(passphrase.to_string());
        }
        device
    }

    pub fn state(&self) -> LuksDeviceState {
        let inner = self.inner.lock();
        LuksDeviceState {
            device_path: self.device_path.clone(),
            mapped_name: self.mapped_name.clone(),
            is_formatted: inner.formatted,
            is_open: inner.open,
        }
    }

    pub fn close(&self) {
        self.inner.lock().open = false;
    }

    /// Simulate the header being overwritten out of band
    pub fn wipe(&self) {
        *self.inner.lock() = MemoryLuksInner::default();
    }

    pub fn format_count(&self) -> u32 {
        self.formats.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LuksDevice for MemoryLuksDevice {
    fn device_path(&self) -> &str {
        &self.device_path
    }

    async fn is_luks_formatted(&self) -> Result<bool> {
        Ok(self.inner.lock().formatted)
    }

    async fn is_open(&self) -> Result<bool> {
        Ok(self.inner.lock().open)
    }

    async fn luks_format(&self, passphrase: &str) -> Result<()> {
        self.formats.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.formatted = true;
        inner.open = false;
        inner.passphrase = Some(passphrase.to_string());
        Ok(())
    }

    async fn open(&self, passphrase: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.formatted {
            return Err(Error::Luks {
                device: self.device_path.clone(),
                reason: "no LUKS header".into(),
            });
        }
        if inner.passphrase.as_deref() != Some(passphrase) {
            return Err(Error::Luks {
                device: self.device_path.clone(),
                reason: "no key available with this passphrase".into(),
            });
        }
        inner.open = true;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one `MemoryLuksDevice` per volume, created on first use
#[derive(Default)]
pub struct MemoryLuksDeviceProvider {
    devices: Mutex<HashMap<String, Arc<MemoryLuksDevice>>>,
}

impl MemoryLuksDeviceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the device for `volume_name`
    pub fn insert(&self, volume_name: impl Into<String>, device: Arc<MemoryLuksDevice>) {
        self.devices.lock().insert(volume_name.into(), device);
    }

    pub fn device(&self, volume_name: &str) -> Option<Arc<MemoryLuksDevice>> {
        self.devices.lock().get(volume_name).cloned()
    }
}

impl LuksDeviceProvider for MemoryLuksDeviceProvider {
    fn device_for(&self, volume: &Volume, publication: &VolumePublication) -> Arc<dyn LuksDevice> {
        self.devices
            .lock()
            .entry(volume.name.clone())
            .or_insert_with(|| {
                Arc::new(MemoryLuksDevice::new(
                    iscsi_device_path(publication),
                    mapped_name(volume),
                ))
            })
            .clone()
    }
}
