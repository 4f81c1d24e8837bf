//! Standby extension: image staging for the deploy flow.
//!
//! `standby.cache_image` downloads and writes an image to the OS install
//! device; `standby.prepare_image` additionally writes the configdrive;
//! `standby.run_image` reboots into the freshly written OS. All three are
//! long-running and execute on the async command path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use ingot_hardware::HardwareRegistry;
use ingot_proto::RestError;

use crate::commands::{CommandRegistry, CommandValidator};

#[derive(Debug, Clone, Deserialize)]
struct ImageInfo {
    id: String,
    urls: Vec<String>,
    hashes: HashMap<String, String>,
}

pub struct StandbyExtension {
    hardware: Arc<HardwareRegistry>,
    http: reqwest::Client,
    download_dir: PathBuf,
    cached_image_id: Mutex<Option<String>>,
}

impl StandbyExtension {
    pub fn new(hardware: Arc<HardwareRegistry>) -> Arc<Self> {
        Self::with_download_dir(hardware, "/tmp")
    }

    /// Stage downloads somewhere other than /tmp. Used by tests.
    pub fn with_download_dir(
        hardware: Arc<HardwareRegistry>,
        download_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hardware,
            http: reqwest::Client::new(),
            download_dir: download_dir.into(),
            cached_image_id: Mutex::new(None),
        })
    }

    pub fn register(self: &Arc<Self>, registry: &mut CommandRegistry) {
        let validator: CommandValidator = Arc::new(validate_image_info);

        let ext = self.clone();
        registry.register_async(
            "standby",
            "cache_image",
            Some(validator.clone()),
            Arc::new(move |_name, params| {
                let ext = ext.clone();
                Box::pin(async move { ext.cache_image(params).await })
            }),
        );

        let ext = self.clone();
        registry.register_async(
            "standby",
            "prepare_image",
            Some(validator),
            Arc::new(move |_name, params| {
                let ext = ext.clone();
                Box::pin(async move { ext.prepare_image(params).await })
            }),
        );

        let ext = self.clone();
        registry.register_async(
            "standby",
            "run_image",
            None,
            Arc::new(move |_name, _params| {
                let ext = ext.clone();
                Box::pin(async move { ext.run_image().await })
            }),
        );
    }

    fn image_location(&self, image_id: &str) -> PathBuf {
        self.download_dir.join(image_id)
    }

    fn configdrive_location(&self) -> PathBuf {
        self.download_dir.join("configdrive")
    }

    async fn cache_image(&self, params: Value) -> Result<Value, RestError> {
        let image_info = parse_image_info(&params)?;
        let force = params
            .get("force")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let device = self.hardware.get_os_install_device().await?;

        let cached = self.cached_image_id.lock().clone();
        if force || cached.as_deref() != Some(image_info.id.as_str()) {
            self.fetch_and_write(&image_info, &device).await?;
        }
        Ok(Value::Null)
    }

    async fn prepare_image(&self, params: Value) -> Result<Value, RestError> {
        let image_info = parse_image_info(&params)?;
        let device = self.hardware.get_os_install_device().await?;

        // don't write the image again if it is already on the device
        let cached = self.cached_image_id.lock().clone();
        if cached.as_deref() != Some(image_info.id.as_str()) {
            self.fetch_and_write(&image_info, &device).await?;
        }

        if let Some(configdrive) = params.get("configdrive").and_then(Value::as_str) {
            self.write_configdrive(configdrive, &device).await?;
        }
        Ok(Value::Null)
    }

    async fn run_image(&self) -> Result<Value, RestError> {
        info!("rebooting system");
        let output = Command::new("reboot")
            .output()
            .await
            .map_err(|err| RestError::SystemReboot {
                details: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RestError::SystemReboot {
                details: format!(
                    "reboot failed with {}. stdout: {}. stderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(Value::Null)
    }

    async fn fetch_and_write(&self, image_info: &ImageInfo, device: &str) -> Result<(), RestError> {
        self.download_image(image_info).await?;
        self.write_image(image_info, device).await?;
        *self.cached_image_id.lock() = Some(image_info.id.clone());
        Ok(())
    }

    /// Try each image URL in order; the first one that streams to disk and
    /// passes checksum verification wins.
    async fn download_image(&self, image_info: &ImageInfo) -> Result<(), RestError> {
        let location = self.image_location(&image_info.id);
        let started = Instant::now();

        let mut downloaded = false;
        for url in &image_info.urls {
            info!(url = %url, image = %image_info.id, "attempting to download image");
            match self.stream_to_file(url, &location).await {
                Ok(()) => {
                    downloaded = true;
                    break;
                }
                Err(err) => {
                    warn!(url = %url, error = %err, elapsed = ?started.elapsed(), "image download failed");
                }
            }
        }
        if !downloaded {
            return Err(RestError::ImageDownload {
                details: format!("could not download image with id {}", image_info.id),
            });
        }
        info!(image = %image_info.id, elapsed = ?started.elapsed(), "image downloaded");

        if !self.verify_image(image_info, &location).await? {
            return Err(RestError::ImageChecksum {
                details: format!(
                    "image with id {} failed to verify against checksum",
                    image_info.id
                ),
            });
        }
        Ok(())
    }

    async fn stream_to_file(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let response = self.http.get(url).send().await?;
        if response.status() != StatusCode::OK {
            anyhow::bail!("unexpected status {}", response.status());
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Check the image against any hash whose algorithm we know; unknown
    /// algorithms are skipped so a newer central service can send digests an
    /// older agent has never heard of.
    async fn verify_image(
        &self,
        image_info: &ImageInfo,
        location: &Path,
    ) -> Result<bool, RestError> {
        for (algorithm, expected) in &image_info.hashes {
            let digest = match algorithm.as_str() {
                "sha256" => Some(file_digest::<Sha256>(location).await?),
                "sha512" => Some(file_digest::<Sha512>(location).await?),
                _ => None,
            };
            let Some(digest) = digest else { continue };
            if digest == *expected {
                return Ok(true);
            }
            warn!(
                image = %image_info.id,
                algorithm = %algorithm,
                expected = %expected,
                actual = %digest,
                "image verification failed"
            );
        }
        Ok(false)
    }

    async fn write_image(&self, image_info: &ImageInfo, device: &str) -> Result<(), RestError> {
        let image = self.image_location(&image_info.id);
        info!(image = %image.display(), device, "writing image to device");
        let started = Instant::now();

        let output = Command::new("dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={device}"))
            .args(["bs=1M", "oflag=direct", "conv=fdatasync"])
            .output()
            .await
            .map_err(|err| RestError::ImageWrite {
                details: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RestError::ImageWrite {
                details: format!(
                    "writing image to device {device} failed with {}. stdout: {}. stderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!(device, elapsed = ?started.elapsed(), "image written to device");
        Ok(())
    }

    /// Decode the base64 configdrive payload and copy it onto the device's
    /// configdrive partition.
    async fn write_configdrive(&self, configdrive: &str, device: &str) -> Result<(), RestError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(configdrive)
            .map_err(|err| RestError::ConfigDriveWrite {
                details: format!("configdrive is not valid base64: {err}"),
            })?;

        let location = self.configdrive_location();
        tokio::fs::write(&location, &data)
            .await
            .map_err(|err| RestError::ConfigDriveWrite {
                details: err.to_string(),
            })?;

        info!(configdrive = %location.display(), device, "copying configdrive to device");
        let output = Command::new("dd")
            .arg(format!("if={}", location.display()))
            .arg(format!("of={device}"))
            .args(["bs=64K", "oflag=direct", "conv=fdatasync"])
            .output()
            .await
            .map_err(|err| RestError::ConfigDriveWrite {
                details: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RestError::ConfigDriveWrite {
                details: format!(
                    "writing configdrive to device {device} failed with {}. stdout: {}. stderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

fn parse_image_info(params: &Value) -> Result<ImageInfo, RestError> {
    let image_info = params.get("image_info").cloned().unwrap_or(Value::Null);
    serde_json::from_value(image_info).map_err(|err| RestError::InvalidCommandParams {
        details: format!("malformed image_info: {err}"),
    })
}

/// Params validator shared by `cache_image` and `prepare_image`, run before
/// the command is enqueued.
fn validate_image_info(params: &Value) -> Result<(), RestError> {
    let image_info = params.get("image_info").cloned().unwrap_or(Value::Null);

    for field in ["id", "urls", "hashes"] {
        if image_info.get(field).is_none() {
            return Err(RestError::InvalidCommandParams {
                details: format!("image_info is missing '{field}' field"),
            });
        }
    }

    let urls_ok = image_info
        .get("urls")
        .and_then(Value::as_array)
        .is_some_and(|urls| !urls.is_empty());
    if !urls_ok {
        return Err(RestError::InvalidCommandParams {
            details: "image_info 'urls' must be a list with at least one element".to_string(),
        });
    }

    let hashes_ok = image_info
        .get("hashes")
        .and_then(Value::as_object)
        .is_some_and(|hashes| !hashes.is_empty());
    if !hashes_ok {
        return Err(RestError::InvalidCommandParams {
            details: "image_info 'hashes' must be a mapping with at least one element".to_string(),
        });
    }

    Ok(())
}

/// Hex digest of a file, streamed in 1 MiB chunks.
async fn file_digest<D: Digest>(path: &Path) -> Result<String, RestError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| RestError::ImageChecksum {
            details: err.to_string(),
        })?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| RestError::ImageChecksum {
                details: err.to_string(),
            })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
