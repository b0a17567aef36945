//! Input device probing and selection.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            host.default_input_device()
                .map(|d| DeviceInfo {
                    name: d
                        .name()
                        .unwrap_or_else(|_| "Default Input Device".to_string()),
                    is_default: true,
                })
                .into_iter()
                .collect()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve the input device to capture from.
///
/// Probe order: the preferred name if it matches an enumerable device, then
/// the system default input, then the first device that reports a usable
/// default input config.
#[cfg(feature = "audio-cpal")]
pub fn select_input_device(
    host: &cpal::Host,
    preferred_name: Option<&str>,
) -> Option<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(preferred) = preferred_name {
        match host.input_devices() {
            Ok(mut devices) => {
                let found = devices
                    .find(|device| device.name().map(|n| n == preferred).unwrap_or(false));
                if let Some(device) = found {
                    return Some(device);
                }
                tracing::warn!("preferred input device '{preferred}' not found, falling back");
            }
            Err(e) => {
                tracing::warn!("failed to list input devices while resolving preference: {e}");
            }
        }
    }

    if let Some(default) = host.default_input_device() {
        return Some(default);
    }

    let first = host
        .input_devices()
        .ok()?
        .find(|device| device.default_input_config().is_ok());
    if first.is_some() {
        tracing::warn!("no default input device, falling back to first usable input");
    }
    first
}
