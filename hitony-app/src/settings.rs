//! Persistent daemon settings (JSON file).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Conversation server endpoint.
    pub server_url: String,
    /// Wake phrase reported to the server on detect.
    pub wake_phrase: String,
    /// Hardware MAC override as 12 hex chars; when absent a stable
    /// host-derived value is used.
    pub mac: Option<String>,
    /// VAD sensitivity 0 (lenient) to 3 (aggressive).
    pub vad_sensitivity: u8,
    /// Enable acoustic echo cancellation (3-channel front-end layout).
    pub enable_aec: bool,
    /// Re-enter listening automatically after a reply. Off by default.
    pub auto_listen: bool,
    /// Tracing filter when RUST_LOG is not set.
    pub log_filter: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9001/ws".into(),
            wake_phrase: "Hi Tony".into(),
            mac: None,
            vad_sensitivity: 1,
            enable_aec: true,
            auto_listen: false,
            log_filter: "hitony=info".into(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.vad_sensitivity = self.vad_sensitivity.min(3);
        if self.server_url.trim().is_empty() {
            self.server_url = Self::default().server_url;
        }
        if self.wake_phrase.trim().is_empty() {
            self.wake_phrase = Self::default().wake_phrase;
        }
        self.mac = self
            .mac
            .as_ref()
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| m.len() == 12 && m.chars().all(|c| c.is_ascii_hexdigit()));
    }

    /// Parse the MAC override, or derive a stable pseudo-MAC from the
    /// hostname so the device identity survives restarts.
    pub fn resolve_mac(&self) -> [u8; 6] {
        if let Some(mac) = &self.mac {
            let mut out = [0u8; 6];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&mac[i * 2..i * 2 + 2], 16).unwrap_or(0);
            }
            return out;
        }

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "hitony-host".into());
        let mut out = [0u8; 6];
        let mut acc: u32 = 0x9E37;
        for (i, b) in host.bytes().enumerate() {
            acc = acc.wrapping_mul(31).wrapping_add(u32::from(b));
            out[i % 6] ^= (acc & 0xFF) as u8;
        }
        out
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("hitony")
        .join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_malformed_mac() {
        let mut settings = AppSettings {
            mac: Some("xyz".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.mac, None);

        let mut settings = AppSettings {
            mac: Some("aabbcc010203".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.mac.as_deref(), Some("AABBCC010203"));
        assert_eq!(
            settings.resolve_mac(),
            [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn sensitivity_is_clamped() {
        let mut settings = AppSettings {
            vad_sensitivity: 9,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.vad_sensitivity, 3);
    }
}
