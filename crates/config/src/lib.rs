// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_machine() -> String {
    "isis-obc".to_string()
}

/// Peripherals that expose an I/O transfer socket, in the order the SoC
/// creates them.
pub const IOX_ENDPOINTS: &[&str] = &[
    "usart0", "usart1", "usart2", "usart3", "usart4", "usart5", "spi0", "spi1", "twi", "pioa",
    "piob", "pioc", "sdramc",
];

/// Well-known socket path for a peripheral instance, matching the paths the
/// original board exposed (`/tmp/qemu_at91_<name>`).
pub fn default_socket_path(endpoint: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/qemu_at91_{endpoint}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialRedirect {
    /// DBGU wired to the host's stdin/stdout.
    #[default]
    Stdio,
    /// DBGU output discarded, input never arrives.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdDriveConfig {
    /// Slot index; the iOBC multiplexes two cards on slot A, selected via
    /// PIO B pin 7.
    pub index: u8,
    pub file: PathBuf,
    #[serde(default = "default_sd_format")]
    pub format: String,
}

fn default_sd_format() -> String {
    "raw".to_string()
}

/// Parsed board configuration. Command-line parsing itself lives in the CLI
/// crate; the core only ever sees this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Machine type; only "isis-obc" is known.
    #[serde(default = "default_machine")]
    pub machine: String,

    /// NOR-flash image, also duplicated into SDRAM to emulate the hardware
    /// copy performed at reset.
    #[serde(default)]
    pub bios: Option<PathBuf>,

    /// SD card images (index 0 and 1).
    #[serde(default)]
    pub sd_drives: Vec<SdDriveConfig>,

    #[serde(default)]
    pub serial: SerialRedirect,

    /// Boot Mode Select pin. High boots from internal ROM, low from
    /// EBI_NCS0 (NOR flash).
    #[serde(default)]
    pub bms: bool,

    /// Per-endpoint socket path overrides; unlisted endpoints use
    /// `default_socket_path`. An endpoint mapped to `null` gets no socket.
    #[serde(default)]
    pub sockets: HashMap<String, Option<PathBuf>>,

    /// Abort on accesses to unimplemented peripheral regions instead of
    /// warning and returning zero.
    #[serde(default)]
    pub strict_unimplemented: bool,

    /// Abort on unsupported-feature accesses instead of warning. Defaults
    /// to true: silently wrong results would mask OBSW bugs.
    #[serde(default = "default_true")]
    pub strict_unsupported: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            machine: default_machine(),
            bios: None,
            sd_drives: Vec::new(),
            serial: SerialRedirect::default(),
            bms: false,
            sockets: HashMap::new(),
            strict_unimplemented: false,
            strict_unsupported: true,
        }
    }
}

impl BoardConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read board config {:?}", path))?;
        let cfg: Self =
            serde_yaml::from_str(&content).context("Failed to parse board config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine != "isis-obc" {
            bail!("unknown machine type '{}'", self.machine);
        }
        for drive in &self.sd_drives {
            if drive.index > 1 {
                bail!("SD drive index {} out of range (0..=1)", drive.index);
            }
            if drive.format != "raw" {
                bail!("unsupported SD image format '{}'", drive.format);
            }
        }
        for endpoint in self.sockets.keys() {
            if !IOX_ENDPOINTS.contains(&endpoint.as_str()) {
                bail!("unknown IOX endpoint '{}'", endpoint);
            }
        }
        Ok(())
    }

    /// Resolved socket path for an endpoint, honoring overrides.
    pub fn socket_path(&self, endpoint: &str) -> Option<PathBuf> {
        match self.sockets.get(endpoint) {
            Some(path) => path.clone(),
            None => Some(default_socket_path(endpoint)),
        }
    }

    /// Configuration with every IOX socket disabled, for embedding the SoC
    /// without filesystem side effects (unit tests, library use).
    pub fn headless() -> Self {
        let mut cfg = Self::default();
        for endpoint in IOX_ENDPOINTS {
            cfg.sockets.insert(endpoint.to_string(), None);
        }
        cfg
    }

    pub fn sd_image(&self, index: u8) -> Option<&Path> {
        self.sd_drives
            .iter()
            .find(|d| d.index == index)
            .map(|d| d.file.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = BoardConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.machine, "isis-obc");
        assert!(cfg.strict_unsupported);
    }

    #[test]
    fn test_socket_path_defaults_and_overrides() {
        let mut cfg = BoardConfig::default();
        assert_eq!(
            cfg.socket_path("usart0"),
            Some(PathBuf::from("/tmp/qemu_at91_usart0"))
        );

        cfg.sockets
            .insert("twi".to_string(), Some(PathBuf::from("/run/sim/twi")));
        cfg.sockets.insert("spi1".to_string(), None);
        assert_eq!(cfg.socket_path("twi"), Some(PathBuf::from("/run/sim/twi")));
        assert_eq!(cfg.socket_path("spi1"), None);
    }

    #[test]
    fn test_validate_rejects_bad_machine_and_drives() {
        let mut cfg = BoardConfig {
            machine: "mps2-an385".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        cfg.machine = default_machine();
        cfg.sd_drives.push(SdDriveConfig {
            index: 2,
            file: PathBuf::from("/tmp/card.img"),
            format: "raw".to_string(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
machine: isis-obc
bios: /opt/obsw/norflash.bin
sd_drives:
  - index: 0
    file: /opt/obsw/sd0.img
bms: true
"#;
        let cfg: BoardConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.bms);
        assert_eq!(cfg.sd_image(0), Some(Path::new("/opt/obsw/sd0.img")));
        assert_eq!(cfg.sd_image(1), None);
    }
}
