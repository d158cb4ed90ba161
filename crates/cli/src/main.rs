// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use clap::Parser;
use satwired_config::{BoardConfig, SdDriveConfig, SerialRedirect, IOX_ENDPOINTS};
use satwired_core::Soc;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

/// Poll cadence of the cooperative loop.
const TICK: Duration = Duration::from_millis(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "SatWired iOBC emulator", long_about = None)]
struct Cli {
    /// Board configuration file (YAML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Machine type
    #[arg(long, default_value = "isis-obc")]
    machine: String,

    /// NOR-flash image, also duplicated into SDRAM like the boot copy
    #[arg(short, long)]
    bios: Option<PathBuf>,

    /// Raw image for SD card 0
    #[arg(long)]
    sd0: Option<PathBuf>,

    /// Raw image for SD card 1
    #[arg(long)]
    sd1: Option<PathBuf>,

    /// DBGU redirect: stdio or null
    #[arg(long, default_value = "stdio")]
    serial: String,

    /// Boot Mode Select pin high (boot from internal ROM)
    #[arg(long)]
    bms: bool,

    /// Directory for the peripheral sockets (default: /tmp)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Abort on accesses to unimplemented peripheral regions
    #[arg(long)]
    strict_unimplemented: bool,

    /// Warn instead of aborting on unsupported-feature accesses
    #[arg(long)]
    lenient_unsupported: bool,
}

impl Cli {
    fn into_board_config(self) -> Result<BoardConfig> {
        let mut cfg = match &self.config {
            Some(path) => BoardConfig::from_file(path)?,
            None => BoardConfig::default(),
        };

        cfg.machine = self.machine;
        if let Some(bios) = self.bios {
            cfg.bios = Some(bios);
        }
        for (index, file) in [(0u8, self.sd0), (1u8, self.sd1)] {
            if let Some(file) = file {
                cfg.sd_drives.retain(|d| d.index != index);
                cfg.sd_drives.push(SdDriveConfig {
                    index,
                    file,
                    format: "raw".to_string(),
                });
            }
        }
        cfg.serial = match self.serial.as_str() {
            "stdio" => SerialRedirect::Stdio,
            "null" => SerialRedirect::Null,
            other => anyhow::bail!("unknown serial redirect '{}'", other),
        };
        if self.bms {
            cfg.bms = true;
        }
        if let Some(dir) = &self.socket_dir {
            for endpoint in IOX_ENDPOINTS {
                cfg.sockets.insert(
                    endpoint.to_string(),
                    Some(dir.join(format!("qemu_at91_{endpoint}"))),
                );
            }
        }
        if self.strict_unimplemented {
            cfg.strict_unimplemented = true;
        }
        if self.lenient_unsupported {
            cfg.strict_unsupported = false;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

/// Host stdin feeds the DBGU; a reader thread keeps the core loop
/// non-blocking.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn run(config: BoardConfig) -> Result<()> {
    let forward_stdin = matches!(config.serial, SerialRedirect::Stdio);
    let mut soc = Soc::from_config(&config).context("Failed to assemble the board")?;

    info!("board '{}' up, entering event loop", config.machine);

    let stdin = if forward_stdin {
        Some(spawn_stdin_reader())
    } else {
        None
    };

    let mut last = Instant::now();
    loop {
        std::thread::sleep(TICK);

        let now = Instant::now();
        let delta = now.duration_since(last);
        last = now;

        if let Some(stdin) = &stdin {
            while let Ok(chunk) = stdin.try_recv() {
                soc.dbgu_input(&chunk);
            }
        }

        soc.step(delta.as_nanos() as u64)
            .context("emulation aborted")?;
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.into_board_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "satwired",
            "--bios",
            "/opt/fw.bin",
            "--sd0",
            "/opt/sd0.img",
            "--serial",
            "null",
            "--bms",
        ]);
        let cfg = cli.into_board_config().unwrap();
        assert_eq!(cfg.bios, Some(PathBuf::from("/opt/fw.bin")));
        assert_eq!(cfg.sd_image(0), Some(std::path::Path::new("/opt/sd0.img")));
        assert!(matches!(cfg.serial, SerialRedirect::Null));
        assert!(cfg.bms);
    }

    #[test]
    fn test_socket_dir_rewrites_paths() {
        let cli = Cli::parse_from(["satwired", "--socket-dir", "/run/sim"]);
        let cfg = cli.into_board_config().unwrap();
        assert_eq!(
            cfg.socket_path("usart0"),
            Some(PathBuf::from("/run/sim/qemu_at91_usart0"))
        );
    }

    #[test]
    fn test_bad_serial_mode_is_rejected() {
        let cli = Cli::parse_from(["satwired", "--serial", "telnet"]);
        assert!(cli.into_board_config().is_err());
    }
}
