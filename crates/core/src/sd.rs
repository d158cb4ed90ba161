// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! SD bus collaborator for the MCI host. The interface is intentionally
//! small: command/response plus a byte-wise data stream. `SdCardImage`
//! models a standard-capacity card backed by a raw 512-byte-sector image;
//! `EmptySlot` is the absent card (every command times out).

use crate::{SocError, SocResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SD_SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdRequest {
    pub cmd: u8,
    pub arg: u32,
}

/// Raw response bytes as they would appear on the CMD line, minus framing:
/// empty, 4 bytes (48-bit), or 16 bytes (136-bit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdCommandOutcome {
    Response(Vec<u8>),
    Timeout,
}

pub trait SdBus: std::fmt::Debug {
    fn do_command(&mut self, req: &SdRequest) -> SocResult<SdCommandOutcome>;
    fn data_ready(&self) -> bool;
    fn read_data(&mut self) -> SocResult<u8>;
    fn write_data(&mut self, byte: u8) -> SocResult<()>;
    fn reset(&mut self);
}

/// An unpopulated SD slot.
#[derive(Debug, Default)]
pub struct EmptySlot;

impl SdBus for EmptySlot {
    fn do_command(&mut self, _req: &SdRequest) -> SocResult<SdCommandOutcome> {
        Ok(SdCommandOutcome::Timeout)
    }

    fn data_ready(&self) -> bool {
        false
    }

    fn read_data(&mut self) -> SocResult<u8> {
        Err(SocError::access("sd.empty", 0, "data read from empty slot"))
    }

    fn write_data(&mut self, _byte: u8) -> SocResult<()> {
        Err(SocError::access("sd.empty", 0, "data write to empty slot"))
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    None,
    /// Reading; `end` is exclusive, `u64::MAX` for an open-ended multiple
    /// block read.
    Read { pos: u64, end: u64 },
    Write { pos: u64, end: u64 },
}

/// Standard-capacity card over a raw image. Byte addressing, 512-byte
/// sectors; writes go back to the backing file sector by sector.
#[derive(Debug)]
pub struct SdCardImage {
    image: Vec<u8>,
    backing: Option<File>,
    rca: u32,
    block_len: u64,
    app_cmd: bool,
    stream: Stream,
}

impl SdCardImage {
    pub fn from_file<P: AsRef<Path>>(path: P) -> SocResult<Self> {
        let mut backing = OpenOptions::new().read(true).write(true).open(path)?;
        let mut image = Vec::new();
        backing.read_to_end(&mut image)?;
        Ok(Self {
            image,
            backing: Some(backing),
            rca: 0x4567,
            block_len: SD_SECTOR_SIZE as u64,
            app_cmd: false,
            stream: Stream::None,
        })
    }

    /// In-memory card, used by tests and for volatile scratch cards.
    pub fn from_vec(image: Vec<u8>) -> Self {
        Self {
            image,
            backing: None,
            rca: 0x4567,
            block_len: SD_SECTOR_SIZE as u64,
            app_cmd: false,
            stream: Stream::None,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.image.len() as u64
    }

    fn r1(&self) -> SdCommandOutcome {
        // card status: app-cmd echo is the only interesting bit here
        let status: u32 = if self.app_cmd { 1 << 5 } else { 0 };
        SdCommandOutcome::Response(status.to_be_bytes().to_vec())
    }

    fn r1_for_arg(status: u32) -> SdCommandOutcome {
        SdCommandOutcome::Response(status.to_be_bytes().to_vec())
    }

    fn long_response(payload: [u8; 16]) -> SdCommandOutcome {
        SdCommandOutcome::Response(payload.to_vec())
    }

    fn flush_sector(&mut self, sector_start: u64) -> SocResult<()> {
        if let Some(file) = self.backing.as_mut() {
            let start = sector_start as usize;
            let end = (start + SD_SECTOR_SIZE).min(self.image.len());
            file.seek(SeekFrom::Start(sector_start))?;
            file.write_all(&self.image[start..end])?;
        }
        Ok(())
    }

    fn handle_app_command(&mut self, req: &SdRequest) -> SocResult<SdCommandOutcome> {
        match req.cmd {
            // ACMD41 SD_SEND_OP_COND: powered up, SDSC
            41 => Ok(SdCommandOutcome::Response(
                0x8030_0000u32.to_be_bytes().to_vec(),
            )),
            // ACMD6 SET_BUS_WIDTH and friends: plain R1
            _ => Ok(self.r1()),
        }
    }
}

impl SdBus for SdCardImage {
    fn do_command(&mut self, req: &SdRequest) -> SocResult<SdCommandOutcome> {
        if self.app_cmd {
            self.app_cmd = false;
            return self.handle_app_command(req);
        }

        match req.cmd {
            // GO_IDLE_STATE
            0 => {
                self.stream = Stream::None;
                Ok(SdCommandOutcome::Response(Vec::new()))
            }

            // ALL_SEND_CID / SEND_CID / SEND_CSD
            2 | 9 | 10 => Ok(Self::long_response([0u8; 16])),

            // SEND_RELATIVE_ADDR
            3 => Ok(Self::r1_for_arg(self.rca << 16)),

            // SELECT/DESELECT_CARD, stateless here
            7 => Ok(self.r1()),

            // SEND_IF_COND: echo the check pattern (R7)
            8 => Ok(Self::r1_for_arg(req.arg & 0xFFF)),

            // STOP_TRANSMISSION
            12 => {
                if let Stream::Write { pos, .. } = self.stream {
                    self.flush_sector(pos & !(SD_SECTOR_SIZE as u64 - 1))?;
                }
                self.stream = Stream::None;
                Ok(self.r1())
            }

            // SEND_STATUS
            13 => Ok(self.r1()),

            // SET_BLOCKLEN
            16 => {
                self.block_len = req.arg as u64;
                Ok(self.r1())
            }

            // READ_SINGLE_BLOCK / READ_MULTIPLE_BLOCK
            17 | 18 => {
                let end = if req.cmd == 17 {
                    req.arg as u64 + self.block_len
                } else {
                    u64::MAX
                };
                self.stream = Stream::Read {
                    pos: req.arg as u64,
                    end,
                };
                Ok(self.r1())
            }

            // WRITE_BLOCK / WRITE_MULTIPLE_BLOCK
            24 | 25 => {
                let end = if req.cmd == 24 {
                    req.arg as u64 + self.block_len
                } else {
                    u64::MAX
                };
                self.stream = Stream::Write {
                    pos: req.arg as u64,
                    end,
                };
                Ok(self.r1())
            }

            // APP_CMD: next command is application-specific
            55 => {
                self.app_cmd = true;
                Ok(self.r1())
            }

            other => {
                tracing::warn!("sd.card: unhandled command CMD{}, responding R1", other);
                Ok(self.r1())
            }
        }
    }

    fn data_ready(&self) -> bool {
        match self.stream {
            Stream::Read { pos, end } => pos < end && pos < self.image.len() as u64,
            _ => false,
        }
    }

    fn read_data(&mut self) -> SocResult<u8> {
        let Stream::Read { pos, end } = &mut self.stream else {
            return Err(SocError::access("sd.card", 0, "data read without read command"));
        };

        let index = *pos as usize;
        if *pos >= *end || index >= self.image.len() {
            return Err(SocError::access("sd.card", 0, "data read past end of stream"));
        }

        let byte = self.image[index];
        *pos += 1;
        if *pos >= *end {
            self.stream = Stream::None;
        }
        Ok(byte)
    }

    fn write_data(&mut self, byte: u8) -> SocResult<()> {
        let Stream::Write { pos, end } = &mut self.stream else {
            return Err(SocError::access("sd.card", 0, "data write without write command"));
        };

        let index = *pos as usize;
        if *pos >= *end || index >= self.image.len() {
            return Err(SocError::access("sd.card", 0, "data write past end of stream"));
        }

        self.image[index] = byte;
        let cur = *pos;
        *pos += 1;
        let finished = *pos >= *end;

        // write the sector back once its last byte lands
        if (cur + 1) % SD_SECTOR_SIZE as u64 == 0 {
            let sector_start = cur & !(SD_SECTOR_SIZE as u64 - 1);
            self.flush_sector(sector_start)?;
        }
        if finished {
            self.stream = Stream::None;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.stream = Stream::None;
        self.app_cmd = false;
        self.block_len = SD_SECTOR_SIZE as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_card(sectors: usize) -> SdCardImage {
        let image: Vec<u8> = (0..sectors * SD_SECTOR_SIZE).map(|i| i as u8).collect();
        SdCardImage::from_vec(image)
    }

    #[test]
    fn test_single_block_read_stream() {
        let mut card = patterned_card(2);
        let outcome = card
            .do_command(&SdRequest { cmd: 17, arg: 0 })
            .unwrap();
        assert!(matches!(outcome, SdCommandOutcome::Response(ref r) if r.len() == 4));

        let mut data = Vec::new();
        while card.data_ready() {
            data.push(card.read_data().unwrap());
        }
        assert_eq!(data.len(), SD_SECTOR_SIZE);
        assert!(data.iter().enumerate().all(|(i, &b)| b == i as u8));

        // the stream is exhausted
        assert!(card.read_data().is_err());
    }

    #[test]
    fn test_multiple_block_read_until_stop() {
        let mut card = patterned_card(3);
        card.do_command(&SdRequest { cmd: 18, arg: 512 }).unwrap();

        for _ in 0..2 * SD_SECTOR_SIZE {
            card.read_data().unwrap();
        }
        assert!(card.data_ready(), "open-ended until STOP_TRANSMISSION");

        card.do_command(&SdRequest { cmd: 12, arg: 0 }).unwrap();
        assert!(!card.data_ready());
    }

    #[test]
    fn test_write_block_modifies_image() {
        let mut card = patterned_card(1);
        card.do_command(&SdRequest { cmd: 24, arg: 0 }).unwrap();
        for _ in 0..SD_SECTOR_SIZE {
            card.write_data(0xAB).unwrap();
        }

        card.do_command(&SdRequest { cmd: 17, arg: 0 }).unwrap();
        assert_eq!(card.read_data().unwrap(), 0xAB);
    }

    #[test]
    fn test_acmd41_reports_powered_up() {
        let mut card = patterned_card(1);
        card.do_command(&SdRequest { cmd: 55, arg: 0 }).unwrap();
        let outcome = card.do_command(&SdRequest { cmd: 41, arg: 0 }).unwrap();
        let SdCommandOutcome::Response(bytes) = outcome else {
            panic!("expected response");
        };
        assert_eq!(bytes[0] & 0x80, 0x80);
    }

    #[test]
    fn test_empty_slot_times_out() {
        let mut slot = EmptySlot;
        assert_eq!(
            slot.do_command(&SdRequest { cmd: 17, arg: 0 }).unwrap(),
            SdCommandOutcome::Timeout
        );
        assert!(!slot.data_ready());
        assert!(slot.read_data().is_err());
    }

    #[test]
    fn test_data_access_without_command_is_an_error() {
        let mut card = patterned_card(1);
        assert!(card.read_data().is_err());
        assert!(card.write_data(0).is_err());
    }
}
