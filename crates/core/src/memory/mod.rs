// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Guest address space: on-chip memories, external flash/SDRAM, and the
//! remappable boot-memory window at address zero.

use crate::{SocError, SocResult};
use serde::{Deserialize, Serialize};

pub const BOOTMEM_BASE: u64 = 0x0000_0000;
pub const BOOTMEM_SIZE: u64 = 0x0010_0000;
pub const ROM_BASE: u64 = 0x0010_0000;
pub const ROM_SIZE: u64 = 0x8000;
pub const SRAM0_BASE: u64 = 0x0020_0000;
pub const SRAM0_SIZE: u64 = 0x4000;
pub const SRAM1_BASE: u64 = 0x0030_0000;
pub const SRAM1_SIZE: u64 = 0x4000;
pub const PFLASH_BASE: u64 = 0x1000_0000;
pub const PFLASH_SIZE: u64 = 0x1000_0000;
pub const SDRAM_BASE: u64 = 0x2000_0000;
pub const SDRAM_SIZE: u64 = 0x1000_0000;

/// Live target of the boot-memory alias at 0x0000_0000. Exactly one target
/// is mapped at any time; the Matrix MRCR register and the BMS pin decide
/// which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootmemTarget {
    Rom,
    Sram0,
    EbiNcs0,
}

impl BootmemTarget {
    pub fn name(self) -> &'static str {
        match self {
            BootmemTarget::Rom => "ROM",
            BootmemTarget::Sram0 => "SRAM0",
            BootmemTarget::EbiNcs0 => "EBI_NCS0",
        }
    }
}

/// A flat backing store mapped at a fixed base address.
struct Region {
    name: &'static str,
    base: u64,
    data: Vec<u8>,
    writable: bool,
}

impl Region {
    fn new(name: &'static str, base: u64, size: u64, writable: bool) -> Self {
        Self {
            name,
            base,
            data: vec![0; size as usize],
            writable,
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.data.len() as u64
    }
}

pub struct AddressSpace {
    rom: Region,
    sram0: Region,
    sram1: Region,
    pflash: Region,
    sdram: Region,
    bootmem_target: BootmemTarget,
}

enum Slot {
    Rom,
    Sram0,
    Sram1,
    Pflash,
    Sdram,
}

impl AddressSpace {
    /// BMS high boots from internal ROM, low from NOR flash on EBI_NCS0
    /// (REMAP is zero out of reset).
    pub fn new(bms: bool) -> Self {
        Self {
            rom: Region::new("iobc.internal.rom", ROM_BASE, ROM_SIZE, false),
            sram0: Region::new("iobc.internal.sram0", SRAM0_BASE, SRAM0_SIZE, true),
            sram1: Region::new("iobc.internal.sram1", SRAM1_BASE, SRAM1_SIZE, true),
            pflash: Region::new("iobc.pflash", PFLASH_BASE, PFLASH_SIZE, true),
            sdram: Region::new("iobc.sdram", SDRAM_BASE, SDRAM_SIZE, true),
            bootmem_target: if bms {
                BootmemTarget::Rom
            } else {
                BootmemTarget::EbiNcs0
            },
        }
    }

    pub fn bootmem_target(&self) -> BootmemTarget {
        self.bootmem_target
    }

    /// Switch the boot-memory alias. The target field is single-valued, so
    /// no access can observe the old and new mapping at once.
    pub fn remap_bootmem(&mut self, target: BootmemTarget) {
        if self.bootmem_target != target {
            tracing::info!("remapping bootmem to {}", target.name());
            self.bootmem_target = target;
        }
    }

    /// Load a firmware image into NOR flash and duplicate it into SDRAM,
    /// emulating the hardware copy performed at reset.
    pub fn load_firmware(&mut self, image: &[u8]) -> SocResult<()> {
        if image.len() as u64 > PFLASH_SIZE {
            return Err(SocError::access(
                "iobc.pflash",
                0,
                format!("firmware image of {} bytes exceeds flash size", image.len()),
            ));
        }
        self.pflash.data[..image.len()].copy_from_slice(image);
        self.sdram.data[..image.len()].copy_from_slice(image);
        Ok(())
    }

    /// True if `addr` falls into any RAM/ROM/flash window (including the
    /// bootmem alias); peripheral windows are not memory.
    pub fn contains(&self, addr: u64) -> bool {
        addr < BOOTMEM_BASE + BOOTMEM_SIZE
            || self.rom.contains(addr)
            || self.sram0.contains(addr)
            || self.sram1.contains(addr)
            || self.pflash.contains(addr)
            || self.sdram.contains(addr)
    }

    fn resolve(&self, addr: u64) -> SocResult<(Slot, usize)> {
        // the alias window redirects into its target region
        let addr = if addr < BOOTMEM_BASE + BOOTMEM_SIZE {
            let offset = addr - BOOTMEM_BASE;
            match self.bootmem_target {
                BootmemTarget::Rom => ROM_BASE + offset,
                BootmemTarget::Sram0 => SRAM0_BASE + offset,
                BootmemTarget::EbiNcs0 => PFLASH_BASE + offset,
            }
        } else {
            addr
        };

        let (slot, region) = if self.rom.contains(addr) {
            (Slot::Rom, &self.rom)
        } else if self.sram0.contains(addr) {
            (Slot::Sram0, &self.sram0)
        } else if self.sram1.contains(addr) {
            (Slot::Sram1, &self.sram1)
        } else if self.pflash.contains(addr) {
            (Slot::Pflash, &self.pflash)
        } else if self.sdram.contains(addr) {
            (Slot::Sdram, &self.sdram)
        } else {
            return Err(SocError::MemoryViolation(addr));
        };

        Ok((slot, (addr - region.base) as usize))
    }

    fn region(&self, slot: Slot) -> &Region {
        match slot {
            Slot::Rom => &self.rom,
            Slot::Sram0 => &self.sram0,
            Slot::Sram1 => &self.sram1,
            Slot::Pflash => &self.pflash,
            Slot::Sdram => &self.sdram,
        }
    }

    fn region_mut(&mut self, slot: Slot) -> &mut Region {
        match slot {
            Slot::Rom => &mut self.rom,
            Slot::Sram0 => &mut self.sram0,
            Slot::Sram1 => &mut self.sram1,
            Slot::Pflash => &mut self.pflash,
            Slot::Sdram => &mut self.sdram,
        }
    }

    /// Bus-master read into `buf`, as performed by the PDC and MCI.
    pub fn dma_read(&self, mut addr: u64, buf: &mut [u8]) -> SocResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let (slot, offset) = self.resolve(addr)?;
            let region = self.region(slot);
            let chunk = (region.data.len() - offset).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(&region.data[offset..offset + chunk]);
            done += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Bus-master write from `buf`.
    pub fn dma_write(&mut self, mut addr: u64, buf: &[u8]) -> SocResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let (slot, offset) = self.resolve(addr)?;
            let region = self.region_mut(slot);
            if !region.writable {
                return Err(SocError::MemoryViolation(addr));
            }
            let chunk = (region.data.len() - offset).min(buf.len() - done);
            region.data[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            done += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> SocResult<u8> {
        let (slot, offset) = self.resolve(addr)?;
        Ok(self.region(slot).data[offset])
    }

    pub fn read_u32(&self, addr: u64) -> SocResult<u32> {
        let mut buf = [0u8; 4];
        self.dma_read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> SocResult<()> {
        let (slot, offset) = self.resolve(addr)?;
        let region = self.region_mut(slot);
        if !region.writable {
            return Err(SocError::MemoryViolation(addr));
        }
        if offset + 4 > region.data.len() {
            return Err(SocError::MemoryViolation(addr));
        }
        region.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Backdoor write used by tests and loaders; same path as DMA.
    pub fn poke(&mut self, addr: u64, data: &[u8]) -> SocResult<()> {
        self.dma_write(addr, data)
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("bootmem_target", &self.bootmem_target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootmem_follows_target() {
        let mut mem = AddressSpace::new(false);
        assert_eq!(mem.bootmem_target(), BootmemTarget::EbiNcs0);

        mem.write_u32(PFLASH_BASE + 0x40, 0x1122_3344).unwrap();
        mem.write_u32(SRAM0_BASE + 0x40, 0xAABB_CCDD).unwrap();

        assert_eq!(mem.read_u32(0x40).unwrap(), 0x1122_3344);

        mem.remap_bootmem(BootmemTarget::Sram0);
        assert_eq!(mem.read_u32(0x40).unwrap(), 0xAABB_CCDD);

        // writes through the alias land in the target
        mem.write_u32(0x80, 0x5555_6666).unwrap();
        assert_eq!(mem.read_u32(SRAM0_BASE + 0x80).unwrap(), 0x5555_6666);
    }

    #[test]
    fn test_bms_selects_initial_target() {
        assert_eq!(AddressSpace::new(true).bootmem_target(), BootmemTarget::Rom);
        assert_eq!(
            AddressSpace::new(false).bootmem_target(),
            BootmemTarget::EbiNcs0
        );
    }

    #[test]
    fn test_alias_faults_past_backing_region() {
        let mut mem = AddressSpace::new(true); // ROM backing is 32 KiB
        assert!(mem.read_u32(ROM_SIZE).is_err());
        mem.remap_bootmem(BootmemTarget::Sram0); // 16 KiB backing
        assert!(mem.read_u32(SRAM0_SIZE).is_err());
        assert!(mem.read_u32(SRAM0_SIZE - 4).is_ok());
    }

    #[test]
    fn test_rom_rejects_writes() {
        let mut mem = AddressSpace::new(true);
        assert!(mem.write_u32(ROM_BASE, 1).is_err());
        assert!(mem.write_u32(0x0, 1).is_err()); // alias of ROM
    }

    #[test]
    fn test_unmapped_access_is_a_violation() {
        let mem = AddressSpace::new(false);
        assert!(matches!(
            mem.read_u32(0x9000_0000),
            Err(SocError::MemoryViolation(0x9000_0000))
        ));
    }

    #[test]
    fn test_firmware_loads_into_flash_and_sdram() {
        let mut mem = AddressSpace::new(false);
        mem.load_firmware(&[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_u32(PFLASH_BASE).unwrap(), 0x0403_0201);
        assert_eq!(mem.read_u32(SDRAM_BASE).unwrap(), 0x0403_0201);
        // and through the boot alias (BMS low -> EBI_NCS0)
        assert_eq!(mem.read_u32(0).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_dma_roundtrip() {
        let mut mem = AddressSpace::new(false);
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        mem.dma_write(SDRAM_BASE + 0x100, &data).unwrap();
        let mut out = [0u8; 5];
        mem.dma_read(SDRAM_BASE + 0x100, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
