// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The SoC aggregate: exclusive owner of the address space, the clock, and
//! every peripheral. The CPU is an external collaborator that issues
//! 32-bit aligned loads and stores through [`Soc::read`]/[`Soc::write`] and
//! samples the nIRQ/nFIQ pair after each access.

mod builder;

use crate::bus::{self, Device, Route};
use crate::clock::SimClock;
use crate::memory::AddressSpace;
use crate::peripherals::aic::{Aic, AicStub};
use crate::peripherals::dbgu::Dbgu;
use crate::peripherals::matrix::Matrix;
use crate::peripherals::mci::Mci;
use crate::peripherals::pio::Pio;
use crate::peripherals::pit::Pit;
use crate::peripherals::pmc::Pmc;
use crate::peripherals::rstc::Rstc;
use crate::peripherals::rtt::Rtt;
use crate::peripherals::sdramc::Sdramc;
use crate::peripherals::spi::Spi;
use crate::peripherals::tc::TcBlock;
use crate::peripherals::twi::Twi;
use crate::peripherals::usart::Usart;
use crate::{SocError, SocPolicy, SocResult};

// AIC source assignments
const IRQ_SYSC: u8 = 1;
const IRQ_PIOA: u8 = 2;
const IRQ_PIOB: u8 = 3;
const IRQ_PIOC: u8 = 4;
const IRQ_USART: [u8; 6] = [6, 7, 8, 23, 24, 25];
const IRQ_MCI: u8 = 9;
const IRQ_TWI: u8 = 11;
const IRQ_SPI: [u8; 2] = [12, 13];
const IRQ_TC012: [u8; 3] = [17, 18, 19];
const IRQ_TC345: [u8; 3] = [26, 27, 28];

// inputs of the SYSC OR-stub
const SYSC_PMC: u8 = 0;
const SYSC_DBGU: u8 = 1;
const SYSC_SDRAMC: u8 = 2;
const SYSC_RSTC: u8 = 3;
const SYSC_RTT: u8 = 4;
const SYSC_PIT: u8 = 5;

pub struct Soc {
    policy: SocPolicy,
    clock: SimClock,
    mem: AddressSpace,

    aic: Aic,
    aic_stub: AicStub,
    pmc: Pmc,
    matrix: Matrix,
    rstc: Rstc,
    sdramc: Sdramc,
    dbgu: Dbgu,
    pio: [Pio; 3],
    pit: Pit,
    rtt: Rtt,
    tc012: TcBlock,
    tc345: TcBlock,
    usart: [Usart; 6],
    spi: [Spi; 2],
    twi: Twi,
    mci: Mci,

    pio_b7_level: bool,
}

impl Soc {
    /// Any MMIO access stalls while an SPI channel waits for its client
    /// echo; the executor yields and retries after polling.
    pub fn is_stalled(&self) -> bool {
        self.spi.iter().any(|s| s.is_stalled())
    }

    /// Core interrupt outputs `(nIRQ, nFIQ)`.
    pub fn irq_output(&self) -> (bool, bool) {
        (self.aic.nirq(), self.aic.nfiq())
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn master_clock(&self) -> u64 {
        self.pmc.master_clock()
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.mem
    }

    /// Host console bytes for the DBGU.
    pub fn dbgu_input(&mut self, data: &[u8]) {
        self.dbgu.inject_input(data);
        self.sync_irq_lines();
    }

    /// Capture DBGU output instead of (or in addition to) host stdout.
    pub fn attach_dbgu_sink(
        &mut self,
        sink: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
        echo_stdout: bool,
    ) {
        self.dbgu.set_sink(Some(sink), echo_stdout);
    }

    fn check_access(addr: u64, size: u32, value: Option<u32>) -> SocResult<()> {
        if size != 4 || addr % 4 != 0 {
            return Err(SocError::Access {
                device: "iobc.mmio",
                offset: addr,
                reason: match value {
                    Some(v) => format!("unaligned or non-word write (size {size}) [value: {v:#010x}]"),
                    None => format!("unaligned or non-word read (size {size})"),
                },
            });
        }
        Ok(())
    }

    /// CPU load. All valid accesses are 32-bit aligned words.
    pub fn read(&mut self, addr: u64, size: u32) -> SocResult<u32> {
        if self.is_stalled() {
            return Err(SocError::Stalled);
        }
        Self::check_access(addr, size, None)?;

        let value = match bus::decode(addr, &self.mem) {
            Route::Memory => self.mem.read_u32(addr)?,

            Route::Peripheral { dev, offset } => match dev {
                Device::Tc012 => self.tc012.read(offset)?,
                Device::Tc345 => self.tc345.read(offset)?,
                Device::Mci => self.mci.read(offset)?,
                Device::Twi => self.twi.read(offset)?,
                Device::Usart(n) => self.usart[n].read(offset)?,
                Device::Spi(n) => self.spi[n].read(offset)?,
                Device::Sdramc => self.sdramc.read(offset)?,
                Device::Matrix => self.matrix.read(offset)?,
                Device::Aic => self.aic.read(offset)?,
                Device::Dbgu => self.dbgu.read(offset)?,
                Device::Pio(n) => self.pio[n].read(offset)?,
                Device::Pmc => self.pmc.read(offset)?,
                Device::Rstc => self.rstc.read(offset)?,
                Device::Rtt => self.rtt.read(offset)?,
                Device::Pit => self.pit.read(offset)?,
            },

            Route::Unimplemented { name, offset } => {
                if self.policy.strict_unimplemented {
                    return Err(SocError::access(
                        "iobc.mmio",
                        addr,
                        format!("read from unimplemented device '{name}' at +{offset:#x}"),
                    ));
                }
                tracing::warn!("unimplemented device '{}' read at +{:#x}", name, offset);
                0
            }

            Route::Reserved { name } => {
                return Err(SocError::access(
                    "iobc.mmio",
                    addr,
                    format!("invalid memory access to reserved region '{name}'"),
                ))
            }
        };

        // register reads may acknowledge interrupts (IVR, the SR reads)
        self.sync_irq_lines();
        Ok(value)
    }

    /// CPU store.
    pub fn write(&mut self, addr: u64, size: u32, value: u32) -> SocResult<()> {
        if self.is_stalled() {
            return Err(SocError::Stalled);
        }
        Self::check_access(addr, size, Some(value))?;

        let now = self.clock.now_ns();
        match bus::decode(addr, &self.mem) {
            Route::Memory => self.mem.write_u32(addr, value)?,

            Route::Peripheral { dev, offset } => match dev {
                Device::Tc012 => self.tc012.write(offset, value, now)?,
                Device::Tc345 => self.tc345.write(offset, value, now)?,
                Device::Mci => self.mci.write(offset, value, &mut self.mem)?,
                Device::Twi => {
                    self.twi.write(offset, value, &mut self.mem, now, &self.policy)?
                }
                Device::Usart(n) => {
                    self.usart[n].write(offset, value, &mut self.mem, &self.policy)?
                }
                Device::Spi(n) => {
                    self.spi[n].write(offset, value, &mut self.mem, &self.policy)?
                }
                Device::Sdramc => self.sdramc.write(offset, value)?,
                Device::Matrix => self.matrix.write(offset, value)?,
                Device::Aic => self.aic.write(offset, value)?,
                Device::Dbgu => self.dbgu.write(offset, value)?,
                Device::Pio(n) => self.pio[n].write(offset, value)?,
                Device::Pmc => self.pmc.write(offset, value)?,
                Device::Rstc => self.rstc.write(offset, value)?,
                Device::Rtt => self.rtt.write(offset, value, now)?,
                Device::Pit => self.pit.write(offset, value, now)?,
            },

            Route::Unimplemented { name, offset } => {
                if self.policy.strict_unimplemented {
                    return Err(SocError::access(
                        "iobc.mmio",
                        addr,
                        format!("write to unimplemented device '{name}' at +{offset:#x}"),
                    ));
                }
                tracing::warn!(
                    "unimplemented device '{}' write at +{:#x} [value: {:#010x}]",
                    name,
                    offset,
                    value
                );
            }

            Route::Reserved { name } => {
                return Err(SocError::access(
                    "iobc.mmio",
                    addr,
                    format!("invalid memory access to reserved region '{name}'"),
                ))
            }
        }

        self.apply_side_effects()?;
        Ok(())
    }

    /// Cross-peripheral effects of the last register write: bootmem
    /// remaps, master-clock fan-out, reset requests, board wiring.
    fn apply_side_effects(&mut self) -> SocResult<()> {
        if let Some(target) = self.matrix.take_remap_request() {
            self.mem.remap_bootmem(target);
        }

        if let Some(mclk) = self.pmc.take_mclk_change() {
            self.fan_out_mclk(mclk);
        }

        // PIO B pin 7 selects which of the two multiplexed cards drives
        // slot A (low selects card 1)
        let b7 = self.pio[1].pin_output(7);
        if b7 != self.pio_b7_level {
            self.pio_b7_level = b7;
            self.mci.card_select(b7);
        }

        if let Some(request) = self.rstc.take_reset_request() {
            match request {
                crate::peripherals::rstc::ResetRequest::Soc => self.reset()?,
                crate::peripherals::rstc::ResetRequest::External => {
                    tracing::info!("rstc: external reset line asserted");
                }
            }
        }

        self.sync_irq_lines();
        Ok(())
    }

    fn fan_out_mclk(&mut self, mclk: u64) {
        tracing::info!("master clock changed: {} Hz", mclk);
        self.pit.set_master_clock(mclk);
        self.twi.set_master_clock(mclk);
        for usart in &mut self.usart {
            usart.set_master_clock(mclk);
        }
        for spi in &mut self.spi {
            spi.set_master_clock(mclk);
        }
        self.mci.set_master_clock(mclk);
        self.tc012.set_master_clock(mclk);
        self.tc345.set_master_clock(mclk);
    }

    /// Feed every peripheral interrupt line into the AIC (system
    /// controller sources via the OR-stub on line 1).
    fn sync_irq_lines(&mut self) {
        self.aic_stub.set_line(SYSC_PMC, self.pmc.irq_line());
        self.aic_stub.set_line(SYSC_DBGU, self.dbgu.irq_line());
        self.aic_stub.set_line(SYSC_SDRAMC, self.sdramc.irq_line());
        self.aic_stub.set_line(SYSC_RSTC, self.rstc.irq_line());
        self.aic_stub.set_line(SYSC_RTT, self.rtt.irq_line());
        self.aic_stub.set_line(SYSC_PIT, self.pit.irq_line());
        self.aic.set_line(IRQ_SYSC, self.aic_stub.output());

        self.aic.set_line(IRQ_PIOA, self.pio[0].irq_line());
        self.aic.set_line(IRQ_PIOB, self.pio[1].irq_line());
        self.aic.set_line(IRQ_PIOC, self.pio[2].irq_line());

        for (n, usart) in self.usart.iter().enumerate() {
            self.aic.set_line(IRQ_USART[n], usart.irq_line());
        }
        for (n, spi) in self.spi.iter().enumerate() {
            self.aic.set_line(IRQ_SPI[n], spi.irq_line());
        }
        self.aic.set_line(IRQ_TWI, self.twi.irq_line());
        self.aic.set_line(IRQ_MCI, self.mci.irq_line());

        for ch in 0..3 {
            self.aic.set_line(IRQ_TC012[ch], self.tc012.irq_line(ch));
            self.aic.set_line(IRQ_TC345[ch], self.tc345.irq_line(ch));
        }
    }

    /// Advance virtual time and service timers and sockets. The run loop
    /// calls this between CPU quanta; tests drive it directly.
    pub fn step(&mut self, delta_ns: u64) -> SocResult<()> {
        self.clock.advance_ns(delta_ns);
        self.poll()
    }

    /// Service host I/O and expired timers without advancing time.
    pub fn poll(&mut self) -> SocResult<()> {
        let now = self.clock.now_ns();

        self.pit.poll(now);
        self.rtt.poll(now);
        self.tc012.poll(now);
        self.tc345.poll(now);
        self.twi.poll(now, &mut self.mem)?;

        for usart in &mut self.usart {
            usart.poll(&mut self.mem)?;
        }
        for spi in &mut self.spi {
            spi.poll(&mut self.mem)?;
        }
        for pio in &mut self.pio {
            pio.poll()?;
        }
        self.sdramc.poll()?;

        self.apply_side_effects()
    }

    /// Full SoC reset in two phases: every peripheral first returns its
    /// registers to reset state, then buffers clear and initialization
    /// frames (the PIO pin vectors) are re-emitted. IOX sockets survive.
    pub fn reset(&mut self) -> SocResult<()> {
        let now = self.clock.now_ns();

        // phase 1: registers
        self.aic.reset_registers();
        self.aic_stub.reset();
        self.pmc.reset_registers();
        self.matrix.reset_registers();
        self.rstc.reset_registers();
        self.sdramc.reset_registers();
        self.dbgu.reset_registers();
        for pio in &mut self.pio {
            pio.reset_registers();
        }
        self.pit.reset_registers();
        self.rtt.reset_registers(now);
        self.tc012.reset_registers();
        self.tc345.reset_registers();
        for usart in &mut self.usart {
            usart.reset_registers();
        }
        for spi in &mut self.spi {
            spi.reset_registers();
        }
        self.twi.reset_registers();
        self.mci.reset_registers();

        // the matrix reset re-evaluates the boot mapping
        self.matrix.update_bootmem()?;
        if let Some(target) = self.matrix.take_remap_request() {
            self.mem.remap_bootmem(target);
        }

        // phase 2: buffers and re-announced state
        for usart in &mut self.usart {
            usart.reset_buffers();
        }
        for spi in &mut self.spi {
            spi.reset_buffers();
        }
        self.twi.reset_buffers();
        for pio in &mut self.pio {
            pio.emit_pin_state()?;
        }

        let mclk = self.pmc.master_clock();
        self.fan_out_mclk(mclk);
        self.pmc.take_mclk_change();
        self.sync_irq_lines();
        Ok(())
    }

    /// Debug view of the register state, by peripheral.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "aic": serde_json::to_value(&self.aic).unwrap_or(serde_json::Value::Null),
            "pmc": serde_json::to_value(&self.pmc).unwrap_or(serde_json::Value::Null),
            "matrix": serde_json::to_value(&self.matrix).unwrap_or(serde_json::Value::Null),
            "rstc": serde_json::to_value(&self.rstc).unwrap_or(serde_json::Value::Null),
            "sdramc": serde_json::to_value(&self.sdramc).unwrap_or(serde_json::Value::Null),
            "dbgu": serde_json::to_value(&self.dbgu).unwrap_or(serde_json::Value::Null),
            "pio": serde_json::to_value(&self.pio).unwrap_or(serde_json::Value::Null),
            "pit": serde_json::to_value(&self.pit).unwrap_or(serde_json::Value::Null),
            "rtt": serde_json::to_value(&self.rtt).unwrap_or(serde_json::Value::Null),
            "tc012": serde_json::to_value(&self.tc012).unwrap_or(serde_json::Value::Null),
            "tc345": serde_json::to_value(&self.tc345).unwrap_or(serde_json::Value::Null),
            "usart": serde_json::to_value(&self.usart).unwrap_or(serde_json::Value::Null),
            "spi": serde_json::to_value(&self.spi).unwrap_or(serde_json::Value::Null),
            "twi": serde_json::to_value(&self.twi).unwrap_or(serde_json::Value::Null),
            "mci": serde_json::to_value(&self.mci).unwrap_or(serde_json::Value::Null),
        })
    }
}
