// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Parallel I/O controller: 32 pins, each driven by the PIO itself or muxed
//! to peripheral A/B, with edge interrupts on pin-data changes. The IOX
//! socket exposes the pin vector for external observation and injection.

use crate::iox::{IoxFrame, IoxServer, CAT_PINSTATE};
use crate::{SocError, SocResult};
use serde::Serialize;
use std::path::Path;

pub const PIO_NUM_PINS: u8 = 32;

const CID_PINSTATE_ENABLE: u8 = 0x01;
const CID_PINSTATE_DISABLE: u8 = 0x02;
const CID_PINSTATE_OUT: u8 = 0x03;
const CID_PINSTATE_GET: u8 = 0x04;

const PIO_PER: u64 = 0x00;
const PIO_PDR: u64 = 0x04;
const PIO_PSR: u64 = 0x08;
const PIO_OER: u64 = 0x10;
const PIO_ODR: u64 = 0x14;
const PIO_OSR: u64 = 0x18;
const PIO_IFER: u64 = 0x20;
const PIO_IFDR: u64 = 0x24;
const PIO_IFSR: u64 = 0x28;
const PIO_SODR: u64 = 0x30;
const PIO_CODR: u64 = 0x34;
const PIO_ODSR: u64 = 0x38;
const PIO_PDSR: u64 = 0x3C;
const PIO_IER: u64 = 0x40;
const PIO_IDR: u64 = 0x44;
const PIO_IMR: u64 = 0x48;
const PIO_ISR: u64 = 0x4C;
const PIO_MDER: u64 = 0x50;
const PIO_MDDR: u64 = 0x54;
const PIO_MDSR: u64 = 0x58;
const PIO_PUDR: u64 = 0x60;
const PIO_PUER: u64 = 0x64;
const PIO_PUSR: u64 = 0x68;
const PIO_ASR: u64 = 0x70;
const PIO_BSR: u64 = 0x74;
const PIO_ABSR: u64 = 0x78;
const PIO_OWER: u64 = 0xA0;
const PIO_OWDR: u64 = 0xA4;
const PIO_OWSR: u64 = 0xA8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriphSel {
    A,
    B,
}

#[derive(Debug, Serialize)]
pub struct Pio {
    device: &'static str,

    reg_psr: u32,
    reg_osr: u32,
    reg_ifsr: u32,
    reg_odsr: u32,
    reg_pdsr: u32,
    reg_imr: u32,
    reg_isr: u32,
    reg_mdsr: u32,
    reg_pusr: u32,
    reg_absr: u32,
    reg_owsr: u32,

    pin_state_in: u32,
    pin_state_periph_a: u32,
    pin_state_periph_b: u32,

    #[serde(skip)]
    server: Option<IoxServer>,
}

impl Pio {
    pub fn new(device: &'static str, socket: Option<&Path>) -> SocResult<Self> {
        let mut pio = Self {
            device,
            reg_psr: 0,
            reg_osr: 0,
            reg_ifsr: 0,
            reg_odsr: 0,
            reg_pdsr: 0,
            reg_imr: 0,
            reg_isr: 0,
            reg_mdsr: 0,
            reg_pusr: 0,
            reg_absr: 0,
            reg_owsr: 0,
            pin_state_in: 0,
            pin_state_periph_a: 0,
            pin_state_periph_b: 0,
            server: None,
        };
        pio.reset_registers();
        if let Some(path) = socket {
            pio.server = Some(IoxServer::open(device, path)?);
        }
        Ok(pio)
    }

    pub fn reset_registers(&mut self) {
        self.reg_psr = 0;
        self.reg_osr = 0;
        self.reg_ifsr = 0;
        self.reg_odsr = 0;
        self.reg_pdsr = 0;
        self.reg_imr = 0;
        self.reg_isr = 0;
        self.reg_mdsr = 0;
        self.reg_pusr = 0;
        self.reg_absr = 0;
        self.reg_owsr = 0;
    }

    pub fn irq_line(&self) -> bool {
        self.reg_isr & self.reg_imr != 0
    }

    /// Resolved pin level as driven onto the pad.
    pub fn pin_output(&self, pin: u8) -> bool {
        self.reg_pdsr & (1 << pin) != 0
    }

    pub fn pin_vector(&self) -> u32 {
        self.reg_pdsr
    }

    /// Recompute PDSR from ownership and the input/output states, latch
    /// changed bits into ISR, and notify an attached client.
    fn update_pins(&mut self) -> SocResult<()> {
        let old = self.reg_pdsr;
        let mut pdsr = 0u32;

        for pin in 0..PIO_NUM_PINS {
            let mask = 1u32 << pin;
            let level = if self.reg_psr & mask != 0 {
                if self.reg_osr & mask != 0 {
                    self.reg_odsr & mask != 0
                } else {
                    self.pin_state_in & mask != 0
                }
            } else if self.reg_absr & mask == 0 {
                self.pin_state_periph_a & mask != 0
            } else {
                self.pin_state_periph_b & mask != 0
            };
            if level {
                pdsr |= mask;
            }
        }

        self.reg_pdsr = pdsr;
        self.reg_isr |= old ^ pdsr;

        if old != pdsr {
            self.emit_pin_state()?;
        }
        Ok(())
    }

    /// Push the current pin vector to an attached client. Also re-emitted
    /// during the buffer-reset phase of an SoC reset.
    pub fn emit_pin_state(&mut self) -> SocResult<()> {
        let pdsr = self.reg_pdsr;
        if let Some(server) = self.server.as_mut() {
            server.send_u32(CAT_PINSTATE, CID_PINSTATE_OUT, pdsr)?;
        }
        Ok(())
    }

    /// External pad input (from the attached process or board wiring).
    pub fn set_input_pins(&mut self, mask: u32, level: bool) -> SocResult<()> {
        if level {
            self.pin_state_in |= mask;
        } else {
            self.pin_state_in &= !mask;
        }
        self.update_pins()
    }

    /// Pin levels driven by an on-chip peripheral through the A/B mux.
    pub fn set_periph_input(&mut self, sel: PeriphSel, mask: u32, level: bool) -> SocResult<()> {
        let state = match sel {
            PeriphSel::A => &mut self.pin_state_periph_a,
            PeriphSel::B => &mut self.pin_state_periph_b,
        };
        if level {
            *state |= mask;
        } else {
            *state &= !mask;
        }
        self.update_pins()
    }

    fn handle_frame(&mut self, frame: &IoxFrame) -> SocResult<()> {
        if frame.cat != CAT_PINSTATE {
            return Ok(());
        }
        match frame.id {
            CID_PINSTATE_ENABLE => {
                if let Some(mask) = frame.payload_u32() {
                    self.set_input_pins(mask, true)?;
                }
            }
            CID_PINSTATE_DISABLE => {
                if let Some(mask) = frame.payload_u32() {
                    self.set_input_pins(mask, false)?;
                }
            }
            CID_PINSTATE_OUT => {
                // full-vector injection
                if let Some(mask) = frame.payload_u32() {
                    self.pin_state_in = mask;
                    self.update_pins()?;
                }
            }
            CID_PINSTATE_GET => {
                let pdsr = self.reg_pdsr;
                if let Some(server) = self.server.as_mut() {
                    server.send_u32_resp(frame, pdsr)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn poll(&mut self) -> SocResult<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        let frames = server.poll()?;
        for frame in &frames {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            PIO_PSR => Ok(self.reg_psr),
            PIO_OSR => Ok(self.reg_osr),
            PIO_IFSR => Ok(self.reg_ifsr),
            PIO_ODSR => Ok(self.reg_odsr),
            PIO_PDSR => Ok(self.reg_pdsr),
            PIO_IMR => Ok(self.reg_imr),
            PIO_ISR => {
                let isr = self.reg_isr;
                self.reg_isr = 0;
                Ok(isr)
            }
            PIO_MDSR => Ok(self.reg_mdsr),
            PIO_PUSR => Ok(self.reg_pusr),
            PIO_ABSR => Ok(self.reg_absr),
            PIO_OWSR => Ok(self.reg_owsr),
            _ => Err(SocError::illegal_read(self.device, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32) -> SocResult<()> {
        match offset {
            PIO_PER => self.reg_psr |= value,
            PIO_PDR => self.reg_psr &= !value,
            PIO_OER => self.reg_osr |= value,
            PIO_ODR => self.reg_osr &= !value,
            PIO_IFER => self.reg_ifsr |= value,
            PIO_IFDR => self.reg_ifsr &= !value,
            PIO_SODR => self.reg_odsr |= value,
            PIO_CODR => self.reg_odsr &= !value,
            // only bits enabled for output-write pass through
            PIO_ODSR => self.reg_odsr = (self.reg_odsr & !self.reg_owsr) | (value & self.reg_owsr),
            PIO_IER => self.reg_imr |= value,
            PIO_IDR => self.reg_imr &= !value,
            PIO_MDER => self.reg_mdsr |= value,
            PIO_MDDR => self.reg_mdsr &= !value,
            PIO_PUER => self.reg_pusr &= !value,
            PIO_PUDR => self.reg_pusr |= value,
            PIO_ASR => self.reg_absr &= !value,
            PIO_BSR => self.reg_absr |= value,
            PIO_OWER => self.reg_owsr |= value,
            PIO_OWDR => self.reg_owsr &= !value,
            _ => return Err(SocError::illegal_write(self.device, offset, value)),
        }

        self.update_pins()
    }

    #[cfg(test)]
    fn inject_frame(&mut self, frame: &IoxFrame) -> SocResult<()> {
        self.handle_frame(frame)
    }
}
