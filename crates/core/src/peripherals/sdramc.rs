// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! SDRAM controller. Register storage plus the refresh-error interrupt,
//! which external processes inject through the IOX socket.

use crate::iox::{IoxFrame, IoxServer, CAT_FAULT};
use crate::{SocError, SocResult};
use serde::Serialize;
use std::path::Path;

const DEVICE: &str = "at91.sdramc";

const CID_FAULT_RES: u8 = 0x01;

const SDRAMC_MR: u64 = 0x00;
const SDRAMC_TR: u64 = 0x04;
const SDRAMC_CR: u64 = 0x08;
const SDRAMC_LPR: u64 = 0x10;
const SDRAMC_IER: u64 = 0x14;
const SDRAMC_IDR: u64 = 0x18;
const SDRAMC_IMR: u64 = 0x1C;
const SDRAMC_ISR: u64 = 0x20;
const SDRAMC_MDR: u64 = 0x24;

const ISR_RES: u32 = 1 << 0;

#[derive(Debug, Default, Serialize)]
pub struct Sdramc {
    reg_mr: u32,
    reg_tr: u32,
    reg_cr: u32,
    reg_lpr: u32,
    reg_imr: u32,
    reg_isr: u32,
    reg_mdr: u32,

    #[serde(skip)]
    server: Option<IoxServer>,
}

impl Sdramc {
    pub fn new(socket: Option<&Path>) -> SocResult<Self> {
        let mut sdramc = Self::default();
        sdramc.reset_registers();
        if let Some(path) = socket {
            sdramc.server = Some(IoxServer::open(DEVICE, path)?);
        }
        Ok(sdramc)
    }

    pub fn reset_registers(&mut self) {
        self.reg_mr = 0x00;
        self.reg_tr = 0x00;
        self.reg_cr = 0x8523_72C0;
        self.reg_lpr = 0x00;
        self.reg_imr = 0x00;
        self.reg_isr = 0x00;
        self.reg_mdr = 0x00;
    }

    /// SYSC interrupt line.
    pub fn irq_line(&self) -> bool {
        self.reg_imr & self.reg_isr != 0
    }

    fn handle_frame(&mut self, frame: &IoxFrame) {
        if frame.cat == CAT_FAULT && frame.id == CID_FAULT_RES {
            self.reg_isr |= ISR_RES;
        }
    }

    pub fn poll(&mut self) -> SocResult<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        let frames = server.poll()?;
        for frame in &frames {
            self.handle_frame(frame);
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            SDRAMC_MR => Ok(self.reg_mr),
            SDRAMC_TR => Ok(self.reg_tr),
            SDRAMC_CR => Ok(self.reg_cr),
            SDRAMC_LPR => Ok(self.reg_lpr),
            SDRAMC_IMR => Ok(self.reg_imr),
            SDRAMC_ISR => {
                let isr = self.reg_isr;
                self.reg_isr &= !ISR_RES;
                Ok(isr)
            }
            SDRAMC_MDR => Ok(self.reg_mdr),
            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32) -> SocResult<()> {
        match offset {
            SDRAMC_MR => self.reg_mr = value,
            SDRAMC_TR => self.reg_tr = value,
            SDRAMC_CR => self.reg_cr = value,
            SDRAMC_LPR => self.reg_lpr = value,
            SDRAMC_IER => self.reg_imr |= value,
            SDRAMC_IDR => self.reg_imr &= !value,
            SDRAMC_MDR => self.reg_mdr = value,
            _ => return Err(SocError::illegal_write(DEVICE, offset, value)),
        }
        Ok(())
    }

    #[cfg(test)]
    fn inject_frame(&mut self, frame: &IoxFrame) {
        self.handle_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_values() {
        let mut sdramc = Sdramc::new(None).unwrap();
        assert_eq!(sdramc.read(SDRAMC_CR).unwrap(), 0x8523_72C0);
        assert_eq!(sdramc.read(SDRAMC_MR).unwrap(), 0);
    }

    #[test]
    fn test_refresh_error_fault_raises_irq() {
        let mut sdramc = Sdramc::new(None).unwrap();
        sdramc.write(SDRAMC_IER, ISR_RES).unwrap();
        assert!(!sdramc.irq_line());

        sdramc.inject_frame(&IoxFrame::new(0, CAT_FAULT, CID_FAULT_RES, &[]));
        assert!(sdramc.irq_line());

        // ISR read clears the flag and the line
        let isr = sdramc.read(SDRAMC_ISR).unwrap();
        assert_eq!(isr & ISR_RES, ISR_RES);
        assert!(!sdramc.irq_line());
    }

    #[test]
    fn test_interrupt_mask_registers() {
        let mut sdramc = Sdramc::new(None).unwrap();
        sdramc.write(SDRAMC_IER, ISR_RES).unwrap();
        assert_eq!(sdramc.read(SDRAMC_IMR).unwrap(), ISR_RES);
        sdramc.write(SDRAMC_IDR, ISR_RES).unwrap();
        assert_eq!(sdramc.read(SDRAMC_IMR).unwrap(), 0);
    }

    #[test]
    fn test_illegal_offset_aborts() {
        let mut sdramc = Sdramc::new(None).unwrap();
        assert!(sdramc.read(0x0C).is_err());
        assert!(sdramc.write(0x30, 0).is_err());
    }
}
