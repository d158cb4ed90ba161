// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Debug unit: a stripped-down UART wired to the host's stdio. Transmits
//! complete instantly; a one-deep receive holding register latches RXRDY
//! and flags OVRE on overrun.

use crate::{SocError, SocResult};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

const DEVICE: &str = "at91.dbgu";

const IOBC_CIDR: u32 = 0x0000_0000;
const IOBC_EXID: u32 = 0x0000_0000;

const DBGU_CR: u64 = 0x00;
const DBGU_MR: u64 = 0x04;
const DBGU_IER: u64 = 0x08;
const DBGU_IDR: u64 = 0x0C;
const DBGU_IMR: u64 = 0x10;
const DBGU_SR: u64 = 0x14;
const DBGU_RHR: u64 = 0x18;
const DBGU_THR: u64 = 0x1C;
const DBGU_BRGR: u64 = 0x20;
const DBGU_CIDR: u64 = 0x40;
const DBGU_EXID: u64 = 0x44;
const DBGU_FNR: u64 = 0x48;

const PDC_AREA_OFFS: u64 = 0x100;
const PDC_AREA_END: u64 = 0x124;

const CR_RSTRX: u32 = 1 << 2;
const CR_RSTTX: u32 = 1 << 3;
const CR_RXEN: u32 = 1 << 4;
const CR_RXDIS: u32 = 1 << 5;
const CR_TXEN: u32 = 1 << 6;
const CR_TXDIS: u32 = 1 << 7;
const CR_RSTSTA: u32 = 1 << 8;

const SR_RXRDY: u32 = 1 << 0;
const SR_TXRDY: u32 = 1 << 1;
const SR_OVRE: u32 = 1 << 5;
const SR_FRAME: u32 = 1 << 6;
const SR_PARE: u32 = 1 << 7;
const SR_TXEMPTY: u32 = 1 << 9;
const SR_TXBUFE: u32 = 1 << 11;

#[derive(Debug, Serialize)]
pub struct Dbgu {
    reg_mr: u32,
    reg_imr: u32,
    reg_sr: u32,
    reg_rhr: u32,
    reg_brgr: u32,
    reg_fnr: u32,

    rx_enabled: bool,
    tx_enabled: bool,

    #[serde(skip)]
    sink: Option<Arc<Mutex<Vec<u8>>>>,
    echo_stdout: bool,
}

impl Default for Dbgu {
    fn default() -> Self {
        Self::new()
    }
}

impl Dbgu {
    pub fn new() -> Self {
        let mut dbgu = Self {
            reg_mr: 0,
            reg_imr: 0,
            reg_sr: 0,
            reg_rhr: 0,
            reg_brgr: 0,
            reg_fnr: 0,
            rx_enabled: false,
            tx_enabled: false,
            sink: None,
            echo_stdout: true,
        };
        dbgu.reset_registers();
        dbgu
    }

    pub fn reset_registers(&mut self) {
        // transmitter path reports idle out of reset
        self.reg_sr = SR_TXRDY | SR_TXBUFE | SR_TXEMPTY;
        self.reg_mr = 0;
        self.reg_imr = 0;
        self.reg_rhr = 0;
        self.reg_brgr = 0;
        self.reg_fnr = 0;
        self.rx_enabled = false;
        self.tx_enabled = false;
    }

    /// Attach a TX capture sink. When `echo_stdout` is false, output no
    /// longer reaches the host console.
    pub fn set_sink(&mut self, sink: Option<Arc<Mutex<Vec<u8>>>>, echo_stdout: bool) {
        self.sink = sink;
        self.echo_stdout = echo_stdout;
    }

    /// SYSC interrupt line.
    pub fn irq_line(&self) -> bool {
        self.reg_sr & self.reg_imr != 0
    }

    /// Host console input. Bytes arriving while RXRDY is still set overrun
    /// the holding register.
    pub fn inject_input(&mut self, data: &[u8]) {
        if !self.rx_enabled {
            return;
        }
        for &byte in data {
            if self.reg_sr & SR_RXRDY != 0 {
                self.reg_sr |= SR_OVRE;
            }
            self.reg_rhr = byte as u32;
            self.reg_sr |= SR_RXRDY;
        }
    }

    fn push_tx(&mut self, byte: u8) {
        if let Some(sink) = &self.sink {
            if let Ok(mut guard) = sink.lock() {
                guard.push(byte);
            }
        }

        if self.echo_stdout {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&[byte]);
            let _ = stdout.flush();
        }
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            DBGU_MR => Ok(self.reg_mr),
            DBGU_IMR => Ok(self.reg_imr),
            DBGU_SR => Ok(self.reg_sr),
            DBGU_RHR => {
                self.reg_sr &= !SR_RXRDY;
                Ok(self.reg_rhr)
            }
            DBGU_BRGR => Ok(self.reg_brgr),
            DBGU_CIDR => Ok(IOBC_CIDR),
            DBGU_EXID => Ok(IOBC_EXID),
            DBGU_FNR => Ok(self.reg_fnr),
            PDC_AREA_OFFS..=PDC_AREA_END => Err(SocError::access(
                DEVICE,
                offset,
                "PDC area is unimplemented",
            )),
            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32) -> SocResult<()> {
        match offset {
            DBGU_CR => {
                if value & CR_RSTRX != 0 {
                    self.rx_enabled = false;
                    self.reg_sr &= !SR_RXRDY;
                }
                if value & CR_RSTTX != 0 {
                    self.tx_enabled = false;
                }
                if value & CR_RXEN != 0 {
                    self.rx_enabled = true;
                }
                if value & CR_RXDIS != 0 {
                    // takes precedence over RXEN
                    self.rx_enabled = false;
                }
                if value & CR_TXEN != 0 {
                    self.tx_enabled = true;
                }
                if value & CR_TXDIS != 0 {
                    // takes precedence over TXEN
                    self.tx_enabled = false;
                }
                if value & CR_RSTSTA != 0 {
                    self.reg_sr &= !(SR_PARE | SR_FRAME | SR_OVRE);
                }
                Ok(())
            }
            DBGU_MR => {
                self.reg_mr = value;
                Ok(())
            }
            DBGU_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            DBGU_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }
            DBGU_THR => {
                self.push_tx(value as u8);
                self.reg_sr |= SR_TXRDY | SR_TXEMPTY;
                Ok(())
            }
            DBGU_BRGR => {
                self.reg_brgr = value;
                Ok(())
            }
            DBGU_FNR => {
                self.reg_fnr = value;
                tracing::warn!("{}: FNR register writes not implemented", DEVICE);
                Ok(())
            }
            PDC_AREA_OFFS..=PDC_AREA_END => Err(SocError::access(
                DEVICE,
                offset,
                "PDC area is unimplemented",
            )),
            _ => Err(SocError::illegal_write(DEVICE, offset, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dbgu_with_sink() -> (Dbgu, Arc<Mutex<Vec<u8>>>) {
        let mut dbgu = Dbgu::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        dbgu.set_sink(Some(sink.clone()), false);
        (dbgu, sink)
    }

    #[test]
    fn test_thr_flushes_to_sink_and_completes_instantly() {
        let (mut dbgu, sink) = dbgu_with_sink();
        dbgu.write(DBGU_CR, CR_TXEN).unwrap();
        dbgu.write(DBGU_THR, 0x41).unwrap();

        assert_eq!(sink.lock().unwrap().as_slice(), b"A");
        let sr = dbgu.read(DBGU_SR).unwrap();
        assert_eq!(sr & SR_TXRDY, SR_TXRDY);
        assert_eq!(sr & SR_TXEMPTY, SR_TXEMPTY);
    }

    #[test]
    fn test_rx_latches_and_overruns() {
        let (mut dbgu, _sink) = dbgu_with_sink();
        dbgu.write(DBGU_CR, CR_RXEN).unwrap();

        dbgu.inject_input(b"a");
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_RXRDY, SR_RXRDY);

        // second byte before RHR was read: overrun, last byte wins
        dbgu.inject_input(b"b");
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_OVRE, SR_OVRE);
        assert_eq!(dbgu.read(DBGU_RHR).unwrap(), b'b' as u32);
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_RXRDY, 0);

        // OVRE survives until RSTSTA
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_OVRE, SR_OVRE);
        dbgu.write(DBGU_CR, CR_RSTSTA).unwrap();
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_OVRE, 0);
    }

    #[test]
    fn test_input_dropped_while_receiver_disabled() {
        let (mut dbgu, _sink) = dbgu_with_sink();
        dbgu.inject_input(b"x");
        assert_eq!(dbgu.read(DBGU_SR).unwrap() & SR_RXRDY, 0);
    }

    #[test]
    fn test_irq_line_follows_mask() {
        let (mut dbgu, _sink) = dbgu_with_sink();
        dbgu.write(DBGU_CR, CR_RXEN).unwrap();
        dbgu.write(DBGU_IER, SR_RXRDY).unwrap();
        assert!(!dbgu.irq_line());

        dbgu.inject_input(b"z");
        assert!(dbgu.irq_line());
        dbgu.read(DBGU_RHR).unwrap();
        assert!(!dbgu.irq_line());
    }

    #[test]
    fn test_pdc_area_aborts() {
        let mut dbgu = Dbgu::new();
        assert!(dbgu.read(0x104).is_err());
        assert!(dbgu.write(0x120, 1).is_err());
    }

    #[test]
    fn test_chip_id_registers() {
        let mut dbgu = Dbgu::new();
        assert_eq!(dbgu.read(DBGU_CIDR).unwrap(), IOBC_CIDR);
        assert_eq!(dbgu.read(DBGU_EXID).unwrap(), IOBC_EXID);
    }
}
