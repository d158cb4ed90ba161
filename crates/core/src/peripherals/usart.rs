// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Universal Synchronous/Asynchronous Receiver/Transmitter.
//!
//! Data moves instantly rather than through an emulated shift register:
//! transmitted characters leave as IOX frames the moment they are written,
//! and received bytes queue in a buffer that drains through RHR or the PDC.
//! Consequently the break/timeguard/address features have no observable
//! effect and only log; receive timeouts are injected as faults by the
//! attached client.

use crate::iox::{IoxFrame, IoxServer, CAT_DATA, CAT_FAULT, CID_DATA_IN, CID_DATA_OUT};
use crate::memory::AddressSpace;
use crate::pdc::{self, Pdc, PdcClient, PdcFlags};
use crate::{SocError, SocPolicy, SocResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;

const CID_FAULT_OVRE: u8 = 0x01;
const CID_FAULT_FRAME: u8 = 0x02;
const CID_FAULT_PARE: u8 = 0x03;
const CID_FAULT_TIMEOUT: u8 = 0x04;

/// Reply status for DATA_IN while the receiver is disabled.
const ENXIO: u32 = 6;

// product-dependent divider for the MCK/DIV clock source
const MCKDIV: u64 = 8;

const US_CR: u64 = 0x00;
const US_MR: u64 = 0x04;
const US_IER: u64 = 0x08;
const US_IDR: u64 = 0x0C;
const US_IMR: u64 = 0x10;
const US_CSR: u64 = 0x14;
const US_RHR: u64 = 0x18;
const US_THR: u64 = 0x1C;
const US_BRGR: u64 = 0x20;
const US_RTOR: u64 = 0x24;
const US_TTGR: u64 = 0x28;
const US_FIDI: u64 = 0x40;
const US_NER: u64 = 0x44;
const US_IF: u64 = 0x4C;
const US_MAN: u64 = 0x50;

const CR_RSTRX: u32 = 1 << 2;
const CR_RSTTX: u32 = 1 << 3;
const CR_RXEN: u32 = 1 << 4;
const CR_RXDIS: u32 = 1 << 5;
const CR_TXEN: u32 = 1 << 6;
const CR_TXDIS: u32 = 1 << 7;
const CR_RSTSTA: u32 = 1 << 8;
const CR_STTBRK: u32 = 1 << 9;
const CR_STPBRK: u32 = 1 << 10;
const CR_STTTO: u32 = 1 << 11;
const CR_SENDA: u32 = 1 << 12;
const CR_RSTIT: u32 = 1 << 13;
const CR_RSTNACK: u32 = 1 << 14;
const CR_RETTO: u32 = 1 << 15;
const CR_DTREN: u32 = 1 << 16;
const CR_DTRDIS: u32 = 1 << 17;
const CR_RTSEN: u32 = 1 << 18;
const CR_RTSDIS: u32 = 1 << 19;

const MR_SYNC: u32 = 1 << 8;
const MR_OVER: u32 = 1 << 19;

const CSR_RXRDY: u32 = 1 << 0;
const CSR_TXRDY: u32 = 1 << 1;
const CSR_RXBRK: u32 = 1 << 2;
const CSR_ENDRX: u32 = 1 << 3;
const CSR_ENDTX: u32 = 1 << 4;
const CSR_OVRE: u32 = 1 << 5;
const CSR_FRAME: u32 = 1 << 6;
const CSR_PARE: u32 = 1 << 7;
const CSR_TIMEOUT: u32 = 1 << 8;
const CSR_TXEMPTY: u32 = 1 << 9;
const CSR_ITER: u32 = 1 << 10;
const CSR_TXBUFE: u32 = 1 << 11;
const CSR_RXBUFF: u32 = 1 << 12;
const CSR_NACK: u32 = 1 << 13;
const CSR_RIIC: u32 = 1 << 16;
const CSR_DSRIC: u32 = 1 << 17;
const CSR_DCDIC: u32 = 1 << 18;
const CSR_CTSIC: u32 = 1 << 19;
const CSR_MANERR: u32 = 1 << 24;

const RHR_RXCHR: u32 = 0x1FF;
const RHR_RXSYNH: u32 = 1 << 15;

const THR_TXCHR: u32 = 0x1FF;
const THR_TXSYNH: u32 = 1 << 15;

const MODE_ISO7816_0: u32 = 0x04;
const MODE_ISO7816_1: u32 = 0x06;

const USCLKS_MCK: u32 = 0x00;
const USCLKS_MCKDIV: u32 = 0x01;
const USCLKS_SCK: u32 = 0x03;

#[derive(Debug, Serialize)]
pub struct Usart {
    device: &'static str,

    reg_mr: u32,
    reg_imr: u32,
    reg_csr: u32,
    reg_rhr: u32,
    reg_brgr: u32,
    reg_rtor: u32,
    reg_ttgr: u32,
    reg_fidi: u32,
    reg_ner: u32,
    reg_if: u32,
    reg_man: u32,

    rx_enabled: bool,
    tx_enabled: bool,
    rx_dma_enabled: bool,

    mclk: u64,
    baud: u64,

    rcvbuf: VecDeque<u8>,
    pdc: Pdc,

    #[serde(skip)]
    server: Option<IoxServer>,
}

impl Usart {
    pub fn new(device: &'static str, socket: Option<&Path>) -> SocResult<Self> {
        let mut usart = Self {
            device,
            reg_mr: 0,
            reg_imr: 0,
            reg_csr: 0,
            reg_rhr: 0,
            reg_brgr: 0,
            reg_rtor: 0,
            reg_ttgr: 0,
            reg_fidi: 0,
            reg_ner: 0,
            reg_if: 0,
            reg_man: 0,
            rx_enabled: false,
            tx_enabled: false,
            rx_dma_enabled: false,
            mclk: 0,
            baud: 0,
            rcvbuf: VecDeque::with_capacity(1024),
            pdc: Pdc::new(),
            server: None,
        };
        usart.reset_registers();
        if let Some(path) = socket {
            usart.server = Some(IoxServer::open(device, path)?);
        }
        Ok(usart)
    }

    pub fn reset_registers(&mut self) {
        self.rx_enabled = false;
        self.tx_enabled = false;
        self.rx_dma_enabled = false;

        self.reg_mr = 0x00;
        self.reg_imr = 0x00;
        self.reg_csr = 0x00;
        self.reg_rhr = 0x00;
        self.reg_brgr = 0x00;
        self.reg_rtor = 0x00;
        self.reg_ttgr = 0x00;
        self.reg_fidi = 0x174;
        self.reg_ner = 0x00;
        self.reg_if = 0x00;
        self.reg_man = 0x3001_1004;

        self.pdc.reset_registers();
    }

    pub fn reset_buffers(&mut self) {
        self.rcvbuf.clear();
    }

    /// Effective status as seen through CSR: RXRDY is masked while the
    /// receiver is disabled (the data itself is retained and RXRDY shows up
    /// again once the receiver is enabled).
    fn effective_csr(&self) -> u32 {
        let mut csr = (self.reg_csr & 0x000F_3FFF) | ((self.reg_csr & CSR_MANERR) >> 4);
        if !self.rx_enabled {
            csr &= !CSR_RXRDY;
        }
        csr
    }

    pub fn irq_line(&self) -> bool {
        self.effective_csr() & self.reg_imr != 0
    }

    fn update_baud_rate(&mut self) {
        let cd = (self.reg_brgr & 0xFFFF) as u64;
        let fp = ((self.reg_brgr >> 16) & 0xFF) as u64;
        let mut baud = 0u64;

        if cd != 0 {
            let clks = (self.reg_mr >> 4) & 0x03;
            let mode = self.reg_mr & 0x0F;

            baud = match clks {
                USCLKS_MCK => self.mclk,
                USCLKS_MCKDIV => self.mclk / MCKDIV,
                USCLKS_SCK => {
                    // the SCK pin is not modeled; the rate is informational
                    // only, so this is not worth an abort
                    tracing::warn!("{}: SCK clock source not supported", self.device);
                    0
                }
                _ => 0,
            };

            if self.reg_mr & MR_SYNC != 0 {
                if clks != USCLKS_SCK {
                    baud /= cd;
                }
            } else {
                if cd > 1 {
                    if fp != 0 {
                        // fractional divider in 1/8 steps
                        baud = baud * 8 / (cd * 8 + fp);
                    } else {
                        baud /= cd;
                    }
                }
                baud /= if self.reg_mr & MR_OVER != 0 { 8 } else { 16 };
            }

            if mode == MODE_ISO7816_0 || mode == MODE_ISO7816_1 {
                baud = if self.reg_fidi != 0 {
                    baud / self.reg_fidi as u64
                } else {
                    0
                };
            }
        }

        self.baud = baud;
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
        self.update_baud_rate();
    }

    /// Informational line rate derived from the clock configuration.
    pub fn baud_rate(&self) -> u64 {
        self.baud
    }

    fn chr_receive(&mut self, chr: u16, rxsynh: bool) {
        if self.reg_csr & CSR_RXRDY != 0 && self.rx_enabled {
            self.reg_csr |= CSR_OVRE;
        }

        // the last character overwrites the previous one
        self.reg_rhr = (chr as u32 & RHR_RXCHR) | if rxsynh { RHR_RXSYNH } else { 0 };
        self.reg_csr |= CSR_RXRDY;
    }

    /// Move the next buffered byte into RHR if the holding register is
    /// free.
    fn receiver_next(&mut self) {
        if self.reg_csr & CSR_RXRDY != 0 {
            return;
        }
        if let Some(chr) = self.rcvbuf.pop_front() {
            self.chr_receive(chr as u16, false);
        }
    }

    /// Flush RHR into the current DMA buffer.
    fn receiver_dma_rhr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let chr = (self.reg_rhr & RHR_RXCHR) as u8;
        mem.dma_write(self.pdc.reg_rpr as u64, &[chr])?;
        self.pdc.reg_rpr += 1;
        self.pdc.reg_rcr -= 1;
        self.reg_csr &= !CSR_RXRDY;
        Ok(())
    }

    /// Drain buffered bytes into the current DMA pointer/count pair.
    fn receiver_dma_rcr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let len = self.rcvbuf.len().min(self.pdc.reg_rcr as usize);
        let data: Vec<u8> = self.rcvbuf.drain(..len).collect();
        mem.dma_write(self.pdc.reg_rpr as u64, &data)?;
        self.pdc.reg_rpr += len as u32;
        self.pdc.reg_rcr -= len as u16;
        Ok(())
    }

    /// Buffer-state flags after a DMA step, rolling over to the next
    /// pointer/count pair when the current one fills.
    fn receiver_dma_update(&mut self) {
        if self.pdc.reg_rcr == 0 {
            self.reg_csr |= CSR_ENDRX;
        }
        if self.pdc.reg_rcr == 0 && self.pdc.reg_rncr == 0 {
            self.reg_csr |= CSR_RXBUFF;
        }
        self.pdc.rollover_rx();
    }

    fn receiver_dma(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        // pending RHR content goes first
        if self.reg_csr & CSR_RXRDY != 0 && self.pdc.reg_rcr != 0 {
            self.receiver_dma_rhr(mem)?;
            self.receiver_dma_update();
        }

        if self.pdc.reg_rcr != 0 && !self.rcvbuf.is_empty() {
            self.receiver_dma_rcr(mem)?;
            self.receiver_dma_update();

            // a rollover may have armed the second buffer
            if self.pdc.reg_rcr != 0 && !self.rcvbuf.is_empty() {
                self.receiver_dma_rcr(mem)?;
                if self.pdc.reg_rcr == 0 {
                    self.reg_csr |= CSR_ENDRX | CSR_RXBUFF;
                }
            }
        }

        // DMA must be re-armed once both buffers filled
        if self.pdc.reg_rcr == 0 {
            self.rx_dma_enabled = false;
        }
        if self.pdc.reg_rcr == 0 && self.pdc.reg_rncr == 0 {
            self.receiver_next();
        }
        Ok(())
    }

    fn iox_send_chars(&mut self, data: &[u8]) -> SocResult<()> {
        if let Some(server) = self.server.as_mut() {
            server.send_multiframe(CAT_DATA, CID_DATA_OUT, data)?;
        }
        Ok(())
    }

    fn chr_transmit(&mut self, chr: u16, _txsynh: bool) -> SocResult<()> {
        if self.reg_csr & CSR_TXRDY == 0 {
            // writing THR while TXRDY is low loses the character
            return Ok(());
        }

        self.iox_send_chars(&[chr as u8])?;
        self.reg_csr |= CSR_TXRDY | CSR_TXEMPTY;
        Ok(())
    }

    fn dma_tx_do_tcr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let len = self.pdc.reg_tcr as usize;
        let mut data = vec![0u8; len];
        mem.dma_read(self.pdc.reg_tpr as u64, &mut data)?;
        self.iox_send_chars(&data)?;

        self.pdc.reg_tpr += len as u32;
        self.pdc.reg_tcr = 0;
        Ok(())
    }

    fn handle_data_in(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        let in_progress = !self.rcvbuf.is_empty();

        if !self.rx_enabled {
            if let Some(server) = self.server.as_mut() {
                server.send_u32_resp(frame, ENXIO)?;
            }
            return Ok(());
        }

        self.rcvbuf.extend(frame.payload.iter());
        if let Some(server) = self.server.as_mut() {
            server.send_u32_resp(frame, 0)?;
        }

        if in_progress {
            return Ok(());
        }

        if self.rx_dma_enabled {
            self.receiver_dma(mem)
        } else {
            self.receiver_next();
            Ok(())
        }
    }

    fn handle_frame(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        match (frame.cat, frame.id) {
            (CAT_DATA, CID_DATA_IN) => self.handle_data_in(frame, mem)?,
            (CAT_FAULT, CID_FAULT_OVRE) => self.reg_csr |= CSR_OVRE,
            (CAT_FAULT, CID_FAULT_FRAME) => self.reg_csr |= CSR_FRAME,
            (CAT_FAULT, CID_FAULT_PARE) => self.reg_csr |= CSR_PARE,
            (CAT_FAULT, CID_FAULT_TIMEOUT) => self.reg_csr |= CSR_TIMEOUT,
            _ => {}
        }
        Ok(())
    }

    pub fn poll(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        let frames = server.poll()?;
        for frame in &frames {
            self.handle_frame(frame, mem)?;
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            US_MR => Ok(self.reg_mr),
            US_IMR => Ok(self.reg_imr),

            US_CSR => {
                let csr = self.effective_csr();
                self.reg_csr &= !(CSR_RIIC | CSR_DSRIC | CSR_DCDIC | CSR_CTSIC);
                Ok(csr)
            }

            US_RHR => {
                let rhr = self.reg_rhr;
                self.reg_csr &= !CSR_RXRDY;
                self.receiver_next();
                Ok(rhr)
            }

            US_BRGR => Ok(self.reg_brgr),
            US_RTOR => Ok(self.reg_rtor),
            US_TTGR => Ok(self.reg_ttgr),
            US_FIDI => Ok(self.reg_fidi),
            US_NER => Ok(self.reg_ner),
            US_IF => Ok(self.reg_if),
            US_MAN => Ok(self.reg_man),

            _ if Pdc::contains(offset) => self.pdc.get_register(self.device, offset),

            _ => Err(SocError::illegal_read(self.device, offset)),
        }
    }

    fn write_cr(&mut self, value: u32, policy: &SocPolicy) -> SocResult<()> {
        if value & CR_RSTRX != 0 {
            // software reset: status flags and machine state clear, the
            // configuration registers persist. RXRDY is not cleared; it is
            // masked separately while the receiver is disabled.
            self.rx_enabled = false;
            self.rx_dma_enabled = false;
            self.reg_csr &= !(CSR_PARE | CSR_FRAME | CSR_OVRE | CSR_MANERR);
            self.reg_csr &= !(CSR_RXBRK | CSR_TIMEOUT | CSR_ENDRX | CSR_RXBUFF | CSR_NACK);
        }
        if value & CR_RSTTX != 0 {
            self.tx_enabled = false;
            self.reg_csr &= !(CSR_TXRDY | CSR_TXEMPTY | CSR_ENDTX | CSR_TXBUFE);
        }
        if value & CR_RXEN != 0 {
            // characters received while disabled surface now: RXRDY is
            // unmasked by the enable
            self.rx_enabled = true;
        }
        if value & CR_RXDIS != 0 {
            // takes precedence over RXEN
            self.rx_enabled = false;
        }
        if value & CR_TXEN != 0 {
            self.tx_enabled = true;
            self.reg_csr |= CSR_TXRDY | CSR_TXEMPTY;
        }
        if value & CR_TXDIS != 0 {
            // takes precedence over TXEN
            self.tx_enabled = false;
            self.reg_csr &= !(CSR_TXRDY | CSR_TXEMPTY);
        }
        if value & CR_RSTSTA != 0 {
            self.reg_csr &= !(CSR_PARE | CSR_FRAME | CSR_OVRE | CSR_MANERR | CSR_RXBRK);
        }
        if value & (CR_STTBRK | CR_STPBRK) != 0 {
            policy.unsupported(self.device, "break transmission (STTBRK/STPBRK)")?;
        }
        if value & CR_STTTO != 0 {
            // timeouts are fault-injected, not clocked
            self.reg_csr &= !CSR_TIMEOUT;
        }
        if value & CR_SENDA != 0 {
            policy.unsupported(self.device, "multidrop address sending (SENDA)")?;
        }
        if value & CR_RSTIT != 0 {
            let mode = self.reg_mr & 0x0F;
            if mode == MODE_ISO7816_0 || mode == MODE_ISO7816_1 {
                self.reg_csr &= !CSR_ITER;
            }
        }
        if value & CR_RSTNACK != 0 {
            self.reg_csr &= !CSR_NACK;
        }
        if value & CR_RETTO != 0 {
            // restart time-out: nothing to restart in this model
        }
        if value & (CR_DTREN | CR_DTRDIS | CR_RTSEN | CR_RTSDIS) != 0 {
            tracing::warn!("{}: DTR/RTS pin control not supported", self.device);
        }
        Ok(())
    }

    pub fn write(
        &mut self,
        offset: u64,
        value: u32,
        mem: &mut AddressSpace,
        policy: &SocPolicy,
    ) -> SocResult<()> {
        match offset {
            US_CR => self.write_cr(value, policy),

            US_MR => {
                self.reg_mr = value;
                self.update_baud_rate();
                Ok(())
            }

            US_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            US_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }

            US_THR => self.chr_transmit((value & THR_TXCHR) as u16, value & THR_TXSYNH != 0),

            US_BRGR => {
                self.reg_brgr = value;
                self.update_baud_rate();
                Ok(())
            }

            US_RTOR => {
                self.reg_rtor = value;
                // no wall-clock timeout tracking; clients inject
                // FAULT_TIMEOUT instead
                if self.reg_rtor == 0 {
                    self.reg_csr &= !CSR_TIMEOUT;
                }
                Ok(())
            }

            US_TTGR => {
                self.reg_ttgr = value;
                Ok(())
            }

            US_FIDI => {
                self.reg_fidi = value;
                self.update_baud_rate();
                Ok(())
            }

            US_IF => {
                self.reg_if = value;
                tracing::warn!("{}: US_IF not supported [value: {:#x}]", self.device, value);
                Ok(())
            }

            US_MAN => {
                self.reg_man = value;
                tracing::warn!("{}: US_MAN not supported [value: {:#x}]", self.device, value);
                Ok(())
            }

            _ if Pdc::contains(offset) => pdc::generic_set_register(self, mem, offset, value),

            _ => Err(SocError::illegal_write(self.device, offset, value)),
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_frame(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        self.handle_frame(frame, mem)
    }

    #[cfg(test)]
    pub(crate) fn rx_buffer_len(&self) -> usize {
        self.rcvbuf.len()
    }
}

impl PdcClient for Usart {
    const DEVICE: &'static str = "at91.usart";
    const FLAGS: PdcFlags = PdcFlags {
        endrx: CSR_ENDRX,
        endtx: CSR_ENDTX,
        rxbuff: CSR_RXBUFF,
        txbufe: CSR_TXBUFE,
    };

    fn pdc_mut(&mut self) -> &mut Pdc {
        &mut self.pdc
    }

    fn status_mut(&mut self) -> &mut u32 {
        &mut self.reg_csr
    }

    fn update_irq(&mut self) {
        // level recomputed on demand through irq_line()
    }

    fn dma_rx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        self.rx_dma_enabled = true;
        self.receiver_dma(mem)
    }

    fn dma_rx_stop(&mut self) {
        self.rx_dma_enabled = false;
    }

    fn dma_tx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        if self.pdc.reg_tcr != 0 {
            self.dma_tx_do_tcr(mem)?;
        }
        if self.pdc.reg_tncr != 0 {
            self.pdc.rollover_tx();
            self.dma_tx_do_tcr(mem)?;
        }

        self.reg_csr |= CSR_ENDTX | CSR_TXBUFE;
        Ok(())
    }

    fn dma_tx_stop(&mut self) {}
}
