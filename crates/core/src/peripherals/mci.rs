// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Multimedia Card Interface (SD host). Commands are dispatched to the
//! selected SD bus and complete instantly; block data moves through the
//! PDC or the RDR/TDR holding registers. Two cards share slot A
//! electrically on the iOBC, selected through PIO B pin 7, so the card
//! selection survives MCI-only resets.

use crate::memory::AddressSpace;
use crate::pdc::{self, Pdc, PdcClient, PdcFlags};
use crate::sd::{SdBus, SdCommandOutcome, SdRequest};
use crate::{SocError, SocResult};
use serde::Serialize;

const DEVICE: &str = "at91.mci";

const MCI_CR: u64 = 0x00;
const MCI_MR: u64 = 0x04;
const MCI_DTOR: u64 = 0x08;
const MCI_SDCR: u64 = 0x0C;
const MCI_ARGR: u64 = 0x10;
const MCI_CMDR: u64 = 0x14;
const MCI_BLKR: u64 = 0x18;
const MCI_RSPR0: u64 = 0x20;
const MCI_RSPR3: u64 = 0x2C;
const MCI_RDR: u64 = 0x30;
const MCI_TDR: u64 = 0x34;
const MCI_SR: u64 = 0x40;
const MCI_IER: u64 = 0x44;
const MCI_IDR: u64 = 0x48;
const MCI_IMR: u64 = 0x4C;

const CR_MCIEN: u32 = 1 << 0;
const CR_MCIDIS: u32 = 1 << 1;
const CR_PWSEN: u32 = 1 << 2;
const CR_PWSDIS: u32 = 1 << 3;
const CR_SWRST: u32 = 1 << 7;

const MR_PDCFBYTE: u32 = 1 << 13;
const MR_PDCMODE: u32 = 1 << 15;

const SR_CMDRDY: u32 = 1 << 0;
const SR_RXRDY: u32 = 1 << 1;
const SR_TXRDY: u32 = 1 << 2;
const SR_BLKE: u32 = 1 << 3;
const SR_DTIP: u32 = 1 << 4;
const SR_NOTBUSY: u32 = 1 << 5;
const SR_ENDRX: u32 = 1 << 6;
const SR_ENDTX: u32 = 1 << 7;
const SR_SDIOIRQA: u32 = 1 << 8;
const SR_SDIOIRQB: u32 = 1 << 9;
const SR_RXBUFF: u32 = 1 << 14;
const SR_TXBUFE: u32 = 1 << 15;
const SR_RINDE: u32 = 1 << 16;
const SR_RDIRE: u32 = 1 << 17;
const SR_RCRCE: u32 = 1 << 18;
const SR_RENDE: u32 = 1 << 19;
const SR_RTOE: u32 = 1 << 20;
const SR_DCRCE: u32 = 1 << 21;
const SR_DTOE: u32 = 1 << 22;
const SR_OVRE: u32 = 1 << 30;
const SR_UNRE: u32 = 1 << 31;

const RSPTYP_NONE: u32 = 0;
const RSPTYP_48BIT: u32 = 1;
const RSPTYP_136BIT: u32 = 2;

const TRCMD_NONE: u32 = 0;
const TRCMD_START: u32 = 1;
const TRCMD_STOP: u32 = 2;

const TRTYP_SINGLE_BLOCK: u32 = 0;
const TRTYP_MULTIPLE_BLOCK: u32 = 1;
const TRTYP_MMC_STREAM: u32 = 2;
const TRTYP_SDIO_BYTE: u32 = 4;
const TRTYP_SDIO_BLOCK: u32 = 5;

const CMDR_TRDIR: u32 = 1 << 18;

/// Sentinel for a multiple-block transfer with BCNT = 0 (no preset count).
const TRANSFER_UNBOUNDED: u64 = u64::MAX;

fn cmdr_cmdnb(v: u32) -> u8 {
    (v & 0x3F) as u8
}

fn cmdr_rsptyp(v: u32) -> u32 {
    (v >> 6) & 0x03
}

fn cmdr_spcmd(v: u32) -> u32 {
    (v >> 9) & 0x07
}

fn cmdr_trcmd(v: u32) -> u32 {
    (v >> 16) & 0x03
}

fn cmdr_trtyp(v: u32) -> u32 {
    (v >> 19) & 0x07
}

fn cmdr_iospcmd(v: u32) -> u32 {
    (v >> 24) & 0x03
}

pub struct Mci {
    reg_mr: u32,
    reg_dtor: u32,
    reg_sdcr: u32,
    reg_argr: u32,
    reg_blkr: u32,
    reg_sr: u32,
    reg_imr: u32,

    reg_rspr: [u32; 4],
    rspr_index: usize,
    rspr_len: usize,

    mcien: bool,
    pwsen: bool,

    rd_bytes_left: u64,
    wr_bytes_left: u64,
    wr_bytes_blk: u64,

    rx_dma_enabled: bool,
    tx_dma_enabled: bool,

    /// Which of the two multiplexed cards drives slot A; follows PIO B
    /// pin 7 and is deliberately not touched by an MCI-only reset.
    selected_card: u8,

    mclk: u64,
    mcck: u64,

    cards: [Box<dyn SdBus>; 2],
    pdc: Pdc,
}

impl Mci {
    pub fn new(card0: Box<dyn SdBus>, card1: Box<dyn SdBus>) -> Self {
        let mut mci = Self {
            reg_mr: 0,
            reg_dtor: 0,
            reg_sdcr: 0,
            reg_argr: 0,
            reg_blkr: 0,
            reg_sr: 0,
            reg_imr: 0,
            reg_rspr: [0; 4],
            rspr_index: 0,
            rspr_len: 0,
            mcien: false,
            pwsen: false,
            rd_bytes_left: 0,
            wr_bytes_left: 0,
            wr_bytes_blk: 0,
            rx_dma_enabled: false,
            tx_dma_enabled: false,
            selected_card: 0,
            mclk: 0,
            mcck: 0,
            cards: [card0, card1],

            pdc: Pdc::new(),
        };
        mci.reset_registers();
        mci
    }

    pub fn reset_registers(&mut self) {
        self.reg_mr = 0x00;
        self.reg_dtor = 0x00;
        self.reg_sdcr = 0x00;
        self.reg_argr = 0x00;
        self.reg_blkr = 0x00;
        self.reg_sr =
            SR_CMDRDY | SR_TXRDY | SR_NOTBUSY | SR_ENDRX | SR_ENDTX | SR_RXBUFF | SR_TXBUFE;
        self.reg_imr = 0x00;

        self.reg_rspr = [0; 4];
        self.rspr_index = 0;
        self.rspr_len = 0;

        self.mcien = false;
        self.pwsen = false;

        self.rd_bytes_left = 0;
        self.wr_bytes_left = 0;
        self.wr_bytes_blk = 0;

        self.pdc.reset_registers();
    }

    pub fn irq_line(&self) -> bool {
        self.reg_sr & self.reg_imr != 0
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
        self.update_mcck();
    }

    fn update_mcck(&mut self) {
        let clkdiv = (self.reg_mr & 0xFF) as u64;
        self.mcck = self.mclk / (2 * (clkdiv + 1));
    }

    /// Card-select input from PIO B pin 7 (low selects card 1).
    pub fn card_select(&mut self, level: bool) {
        self.selected_card = if level { 0 } else { 1 };
    }

    pub fn selected_card(&self) -> u8 {
        self.selected_card
    }

    fn card(&mut self) -> &mut dyn SdBus {
        self.cards[self.selected_card as usize].as_mut()
    }

    fn blk_len(&self) -> u64 {
        ((self.reg_blkr >> 16) & 0xFFFF) as u64
    }

    fn blk_cnt(&self) -> u64 {
        (self.reg_blkr & 0xFFFF) as u64
    }

    fn fbyte(&self) -> bool {
        self.reg_mr & MR_PDCFBYTE != 0
    }

    fn pdc_mode(&self) -> bool {
        self.reg_mr & MR_PDCMODE != 0
    }

    fn transfer_length(&self, cmdr: u32) -> SocResult<u64> {
        match cmdr_trtyp(cmdr) {
            TRTYP_SINGLE_BLOCK => Ok(self.blk_len()),
            TRTYP_MULTIPLE_BLOCK => {
                if self.blk_cnt() == 0 {
                    Ok(TRANSFER_UNBOUNDED)
                } else {
                    Ok(self.blk_len() * self.blk_cnt())
                }
            }
            TRTYP_SDIO_BYTE => Ok(self.blk_cnt()),
            TRTYP_SDIO_BLOCK => Ok(self.blk_len() * self.blk_cnt()),
            TRTYP_MMC_STREAM => Err(SocError::Unsupported {
                device: DEVICE,
                feature: "MMC stream data transfer".to_string(),
            }),
            other => Err(SocError::access(
                DEVICE,
                MCI_CMDR,
                format!("invalid transfer type {other}"),
            )),
        }
    }

    fn pdc_do_read_rcr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let mut len = self.pdc.reg_rcr as u64;
        if !self.fbyte() {
            len *= 4;
        }
        len = len.min(self.rd_bytes_left);

        let mut data = vec![0u8; len as usize];
        for byte in data.iter_mut() {
            if !self.card().data_ready() {
                return Err(SocError::access(
                    DEVICE,
                    MCI_RDR,
                    "sd card has no data available for read",
                ));
            }
            *byte = self.card().read_data()?;
        }

        mem.dma_write(self.pdc.reg_rpr as u64, &data)?;

        self.pdc.reg_rpr += len as u32;
        self.pdc.reg_rcr -= (if self.fbyte() { len } else { len / 4 }) as u16;

        if self.rd_bytes_left != TRANSFER_UNBOUNDED {
            self.rd_bytes_left -= len;
        }
        Ok(())
    }

    fn pdc_do_read(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        if self.pdc.reg_rcr != 0 {
            self.pdc_do_read_rcr(mem)?;
        }

        if self.pdc.reg_rcr == 0 {
            self.reg_sr |= SR_ENDRX;
        }

        if self.pdc.rollover_rx() && self.rd_bytes_left != 0 {
            self.pdc_do_read_rcr(mem)?;
        }

        if self.rd_bytes_left == 0 {
            // in PDC mode BLKE indicates read completion, not per-block
            self.reg_sr |= SR_BLKE;
            self.reg_sr &= !(SR_DTIP | SR_RXRDY);
        }

        if self.pdc.reg_rcr == 0 && self.pdc.reg_rncr == 0 {
            self.reg_sr |= SR_RXBUFF;
            self.rx_dma_enabled = false;

            if self.rd_bytes_left != 0 {
                self.reg_sr |= SR_RXRDY;
            }
        }
        Ok(())
    }

    fn pdc_do_write_tcr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let mut len = self.pdc.reg_tcr as u64;
        if !self.fbyte() {
            len *= 4;
        }
        len = len.min(self.wr_bytes_left);

        let mut data = vec![0u8; len as usize];
        mem.dma_read(self.pdc.reg_tpr as u64, &mut data)?;
        for &byte in &data {
            self.card().write_data(byte)?;
        }

        self.pdc.reg_tpr += len as u32;
        self.pdc.reg_tcr -= (if self.fbyte() { len } else { len / 4 }) as u16;

        if self.wr_bytes_left != TRANSFER_UNBOUNDED {
            self.wr_bytes_left -= len;
        }
        let blk_len = self.blk_len();
        if blk_len != 0 {
            self.wr_bytes_blk = (self.wr_bytes_blk + len) % blk_len;
        }
        Ok(())
    }

    fn pdc_do_write(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        if self.pdc.reg_tcr != 0 {
            self.pdc_do_write_tcr(mem)?;
        }

        if self.pdc.reg_tcr == 0 {
            self.reg_sr |= SR_ENDTX;
        }

        if self.pdc.rollover_tx() && self.wr_bytes_left != 0 {
            self.pdc_do_write_tcr(mem)?;
        }

        if self.wr_bytes_left == 0 {
            // BLKE marks the last block of the transfer in PDC mode
            self.reg_sr |= SR_NOTBUSY | SR_BLKE;
            self.reg_sr &= !(SR_DTIP | SR_TXRDY);
        }

        if self.pdc.reg_tcr == 0 && self.pdc.reg_tncr == 0 {
            self.reg_sr |= SR_TXBUFE;
            self.tx_dma_enabled = false;

            // an unbounded transfer marks block completion when it happens
            // to stop on a block boundary
            if self.wr_bytes_left == TRANSFER_UNBOUNDED && self.wr_bytes_blk == 0 {
                self.reg_sr |= SR_BLKE;
            }

            if self.wr_bytes_left != 0 {
                self.reg_sr |= SR_TXRDY;
            }
        }
        Ok(())
    }

    fn tr_start(&mut self, cmdr: u32, mem: &mut AddressSpace) -> SocResult<()> {
        if cmdr & CMDR_TRDIR != 0 {
            self.rd_bytes_left = self.transfer_length(cmdr)?;
            if self.pdc_mode() && self.rx_dma_enabled {
                self.pdc_do_read(mem)?;
            } else if !self.pdc_mode() {
                self.reg_sr |= SR_RXRDY;
            }
        } else {
            self.wr_bytes_left = self.transfer_length(cmdr)?;
            self.wr_bytes_blk = 0;
            self.reg_sr &= !SR_NOTBUSY;
            if self.pdc_mode() && self.tx_dma_enabled {
                self.pdc_do_write(mem)?;
            } else if !self.pdc_mode() {
                self.reg_sr |= SR_TXRDY;
            }
        }
        Ok(())
    }

    fn tr_stop(&mut self) {
        // the stop command has no direction; NOTBUSY is set either way
        self.rd_bytes_left = 0;
        self.wr_bytes_left = 0;
        self.wr_bytes_blk = 0;
        self.reg_sr &= !(SR_DTIP | SR_RXRDY | SR_TXRDY);
        self.reg_sr |= SR_NOTBUSY;
    }

    fn do_command(&mut self, cmdr: u32, mem: &mut AddressSpace) -> SocResult<()> {
        self.reg_sr &= !SR_CMDRDY;

        let rlen_expected = match cmdr_rsptyp(cmdr) {
            RSPTYP_NONE => 0,
            RSPTYP_48BIT => 4,
            RSPTYP_136BIT => 16,
            other => {
                return Err(SocError::access(
                    DEVICE,
                    MCI_CMDR,
                    format!("invalid command RSPTYP {other}"),
                ))
            }
        };

        let request = SdRequest {
            cmd: cmdr_cmdnb(cmdr),
            arg: self.reg_argr,
        };

        let response = match self.card().do_command(&request)? {
            SdCommandOutcome::Timeout => {
                tracing::warn!("{}: command CMD{} timed out", DEVICE, request.cmd);
                self.reg_sr |= SR_CMDRDY | SR_RTOE;
                return Ok(());
            }
            SdCommandOutcome::Response(bytes) => bytes,
        };

        // an empty response for a response-carrying command means the card
        // did not answer (disconnected, illegal command)
        if !response.is_empty() && response.len() != rlen_expected {
            return Err(SocError::access(
                DEVICE,
                MCI_CMDR,
                format!(
                    "command response length {} does not match expected {}",
                    response.len(),
                    rlen_expected
                ),
            ));
        }
        if response.is_empty() && rlen_expected != 0 {
            self.reg_sr |= SR_RTOE;
        }

        self.rspr_index = 0;
        self.reg_rspr = [0; 4];
        match response.len() {
            4 => {
                self.reg_rspr[0] = u32::from_be_bytes(response[0..4].try_into().unwrap());
                self.rspr_len = 1;
            }
            16 => {
                self.reg_rspr[0] = u32::from_be_bytes(response[12..16].try_into().unwrap());
                self.reg_rspr[1] = u32::from_be_bytes(response[8..12].try_into().unwrap());
                self.reg_rspr[2] = u32::from_be_bytes(response[4..8].try_into().unwrap());
                self.reg_rspr[3] = u32::from_be_bytes(response[0..4].try_into().unwrap());
                self.rspr_len = 4;
            }
            _ => self.rspr_len = 0,
        }

        if cmdr_trcmd(cmdr) != TRCMD_NONE {
            self.reg_sr &= !(SR_OVRE | SR_UNRE);
            self.reg_sr |= SR_DTIP;

            if self.pdc_mode() && !self.fbyte() && self.blk_len() % 4 != 0 {
                return Err(SocError::access(
                    DEVICE,
                    MCI_CMDR,
                    "block length must be a multiple of 4 bytes unless PDCFBYTE is set",
                ));
            }

            match cmdr_trcmd(cmdr) {
                TRCMD_START => self.tr_start(cmdr, mem)?,
                TRCMD_STOP => self.tr_stop(),
                other => {
                    return Err(SocError::access(
                        DEVICE,
                        MCI_CMDR,
                        format!("invalid TRCMD value {other}"),
                    ))
                }
            }
        }

        if cmdr_spcmd(cmdr) != 0 {
            tracing::warn!("{}: special commands not supported (cmdr: {:#x})", DEVICE, cmdr);
        }
        if cmdr_iospcmd(cmdr) != 0 {
            tracing::warn!(
                "{}: SDIO special commands not supported (cmdr: {:#x})",
                DEVICE,
                cmdr
            );
        }

        self.reg_sr |= SR_CMDRDY;
        Ok(())
    }

    fn read_rdr(&mut self) -> SocResult<u32> {
        if self.rd_bytes_left == 0 {
            return Err(SocError::access(
                DEVICE,
                MCI_RDR,
                "RDR access without active read transmission",
            ));
        }
        if self.pdc_mode() {
            return Err(SocError::access(
                DEVICE,
                MCI_RDR,
                "RDR access while PDCMODE is set",
            ));
        }
        if !self.card().data_ready() {
            return Err(SocError::access(
                DEVICE,
                MCI_RDR,
                "sd card has no data available for read",
            ));
        }
        if self.reg_sr & SR_RXRDY == 0 {
            return Err(SocError::access(DEVICE, MCI_RDR, "RDR access while RXRDY not set"));
        }

        self.reg_sr &= !SR_RXRDY;

        let len = self.rd_bytes_left.min(4);
        let mut word = 0u32;
        for i in 0..len {
            word |= (self.card().read_data()? as u32) << (8 * i);
        }
        self.rd_bytes_left -= len;

        if self.rd_bytes_left == 0 {
            self.reg_sr &= !SR_DTIP;
        } else {
            // instantly ready for the next word
            self.reg_sr |= SR_RXRDY;
        }

        Ok(word)
    }

    fn write_tdr(&mut self, value: u32) -> SocResult<()> {
        if self.wr_bytes_left == 0 {
            return Err(SocError::access(
                DEVICE,
                MCI_TDR,
                "TDR access without active write transmission",
            ));
        }
        if self.pdc_mode() {
            return Err(SocError::access(
                DEVICE,
                MCI_TDR,
                "TDR access while PDCMODE is set",
            ));
        }
        if self.reg_sr & SR_TXRDY == 0 {
            return Err(SocError::access(DEVICE, MCI_TDR, "TDR access while TXRDY not set"));
        }

        self.reg_sr &= !SR_TXRDY;

        let len = self.wr_bytes_left.min(4);
        for i in 0..len {
            self.card().write_data((value >> (8 * i)) as u8)?;
        }
        self.wr_bytes_left -= len;
        self.wr_bytes_blk += len;

        // full block boundaries raise BLKE on writes
        let blk_len = self.blk_len();
        if blk_len != 0 && self.wr_bytes_blk >= blk_len {
            self.wr_bytes_blk -= blk_len;
            self.reg_sr |= SR_BLKE;
        }

        if self.wr_bytes_left == 0 {
            self.reg_sr |= SR_NOTBUSY | SR_BLKE;
            self.reg_sr &= !SR_DTIP;
            self.wr_bytes_blk = 0;
        }

        // data is committed immediately, so the interface is writable again
        self.reg_sr |= SR_TXRDY;
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            MCI_MR => Ok(self.reg_mr),
            MCI_DTOR => Ok(self.reg_dtor),
            MCI_SDCR => Ok(self.reg_sdcr),
            MCI_ARGR => Ok(self.reg_argr),
            MCI_BLKR => Ok(self.reg_blkr),

            // the response registers behave as a cursor: consecutive reads
            // (of any RSPR offset) step through the response words
            MCI_RSPR0..=MCI_RSPR3 => {
                if self.rspr_index < self.rspr_len {
                    let word = self.reg_rspr[self.rspr_index];
                    self.rspr_index += 1;
                    Ok(word)
                } else {
                    Err(SocError::access(
                        DEVICE,
                        offset,
                        format!(
                            "response of length {} but accessed {} times",
                            self.rspr_len,
                            self.rspr_index + 1
                        ),
                    ))
                }
            }

            MCI_RDR => self.read_rdr(),

            MCI_SR => {
                let sr = self.reg_sr;
                self.reg_sr &= !(SR_BLKE | SR_DCRCE | SR_DTOE | SR_SDIOIRQA | SR_SDIOIRQB);
                Ok(sr)
            }

            MCI_IMR => Ok(self.reg_imr),

            _ if Pdc::contains(offset) => self.pdc.get_register(DEVICE, offset),

            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32, mem: &mut AddressSpace) -> SocResult<()> {
        match offset {
            MCI_CR => {
                if value & CR_MCIEN != 0 && value & CR_MCIDIS == 0 {
                    self.mcien = true;
                }
                if value & CR_MCIDIS != 0 {
                    self.mcien = false;
                }
                if value & CR_PWSEN != 0 && value & CR_PWSDIS == 0 {
                    if (self.reg_mr >> 8) & 0x07 == 0 {
                        return Err(SocError::access(
                            DEVICE,
                            offset,
                            "cannot enable power save mode with PWSDIV set to zero",
                        ));
                    }
                    self.pwsen = true;
                }
                if value & CR_PWSDIS != 0 {
                    self.pwsen = false;
                }
                if value & CR_SWRST != 0 {
                    self.reset_registers();
                    for card in &mut self.cards {
                        card.reset();
                    }
                }
                Ok(())
            }

            MCI_MR => {
                self.reg_mr = value;
                // the block length field is shared with BLKR
                self.reg_blkr = (self.reg_blkr & 0x0000_FFFF) | (value & 0xFFFF_0000);
                self.update_mcck();
                Ok(())
            }

            MCI_DTOR => {
                self.reg_dtor = value;
                Ok(())
            }

            MCI_SDCR => {
                self.reg_sdcr = value;
                match value & 0x03 {
                    // slot A is the only slot wired on the iOBC
                    0 => Ok(()),
                    1 => Err(SocError::access(
                        DEVICE,
                        offset,
                        "cannot select slot B: all cards are multiplexed on slot A",
                    )),
                    other => Err(SocError::access(
                        DEVICE,
                        offset,
                        format!("invalid slot selection {other}"),
                    )),
                }
            }

            MCI_ARGR => {
                self.reg_argr = value;
                Ok(())
            }

            MCI_CMDR => {
                if !self.mcien {
                    return Err(SocError::access(
                        DEVICE,
                        offset,
                        "cannot send command while disabled",
                    ));
                }
                if self.reg_sr & SR_CMDRDY == 0 {
                    return Err(SocError::access(
                        DEVICE,
                        offset,
                        "CMDR is write protected while not CMDRDY",
                    ));
                }

                self.reg_sr &= !(SR_CMDRDY | SR_RINDE | SR_RDIRE | SR_RCRCE | SR_RENDE | SR_RTOE);
                self.do_command(value, mem)
            }

            MCI_BLKR => {
                self.reg_blkr = value;
                self.reg_mr = (self.reg_mr & 0x0000_FFFF) | (value & 0xFFFF_0000);
                Ok(())
            }

            MCI_TDR => self.write_tdr(value),

            MCI_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            MCI_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }

            _ if Pdc::contains(offset) => pdc::generic_set_register(self, mem, offset, value),

            _ => Err(SocError::illegal_write(DEVICE, offset, value)),
        }
    }
}

impl std::fmt::Debug for Mci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mci")
            .field("sr", &self.reg_sr)
            .field("selected_card", &self.selected_card)
            .finish()
    }
}

impl Serialize for Mci {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Mci", 7)?;
        s.serialize_field("mr", &self.reg_mr)?;
        s.serialize_field("sr", &self.reg_sr)?;
        s.serialize_field("blkr", &self.reg_blkr)?;
        s.serialize_field("mcien", &self.mcien)?;
        s.serialize_field("pwsen", &self.pwsen)?;
        s.serialize_field("mcck", &self.mcck)?;
        s.serialize_field("selected_card", &self.selected_card)?;
        s.end()
    }
}

impl PdcClient for Mci {
    const DEVICE: &'static str = DEVICE;
    const FLAGS: PdcFlags = PdcFlags {
        endrx: SR_ENDRX,
        endtx: SR_ENDTX,
        rxbuff: SR_RXBUFF,
        txbufe: SR_TXBUFE,
    };

    fn pdc_mut(&mut self) -> &mut Pdc {
        &mut self.pdc
    }

    fn status_mut(&mut self) -> &mut u32 {
        &mut self.reg_sr
    }

    fn update_irq(&mut self) {}

    fn dma_rx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        self.rx_dma_enabled = true;
        if self.rd_bytes_left != 0 {
            if !self.pdc_mode() {
                return Err(SocError::access(
                    DEVICE,
                    MCI_CMDR,
                    "PDC read transfer without PDCMODE set",
                ));
            }
            self.pdc_do_read(mem)?;
        }
        Ok(())
    }

    fn dma_rx_stop(&mut self) {
        self.rx_dma_enabled = false;
    }

    fn dma_tx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        self.tx_dma_enabled = true;
        if self.wr_bytes_left != 0 {
            if !self.pdc_mode() {
                return Err(SocError::access(
                    DEVICE,
                    MCI_CMDR,
                    "PDC write transfer without PDCMODE set",
                ));
            }
            self.pdc_do_write(mem)?;
        }
        Ok(())
    }

    fn dma_tx_stop(&mut self) {
        self.tx_dma_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SDRAM_BASE;
    use crate::pdc::{PDC_PTCR, PDC_RCR, PDC_RPR, PDC_TCR, PDC_TPR, PTCR_RXTEN, PTCR_TXTEN};
    use crate::sd::{EmptySlot, SdCardImage, SD_SECTOR_SIZE};

    fn patterned_mci() -> (Mci, AddressSpace) {
        let image: Vec<u8> = (0..4 * SD_SECTOR_SIZE).map(|i| i as u8).collect();
        let mci = Mci::new(
            Box::new(SdCardImage::from_vec(image)),
            Box::new(EmptySlot),
        );
        (mci, AddressSpace::new(false))
    }

    fn enable(mci: &mut Mci, mem: &mut AddressSpace) {
        mci.write(MCI_CR, CR_MCIEN, mem).unwrap();
    }

    /// CMD17 with a 48-bit response, read direction, start transfer.
    fn cmd17(trtyp: u32) -> u32 {
        17 | (RSPTYP_48BIT << 6) | (TRCMD_START << 16) | CMDR_TRDIR | (trtyp << 19)
    }

    #[test]
    fn test_single_block_read_via_pdc() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);

        // PDC mode, 512-byte blocks
        mci.write(MCI_MR, MR_PDCMODE | (512 << 16), &mut mem).unwrap();
        mci.write(PDC_RPR, SDRAM_BASE as u32, &mut mem).unwrap();
        mci.write(PDC_RCR, 128, &mut mem).unwrap(); // 128 words = 512 bytes
        mci.write(PDC_PTCR, PTCR_RXTEN, &mut mem).unwrap();

        mci.write(MCI_ARGR, 0, &mut mem).unwrap();
        mci.write(MCI_CMDR, cmd17(TRTYP_SINGLE_BLOCK), &mut mem).unwrap();

        let mut data = vec![0u8; 512];
        mem.dma_read(SDRAM_BASE, &mut data).unwrap();
        assert!(data.iter().enumerate().all(|(i, &b)| b == i as u8));

        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_ENDRX, SR_ENDRX);
        assert_eq!(sr & SR_BLKE, SR_BLKE);
        assert_eq!(sr & SR_CMDRDY, SR_CMDRDY);
        assert_eq!(mci.read(PDC_RCR).unwrap(), 0);

        // response cursor yields exactly one word for R1
        mci.read(MCI_RSPR0).unwrap();
        assert!(mci.read(MCI_RSPR0).is_err());
    }

    #[test]
    fn test_single_block_read_via_rdr() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        mci.write(MCI_BLKR, 8 << 16, &mut mem).unwrap(); // 8-byte "block"

        mci.write(MCI_CMDR, cmd17(TRTYP_SINGLE_BLOCK), &mut mem).unwrap();
        assert_eq!(mci.read(MCI_SR).unwrap() & SR_RXRDY, SR_RXRDY);

        assert_eq!(mci.read(MCI_RDR).unwrap(), 0x0302_0100);
        assert_eq!(mci.read(MCI_RDR).unwrap(), 0x0706_0504);

        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_RXRDY, 0);
        assert_eq!(sr & SR_DTIP, 0);
        // reading past the transfer aborts
        assert!(mci.read(MCI_RDR).is_err());
    }

    #[test]
    fn test_write_block_via_tdr_sets_blke_per_block() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        mci.write(MCI_BLKR, 4 << 16, &mut mem).unwrap();

        // CMD24, write direction, single block
        let cmdr = 24 | (RSPTYP_48BIT << 6) | (TRCMD_START << 16);
        mci.write(MCI_CMDR, cmdr, &mut mem).unwrap();
        assert_eq!(mci.read(MCI_SR).unwrap() & SR_TXRDY, SR_TXRDY);
        assert_eq!(mci.read(MCI_SR).unwrap() & SR_NOTBUSY, 0);

        mci.write(MCI_TDR, 0xDDCC_BBAA, &mut mem).unwrap();
        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_BLKE, SR_BLKE);
        assert_eq!(sr & SR_NOTBUSY, SR_NOTBUSY);

        // the data landed on the card
        mci.write(MCI_CMDR, cmd17(TRTYP_SINGLE_BLOCK), &mut mem).unwrap();
        mci.write(MCI_BLKR, 4 << 16, &mut mem).unwrap();
        assert_eq!(mci.read(MCI_RDR).unwrap(), 0xDDCC_BBAA);
    }

    #[test]
    fn test_command_timeout_sets_rtoe() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        mci.card_select(false); // card 1 = empty slot

        let cmdr = 17 | (RSPTYP_48BIT << 6);
        mci.write(MCI_CMDR, cmdr, &mut mem).unwrap();
        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_RTOE, SR_RTOE);
        assert_eq!(sr & SR_CMDRDY, SR_CMDRDY);
    }

    #[test]
    fn test_card_select_survives_mci_reset() {
        let (mut mci, mut mem) = patterned_mci();
        mci.card_select(false);
        assert_eq!(mci.selected_card(), 1);

        enable(&mut mci, &mut mem);
        mci.write(MCI_CR, CR_SWRST, &mut mem).unwrap();
        assert_eq!(mci.selected_card(), 1);
    }

    #[test]
    fn test_cmdr_requires_enable_and_cmdrdy() {
        let (mut mci, mut mem) = patterned_mci();
        assert!(mci.write(MCI_CMDR, 0, &mut mem).is_err());
    }

    #[test]
    fn test_blklen_must_be_word_multiple_in_pdc_mode() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        mci.write(MCI_MR, MR_PDCMODE | (510 << 16), &mut mem).unwrap();
        assert!(mci.write(MCI_CMDR, cmd17(TRTYP_SINGLE_BLOCK), &mut mem).is_err());
    }

    #[test]
    fn test_mr_and_blkr_share_block_length() {
        let (mut mci, mut mem) = patterned_mci();
        mci.write(MCI_MR, 512 << 16, &mut mem).unwrap();
        assert_eq!(mci.read(MCI_BLKR).unwrap() >> 16, 512);

        mci.write(MCI_BLKR, (256 << 16) | 4, &mut mem).unwrap();
        assert_eq!(mci.read(MCI_MR).unwrap() >> 16, 256);
    }

    #[test]
    fn test_slot_b_selection_aborts() {
        let (mut mci, mut mem) = patterned_mci();
        assert!(mci.write(MCI_SDCR, 1, &mut mem).is_err());
    }

    #[test]
    fn test_tdr_outside_transaction_aborts() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        assert!(mci.write(MCI_TDR, 0, &mut mem).is_err());
    }

    #[test]
    fn test_multiple_block_read_spans_blocks() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);

        // two 512-byte blocks through the PDC
        mci.write(MCI_MR, MR_PDCMODE | (512 << 16), &mut mem).unwrap();
        mci.write(MCI_BLKR, (512 << 16) | 2, &mut mem).unwrap();
        mci.write(PDC_RPR, SDRAM_BASE as u32, &mut mem).unwrap();
        mci.write(PDC_RCR, 256, &mut mem).unwrap();
        mci.write(PDC_PTCR, PTCR_RXTEN, &mut mem).unwrap();

        // CMD18, multiple block, read, start
        let cmdr = 18
            | (RSPTYP_48BIT << 6)
            | (TRCMD_START << 16)
            | CMDR_TRDIR
            | (TRTYP_MULTIPLE_BLOCK << 19);
        mci.write(MCI_CMDR, cmdr, &mut mem).unwrap();

        let mut data = vec![0u8; 1024];
        mem.dma_read(SDRAM_BASE, &mut data).unwrap();
        assert!(data.iter().enumerate().all(|(i, &b)| b == i as u8));

        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_ENDRX, SR_ENDRX);
        assert_eq!(sr & SR_BLKE, SR_BLKE);
    }

    #[test]
    fn test_unbounded_write_uses_sentinel_accounting() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);

        // BCNT = 0: no preset block count
        mci.write(MCI_MR, MR_PDCMODE | (4 << 16), &mut mem).unwrap();
        mci.write(MCI_BLKR, 4 << 16, &mut mem).unwrap();

        mem.dma_write(SDRAM_BASE, &[9, 8, 7, 6]).unwrap();
        mci.write(PDC_TPR, SDRAM_BASE as u32, &mut mem).unwrap();
        mci.write(PDC_PTCR, PTCR_TXTEN, &mut mem).unwrap();

        // CMD25, multiple block, write, start
        let cmdr =
            25 | (RSPTYP_48BIT << 6) | (TRCMD_START << 16) | (TRTYP_MULTIPLE_BLOCK << 19);
        mci.write(MCI_CMDR, cmdr, &mut mem).unwrap();

        mci.write(PDC_TCR, 1, &mut mem).unwrap(); // one word = one block here

        let sr = mci.read(MCI_SR).unwrap();
        assert_eq!(sr & SR_ENDTX, SR_ENDTX);
        assert_eq!(sr & SR_BLKE, SR_BLKE, "stopped on a block boundary");
        assert_eq!(sr & SR_TXRDY, SR_TXRDY, "transfer is still open");
        assert_eq!(sr & SR_NOTBUSY, 0);

        // CMD12-style stop command closes the transfer
        let stop = 12 | (RSPTYP_48BIT << 6) | (TRCMD_STOP << 16);
        mci.write(MCI_CMDR, stop, &mut mem).unwrap();
        assert_eq!(mci.read(MCI_SR).unwrap() & SR_NOTBUSY, SR_NOTBUSY);
    }

    #[test]
    fn test_mmc_stream_rejected() {
        let (mut mci, mut mem) = patterned_mci();
        enable(&mut mci, &mut mem);
        assert!(mci
            .write(MCI_CMDR, cmd17(TRTYP_MMC_STREAM), &mut mem)
            .is_err());
    }
}
