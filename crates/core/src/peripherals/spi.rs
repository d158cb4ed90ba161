// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Serial Peripheral Interface, master mode. Every transmitted unit
//! implies a same-size read from the slave: with a client attached the
//! emulated CPU stalls until the client echoes the outstanding units back;
//! without one (or with LLB set) the transmitted data loops into the
//! receive path.
//!
//! A transferred unit travels as a little-endian u32 encoding the chip
//! number, word width, and data: `(pcnr << 24) | ((bits - 8) << 16) | data`.

use crate::iox::{IoxFrame, IoxServer, CAT_DATA, CAT_FAULT, CID_DATA_IN, CID_DATA_OUT};
use crate::memory::AddressSpace;
use crate::pdc::{self, Pdc, PdcClient, PdcFlags};
use crate::{SocError, SocPolicy, SocResult};
use serde::Serialize;
use std::path::Path;

const CID_FAULT_MODF: u8 = 0x01;
const CID_FAULT_OVRES: u8 = 0x02;

const SPI_CR: u64 = 0x00;
const SPI_MR: u64 = 0x04;
const SPI_RDR: u64 = 0x08;
const SPI_TDR: u64 = 0x0C;
const SPI_SR: u64 = 0x10;
const SPI_IER: u64 = 0x14;
const SPI_IDR: u64 = 0x18;
const SPI_IMR: u64 = 0x1C;
const SPI_CSR0: u64 = 0x30;
const SPI_CSR3: u64 = 0x3C;

const CR_SPIEN: u32 = 1 << 0;
const CR_SPIDIS: u32 = 1 << 1;
const CR_SWRST: u32 = 1 << 7;
const CR_LASTXFER: u32 = 1 << 24;

const MR_MSTR: u32 = 1 << 0;
const MR_PS: u32 = 1 << 1;
const MR_PCSDEC: u32 = 1 << 2;
const MR_LLB: u32 = 1 << 7;

const SR_RDRF: u32 = 1 << 0;
const SR_TDRE: u32 = 1 << 1;
const SR_MODF: u32 = 1 << 2;
const SR_OVRES: u32 = 1 << 3;
const SR_ENDRX: u32 = 1 << 4;
const SR_ENDTX: u32 = 1 << 5;
const SR_RXBUFF: u32 = 1 << 6;
const SR_TXBUFE: u32 = 1 << 7;
const SR_NSSR: u32 = 1 << 8;
const SR_TXEMPTY: u32 = 1 << 9;
const SR_SPIENS: u32 = 1 << 16;

fn encode_unit(pcnr: u8, bits: u8, data: u16) -> u32 {
    ((pcnr as u32) << 24) | (((bits - 8) as u32) << 16) | data as u32
}

fn unit_bits(unit: u32) -> u8 {
    (((unit >> 16) & 0xFF) as u8) + 8
}

fn unit_data(unit: u32) -> u16 {
    unit as u16
}

#[derive(Debug, Serialize)]
pub struct Spi {
    device: &'static str,

    reg_mr: u32,
    reg_rdr: u32,
    reg_sr: u32,
    reg_imr: u32,
    reg_csr: [u32; 4],

    mclk: u64,

    /// Units sent to the client whose echo has not arrived yet; any MMIO
    /// access stalls the CPU while this is non-zero.
    pending_echo: usize,
    rx_dma_enabled: bool,

    pdc: Pdc,
    #[serde(skip)]
    server: Option<IoxServer>,
}

impl Spi {
    pub fn new(device: &'static str, socket: Option<&Path>) -> SocResult<Self> {
        let mut spi = Self {
            device,
            reg_mr: 0,
            reg_rdr: 0,
            reg_sr: 0,
            reg_imr: 0,
            reg_csr: [0; 4],
            mclk: 0,
            pending_echo: 0,
            rx_dma_enabled: false,
            pdc: Pdc::new(),
            server: None,
        };
        spi.reset_registers();
        if let Some(path) = socket {
            spi.server = Some(IoxServer::open(device, path)?);
        }
        Ok(spi)
    }

    pub fn reset_registers(&mut self) {
        self.reg_mr = 0;
        self.reg_rdr = 0;
        self.reg_sr = SR_ENDRX | SR_ENDTX | SR_RXBUFF | SR_TXBUFE;
        self.reg_imr = 0;
        self.reg_csr = [0; 4];
        self.pending_echo = 0;
        self.rx_dma_enabled = false;
        self.pdc.reset_registers();
    }

    pub fn reset_buffers(&mut self) {
        self.pending_echo = 0;
    }

    pub fn irq_line(&self) -> bool {
        self.reg_sr & self.reg_imr & 0x3FF != 0
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
    }

    /// Informational serial clock rate for a chip select.
    pub fn spck_rate(&self, cs: usize) -> u64 {
        let scbr = ((self.reg_csr[cs] >> 8) & 0xFF) as u64;
        if scbr == 0 {
            0
        } else {
            self.mclk / scbr
        }
    }

    /// True while a transfer awaits its client echo; the executor yields on
    /// any MMIO access until the reply drains this.
    pub fn is_stalled(&self) -> bool {
        self.pending_echo > 0 && self.server.as_ref().is_some_and(|s| s.connected())
    }

    fn enabled(&self) -> bool {
        self.reg_sr & SR_SPIENS != 0
    }

    /// Chip number from a PCS field. Without PCSDEC the field is one-hot
    /// low-active; with it, a direct binary index.
    fn decode_pcs(&self, pcs: u32) -> u8 {
        if self.reg_mr & MR_PCSDEC != 0 {
            (pcs & 0x03) as u8
        } else if pcs & 0x1 == 0 {
            0
        } else if pcs & 0x3 == 0x1 {
            1
        } else if pcs & 0x7 == 0x3 {
            2
        } else {
            3
        }
    }

    fn csr_bits(&self, cs: u8) -> u8 {
        (((self.reg_csr[cs as usize] >> 4) & 0x0F) as u8) + 8
    }

    /// Number of bytes a unit of the given width occupies in memory for
    /// fixed-peripheral-select PDC transfers.
    fn word_size(bits: u8) -> usize {
        if bits > 8 {
            2
        } else {
            1
        }
    }

    fn rx_unit(&mut self, unit: u32, mem: &mut AddressSpace) -> SocResult<()> {
        if self.rx_dma_enabled && self.pdc.reg_rcr != 0 {
            let data = unit_data(unit);
            let width = Self::word_size(unit_bits(unit));
            mem.dma_write(self.pdc.reg_rpr as u64, &data.to_le_bytes()[..width])?;
            self.pdc.reg_rpr += width as u32;
            self.pdc.reg_rcr -= 1;

            if self.pdc.reg_rcr == 0 {
                self.reg_sr |= SR_ENDRX;
                if self.pdc.reg_rncr == 0 {
                    self.reg_sr |= SR_RXBUFF;
                    self.rx_dma_enabled = false;
                } else {
                    self.pdc.rollover_rx();
                }
            }
            return Ok(());
        }

        if self.reg_sr & SR_RDRF != 0 {
            self.reg_sr |= SR_OVRES;
        }
        self.reg_rdr = unit_data(unit) as u32;
        self.reg_sr |= SR_RDRF;
        Ok(())
    }

    /// Emit one unit on the wire. With a client attached the matching echo
    /// is owed before emulation may continue; otherwise the unit loops
    /// straight back into the receive path.
    fn transfer_unit(&mut self, unit: u32, mem: &mut AddressSpace) -> SocResult<()> {
        let loopback = self.reg_mr & MR_LLB != 0;
        let client = self.server.as_ref().is_some_and(|s| s.connected());

        if client && !loopback {
            if let Some(server) = self.server.as_mut() {
                server.send_data(CAT_DATA, CID_DATA_OUT, &unit.to_le_bytes())?;
            }
            self.pending_echo += 1;
            self.reg_sr &= !SR_TXEMPTY;
        } else {
            self.rx_unit(unit, mem)?;
        }

        self.reg_sr |= SR_TDRE;
        if self.pending_echo == 0 {
            self.reg_sr |= SR_TXEMPTY;
        }
        Ok(())
    }

    fn write_tdr(
        &mut self,
        value: u32,
        mem: &mut AddressSpace,
        policy: &SocPolicy,
    ) -> SocResult<()> {
        if !self.enabled() {
            tracing::warn!("{}: TDR write while SPI disabled is lost", self.device);
            return Ok(());
        }
        if self.reg_mr & MR_MSTR == 0 {
            return policy.unsupported(self.device, "slave-mode transfer");
        }

        let pcs = if self.reg_mr & MR_PS != 0 {
            (value >> 16) & 0x0F
        } else {
            (self.reg_mr >> 16) & 0x0F
        };
        let pcnr = self.decode_pcs(pcs);
        let bits = self.csr_bits(pcnr);
        let data = (value as u16) & (((1u32 << bits) - 1) as u16);

        self.reg_sr &= !SR_TDRE;
        self.transfer_unit(encode_unit(pcnr, bits, data), mem)
    }

    fn handle_data_in(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        for chunk in frame.payload.chunks_exact(4) {
            if self.pending_echo == 0 {
                // unsolicited units are dropped; the SPI is master-only
                break;
            }
            let unit = u32::from_le_bytes(chunk.try_into().unwrap());
            self.rx_unit(unit, mem)?;
            self.pending_echo -= 1;
        }

        if self.pending_echo == 0 {
            self.reg_sr |= SR_TXEMPTY;
        }
        if let Some(server) = self.server.as_mut() {
            server.send_u32_resp(frame, 0)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        match (frame.cat, frame.id) {
            (CAT_DATA, CID_DATA_IN) => self.handle_data_in(frame, mem)?,
            (CAT_FAULT, CID_FAULT_MODF) => self.reg_sr |= SR_MODF,
            (CAT_FAULT, CID_FAULT_OVRES) => self.reg_sr |= SR_OVRES,
            _ => {}
        }
        Ok(())
    }

    pub fn poll(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        let was_connected = server.connected();
        let frames = server.poll()?;

        if was_connected && !server.connected() && self.pending_echo > 0 {
            // the client vanished mid-transfer; release the CPU rather
            // than stall forever
            tracing::warn!(
                "{}: client disconnected with {} unit(s) outstanding",
                self.device,
                self.pending_echo
            );
            self.pending_echo = 0;
            self.reg_sr |= SR_TXEMPTY;
        }

        for frame in &frames {
            self.handle_frame(frame, mem)?;
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            SPI_MR => Ok(self.reg_mr),

            SPI_RDR => {
                self.reg_sr &= !SR_RDRF;
                Ok(self.reg_rdr)
            }

            SPI_SR => {
                let sr = self.reg_sr;
                self.reg_sr &= !(SR_MODF | SR_OVRES | SR_NSSR);
                Ok(sr)
            }

            SPI_IMR => Ok(self.reg_imr),

            SPI_CSR0..=SPI_CSR3 => Ok(self.reg_csr[((offset - SPI_CSR0) / 4) as usize]),

            _ if Pdc::contains(offset) => self.pdc.get_register(self.device, offset),

            _ => Err(SocError::illegal_read(self.device, offset)),
        }
    }

    pub fn write(
        &mut self,
        offset: u64,
        value: u32,
        mem: &mut AddressSpace,
        policy: &SocPolicy,
    ) -> SocResult<()> {
        match offset {
            SPI_CR => {
                if value & CR_SPIEN != 0 && value & CR_SPIDIS == 0 {
                    self.reg_sr |= SR_SPIENS | SR_TDRE | SR_TXEMPTY;
                }
                if value & CR_SPIDIS != 0 {
                    self.reg_sr &= !(SR_SPIENS | SR_TDRE | SR_TXEMPTY);
                }
                if value & CR_SWRST != 0 {
                    self.reset_registers();
                }
                // LASTXFER only matters for chip-select timing, which is
                // not modeled
                let _ = value & CR_LASTXFER;
                Ok(())
            }

            SPI_MR => {
                self.reg_mr = value;
                Ok(())
            }

            SPI_TDR => self.write_tdr(value, mem, policy),

            SPI_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            SPI_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }

            SPI_CSR0..=SPI_CSR3 => {
                let bits_field = (value >> 4) & 0x0F;
                if bits_field > 8 {
                    return Err(SocError::access(
                        self.device,
                        offset,
                        format!("reserved BITS value {bits_field} in CSR"),
                    ));
                }
                self.reg_csr[((offset - SPI_CSR0) / 4) as usize] = value;
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
}

impl PdcClient for Spi {
    const DEVICE: &'static str = "at91.spi";
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

    fn dma_rx_start(&mut self, _mem: &mut AddressSpace) -> SocResult<()> {
        self.rx_dma_enabled = true;
        Ok(())
    }

    fn dma_rx_stop(&mut self) {
        self.rx_dma_enabled = false;
    }

    /// Read TCR units from memory and emit them. Variable peripheral
    /// select stores full 32-bit TDR images; fixed mode stores bare 8- or
    /// 16-bit words.
    fn dma_tx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        loop {
            while self.pdc.reg_tcr != 0 {
                let unit = if self.reg_mr & MR_PS != 0 {
                    let mut buf = [0u8; 4];
                    mem.dma_read(self.pdc.reg_tpr as u64, &mut buf)?;
                    self.pdc.reg_tpr += 4;
                    let tdr = u32::from_le_bytes(buf);
                    let pcnr = self.decode_pcs((tdr >> 16) & 0x0F);
                    let bits = self.csr_bits(pcnr);
                    encode_unit(pcnr, bits, (tdr as u16) & (((1u32 << bits) - 1) as u16))
                } else {
                    let pcnr = self.decode_pcs((self.reg_mr >> 16) & 0x0F);
                    let bits = self.csr_bits(pcnr);
                    let width = Self::word_size(bits);
                    let mut buf = [0u8; 2];
                    mem.dma_read(self.pdc.reg_tpr as u64, &mut buf[..width])?;
                    self.pdc.reg_tpr += width as u32;
                    encode_unit(pcnr, bits, u16::from_le_bytes(buf))
                };

                self.pdc.reg_tcr -= 1;
                self.transfer_unit(unit, mem)?;
            }

            if !self.pdc.rollover_tx() {
                break;
            }
        }

        self.reg_sr |= SR_ENDTX | SR_TXBUFE;
        Ok(())
    }

    fn dma_tx_stop(&mut self) {}
}
