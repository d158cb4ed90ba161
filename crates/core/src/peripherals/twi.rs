// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Two-Wire Interface (I2C), master mode. A write transaction gathers the
//! bytes the firmware feeds through THR: each write re-arms a timer of two
//! TWI-clock periods, and when it finally expires the whole run is emitted
//! as one START / data / STOP burst on the IOX link. DMA writes emit the
//! burst synchronously. Slave mode exists only as a mode-lattice state; any
//! data operation in it is rejected.

use crate::clock::PeriodicTimer;
use crate::iox::{
    IoxFrame, IoxServer, CAT_DATA, CAT_FAULT, CID_CTRL_START, CID_CTRL_STOP, CID_DATA_IN,
    CID_DATA_OUT,
};
use crate::memory::AddressSpace;
use crate::pdc::{self, Pdc, PdcClient, PdcFlags};
use crate::{SocError, SocPolicy, SocResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;

const DEVICE: &str = "at91.twi";

const CID_FAULT_OVRE: u8 = 0x01;
const CID_FAULT_NACK: u8 = 0x02;
const CID_FAULT_ARBLST: u8 = 0x03;

const TWI_CR: u64 = 0x00;
const TWI_MMR: u64 = 0x04;
const TWI_SMR: u64 = 0x08;
const TWI_IADR: u64 = 0x0C;
const TWI_CWGR: u64 = 0x10;
const TWI_SR: u64 = 0x20;
const TWI_IER: u64 = 0x24;
const TWI_IDR: u64 = 0x28;
const TWI_IMR: u64 = 0x2C;
const TWI_RHR: u64 = 0x30;
const TWI_THR: u64 = 0x34;

const CR_START: u32 = 1 << 0;
const CR_STOP: u32 = 1 << 1;
const CR_MSEN: u32 = 1 << 2;
const CR_MSDIS: u32 = 1 << 3;
const CR_SVEN: u32 = 1 << 4;
const CR_SVDIS: u32 = 1 << 5;
const CR_SWRST: u32 = 1 << 7;

const MMR_MREAD: u32 = 1 << 12;

const SR_TXCOMP: u32 = 1 << 0;
const SR_RXRDY: u32 = 1 << 1;
const SR_TXRDY: u32 = 1 << 2;
const SR_GACC: u32 = 1 << 5;
const SR_OVRE: u32 = 1 << 6;
const SR_NACK: u32 = 1 << 8;
const SR_ARBLST: u32 = 1 << 9;
const SR_EOSACC: u32 = 1 << 11;
const SR_ENDRX: u32 = 1 << 12;
const SR_ENDTX: u32 = 1 << 13;
const SR_RXBUFF: u32 = 1 << 14;
const SR_TXBUFE: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum TwiMode {
    Offline,
    Master,
    Slave,
}

#[derive(Debug, Serialize)]
pub struct Twi {
    reg_mmr: u32,
    reg_smr: u32,
    reg_iadr: u32,
    reg_cwgr: u32,
    reg_sr: u32,
    reg_imr: u32,
    reg_rhr: u32,

    mode: TwiMode,
    mclk: u64,
    clock: u64,

    dma_rx_enabled: bool,

    rcvbuf: VecDeque<u8>,
    sendbuf: Vec<u8>,
    #[serde(skip)]
    chrtx_timer: PeriodicTimer,

    pdc: Pdc,
    #[serde(skip)]
    server: Option<IoxServer>,
}

impl Twi {
    pub fn new(socket: Option<&Path>) -> SocResult<Self> {
        let mut twi = Self {
            reg_mmr: 0,
            reg_smr: 0,
            reg_iadr: 0,
            reg_cwgr: 0,
            reg_sr: 0,
            reg_imr: 0,
            reg_rhr: 0,
            mode: TwiMode::Offline,
            mclk: 0,
            clock: 0,
            dma_rx_enabled: false,
            rcvbuf: VecDeque::with_capacity(1024),
            sendbuf: Vec::with_capacity(256),
            chrtx_timer: PeriodicTimer::new(),
            pdc: Pdc::new(),
            server: None,
        };
        twi.reset_registers();
        if let Some(path) = socket {
            twi.server = Some(IoxServer::open(DEVICE, path)?);
        }
        Ok(twi)
    }

    pub fn reset_registers(&mut self) {
        self.mode = TwiMode::Offline;

        self.reg_mmr = 0;
        self.reg_smr = 0;
        self.reg_iadr = 0;
        self.reg_cwgr = 0;
        self.reg_sr = 0xF009;
        self.reg_imr = 0;
        self.reg_rhr = 0;

        self.dma_rx_enabled = false;
        self.chrtx_timer.stop();

        self.pdc.reset_registers();
        self.update_clock();
    }

    pub fn reset_buffers(&mut self) {
        self.rcvbuf.clear();
        self.sendbuf.clear();
    }

    pub fn irq_line(&self) -> bool {
        self.reg_sr & self.reg_imr != 0
    }

    fn update_clock(&mut self) {
        let cldiv = (self.reg_cwgr & 0xFF) as u64;
        let chdiv = ((self.reg_cwgr >> 8) & 0xFF) as u64;
        let ckdiv = ((self.reg_cwgr >> 16) & 0x07) as u64;

        let ldiv = cldiv * (1 << ckdiv) + 4;
        let hdiv = chdiv * (1 << ckdiv) + 4;
        self.clock = self.mclk / (ldiv + hdiv);

        if self.clock != 0 {
            self.chrtx_timer.set_freq(self.clock);
        }
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
        self.update_clock();
    }

    fn send_frame_start(&mut self) -> SocResult<()> {
        let dadr = (((self.reg_mmr >> 16) & 0x7F) | ((self.reg_mmr & MMR_MREAD) >> 5)) as u8;
        let payload = [
            dadr,
            ((self.reg_mmr >> 8) & 0x03) as u8,
            (self.reg_iadr & 0xFF) as u8,
            ((self.reg_iadr >> 8) & 0xFF) as u8,
            ((self.reg_iadr >> 16) & 0xFF) as u8,
        ];
        if let Some(server) = self.server.as_mut() {
            server.send_data(CAT_DATA, CID_CTRL_START, &payload)?;
        }
        Ok(())
    }

    fn send_frame_stop(&mut self) -> SocResult<()> {
        if let Some(server) = self.server.as_mut() {
            server.send_command(CAT_DATA, CID_CTRL_STOP)?;
        }
        Ok(())
    }

    fn iox_send_chars(&mut self, data: &[u8]) -> SocResult<()> {
        if let Some(server) = self.server.as_mut() {
            server.send_multiframe(CAT_DATA, CID_DATA_OUT, data)?;
        }
        Ok(())
    }

    /// The character-transmit timer expired: all THR writes of this
    /// transaction have been gathered, emit the burst.
    fn chrtx_flush(&mut self) -> SocResult<()> {
        self.send_frame_start()?;
        let data = std::mem::take(&mut self.sendbuf);
        self.iox_send_chars(&data)?;
        self.send_frame_stop()?;

        self.reg_sr |= SR_TXCOMP;
        Ok(())
    }

    fn chr_transmit(&mut self, value: u8, now_ns: u64) {
        self.sendbuf.push(value);

        // two TWI clock periods: load-to-shift, then send; re-armed on
        // every write so a back-to-back run stays one transaction
        self.chrtx_timer.set_limit(2, true);
        self.chrtx_timer.run(now_ns, true);

        self.reg_sr |= SR_TXRDY;
    }

    fn chr_receive(&mut self, chr: u8) {
        if self.reg_sr & SR_RXRDY != 0 {
            self.reg_sr |= SR_OVRE;
        }
        self.reg_rhr = chr as u32;
        self.reg_sr |= SR_RXRDY;
    }

    fn receiver_next(&mut self) {
        if self.reg_sr & SR_RXRDY != 0 {
            return;
        }
        if let Some(chr) = self.rcvbuf.pop_front() {
            self.chr_receive(chr);
        }
    }

    fn receiver_dma_rhr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let chr = self.reg_rhr as u8;
        mem.dma_write(self.pdc.reg_rpr as u64, &[chr])?;
        self.pdc.reg_rpr += 1;
        self.pdc.reg_rcr -= 1;
        self.reg_sr &= !SR_RXRDY;
        Ok(())
    }

    fn receiver_dma_rcr(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        let len = self.rcvbuf.len().min(self.pdc.reg_rcr as usize);
        let data: Vec<u8> = self.rcvbuf.drain(..len).collect();
        mem.dma_write(self.pdc.reg_rpr as u64, &data)?;
        self.pdc.reg_rpr += len as u32;
        self.pdc.reg_rcr -= len as u16;
        Ok(())
    }

    fn receiver_dma_update(&mut self) {
        if self.pdc.reg_rcr == 0 {
            self.reg_sr |= SR_ENDRX;
        }
        if self.pdc.reg_rcr == 0 && self.pdc.reg_rncr == 0 {
            self.reg_sr |= SR_RXBUFF;
        }
        self.pdc.rollover_rx();
    }

    fn receiver_dma(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        if self.reg_sr & SR_RXRDY != 0 && self.pdc.reg_rcr != 0 {
            self.receiver_dma_rhr(mem)?;
            self.receiver_dma_update();
        }

        if self.pdc.reg_rcr != 0 && !self.rcvbuf.is_empty() {
            self.receiver_dma_rcr(mem)?;
            self.receiver_dma_update();

            if self.pdc.reg_rcr != 0 && !self.rcvbuf.is_empty() {
                self.receiver_dma_rcr(mem)?;
                if self.pdc.reg_rcr == 0 {
                    self.reg_sr |= SR_ENDRX | SR_RXBUFF;
                }
            }
        }

        if self.pdc.reg_rcr == 0 {
            self.dma_rx_enabled = false;
        }
        if self.pdc.reg_rcr == 0 && self.pdc.reg_rncr == 0 {
            self.receiver_next();
        }
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

        self.rcvbuf.extend(frame.payload.iter());
        if let Some(server) = self.server.as_mut() {
            server.send_u32_resp(frame, 0)?;
        }

        if in_progress {
            return Ok(());
        }

        if self.dma_rx_enabled {
            self.receiver_dma(mem)
        } else {
            self.receiver_next();
            Ok(())
        }
    }

    fn handle_frame(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        match (frame.cat, frame.id) {
            (CAT_DATA, CID_DATA_IN) => self.handle_data_in(frame, mem)?,
            (CAT_FAULT, CID_FAULT_OVRE) => self.reg_sr |= SR_OVRE,
            // NACK and lost arbitration complete the transfer attempt
            (CAT_FAULT, CID_FAULT_NACK) => self.reg_sr |= SR_NACK | SR_TXCOMP,
            (CAT_FAULT, CID_FAULT_ARBLST) => self.reg_sr |= SR_ARBLST | SR_TXCOMP,
            _ => {}
        }
        Ok(())
    }

    pub fn poll(&mut self, now_ns: u64, mem: &mut AddressSpace) -> SocResult<()> {
        if self.chrtx_timer.poll(now_ns) > 0 {
            self.chrtx_flush()?;
        }

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
            TWI_MMR => Ok(self.reg_mmr),
            TWI_SMR => Ok(self.reg_smr),
            TWI_IADR => Ok(self.reg_iadr),
            TWI_CWGR => Ok(self.reg_cwgr),

            TWI_SR => {
                let sr = self.reg_sr;
                self.reg_sr &= !(SR_GACC | SR_OVRE | SR_NACK | SR_ARBLST | SR_EOSACC);
                Ok(sr)
            }

            TWI_IMR => Ok(self.reg_imr),

            TWI_RHR => {
                let rhr = self.reg_rhr;
                self.reg_sr &= !SR_RXRDY;
                self.receiver_next();
                Ok(rhr)
            }

            _ if Pdc::contains(offset) => self.pdc.get_register(DEVICE, offset),

            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    fn write_cr(&mut self, value: u32, policy: &SocPolicy) -> SocResult<()> {
        if value & CR_START != 0 {
            if self.mode != TwiMode::Master || self.reg_mmr & MMR_MREAD == 0 {
                tracing::warn!("{}: sending start frame when not in master-read mode", DEVICE);
            }
            // a master read is announced here; a master write announces
            // itself on the first THR character instead
            self.send_frame_start()?;
        }
        if value & CR_STOP != 0 {
            if self.mode != TwiMode::Master {
                tracing::warn!("{}: sending stop frame when not in master mode", DEVICE);
            }
            self.send_frame_stop()?;
        }
        if value & CR_MSEN != 0 && value & CR_MSDIS == 0 {
            let txcomp = self.reg_sr & SR_TXCOMP != 0;
            match self.mode {
                TwiMode::Offline => {
                    tracing::info!("{}: enabling master mode", DEVICE);
                    self.mode = TwiMode::Master;
                    self.reg_sr |= SR_TXRDY;
                }
                TwiMode::Slave if txcomp => {
                    tracing::info!("{}: enabling master mode", DEVICE);
                    self.mode = TwiMode::Master;
                    self.reg_sr |= SR_TXRDY;
                }
                TwiMode::Slave => {
                    return Err(SocError::access(
                        DEVICE,
                        TWI_CR,
                        "switching from slave to master mode requires TXCOMP",
                    ));
                }
                TwiMode::Master => {}
            }
        }
        if value & CR_MSDIS != 0 {
            match self.mode {
                TwiMode::Master => {
                    tracing::info!("{}: disabling master mode", DEVICE);
                    self.mode = TwiMode::Offline;
                }
                TwiMode::Slave => {
                    tracing::warn!("{}: MSDIS while in slave mode", DEVICE);
                }
                TwiMode::Offline => {}
            }
        }
        if value & CR_SVEN != 0 && value & CR_SVDIS == 0 {
            let txcomp = self.reg_sr & SR_TXCOMP != 0;
            match self.mode {
                TwiMode::Offline => self.mode = TwiMode::Slave,
                TwiMode::Master if txcomp => self.mode = TwiMode::Slave,
                TwiMode::Master => {
                    return Err(SocError::access(
                        DEVICE,
                        TWI_CR,
                        "switching from master to slave mode requires TXCOMP",
                    ));
                }
                TwiMode::Slave => {}
            }
        }
        if value & CR_SVDIS != 0 {
            match self.mode {
                TwiMode::Slave => self.mode = TwiMode::Offline,
                TwiMode::Master => {
                    tracing::warn!("{}: SVDIS while in master mode", DEVICE);
                }
                TwiMode::Offline => {}
            }
        }
        if value & CR_SWRST != 0 {
            policy.unsupported(DEVICE, "software reset (SWRST)")?;
        }
        Ok(())
    }

    pub fn write(
        &mut self,
        offset: u64,
        value: u32,
        mem: &mut AddressSpace,
        now_ns: u64,
        policy: &SocPolicy,
    ) -> SocResult<()> {
        match offset {
            TWI_CR => self.write_cr(value, policy),

            TWI_MMR => {
                self.reg_mmr = value;
                Ok(())
            }
            TWI_SMR => {
                self.reg_smr = value;
                Ok(())
            }
            TWI_IADR => {
                self.reg_iadr = value;
                Ok(())
            }
            TWI_CWGR => {
                self.reg_cwgr = value;
                self.update_clock();
                Ok(())
            }

            TWI_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            TWI_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }

            TWI_THR => {
                if self.mode == TwiMode::Slave {
                    return policy.unsupported(DEVICE, "slave-mode transmission");
                }
                self.chr_transmit(value as u8, now_ns);
                Ok(())
            }

            _ if Pdc::contains(offset) => pdc::generic_set_register(self, mem, offset, value),

            _ => Err(SocError::illegal_write(DEVICE, offset, value)),
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_frame(&mut self, frame: &IoxFrame, mem: &mut AddressSpace) -> SocResult<()> {
        self.handle_frame(frame, mem)
    }
}

impl PdcClient for Twi {
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
        self.dma_rx_enabled = true;
        self.receiver_dma(mem)
    }

    fn dma_rx_stop(&mut self) {
        self.dma_rx_enabled = false;
    }

    /// DMA writes emit the whole transaction synchronously.
    fn dma_tx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()> {
        if self.pdc.reg_tcr == 0 {
            return Ok(());
        }

        self.send_frame_start()?;
        self.dma_tx_do_tcr(mem)?;

        if self.pdc.reg_tncr != 0 {
            self.pdc.rollover_tx();
            self.dma_tx_do_tcr(mem)?;
        }

        self.send_frame_stop()?;

        self.reg_sr |= SR_ENDTX | SR_TXBUFE | SR_TXCOMP | SR_TXRDY;
        Ok(())
    }

    fn dma_tx_stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iox::FrameDecoder;
    use crate::memory::SDRAM_BASE;
    use crate::pdc::{PDC_PTCR, PDC_TCR, PDC_TPR, PTCR_TXTEN};
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SOCKET_ID: AtomicUsize = AtomicUsize::new(0);

    fn socket_path() -> PathBuf {
        let id = SOCKET_ID.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("satwired_twi_{}_{}", std::process::id(), id))
    }

    fn setup() -> (Twi, AddressSpace, SocPolicy) {
        (
            Twi::new(None).unwrap(),
            AddressSpace::new(false),
            SocPolicy::default(),
        )
    }

    fn master(twi: &mut Twi, mem: &mut AddressSpace, policy: &SocPolicy) {
        twi.write(TWI_CR, CR_MSEN, mem, 0, policy).unwrap();
    }

    fn drain_frames(client: &mut UnixStream, expect: usize) -> Vec<IoxFrame> {
        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 1024];
        while frames.len() < expect {
            let n = client.read(&mut buf).unwrap();
            frames.extend(dec.push(&buf[..n]));
        }
        frames
    }

    #[test]
    fn test_thr_writes_bundle_into_one_burst() {
        let path = socket_path();
        let mut twi = Twi::new(Some(&path)).unwrap();
        let mut mem = AddressSpace::new(false);
        let policy = SocPolicy::default();

        let mut client = UnixStream::connect(&path).unwrap();
        twi.poll(0, &mut mem).unwrap();

        twi.set_master_clock(100_000_000);
        twi.write(TWI_CWGR, 0x0000_7575, &mut mem, 0, &policy).unwrap();
        twi.write(TWI_MMR, 0x50 << 16, &mut mem, 0, &policy).unwrap();
        master(&mut twi, &mut mem, &policy);

        // three writes in quick succession: the debounce timer is re-armed
        // each time, so a single transaction results
        twi.write(TWI_THR, 0x11, &mut mem, 0, &policy).unwrap();
        twi.write(TWI_THR, 0x22, &mut mem, 100, &policy).unwrap();
        twi.write(TWI_THR, 0x33, &mut mem, 200, &policy).unwrap();

        // well past two TWI clock ticks
        twi.poll(1_000_000_000, &mut mem).unwrap();

        let frames = drain_frames(&mut client, 3);
        assert_eq!(frames[0].id, CID_CTRL_START);
        assert_eq!(frames[0].payload[0], 0x50, "device address, write");
        assert_eq!(frames[1].id, CID_DATA_OUT);
        assert_eq!(frames[1].payload, vec![0x11, 0x22, 0x33]);
        assert_eq!(frames[2].id, CID_CTRL_STOP);
    }

    #[test]
    fn test_start_frame_encodes_read_flag_and_internal_address() {
        let path = socket_path();
        let mut twi = Twi::new(Some(&path)).unwrap();
        let mut mem = AddressSpace::new(false);
        let policy = SocPolicy::default();

        let mut client = UnixStream::connect(&path).unwrap();
        twi.poll(0, &mut mem).unwrap();

        master(&mut twi, &mut mem, &policy);
        // DADR 0x68, 2 internal address bytes, master read
        twi.write(TWI_MMR, (0x68 << 16) | (2 << 8) | MMR_MREAD, &mut mem, 0, &policy)
            .unwrap();
        twi.write(TWI_IADR, 0xBEEF, &mut mem, 0, &policy).unwrap();
        twi.write(TWI_CR, CR_START, &mut mem, 0, &policy).unwrap();

        let frames = drain_frames(&mut client, 1);
        assert_eq!(frames[0].id, CID_CTRL_START);
        assert_eq!(frames[0].payload, vec![0x68 | 0x80, 2, 0xEF, 0xBE, 0x00]);
    }

    #[test]
    fn test_receive_path_mirrors_usart() {
        let (mut twi, mut mem, policy) = setup();
        master(&mut twi, &mut mem, &policy);

        let frame = IoxFrame::new(0, CAT_DATA, CID_DATA_IN, &[0xAA, 0xBB]);
        twi.inject_frame(&frame, &mut mem).unwrap();

        assert_eq!(twi.read(TWI_SR).unwrap() & SR_RXRDY, SR_RXRDY);
        assert_eq!(twi.read(TWI_RHR).unwrap(), 0xAA);
        assert_eq!(twi.read(TWI_RHR).unwrap(), 0xBB);
        assert_eq!(twi.read(TWI_SR).unwrap() & SR_RXRDY, 0);
    }

    #[test]
    fn test_dma_tx_emits_synchronously() {
        let path = socket_path();
        let mut twi = Twi::new(Some(&path)).unwrap();
        let mut mem = AddressSpace::new(false);
        let policy = SocPolicy::default();

        let mut client = UnixStream::connect(&path).unwrap();
        twi.poll(0, &mut mem).unwrap();
        master(&mut twi, &mut mem, &policy);

        mem.dma_write(SDRAM_BASE, &[1, 2, 3, 4]).unwrap();
        twi.write(PDC_TPR, SDRAM_BASE as u32, &mut mem, 0, &policy).unwrap();
        twi.write(PDC_PTCR, PTCR_TXTEN, &mut mem, 0, &policy).unwrap();
        twi.write(PDC_TCR, 4, &mut mem, 0, &policy).unwrap();

        let frames = drain_frames(&mut client, 3);
        assert_eq!(frames[0].id, CID_CTRL_START);
        assert_eq!(frames[1].payload, vec![1, 2, 3, 4]);
        assert_eq!(frames[2].id, CID_CTRL_STOP);

        let sr = twi.read(TWI_SR).unwrap();
        assert_eq!(sr & (SR_ENDTX | SR_TXBUFE | SR_TXCOMP), SR_ENDTX | SR_TXBUFE | SR_TXCOMP);
    }

    #[test]
    fn test_mode_lattice_gates_on_txcomp() {
        let (mut twi, mut mem, policy) = setup();
        master(&mut twi, &mut mem, &policy);

        // TXCOMP is set at reset, so master -> slave is legal
        twi.write(TWI_CR, CR_SVEN, &mut mem, 0, &policy).unwrap();
        // and back
        twi.write(TWI_CR, CR_MSEN, &mut mem, 0, &policy).unwrap();

        // clear TXCOMP by starting a (never flushed) write transaction
        twi.write(TWI_SR, 0, &mut mem, 0, &policy).unwrap_err(); // SR is read-only
        twi.reg_sr &= !SR_TXCOMP;
        assert!(twi.write(TWI_CR, CR_SVEN, &mut mem, 0, &policy).is_err());
    }

    #[test]
    fn test_slave_transmission_is_unsupported() {
        let (mut twi, mut mem, policy) = setup();
        twi.write(TWI_CR, CR_SVEN, &mut mem, 0, &policy).unwrap();
        assert!(twi.write(TWI_THR, 0x42, &mut mem, 0, &policy).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let (mut twi, mut mem, _policy) = setup();
        twi.reg_sr &= !SR_TXCOMP;

        twi.inject_frame(&IoxFrame::new(0, CAT_FAULT, CID_FAULT_NACK, &[]), &mut mem)
            .unwrap();
        let sr = twi.read(TWI_SR).unwrap();
        assert_eq!(sr & SR_NACK, SR_NACK);
        assert_eq!(sr & SR_TXCOMP, SR_TXCOMP, "NACK completes the transfer");

        // SR read cleared NACK
        assert_eq!(twi.read(TWI_SR).unwrap() & SR_NACK, 0);
    }

    #[test]
    fn test_clock_derivation_from_cwgr() {
        let (mut twi, mut mem, policy) = setup();
        twi.set_master_clock(100_000_000);
        // CLDIV=CHDIV=0x75, CKDIV=0 -> 100 MHz / 242
        twi.write(TWI_CWGR, 0x0000_7575, &mut mem, 0, &policy).unwrap();
        assert_eq!(twi.clock, 100_000_000 / 242);
    }
}
