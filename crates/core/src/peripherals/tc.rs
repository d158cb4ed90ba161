// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Timer/Counter block: three 16-bit channels with per-channel clock
//! selection, capture and waveform modes. External clock inputs (XC0..2)
//! and burst gating are not modeled.

use crate::clock::PeriodicTimer;
use crate::peripherals::pmc::SLOW_CLOCK;
use crate::{SocError, SocResult};
use serde::Serialize;

pub const TC_NUM_CHANNELS: usize = 3;

const TC_CCR: u64 = 0x00;
const TC_CMR: u64 = 0x04;
const TC_CV: u64 = 0x10;
const TC_RA: u64 = 0x14;
const TC_RB: u64 = 0x18;
const TC_RC: u64 = 0x1C;
const TC_SR: u64 = 0x20;
const TC_IER: u64 = 0x24;
const TC_IDR: u64 = 0x28;
const TC_IMR: u64 = 0x2C;

const TCC0_START: u64 = 0x00;
const TCC0_END: u64 = 0x2C;
const TCC1_START: u64 = 0x40;
const TCC1_END: u64 = 0x6C;
const TCC2_START: u64 = 0x80;
const TCC2_END: u64 = 0xAC;

const TC_BCR: u64 = 0xC0;
const TC_BMR: u64 = 0xC4;

const BCR_SYNC: u32 = 1 << 0;

const CCR_CLKEN: u32 = 1 << 0;
const CCR_CLKDIS: u32 = 1 << 1;
const CCR_SWTRG: u32 = 1 << 2;

const CMR_WAVE: u32 = 1 << 15;
const CMR_CPCSTOP: u32 = 1 << 6;
const CMR_CPCDIS: u32 = 1 << 7;
const CMR_CPCTRG: u32 = 1 << 14;

const SR_COVFS: u32 = 1 << 0;
const SR_LOVRS: u32 = 1 << 1;
const SR_CPAS: u32 = 1 << 2;
const SR_CPBS: u32 = 1 << 3;
const SR_CPCS: u32 = 1 << 4;
const SR_LDRAS: u32 = 1 << 5;
const SR_LDRBS: u32 = 1 << 6;
const SR_ETRGS: u32 = 1 << 7;
const SR_CLKSTA: u32 = 1 << 16;

fn cmr_tcclks(cmr: u32) -> u32 {
    cmr & 0x07
}

fn cmr_burst(cmr: u32) -> u32 {
    (cmr >> 4) & 0x03
}

fn cmr_wavsel(cmr: u32) -> u32 {
    (cmr >> 13) & 0x03
}

#[derive(Debug, Serialize)]
struct TcChannel {
    reg_cmr: u32,
    reg_cv: u32,
    reg_ra: u32,
    reg_rb: u32,
    reg_rc: u32,
    reg_sr: u32,
    reg_imr: u32,

    cstep: i32,
    clk: u64,
    #[serde(skip)]
    timer: PeriodicTimer,
}

impl TcChannel {
    fn new() -> Self {
        Self {
            reg_cmr: 0,
            reg_cv: 0,
            reg_ra: 0,
            reg_rb: 0,
            reg_rc: 0,
            reg_sr: 0,
            reg_imr: 0,
            cstep: 1,
            clk: 0,
            timer: PeriodicTimer::new(),
        }
    }

    fn reset(&mut self) {
        self.reg_cmr = 0;
        self.reg_cv = 0;
        self.reg_ra = 0;
        self.reg_rb = 0;
        self.reg_rc = 0;
        self.reg_sr = 0;
        self.reg_imr = 0;
        self.cstep = 1;
        self.timer.stop();
    }

    fn irq_line(&self) -> bool {
        self.reg_sr & self.reg_imr & 0xFF != 0
    }

    fn update_clock(&mut self, mclk: u64) {
        self.clk = match cmr_tcclks(self.reg_cmr) {
            0 => mclk / 2,
            1 => mclk / 8,
            2 => mclk / 32,
            3 => mclk / 128,
            4 => SLOW_CLOCK,
            // XC inputs rejected at CMR write time
            _ => 0,
        };

        if self.clk != 0 {
            self.timer.set_freq(self.clk);
        }
    }

    fn clk_start(&mut self, now_ns: u64) {
        if self.reg_sr & SR_CLKSTA == 0 {
            return;
        }
        self.timer.set_freq(self.clk);
        self.timer.set_limit(1, false);
        self.timer.run(now_ns, false);
    }

    fn clk_stop(&mut self) {
        self.timer.stop();
    }

    fn trigger(&mut self, now_ns: u64) {
        if self.reg_cmr & CMR_WAVE != 0 {
            if cmr_wavsel(self.reg_cmr) & 0x01 == 0 {
                // sawtooth restarts from zero
                self.reg_cv = 0;
            } else {
                // triangular reverses direction
                self.cstep = -self.cstep;
            }
        } else {
            self.reg_cv = 0;
        }

        self.clk_start(now_ns);
    }

    fn tick(&mut self) {
        if self.reg_cv == 0xFFFF {
            self.reg_sr |= SR_COVFS;
        }

        if self.reg_cmr & CMR_WAVE != 0 {
            let cmp = if cmr_wavsel(self.reg_cmr) & 0x02 != 0 {
                self.reg_rc
            } else {
                0xFFFF
            };

            if cmr_wavsel(self.reg_cmr) & 0x01 == 0 {
                // sawtooth
                if self.reg_cv == cmp {
                    self.reg_cv = 0;
                } else {
                    self.reg_cv = (self.reg_cv + 1) & 0xFFFF;
                }
            } else {
                // triangular
                if self.reg_cv == cmp {
                    self.cstep = -1;
                } else if self.reg_cv == 0 {
                    self.cstep = 1;
                }
                self.reg_cv = (self.reg_cv as i32 + self.cstep) as u32 & 0xFFFF;
            }

            if self.reg_cv == self.reg_ra {
                self.reg_sr |= SR_CPAS;
            }
            if self.reg_cv == self.reg_rb {
                self.reg_sr |= SR_CPBS;
            }
            if self.reg_cv == self.reg_rc {
                self.reg_sr |= SR_CPCS;

                if self.reg_cmr & CMR_CPCDIS != 0 {
                    self.reg_sr &= !SR_CLKSTA;
                    self.clk_stop();
                }
                if self.reg_cmr & CMR_CPCSTOP != 0 {
                    self.clk_stop();
                }
            }
        } else {
            self.reg_cv = (self.reg_cv + 1) & 0xFFFF;

            if self.reg_cv == self.reg_rc {
                self.reg_sr |= SR_CPCS;
                if self.reg_cmr & CMR_CPCTRG != 0 {
                    self.reg_cv = 0;
                }
            }
        }
    }

    fn poll(&mut self, now_ns: u64) {
        let fires = self.timer.poll(now_ns);
        for _ in 0..fires {
            // a tick may stop the clock (CPCDIS/CPCSTOP)
            if !self.timer.is_running() {
                break;
            }
            self.tick();
        }
    }

    fn read(&mut self, device: &'static str, offset: u64) -> SocResult<u32> {
        match offset {
            TC_CMR => Ok(self.reg_cmr),
            TC_CV => Ok(self.reg_cv),
            TC_RA => Ok(self.reg_ra),
            TC_RB => Ok(self.reg_rb),
            TC_RC => Ok(self.reg_rc),
            TC_SR => {
                let sr = self.reg_sr;
                self.reg_sr &= !(SR_COVFS
                    | SR_LOVRS
                    | SR_CPAS
                    | SR_CPBS
                    | SR_CPCS
                    | SR_LDRAS
                    | SR_LDRBS
                    | SR_ETRGS);
                Ok(sr)
            }
            TC_IMR => Ok(self.reg_imr),
            _ => Err(SocError::illegal_read(device, offset)),
        }
    }

    fn write(
        &mut self,
        device: &'static str,
        offset: u64,
        value: u32,
        mclk: u64,
        now_ns: u64,
    ) -> SocResult<()> {
        match offset {
            TC_CCR => {
                if value & CCR_CLKEN != 0 && value & CCR_CLKDIS == 0 {
                    self.reg_sr |= SR_CLKSTA;
                }
                if value & CCR_CLKDIS != 0 {
                    self.reg_sr &= !SR_CLKSTA;
                    self.clk_stop();
                }
                if value & CCR_SWTRG != 0 {
                    self.trigger(now_ns);
                }
                Ok(())
            }
            TC_CMR => {
                if cmr_burst(value) != 0 {
                    return Err(SocError::Unsupported {
                        device,
                        feature: "TC_CMR BURST gating".to_string(),
                    });
                }
                if cmr_tcclks(value) >= 5 {
                    return Err(SocError::Unsupported {
                        device,
                        feature: "XC0/XC1/XC2 clock inputs".to_string(),
                    });
                }
                self.reg_cmr = value;
                self.update_clock(mclk);
                Ok(())
            }
            TC_RA => {
                if self.reg_cmr & CMR_WAVE == 0 {
                    return Err(SocError::access(device, offset, "write to TC_RA while WAVE = 0"));
                }
                self.reg_ra = value;
                Ok(())
            }
            TC_RB => {
                if self.reg_cmr & CMR_WAVE == 0 {
                    return Err(SocError::access(device, offset, "write to TC_RB while WAVE = 0"));
                }
                self.reg_rb = value;
                Ok(())
            }
            TC_RC => {
                if value > 0xFFFF {
                    tracing::warn!(
                        "{}: write to TC_RC with value {:#x} > 0xffff, truncating",
                        device,
                        value
                    );
                }
                self.reg_rc = value & 0xFFFF;
                Ok(())
            }
            TC_IER => {
                self.reg_imr |= value;
                Ok(())
            }
            TC_IDR => {
                self.reg_imr &= !value;
                Ok(())
            }
            _ => Err(SocError::illegal_write(device, offset, value)),
        }
    }
}

/// One TC block (the SAM9G20 has two, covering channels 0-2 and 3-5).
#[derive(Debug, Serialize)]
pub struct TcBlock {
    device: &'static str,
    reg_bmr: u32,
    mclk: u64,
    chan: [TcChannel; TC_NUM_CHANNELS],
}

impl TcBlock {
    pub fn new(device: &'static str) -> Self {
        Self {
            device,
            reg_bmr: 0,
            mclk: 0,
            chan: [TcChannel::new(), TcChannel::new(), TcChannel::new()],
        }
    }

    pub fn reset_registers(&mut self) {
        self.reg_bmr = 0;
        for chan in &mut self.chan {
            chan.reset();
        }
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
        for chan in &mut self.chan {
            chan.update_clock(mclk);
        }
    }

    /// Per-channel AIC line.
    pub fn irq_line(&self, channel: usize) -> bool {
        self.chan[channel].irq_line()
    }

    pub fn poll(&mut self, now_ns: u64) {
        for chan in &mut self.chan {
            chan.poll(now_ns);
        }
    }

    fn channel_for(offset: u64) -> Option<(usize, u64)> {
        match offset {
            TCC0_START..=TCC0_END => Some((0, offset)),
            TCC1_START..=TCC1_END => Some((1, offset - TCC1_START)),
            TCC2_START..=TCC2_END => Some((2, offset - TCC2_START)),
            _ => None,
        }
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        if let Some((idx, chan_offset)) = Self::channel_for(offset) {
            return self.chan[idx].read(self.device, chan_offset);
        }
        match offset {
            TC_BMR => Ok(self.reg_bmr),
            _ => Err(SocError::illegal_read(self.device, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32, now_ns: u64) -> SocResult<()> {
        if let Some((idx, chan_offset)) = Self::channel_for(offset) {
            let mclk = self.mclk;
            return self.chan[idx].write(self.device, chan_offset, value, mclk, now_ns);
        }
        match offset {
            TC_BCR => {
                if value & BCR_SYNC != 0 {
                    for chan in &mut self.chan {
                        chan.trigger(now_ns);
                    }
                }
                Ok(())
            }
            TC_BMR => {
                self.reg_bmr = value;
                Ok(())
            }
            _ => Err(SocError::illegal_write(self.device, offset, value)),
        }
    }
}
