// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Real-Time Timer: a 32-bit counter clocked from the slow oscillator
//! through a 16-bit prescaler, with an alarm comparator.

use crate::clock::PeriodicTimer;
use crate::peripherals::pmc::SLOW_CLOCK;
use crate::{SocError, SocResult};
use serde::Serialize;

const DEVICE: &str = "at91.rtt";

const RTT_MR: u64 = 0x00;
const RTT_AR: u64 = 0x04;
const RTT_VR: u64 = 0x08;
const RTT_SR: u64 = 0x0C;

const MR_RTPRES: u32 = 0xFFFF;
const MR_RTTRST: u32 = 1 << 18;

const SR_ALMS: u32 = 1 << 0;
const SR_RTTINC: u32 = 1 << 1;

#[derive(Debug, Serialize)]
pub struct Rtt {
    reg_mr: u32,
    reg_ar: u32,
    reg_vr: u32,
    reg_sr: u32,

    #[serde(skip)]
    timer: PeriodicTimer,
}

impl Default for Rtt {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtt {
    pub fn new() -> Self {
        let mut rtt = Self {
            reg_mr: 0,
            reg_ar: 0,
            reg_vr: 0,
            reg_sr: 0,
            timer: PeriodicTimer::new(),
        };
        rtt.reset_registers(0);
        rtt
    }

    pub fn reset_registers(&mut self, now_ns: u64) {
        self.reg_mr = 0x8000;
        self.reg_ar = 0xFFFF_FFFF;
        self.reg_vr = 0;
        self.reg_sr = 0;
        self.restart_timer(now_ns);
    }

    fn restart_timer(&mut self, now_ns: u64) {
        let rtpres = match self.reg_mr & MR_RTPRES {
            0 => 0x8000,
            v => v as u64,
        };
        self.timer.set_freq(SLOW_CLOCK / rtpres);
        self.timer.set_limit(1, true);
        self.timer.run(now_ns, false);
    }

    fn irq_mask(&self) -> u32 {
        (self.reg_mr >> 16) & 0x03
    }

    /// SYSC interrupt line.
    pub fn irq_line(&self) -> bool {
        self.irq_mask() & self.reg_sr != 0
    }

    pub fn poll(&mut self, now_ns: u64) {
        let fires = self.timer.poll(now_ns);
        for _ in 0..fires {
            self.reg_vr = self.reg_vr.wrapping_add(1);
            self.reg_sr |= SR_RTTINC;
            if self.reg_vr == self.reg_ar.wrapping_add(1) {
                self.reg_sr |= SR_ALMS;
            }
        }
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            RTT_MR => Ok(self.reg_mr),
            RTT_AR => Ok(self.reg_ar),
            RTT_VR => Ok(self.reg_vr),
            RTT_SR => {
                let sr = self.reg_sr;
                self.reg_sr = 0;
                Ok(sr)
            }
            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32, now_ns: u64) -> SocResult<()> {
        match offset {
            RTT_MR => {
                self.reg_mr = value;
                if value & MR_RTTRST != 0 {
                    self.reg_vr = 0;
                    self.restart_timer(now_ns);
                }
                Ok(())
            }
            RTT_AR => {
                self.reg_ar = value;
                Ok(())
            }
            _ => Err(SocError::illegal_write(DEVICE, offset, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_default_rate_is_one_hertz() {
        let mut rtt = Rtt::new();
        rtt.poll(SEC - 1);
        assert_eq!(rtt.read(RTT_VR).unwrap(), 0);
        rtt.poll(SEC);
        assert_eq!(rtt.read(RTT_VR).unwrap(), 1);
        assert_eq!(rtt.read(RTT_SR).unwrap() & SR_RTTINC, SR_RTTINC);
    }

    #[test]
    fn test_alarm_fires_past_ar_plus_one() {
        let mut rtt = Rtt::new();
        rtt.write(RTT_AR, 2, 0).unwrap();
        rtt.write(RTT_MR, 0x8000 | (1 << 16), 0).unwrap(); // ALMIEN

        rtt.poll(2 * SEC);
        assert_eq!(rtt.read(RTT_SR).unwrap() & SR_ALMS, 0);

        rtt.poll(3 * SEC); // VR reaches AR + 1
        assert!(rtt.irq_line());
        let sr = rtt.read(RTT_SR).unwrap();
        assert_eq!(sr & SR_ALMS, SR_ALMS);

        // SR read cleared everything
        assert!(!rtt.irq_line());
        assert_eq!(rtt.read(RTT_SR).unwrap(), 0);
    }

    #[test]
    fn test_rttrst_restarts_counter_and_prescaler() {
        let mut rtt = Rtt::new();
        rtt.poll(5 * SEC);
        assert_eq!(rtt.read(RTT_VR).unwrap(), 5);

        // prescaler 0x4000 -> 2 Hz, counter restarts at zero
        rtt.write(RTT_MR, 0x4000 | MR_RTTRST, 5 * SEC).unwrap();
        assert_eq!(rtt.read(RTT_VR).unwrap(), 0);

        rtt.poll(6 * SEC);
        assert_eq!(rtt.read(RTT_VR).unwrap(), 2);
    }

    #[test]
    fn test_illegal_offsets() {
        let mut rtt = Rtt::new();
        assert!(rtt.read(0x10).is_err());
        assert!(rtt.write(RTT_VR, 0, 0).is_err());
        assert!(rtt.write(RTT_SR, 0, 0).is_err());
    }
}
