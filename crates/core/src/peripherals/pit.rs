// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Periodic Interval Timer: a 20-bit counter at MCK/16 with a 12-bit
//! overflow counter, read-and-clear through PIVR.

use crate::clock::PeriodicTimer;
use crate::{SocError, SocResult};
use serde::Serialize;

const DEVICE: &str = "at91.pit";

const PIT_MR: u64 = 0x00;
const PIT_SR: u64 = 0x04;
const PIT_PIVR: u64 = 0x08;
const PIT_PIIR: u64 = 0x0C;

const MR_PIV: u32 = 0x000F_FFFF;
const MR_PITEN: u32 = 1 << 24;
const MR_PITIEN: u32 = 1 << 25;

const SR_PITS: u32 = 0x01;

#[derive(Debug, Serialize)]
pub struct Pit {
    reg_mr: u32,
    reg_sr: u32,
    picnt: u32,

    mclk: u64,
    #[serde(skip)]
    timer: PeriodicTimer,
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl Pit {
    pub fn new() -> Self {
        let mut pit = Self {
            reg_mr: 0,
            reg_sr: 0,
            picnt: 0,
            mclk: 0,
            timer: PeriodicTimer::new(),
        };
        pit.reset_registers();
        pit
    }

    pub fn reset_registers(&mut self) {
        self.reg_mr = 0xF_FFFF;
        self.reg_sr = 0;
        self.picnt = 0;
        self.timer.stop();
    }

    pub fn set_master_clock(&mut self, mclk: u64) {
        self.mclk = mclk;
        if self.timer.is_running() {
            self.timer.set_freq(self.mclk / 16);
        }
    }

    /// SYSC interrupt line.
    pub fn irq_line(&self) -> bool {
        self.reg_mr & MR_PITIEN != 0 && self.reg_sr & SR_PITS != 0
    }

    fn period(&self) -> u64 {
        1 + (self.reg_mr & MR_PIV) as u64
    }

    /// Elapsed ticks within the current period (CPIV).
    fn cpiv(&self) -> u32 {
        if !self.timer.is_running() {
            return 0;
        }
        (self.period().wrapping_sub(self.timer.count()) & 0xF_FFFF) as u32
    }

    /// Advance the counter; each full period sets PITS and bumps PICNT.
    pub fn poll(&mut self, now_ns: u64) {
        let mut fires = self.timer.poll(now_ns);
        if fires == 0 {
            return;
        }

        // a cleared PITEN takes effect at the first period boundary
        if self.reg_mr & MR_PITEN == 0 {
            fires = 1;
            self.timer.stop();
        }

        self.reg_sr |= SR_PITS;
        self.picnt = (self.picnt + fires as u32) & 0xFFF;
    }

    pub fn read(&mut self, offset: u64) -> SocResult<u32> {
        match offset {
            PIT_MR => Ok(self.reg_mr),
            PIT_SR => Ok(self.reg_sr),
            PIT_PIVR => {
                let value = (self.picnt << 20) | self.cpiv();
                self.picnt = 0;
                self.reg_sr &= !SR_PITS;
                Ok(value)
            }
            PIT_PIIR => Ok((self.picnt << 20) | self.cpiv()),
            _ => Err(SocError::illegal_read(DEVICE, offset)),
        }
    }

    pub fn write(&mut self, offset: u64, value: u32, now_ns: u64) -> SocResult<()> {
        match offset {
            PIT_MR => {
                self.reg_mr = value;
                if value & MR_PITEN != 0 {
                    self.timer.set_freq(self.mclk / 16);
                    self.timer.set_limit(self.period(), true);
                    self.timer.run(now_ns, false);
                }
                // with PITEN cleared the timer keeps running until the
                // counter next reaches zero
                Ok(())
            }
            _ => Err(SocError::illegal_write(DEVICE, offset, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MCLK: u64 = 16_000_000; // PIT base = 1 MHz

    fn running_pit(piv: u32) -> Pit {
        let mut pit = Pit::new();
        pit.set_master_clock(MCLK);
        pit.write(PIT_MR, piv | MR_PITEN | MR_PITIEN, 0).unwrap();
        pit
    }

    #[test]
    fn test_period_elapse_sets_pits_and_picnt() {
        let mut pit = running_pit(0xFF);

        // one period = 256 ticks at 1 MHz
        pit.poll(255_000);
        assert_eq!(pit.read(PIT_SR).unwrap(), 0);

        pit.poll(256_000);
        assert_eq!(pit.read(PIT_SR).unwrap(), SR_PITS);
        assert!(pit.irq_line());
    }

    #[test]
    fn test_pivr_read_returns_and_clears() {
        let mut pit = running_pit(0xFF);
        pit.poll(256_000);

        let pivr = pit.read(PIT_PIVR).unwrap();
        assert_eq!(pivr >> 20, 1, "PICNT");
        assert_eq!(pivr & 0xF_FFFF, 0, "CPIV at period boundary");

        assert_eq!(pit.read(PIT_SR).unwrap(), 0);
        assert!(!pit.irq_line());
        assert_eq!(pit.read(PIT_PIVR).unwrap() >> 20, 0);
    }

    #[test]
    fn test_piir_read_is_nondestructive() {
        let mut pit = running_pit(0xFF);
        pit.poll(256_000);

        let piir = pit.read(PIT_PIIR).unwrap();
        assert_eq!(piir >> 20, 1);
        assert_eq!(pit.read(PIT_PIIR).unwrap() >> 20, 1);
        assert_eq!(pit.read(PIT_SR).unwrap(), SR_PITS);
    }

    #[test]
    fn test_cpiv_tracks_mid_period() {
        let mut pit = running_pit(0xFF);
        pit.poll(100_000); // 100 ticks in
        assert_eq!(pit.read(PIT_PIIR).unwrap() & 0xF_FFFF, 100);
    }

    #[test]
    fn test_disable_stops_at_period_boundary() {
        let mut pit = running_pit(0xFF);

        // clear PITEN mid-period; the counter finishes its period
        pit.write(PIT_MR, 0xFF | MR_PITIEN, 100_000).unwrap();
        pit.poll(256_000);
        assert_eq!(pit.read(PIT_SR).unwrap(), SR_PITS);

        // then stops: no further periods accumulate
        pit.read(PIT_PIVR).unwrap();
        pit.poll(1_000_000);
        assert_eq!(pit.read(PIT_SR).unwrap(), 0);
    }

    #[test]
    fn test_multiple_periods_accumulate_picnt() {
        let mut pit = running_pit(0xFF);
        pit.poll(4 * 256_000);
        assert_eq!(pit.read(PIT_PIVR).unwrap() >> 20, 4);
    }
}
