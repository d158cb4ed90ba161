// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Peripheral DMA Controller (PDC) register block, embedded by USART, SPI,
//! TWI, and MCI. Each channel carries a current and a next pointer/count
//! pair per direction; the host peripheral supplies the transfer callbacks
//! and its status-register flag layout through [`PdcClient`].

use crate::memory::AddressSpace;
use crate::{SocError, SocResult};
use serde::Serialize;

pub const PDC_START: u64 = 0x100;
pub const PDC_END: u64 = 0x124;

pub const PDC_RPR: u64 = 0x100;
pub const PDC_RCR: u64 = 0x104;
pub const PDC_TPR: u64 = 0x108;
pub const PDC_TCR: u64 = 0x10C;
pub const PDC_RNPR: u64 = 0x110;
pub const PDC_RNCR: u64 = 0x114;
pub const PDC_TNPR: u64 = 0x118;
pub const PDC_TNCR: u64 = 0x11C;
pub const PDC_PTCR: u64 = 0x120;
pub const PDC_PTSR: u64 = 0x124;

pub const PTCR_RXTEN: u32 = 1 << 0;
pub const PTCR_RXTDIS: u32 = 1 << 1;
pub const PTCR_TXTEN: u32 = 1 << 8;
pub const PTCR_TXTDIS: u32 = 1 << 9;

pub const PTSR_RXTEN: u32 = 1 << 0;
pub const PTSR_TXTEN: u32 = 1 << 8;

/// Host-peripheral status bits driven by the PDC flag algebra.
#[derive(Debug, Clone, Copy)]
pub struct PdcFlags {
    pub endrx: u32,
    pub endtx: u32,
    pub rxbuff: u32,
    pub txbufe: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdcAction {
    None,
    /// PTCR was written; both channel states may have changed.
    State,
    StartRx,
    StopRx,
    StartTx,
    StopTx,
}

#[derive(Debug, Default, Serialize)]
pub struct Pdc {
    pub reg_ptsr: u32,

    pub reg_rpr: u32,
    pub reg_rnpr: u32,
    pub reg_tpr: u32,
    pub reg_tnpr: u32,

    pub reg_rcr: u16,
    pub reg_rncr: u16,
    pub reg_tcr: u16,
    pub reg_tncr: u16,
}

impl Pdc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(offset: u64) -> bool {
        (PDC_START..=PDC_END).contains(&offset)
    }

    pub fn reset_registers(&mut self) {
        *self = Self::default();
    }

    pub fn rx_enabled(&self) -> bool {
        self.reg_ptsr & PTSR_RXTEN != 0
    }

    pub fn tx_enabled(&self) -> bool {
        self.reg_ptsr & PTSR_TXTEN != 0
    }

    /// Roll the current RX pair over from the next pair. Returns true if a
    /// rollover happened.
    pub fn rollover_rx(&mut self) -> bool {
        if self.reg_rcr == 0 && self.reg_rncr != 0 {
            self.reg_rpr = self.reg_rnpr;
            self.reg_rnpr = 0;
            self.reg_rcr = self.reg_rncr;
            self.reg_rncr = 0;
            true
        } else {
            false
        }
    }

    pub fn rollover_tx(&mut self) -> bool {
        if self.reg_tcr == 0 && self.reg_tncr != 0 {
            self.reg_tpr = self.reg_tnpr;
            self.reg_tnpr = 0;
            self.reg_tcr = self.reg_tncr;
            self.reg_tncr = 0;
            true
        } else {
            false
        }
    }

    pub fn get_register(&self, device: &'static str, offset: u64) -> SocResult<u32> {
        match offset {
            PDC_RPR => Ok(self.reg_rpr),
            PDC_RCR => Ok(self.reg_rcr as u32),
            PDC_TPR => Ok(self.reg_tpr),
            PDC_TCR => Ok(self.reg_tcr as u32),
            PDC_RNPR => Ok(self.reg_rnpr),
            PDC_RNCR => Ok(self.reg_rncr as u32),
            PDC_TNPR => Ok(self.reg_tnpr),
            PDC_TNCR => Ok(self.reg_tncr as u32),
            PDC_PTSR => Ok(self.reg_ptsr),
            _ => Err(SocError::illegal_read(device, offset)),
        }
    }

    pub fn set_register(
        &mut self,
        device: &'static str,
        offset: u64,
        value: u32,
    ) -> SocResult<PdcAction> {
        match offset {
            PDC_RPR => {
                self.reg_rpr = value;
                Ok(PdcAction::None)
            }
            PDC_RCR => {
                self.reg_rcr = value as u16;
                if self.rx_enabled() {
                    Ok(if value != 0 {
                        PdcAction::StartRx
                    } else {
                        PdcAction::StopRx
                    })
                } else {
                    Ok(PdcAction::None)
                }
            }
            PDC_TPR => {
                self.reg_tpr = value;
                Ok(PdcAction::None)
            }
            PDC_TCR => {
                self.reg_tcr = value as u16;
                if self.tx_enabled() {
                    Ok(if value != 0 {
                        PdcAction::StartTx
                    } else {
                        PdcAction::StopTx
                    })
                } else {
                    Ok(PdcAction::None)
                }
            }
            PDC_RNPR => {
                self.reg_rnpr = value;
                Ok(PdcAction::None)
            }
            PDC_RNCR => {
                self.reg_rncr = value as u16;
                Ok(PdcAction::None)
            }
            PDC_TNPR => {
                self.reg_tnpr = value;
                Ok(PdcAction::None)
            }
            PDC_TNCR => {
                self.reg_tncr = value as u16;
                Ok(PdcAction::None)
            }
            PDC_PTCR => {
                if value & PTCR_RXTEN != 0 && value & PTCR_RXTDIS == 0 {
                    self.reg_ptsr |= PTSR_RXTEN;
                }
                if value & PTCR_RXTDIS != 0 {
                    self.reg_ptsr &= !PTSR_RXTEN;
                }
                if value & PTCR_TXTEN != 0 && value & PTCR_TXTDIS == 0 {
                    self.reg_ptsr |= PTSR_TXTEN;
                }
                if value & PTCR_TXTDIS != 0 {
                    self.reg_ptsr &= !PTSR_TXTEN;
                }
                Ok(PdcAction::State)
            }
            _ => Err(SocError::illegal_write(device, offset, value)),
        }
    }

    /// PTCR handling for half-duplex peripherals: the pointer/count pairs
    /// are shared, and RX/TX channel enables are mutually exclusive.
    pub fn set_register_half_duplex(
        &mut self,
        device: &'static str,
        offset: u64,
        value: u32,
    ) -> SocResult<PdcAction> {
        match offset {
            PDC_RPR | PDC_TPR => {
                self.reg_rpr = value;
                self.reg_tpr = value;
                Ok(PdcAction::None)
            }
            PDC_RCR | PDC_TCR => {
                self.reg_rcr = value as u16;
                self.reg_tcr = value as u16;
                if self.tx_enabled() {
                    Ok(if value != 0 {
                        PdcAction::StartTx
                    } else {
                        PdcAction::StopTx
                    })
                } else if self.rx_enabled() {
                    Ok(if value != 0 {
                        PdcAction::StartRx
                    } else {
                        PdcAction::StopRx
                    })
                } else {
                    Ok(PdcAction::None)
                }
            }
            PDC_RNPR | PDC_TNPR => {
                self.reg_rnpr = value;
                self.reg_tnpr = value;
                Ok(PdcAction::None)
            }
            PDC_RNCR | PDC_TNCR => {
                self.reg_rncr = value as u16;
                self.reg_tncr = value as u16;
                Ok(PdcAction::None)
            }
            PDC_PTCR => {
                if value & PTCR_RXTEN != 0 && value & PTCR_TXTEN != 0 {
                    return Err(SocError::access(
                        device,
                        offset,
                        "cannot set both RXTEN and TXTEN on half-duplex device",
                    ));
                }
                if value & PTCR_RXTEN != 0 && value & PTCR_RXTDIS == 0 {
                    // enabling the receiver disables transmitter requests
                    self.reg_ptsr = (self.reg_ptsr | PTSR_RXTEN) & !PTSR_TXTEN;
                }
                if value & PTCR_RXTDIS != 0 {
                    self.reg_ptsr &= !(PTSR_RXTEN | PTSR_TXTEN);
                }
                if value & PTCR_TXTEN != 0 && value & PTCR_TXTDIS == 0 && !self.rx_enabled() {
                    self.reg_ptsr |= PTSR_TXTEN;
                }
                if value & PTCR_TXTDIS != 0 {
                    self.reg_ptsr &= !(PTSR_RXTEN | PTSR_TXTEN);
                }
                Ok(PdcAction::State)
            }
            _ => Err(SocError::illegal_write(device, offset, value)),
        }
    }

    /// Recompute the end-of-transfer and buffer-empty flags after a count
    /// register write. Returns `(set, clear)` masks for the host status
    /// register; must be applied after [`set_register`], before the host's
    /// IRQ update.
    pub fn status_flag_delta(&self, flags: &PdcFlags, offset: u64, value: u32) -> (u32, u32) {
        let mut set = 0;
        let mut clear = 0;

        match offset {
            PDC_RCR | PDC_RNCR => {
                if value != 0 {
                    clear |= flags.endrx | flags.rxbuff;
                }
                if self.rx_enabled() && self.reg_rcr == 0 {
                    set |= flags.endrx;
                    if self.reg_rncr == 0 {
                        set |= flags.rxbuff;
                    }
                }
            }
            PDC_TCR | PDC_TNCR => {
                if value != 0 {
                    clear |= flags.endtx | flags.txbufe;
                }
                if self.tx_enabled() && self.reg_tcr == 0 {
                    set |= flags.endtx;
                    if self.reg_tncr == 0 {
                        set |= flags.txbufe;
                    }
                }
            }
            _ => {}
        }

        (set, clear)
    }
}

/// Capability interface a PDC-owning peripheral provides so the shared
/// register handler can call back into it.
pub trait PdcClient {
    const DEVICE: &'static str;
    const FLAGS: PdcFlags;

    fn pdc_mut(&mut self) -> &mut Pdc;
    fn status_mut(&mut self) -> &mut u32;
    fn update_irq(&mut self);

    fn dma_rx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()>;
    fn dma_rx_stop(&mut self);
    fn dma_tx_start(&mut self, mem: &mut AddressSpace) -> SocResult<()>;
    fn dma_tx_stop(&mut self);
}

/// Shared PDC register-write path: register update, status-flag algebra,
/// then channel start/stop dispatch. Status flags are guaranteed to reflect
/// the post-write state before `update_irq` runs.
pub fn generic_set_register<C: PdcClient>(
    client: &mut C,
    mem: &mut AddressSpace,
    offset: u64,
    value: u32,
) -> SocResult<()> {
    let action = client.pdc_mut().set_register(C::DEVICE, offset, value)?;

    if matches!(offset, PDC_RCR | PDC_RNCR | PDC_TCR | PDC_TNCR) {
        let (set, clear) = client.pdc_mut().status_flag_delta(&C::FLAGS, offset, value);
        let sr = client.status_mut();
        *sr = (*sr & !clear) | set;
        client.update_irq();
    }

    match action {
        PdcAction::None => {}
        PdcAction::State => {
            if client.pdc_mut().rx_enabled() {
                client.dma_rx_start(mem)?;
            } else {
                client.dma_rx_stop();
            }
            if client.pdc_mut().tx_enabled() {
                client.dma_tx_start(mem)?;
            } else {
                client.dma_tx_stop();
            }
        }
        PdcAction::StartRx => client.dma_rx_start(mem)?,
        PdcAction::StopRx => client.dma_rx_stop(),
        PdcAction::StartTx => client.dma_tx_start(mem)?,
        PdcAction::StopTx => client.dma_tx_stop(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAGS: PdcFlags = PdcFlags {
        endrx: 1 << 3,
        endtx: 1 << 4,
        rxbuff: 1 << 12,
        txbufe: 1 << 11,
    };

    #[test]
    fn test_ptcr_enables_and_disables_channels() {
        let mut pdc = Pdc::new();
        assert_eq!(
            pdc.set_register("t", PDC_PTCR, PTCR_RXTEN | PTCR_TXTEN).unwrap(),
            PdcAction::State
        );
        assert!(pdc.rx_enabled() && pdc.tx_enabled());

        // disable takes precedence over enable
        pdc.set_register("t", PDC_PTCR, PTCR_RXTEN | PTCR_RXTDIS).unwrap();
        assert!(!pdc.rx_enabled());
        pdc.set_register("t", PDC_PTCR, PTCR_TXTDIS).unwrap();
        assert!(!pdc.tx_enabled());
    }

    #[test]
    fn test_rcr_write_selects_action_by_ptsr() {
        let mut pdc = Pdc::new();
        assert_eq!(pdc.set_register("t", PDC_RCR, 16).unwrap(), PdcAction::None);

        pdc.set_register("t", PDC_PTCR, PTCR_RXTEN).unwrap();
        assert_eq!(pdc.set_register("t", PDC_RCR, 16).unwrap(), PdcAction::StartRx);
        assert_eq!(pdc.set_register("t", PDC_RCR, 0).unwrap(), PdcAction::StopRx);
    }

    fn apply(pdc: &Pdc, sr: &mut u32, offset: u64, value: u32) {
        let (set, clear) = pdc.status_flag_delta(&FLAGS, offset, value);
        *sr = (*sr & !clear) | set;
    }

    #[test]
    fn test_flag_algebra_end_and_buffer_bits() {
        let mut pdc = Pdc::new();
        let mut sr = 0u32;

        pdc.set_register("t", PDC_PTCR, PTCR_RXTEN).unwrap();

        // RCR = 0 while enabled: end-of-transfer and buffer-empty
        pdc.set_register("t", PDC_RCR, 0).unwrap();
        apply(&pdc, &mut sr, PDC_RCR, 0);
        assert_eq!(sr & FLAGS.endrx, FLAGS.endrx);
        assert_eq!(sr & FLAGS.rxbuff, FLAGS.rxbuff);

        // writing a non-zero RNCR clears both
        pdc.set_register("t", PDC_RNCR, 8).unwrap();
        apply(&pdc, &mut sr, PDC_RNCR, 8);
        assert_eq!(sr & (FLAGS.endrx | FLAGS.rxbuff), 0);

        // RCR zero with RNCR pending: ENDRX but not RXBUFF
        pdc.set_register("t", PDC_RCR, 0).unwrap();
        apply(&pdc, &mut sr, PDC_RCR, 0);
        assert_eq!(sr & FLAGS.endrx, FLAGS.endrx);
        assert_eq!(sr & FLAGS.rxbuff, 0);
    }

    #[test]
    fn test_rx_rollover() {
        let mut pdc = Pdc::new();
        pdc.reg_rnpr = 0x2000_0000;
        pdc.reg_rncr = 32;

        assert!(pdc.rollover_rx());
        assert_eq!(pdc.reg_rpr, 0x2000_0000);
        assert_eq!(pdc.reg_rcr, 32);
        assert_eq!(pdc.reg_rnpr, 0);
        assert_eq!(pdc.reg_rncr, 0);

        // nothing left to roll from
        pdc.reg_rcr = 0;
        assert!(!pdc.rollover_rx());
    }

    #[test]
    fn test_half_duplex_rejects_simultaneous_enable() {
        let mut pdc = Pdc::new();
        assert!(pdc
            .set_register_half_duplex("t", PDC_PTCR, PTCR_RXTEN | PTCR_TXTEN)
            .is_err());
    }

    #[test]
    fn test_half_duplex_rx_preempts_tx() {
        let mut pdc = Pdc::new();
        pdc.set_register_half_duplex("t", PDC_PTCR, PTCR_TXTEN).unwrap();
        assert!(pdc.tx_enabled());

        pdc.set_register_half_duplex("t", PDC_PTCR, PTCR_RXTEN).unwrap();
        assert!(pdc.rx_enabled());
        assert!(!pdc.tx_enabled());

        // TX enable is refused while RX owns the channel
        pdc.set_register_half_duplex("t", PDC_PTCR, PTCR_TXTEN).unwrap();
        assert!(!pdc.tx_enabled());
    }

    #[test]
    fn test_ptsr_is_read_only_through_set() {
        let mut pdc = Pdc::new();
        assert!(pdc.set_register("t", PDC_PTSR, 1).is_err());
        assert!(pdc.get_register("t", PDC_PTCR).is_err());
    }
}
