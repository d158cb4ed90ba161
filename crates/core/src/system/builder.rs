// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::Soc;
use crate::clock::SimClock;
use crate::memory::AddressSpace;
use crate::peripherals::aic::{Aic, AicStub};
use crate::peripherals::dbgu::Dbgu;
use crate::peripherals::matrix::Matrix;
use crate::peripherals::mci::Mci;
use crate::peripherals::pio::Pio;
use crate::peripherals::pit::Pit;
use crate::peripherals::pmc::Pmc;
use crate::peripherals::rstc::Rstc;
use crate::peripherals::rtt::Rtt;
use crate::peripherals::sdramc::Sdramc;
use crate::peripherals::spi::Spi;
use crate::peripherals::tc::TcBlock;
use crate::peripherals::twi::Twi;
use crate::peripherals::usart::Usart;
use crate::sd::{EmptySlot, SdBus, SdCardImage};
use crate::{SocPolicy, SocResult};
use satwired_config::BoardConfig;
use std::path::PathBuf;

const USART_NAMES: [&str; 6] = [
    "at91.usart0",
    "at91.usart1",
    "at91.usart2",
    "at91.usart3",
    "at91.usart4",
    "at91.usart5",
];

fn sd_slot(config: &BoardConfig, index: u8) -> SocResult<Box<dyn SdBus>> {
    match config.sd_image(index) {
        Some(path) => {
            tracing::info!("sd slot {}: backed by {}", index, path.display());
            Ok(Box::new(SdCardImage::from_file(path)?))
        }
        None => Ok(Box::new(EmptySlot)),
    }
}

impl Soc {
    /// Assemble the board from a parsed configuration: memories, every
    /// peripheral with its socket, the SD cards, and the initial clock.
    pub fn from_config(config: &BoardConfig) -> SocResult<Self> {
        let mut mem = AddressSpace::new(config.bms);

        if let Some(bios) = &config.bios {
            let image = std::fs::read(bios)?;
            tracing::info!("loading bios {} ({} bytes)", bios.display(), image.len());
            mem.load_firmware(&image)?;
        }

        let socket = |endpoint: &str| -> Option<PathBuf> { config.socket_path(endpoint) };

        let usart = [
            Usart::new(USART_NAMES[0], socket("usart0").as_deref())?,
            Usart::new(USART_NAMES[1], socket("usart1").as_deref())?,
            Usart::new(USART_NAMES[2], socket("usart2").as_deref())?,
            Usart::new(USART_NAMES[3], socket("usart3").as_deref())?,
            Usart::new(USART_NAMES[4], socket("usart4").as_deref())?,
            Usart::new(USART_NAMES[5], socket("usart5").as_deref())?,
        ];
        let spi = [
            Spi::new("at91.spi0", socket("spi0").as_deref())?,
            Spi::new("at91.spi1", socket("spi1").as_deref())?,
        ];
        let pio = [
            Pio::new("at91.pio_a", socket("pioa").as_deref())?,
            Pio::new("at91.pio_b", socket("piob").as_deref())?,
            Pio::new("at91.pio_c", socket("pioc").as_deref())?,
        ];

        let mut soc = Soc {
            policy: SocPolicy {
                strict_unimplemented: config.strict_unimplemented,
                strict_unsupported: config.strict_unsupported,
            },
            clock: SimClock::new(),
            mem,
            aic: Aic::new(),
            aic_stub: AicStub::new(),
            pmc: Pmc::new(),
            matrix: Matrix::new(config.bms),
            rstc: Rstc::new(),
            sdramc: Sdramc::new(socket("sdramc").as_deref())?,
            dbgu: Dbgu::new(),
            pio,
            pit: Pit::new(),
            rtt: Rtt::new(),
            tc012: TcBlock::new("at91.tc012"),
            tc345: TcBlock::new("at91.tc345"),
            usart,
            spi,
            twi: Twi::new(socket("twi").as_deref())?,
            mci: Mci::new(sd_slot(config, 0)?, sd_slot(config, 1)?),
            pio_b7_level: false,
        };

        if matches!(config.serial, satwired_config::SerialRedirect::Null) {
            soc.dbgu.set_sink(None, false);
        }

        // out of reset everything runs from the slow clock
        let mclk = soc.pmc.master_clock();
        soc.fan_out_mclk(mclk);
        soc.sync_irq_lines();

        Ok(soc)
    }
}
