// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Minimal IOX client: connects to a USART socket of a running emulator,
//! sends a DATA_IN frame, and prints everything the peripheral emits.
//! Handy for smoke-testing a board without a Python harness.

use anyhow::{Context, Result};
use clap::Parser;
use satwired_core::iox::{FrameDecoder, IoxFrame, CAT_DATA, CID_DATA_IN, CID_DATA_OUT};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "IOX ping client for SatWired USART sockets")]
struct Cli {
    /// Peripheral socket to connect to
    #[arg(long, default_value = "/tmp/qemu_at91_usart0")]
    socket: PathBuf,

    /// Payload to send as DATA_IN
    #[arg(long, default_value = "ping")]
    payload: String,

    /// Keep listening for outbound frames after the reply
    #[arg(long)]
    follow: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut stream = UnixStream::connect(&cli.socket)
        .with_context(|| format!("Failed to connect to {}", cli.socket.display()))?;

    let request = IoxFrame::new(0x00, CAT_DATA, CID_DATA_IN, cli.payload.as_bytes());
    stream.write_all(&request.encode())?;
    println!(
        "-> DATA_IN seq={:#04x} len={}",
        request.seq,
        request.payload.len()
    );

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    let mut got_reply = false;

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            anyhow::bail!("emulator closed the connection");
        }

        for frame in decoder.push(&buf[..n]) {
            match (frame.cat, frame.id) {
                (CAT_DATA, CID_DATA_IN) => {
                    let status = frame.payload_u32().unwrap_or(u32::MAX);
                    println!("<- reply seq={:#04x} status={}", frame.seq, status);
                    got_reply = true;
                }
                (CAT_DATA, CID_DATA_OUT) => {
                    println!(
                        "<- DATA_OUT seq={:#04x} {:?}",
                        frame.seq,
                        String::from_utf8_lossy(&frame.payload)
                    );
                }
                (cat, id) => {
                    println!("<- frame cat={cat:#04x} id={id:#04x} len={}", frame.payload.len());
                }
            }
        }

        if got_reply && !cli.follow {
            return Ok(());
        }
    }
}
