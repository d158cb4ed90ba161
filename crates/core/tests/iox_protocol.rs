// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Wire-protocol invariants of the I/O transfer link, exercised over real
//! Unix sockets against an assembled board.

use satwired_config::BoardConfig;
use satwired_core::iox::{
    seq_is_outbound, FrameDecoder, IoxFrame, CAT_DATA, CID_DATA_IN, CID_DATA_OUT,
};
use satwired_core::memory::SDRAM_BASE;
use satwired_core::Soc;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

const USART0_BASE: u64 = 0xFFFB_0000;
const US_CR: u64 = USART0_BASE;
const US_CSR: u64 = USART0_BASE + 0x14;
const US_RHR: u64 = USART0_BASE + 0x18;
const PDC_TPR: u64 = USART0_BASE + 0x108;
const PDC_TCR: u64 = USART0_BASE + 0x10C;
const PDC_PTCR: u64 = USART0_BASE + 0x120;

static SOCKET_ID: AtomicUsize = AtomicUsize::new(0);

fn socket_path() -> PathBuf {
    let id = SOCKET_ID.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("satwired_proto_{}_{}", std::process::id(), id))
}

fn soc_with_usart0() -> (Soc, UnixStream) {
    let mut cfg = BoardConfig::headless();
    let path = socket_path();
    cfg.sockets.insert("usart0".to_string(), Some(path.clone()));
    let mut soc = Soc::from_config(&cfg).unwrap();

    let client = UnixStream::connect(&path).unwrap();
    soc.poll().unwrap();
    (soc, client)
}

fn pump_until<F: FnMut(&mut Soc) -> bool>(soc: &mut Soc, mut done: F) {
    for _ in 0..200 {
        soc.poll().unwrap();
        if done(soc) {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("condition not reached");
}

fn read_frames(client: &mut UnixStream, expect: usize) -> Vec<IoxFrame> {
    let mut dec = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut buf = [0u8; 2048];
    while frames.len() < expect {
        let n = client.read(&mut buf).unwrap();
        frames.extend(dec.push(&buf[..n]));
    }
    frames
}

/// Deterministic linear congruential generator for split points.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        1 + (self.0 >> 33) as usize % bound
    }
}

#[test]
fn test_chunked_delivery_reconstructs_frame_boundaries() {
    let (mut soc, mut client) = soc_with_usart0();
    soc.write(US_CR, 4, 1 << 4).unwrap(); // RXEN

    // several frames concatenated, sent with pathological splits
    let mut wire = Vec::new();
    let payloads: [&[u8]; 3] = [b"a", b"bc", b"def"];
    for (i, payload) in payloads.iter().enumerate() {
        wire.extend(IoxFrame::new(i as u8, CAT_DATA, CID_DATA_IN, payload).encode());
    }

    let mut lcg = Lcg(0x1234_5678);
    let mut rest = wire.as_slice();
    while !rest.is_empty() {
        let n = lcg.next(rest.len());
        client.write_all(&rest[..n]).unwrap();
        client.flush().unwrap();
        rest = &rest[n..];
        soc.poll().unwrap();
    }

    // all six bytes arrive, in order, across the frame boundaries
    let mut received = Vec::new();
    pump_until(&mut soc, |soc| {
        while soc.read(US_CSR, 4).unwrap() & 1 != 0 {
            received.push(soc.read(US_RHR, 4).unwrap() as u8);
        }
        received.len() == 6
    });
    assert_eq!(received, b"abcdef");

    // one status reply per request frame, each echoing its seq
    let replies = read_frames(&mut client, 3);
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.seq, i as u8);
        assert_eq!(reply.payload_u32(), Some(0));
    }
}

#[test]
fn test_outbound_frames_carry_direction_bit_and_fresh_seq() {
    let (mut soc, mut client) = soc_with_usart0();
    soc.write(US_CR, 4, 1 << 6).unwrap(); // TXEN

    soc.write(USART0_BASE + 0x1C, 4, b'x' as u32).unwrap();
    soc.write(USART0_BASE + 0x1C, 4, b'y' as u32).unwrap();

    let frames = read_frames(&mut client, 2);
    assert!(frames.iter().all(|f| f.id == CID_DATA_OUT));
    assert!(frames.iter().all(|f| seq_is_outbound(f.seq)));
    assert_ne!(frames[0].seq, frames[1].seq);
}

#[test]
fn test_multiframe_split_shares_one_seq() {
    let (mut soc, mut client) = soc_with_usart0();
    soc.write(US_CR, 4, 1 << 6).unwrap(); // TXEN

    // 600-byte PDC transmission: 255 + 255 + 90
    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    soc.memory_mut().poke(SDRAM_BASE, &data).unwrap();

    soc.write(PDC_TPR, 4, SDRAM_BASE as u32).unwrap();
    soc.write(PDC_PTCR, 4, 1 << 8).unwrap(); // TXTEN
    soc.write(PDC_TCR, 4, 600).unwrap();

    let frames = read_frames(&mut client, 3);
    assert_eq!(frames[0].payload.len(), 255);
    assert_eq!(frames[1].payload.len(), 255);
    assert_eq!(frames[2].payload.len(), 90);
    assert!(frames.iter().all(|f| f.seq == frames[0].seq));
    assert!(seq_is_outbound(frames[0].seq));

    let reassembled: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
    assert_eq!(reassembled, data);
}

#[test]
fn test_inbound_direction_bit_is_clear_on_requests() {
    // clients send with bit 7 clear; a response copies the seq unchanged,
    // so a zero-seq request yields a zero-seq (inbound-looking) reply while
    // server-initiated traffic always has the bit set
    let (mut soc, mut client) = soc_with_usart0();
    soc.write(US_CR, 4, (1 << 4) | (1 << 6)).unwrap();

    let request = IoxFrame::new(0x7F, CAT_DATA, CID_DATA_IN, b"!");
    assert!(!seq_is_outbound(request.seq));
    client.write_all(&request.encode()).unwrap();

    pump_until(&mut soc, |soc| soc.read(US_CSR, 4).unwrap() & 1 != 0);

    let reply = read_frames(&mut client, 1).remove(0);
    assert_eq!(reply.seq, 0x7F, "response seq equals request seq");

    // and an actual transmission gets a fresh outbound seq
    soc.write(USART0_BASE + 0x1C, 4, b'z' as u32).unwrap();
    let frame = read_frames(&mut client, 1).remove(0);
    assert!(seq_is_outbound(frame.seq));
}
