// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! I/O transfer (IOX) wire protocol: length-delimited frames over Unix
//! domain sockets, used to attach external processes (test harnesses,
//! device simulators) to individual peripherals.
//!
//! Frame layout (little-endian, packed): `seq:u8 cat:u8 id:u8 len:u8`
//! followed by exactly `len` payload bytes. Bit 7 of `seq` carries the
//! direction: clear for client-to-emulator, set for emulator-to-client.
//! Responses copy the request's sequence number unchanged.

mod server;

pub use server::IoxServer;

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = 255;

pub const SEQ_DIRECTION: u8 = 0x80;

/// Command categories. PINSTATE shares the DATA value: the PIO speaks its
/// own dialect on its own socket.
pub const CAT_DATA: u8 = 0x01;
pub const CAT_FAULT: u8 = 0x02;
pub const CAT_PINSTATE: u8 = 0x01;

pub const CID_DATA_IN: u8 = 0x01;
pub const CID_DATA_OUT: u8 = 0x02;
pub const CID_CTRL_START: u8 = 0x03;
pub const CID_CTRL_STOP: u8 = 0x04;

#[inline]
pub fn seq_set_in(seq: u8) -> u8 {
    seq & !SEQ_DIRECTION
}

#[inline]
pub fn seq_set_out(seq: u8) -> u8 {
    seq | SEQ_DIRECTION
}

#[inline]
pub fn seq_is_outbound(seq: u8) -> bool {
    seq & SEQ_DIRECTION != 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoxFrame {
    pub seq: u8,
    pub cat: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl IoxFrame {
    pub fn new(seq: u8, cat: u8, id: u8, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self {
            seq,
            cat,
            id,
            payload: payload.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.seq);
        out.push(self.cat);
        out.push(self.id);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Payload interpreted as a little-endian u32, for the status-reply and
    /// pin-mask frames.
    pub fn payload_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Incremental frame decoder. Bytes arrive in arbitrary chunks; a frame is
/// dispatched only once the header and the full declared payload are
/// buffered, and partial input resumes exactly where it stopped.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: [u8; HEADER_LEN + MAX_PAYLOAD],
    used: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: [0; HEADER_LEN + MAX_PAYLOAD],
            used: 0,
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Feed received bytes, returning every frame completed by them.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<IoxFrame> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            let want = if self.used < HEADER_LEN {
                HEADER_LEN - self.used
            } else {
                HEADER_LEN + self.buf[3] as usize - self.used
            };

            let take = want.min(data.len());
            self.buf[self.used..self.used + take].copy_from_slice(&data[..take]);
            self.used += take;
            data = &data[take..];

            if self.used >= HEADER_LEN {
                let total = HEADER_LEN + self.buf[3] as usize;
                if self.used == total {
                    frames.push(IoxFrame {
                        seq: self.buf[0],
                        cat: self.buf[1],
                        id: self.buf[2],
                        payload: self.buf[HEADER_LEN..total].to_vec(),
                    });
                    self.used = 0;
                }
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<IoxFrame> {
        vec![
            IoxFrame::new(0x00, CAT_DATA, CID_DATA_IN, b"abc"),
            IoxFrame::new(0x01, CAT_FAULT, 0x02, &[]),
            IoxFrame::new(0x02, CAT_DATA, CID_DATA_IN, &[0u8; 255]),
            IoxFrame::new(0x03, CAT_DATA, CID_CTRL_STOP, &[1, 2]),
        ]
    }

    #[test]
    fn test_encode_layout() {
        let frame = IoxFrame::new(0x81, 0x01, 0x02, &[0xAA, 0xBB]);
        assert_eq!(frame.encode(), vec![0x81, 0x01, 0x02, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn test_single_shot_decode() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push(&wire), frames);
    }

    #[test]
    fn test_byte_at_a_time_decode_matches_single_shot() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in &wire {
            got.extend(dec.push(std::slice::from_ref(byte)));
        }
        assert_eq!(got, frames);
    }

    #[test]
    fn test_random_chunking_never_misaligns() {
        let frames = sample_frames();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }

        // deterministic LCG split points
        let mut state: u64 = 0x5DEECE66D;
        for _ in 0..100 {
            let mut dec = FrameDecoder::new();
            let mut got = Vec::new();
            let mut rest = wire.as_slice();
            while !rest.is_empty() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let n = 1 + (state >> 33) as usize % rest.len();
                got.extend(dec.push(&rest[..n]));
                rest = &rest[n..];
            }
            assert_eq!(got, frames);
        }
    }

    #[test]
    fn test_seq_direction_bit() {
        assert_eq!(seq_set_out(0x12), 0x92);
        assert_eq!(seq_set_in(0x92), 0x12);
        assert!(seq_is_outbound(0x80));
        assert!(!seq_is_outbound(0x7F));
    }

    #[test]
    fn test_payload_u32() {
        let frame = IoxFrame::new(0, CAT_DATA, CID_DATA_IN, &0x1234_5678u32.to_le_bytes());
        assert_eq!(frame.payload_u32(), Some(0x1234_5678));
        assert_eq!(IoxFrame::new(0, 1, 1, b"abc").payload_u32(), None);
    }
}
