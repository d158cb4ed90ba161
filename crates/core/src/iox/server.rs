// SatWired - Flight Software Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::{seq_set_out, FrameDecoder, IoxFrame, MAX_PAYLOAD};
use crate::SocResult;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Per-peripheral I/O transfer server.
///
/// Listens on one Unix domain socket and holds at most one client; while a
/// client is connected, further connection attempts are accepted and
/// immediately closed. All sockets are polled from the cooperative event
/// loop; reads that would block simply return control.
pub struct IoxServer {
    name: &'static str,
    path: PathBuf,
    listener: UnixListener,
    client: Option<UnixStream>,
    decoder: FrameDecoder,
    seq: u8,
}

impl IoxServer {
    pub fn open(name: &'static str, path: &Path) -> std::io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        tracing::info!("{}: listening on {}", name, path.display());

        Ok(Self {
            name,
            path: path.to_path_buf(),
            listener,
            client: None,
            decoder: FrameDecoder::new(),
            seq: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connected(&self) -> bool {
        self.client.is_some()
    }

    /// Allocate the next outbound sequence number.
    fn next_seq(&mut self) -> u8 {
        self.seq = seq_set_out(self.seq.wrapping_add(1));
        self.seq
    }

    fn disconnect(&mut self) {
        if self.client.take().is_some() {
            tracing::info!("{}: client disconnected", self.name);
            self.decoder.reset();
        }
    }

    /// Pump accepts and reads; returns every complete inbound frame.
    pub fn poll(&mut self) -> SocResult<Vec<IoxFrame>> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if self.client.is_some() {
                        tracing::warn!("{}: server already has a client", self.name);
                        drop(stream);
                    } else {
                        stream.set_nonblocking(true)?;
                        tracing::info!("{}: client connected", self.name);
                        self.client = Some(stream);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut frames = Vec::new();
        let mut hangup = false;
        if let Some(client) = self.client.as_mut() {
            let mut buf = [0u8; 512];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => {
                        hangup = true;
                        break;
                    }
                    Ok(n) => frames.extend(self.decoder.push(&buf[..n])),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        hangup = true;
                        break;
                    }
                }
            }
        }
        if hangup {
            self.disconnect();
        }

        Ok(frames)
    }

    fn write_all(&mut self, data: &[u8]) -> SocResult<()> {
        let Some(client) = self.client.as_mut() else {
            return Ok(()); // no client attached; transfers vanish on the wire
        };

        // writes are the only blocking direction; reads stay non-blocking
        client.set_nonblocking(false)?;
        let result = client.write_all(data);
        let _ = client.set_nonblocking(true);

        if let Err(e) = result {
            tracing::warn!("{}: client write failed: {}", self.name, e);
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn send_frame(&mut self, frame: &IoxFrame) -> SocResult<()> {
        self.write_all(&frame.encode())
    }

    /// Send a single frame with a fresh sequence number.
    pub fn send_data(&mut self, cat: u8, id: u8, data: &[u8]) -> SocResult<()> {
        debug_assert!(data.len() <= MAX_PAYLOAD);
        let seq = self.next_seq();
        self.send_frame(&IoxFrame::new(seq, cat, id, data))
    }

    /// Send arbitrary-length data; payloads above 255 bytes split into
    /// multiple frames sharing one sequence number.
    pub fn send_multiframe(&mut self, cat: u8, id: u8, mut data: &[u8]) -> SocResult<()> {
        let seq = self.next_seq();
        while data.len() > MAX_PAYLOAD {
            self.send_frame(&IoxFrame::new(seq, cat, id, &data[..MAX_PAYLOAD]))?;
            data = &data[MAX_PAYLOAD..];
        }
        self.send_frame(&IoxFrame::new(seq, cat, id, data))
    }

    pub fn send_command(&mut self, cat: u8, id: u8) -> SocResult<()> {
        self.send_data(cat, id, &[])
    }

    pub fn send_u32(&mut self, cat: u8, id: u8, value: u32) -> SocResult<()> {
        self.send_data(cat, id, &value.to_le_bytes())
    }

    /// Reply to a request frame: same category/id, and the request's
    /// sequence number copied unchanged.
    pub fn send_u32_resp(&mut self, request: &IoxFrame, value: u32) -> SocResult<()> {
        self.send_frame(&IoxFrame::new(
            request.seq,
            request.cat,
            request.id,
            &value.to_le_bytes(),
        ))
    }
}

impl Drop for IoxServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for IoxServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoxServer")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("connected", &self.connected())
            .finish()
    }
}
