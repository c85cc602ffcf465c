/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Signals delivered through a socket pair so the poll loop sees them as
//! ordinary readiness. Each handler writes its signal number as one byte.

use log::debug;
use signal_hook::consts::{SIGALRM, SIGINT, SIGTERM};
use signal_hook::SigId;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Alarm,
    Terminate,
    Other(i32),
}

impl From<u8> for Signal {
    fn from(b: u8) -> Self {
        match i32::from(b) {
            SIGALRM => Self::Alarm,
            SIGTERM | SIGINT => Self::Terminate,
            other => Self::Other(other),
        }
    }
}

/// Writes into the pipe from ordinary code, e.g. to stop a dispatcher
/// running on another thread.
pub struct SignalHandle {
    writer: UnixStream,
}

impl SignalHandle {
    pub fn send(&self, sig: i32) -> Result<(), io::Error> {
        (&self.writer).write_all(&[sig as u8])
    }
}

pub struct SignalPipe {
    reader: mio::net::UnixStream,
    writer: UnixStream,
    ids: Vec<SigId>,
}

impl SignalPipe {
    pub fn new() -> Result<Self, io::Error> {
        let (reader, writer) = UnixStream::pair()?;

        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            reader: mio::net::UnixStream::from_std(reader),
            writer,
            ids: Vec::new(),
        })
    }

    /// Installs handlers for alarm and termination signals. A second
    /// termination signal while the first is still pending exits the
    /// process immediately.
    pub fn install(&mut self) -> Result<(), io::Error> {
        let term_now = Arc::new(AtomicBool::new(false));

        for sig in [SIGTERM, SIGINT] {
            self.ids.push(signal_hook::flag::register_conditional_shutdown(
                sig,
                1,
                Arc::clone(&term_now),
            )?);

            self.ids
                .push(signal_hook::flag::register(sig, Arc::clone(&term_now))?);
        }

        for sig in [SIGALRM, SIGTERM, SIGINT] {
            self.forward(sig)?;
        }

        Ok(())
    }

    /// Forwards `sig` into the pipe.
    pub fn forward(&mut self, sig: i32) -> Result<(), io::Error> {
        let fd = self.writer.as_raw_fd();
        let byte = sig as u8;

        // SAFETY: send() is async-signal-safe, and the fd outlives the
        // handler since handlers are unregistered on drop
        let id = unsafe {
            signal_hook::low_level::register(sig, move || {
                libc::send(
                    fd,
                    &byte as *const u8 as *const libc::c_void,
                    1,
                    libc::MSG_DONTWAIT,
                );
            })?
        };

        self.ids.push(id);

        Ok(())
    }

    pub fn handle(&self) -> Result<SignalHandle, io::Error> {
        Ok(SignalHandle {
            writer: self.writer.try_clone()?,
        })
    }

    pub fn source(&mut self) -> &mut mio::net::UnixStream {
        &mut self.reader
    }

    /// Reads everything pending, passing each decoded signal to `f`.
    pub fn drain<F>(&mut self, mut f: F) -> Result<(), io::Error>
    where
        F: FnMut(Signal),
    {
        let mut buf = [0; 64];

        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(size) => {
                    for b in &buf[..size] {
                        let sig = Signal::from(*b);

                        debug!("signal {:?}", sig);

                        f(sig);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Schedules a SIGALRM in `secs` seconds, replacing any pending one.
pub fn alarm(secs: u32) {
    // SAFETY: alarm() has no memory safety requirements
    unsafe {
        libc::alarm(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::consts::SIGUSR2;

    fn collect(pipe: &mut SignalPipe) -> Vec<Signal> {
        let mut out = Vec::new();
        pipe.drain(|s| out.push(s)).unwrap();

        out
    }

    #[test]
    fn decode() {
        assert_eq!(Signal::from(SIGALRM as u8), Signal::Alarm);
        assert_eq!(Signal::from(SIGTERM as u8), Signal::Terminate);
        assert_eq!(Signal::from(SIGINT as u8), Signal::Terminate);
        assert_eq!(Signal::from(SIGUSR2 as u8), Signal::Other(SIGUSR2));
    }

    #[test]
    fn handle_writes_into_pipe() {
        let mut pipe = SignalPipe::new().unwrap();
        assert!(collect(&mut pipe).is_empty());

        let h = pipe.handle().unwrap();
        h.send(SIGALRM).unwrap();
        h.send(SIGTERM).unwrap();

        assert_eq!(collect(&mut pipe), vec![Signal::Alarm, Signal::Terminate]);
        assert!(collect(&mut pipe).is_empty());
    }

    #[test]
    fn raised_signal_is_forwarded() {
        let mut pipe = SignalPipe::new().unwrap();
        pipe.forward(SIGUSR2).unwrap();

        // SAFETY: a handler for SIGUSR2 is installed
        unsafe {
            libc::raise(SIGUSR2);
        }

        assert_eq!(collect(&mut pipe), vec![Signal::Other(SIGUSR2)]);
    }
}
