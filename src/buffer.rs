/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use arrayvec::ArrayVec;
use std::io::{self, Read, Write};
use std::ops::Range;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

// header buffer + file mapping
pub const VECTORED_MAX: usize = 2;

/// Fixed-capacity response header buffer. Writes past capacity fail.
pub type ResponseBuffer = ArrayVec<u8, WRITE_BUFFER_SIZE>;

#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A complete line, terminator excluded.
    Ok(Range<usize>),

    /// CR followed by something other than LF.
    Bad,

    /// No terminator yet.
    Open,
}

/// Request buffer with a line scanner.
///
/// Bytes `[0, read_index)` have been received, bytes `[0, checked_index)`
/// have been scanned, and the current unconsumed line begins at
/// `line_start`. `line_start <= checked_index <= read_index <= capacity`
/// always holds.
pub struct LineBuffer {
    buf: Box<[u8]>,
    read_index: usize,
    checked_index: usize,
    line_start: usize,
}

impl LineBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size].into_boxed_slice(),
            read_index: 0,
            checked_index: 0,
            line_start: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.read_index = 0;
        self.checked_index = 0;
        self.line_start = 0;
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn checked_index(&self) -> usize {
        self.checked_index
    }

    pub fn is_full(&self) -> bool {
        self.read_index == self.buf.len()
    }

    pub fn write_avail(&self) -> usize {
        self.buf.len() - self.read_index
    }

    /// Performs a single read into the unfilled tail.
    pub fn write_from<R: Read>(&mut self, r: &mut R) -> Result<usize, io::Error> {
        let size = r.read(&mut self.buf[self.read_index..])?;

        self.read_index += size;

        Ok(size)
    }

    pub fn get(&self, range: Range<usize>) -> &[u8] {
        assert!(range.end <= self.read_index);

        &self.buf[range]
    }

    /// Bytes received beyond the scan cursor.
    pub fn unchecked(&self) -> &[u8] {
        &self.buf[self.checked_index..self.read_index]
    }

    /// Consumes `size` bytes past the scan cursor, e.g. a request body.
    pub fn consume(&mut self, size: usize) -> Range<usize> {
        assert!(self.checked_index + size <= self.read_index);

        let start = self.checked_index;
        self.checked_index += size;
        self.line_start = self.checked_index;

        start..self.checked_index
    }

    /// Scans for the next line terminator. Accepts CRLF or a bare LF. A CR
    /// at the very end of the received bytes is left unscanned until the
    /// next byte arrives.
    pub fn parse_line(&mut self) -> Line {
        let mut pos = self.checked_index;

        while pos < self.read_index {
            match self.buf[pos] {
                b'\r' => {
                    if pos + 1 == self.read_index {
                        self.checked_index = pos;
                        return Line::Open;
                    }

                    if self.buf[pos + 1] != b'\n' {
                        self.checked_index = pos;
                        return Line::Bad;
                    }

                    return Line::Ok(self.finish_line(pos, pos + 2));
                }
                b'\n' => return Line::Ok(self.finish_line(pos, pos + 1)),
                _ => pos += 1,
            }
        }

        self.checked_index = pos;

        Line::Open
    }

    fn finish_line(&mut self, end: usize, next: usize) -> Range<usize> {
        let line = self.line_start..end;

        self.checked_index = next;
        self.line_start = next;

        line
    }
}

#[cfg(test)]
impl Write for LineBuffer {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        if !buf.is_empty() && self.write_avail() == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let size = std::cmp::min(self.write_avail(), buf.len());

        self.buf[self.read_index..(self.read_index + size)].copy_from_slice(&buf[..size]);
        self.read_index += size;

        Ok(size)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

/// Writes `bufs` as one vectored write, skipping the first `offset` bytes.
pub fn write_vectored_offset<W: Write>(
    writer: &mut W,
    bufs: &[&[u8]],
    offset: usize,
) -> Result<usize, io::Error> {
    let mut offset = offset;
    let mut start = 0;

    while start < bufs.len() && offset >= bufs[start].len() {
        offset -= bufs[start].len();
        start += 1;
    }

    if start == bufs.len() {
        // exceeding the total is an error
        if offset > 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        return Ok(0);
    }

    let mut arr = [io::IoSlice::new(&b""[..]); VECTORED_MAX];
    let mut arr_len = 0;

    for (index, &buf) in bufs.iter().enumerate().skip(start).take(VECTORED_MAX) {
        let buf = if index == start { &buf[offset..] } else { buf };

        arr[arr_len] = io::IoSlice::new(buf);
        arr_len += 1;
    }

    writer.write_vectored(&arr[..arr_len])
}
