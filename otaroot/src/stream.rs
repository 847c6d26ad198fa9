// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    str,
    sync::atomic::{AtomicBool, Ordering},
};

use ring::digest::Context;

use crate::util;

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Trait object friendly combination of [`Read`] and [`Seek`].
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

fn eof_error(action: &str, expected: u64, actual: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("Expected to {action} {expected} bytes, but reached EOF after {actual} bytes"),
    )
}

/// Extensions for readers to skip over data, like padding.
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(eof_error("read", size, n));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for writers to emit runs of zeros.
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(eof_error("write", size, n));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        let mut written = 0;

        while written < size {
            let chunk = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..chunk])?;
            written += n as u64;

            if n < chunk {
                break;
            }
        }

        Ok(written)
    }
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for reading UTF-8 strings from fixed-size fields.
pub trait ReadStringExt {
    /// Read exactly `size` bytes as a string.
    fn read_string_exact(&mut self, size: usize) -> io::Result<String>;

    /// Read a `size`-byte field and strip the trailing NULL padding. The
    /// padding must not be followed by any other data.
    fn read_string_padded(&mut self, size: usize) -> io::Result<String>;
}

impl<R: Read> ReadStringExt for R {
    fn read_string_exact(&mut self, size: usize) -> io::Result<String> {
        let buf = self.read_vec_exact(size)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_string_padded(&mut self, size: usize) -> io::Result<String> {
        let buf = self.read_vec_exact(size)?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());

        if !util::is_zero(&buf[end..]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Data found after NULL terminator",
            ));
        }

        str::from_utf8(&buf[..end])
            .map(|s| s.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Extensions for writing strings into fixed-size, NULL-padded fields.
pub trait WriteStringExt {
    fn write_string_padded(&mut self, data: &str, size: usize) -> io::Result<()>;
}

impl<W: Write> WriteStringExt for W {
    fn write_string_padded(&mut self, data: &str, size: usize) -> io::Result<()> {
        if data.len() > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("String is too long for {size}-byte field: {data:?}"),
            ));
        }

        self.write_all(data.as_bytes())?;
        self.write_zeros_exact((size - data.len()) as u64)
    }
}

/// A reader that keeps track of how many bytes were read. Seeking is only
/// supported for querying the current position.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.count)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        position_only_seek(pos, self.count)
    }
}

/// A writer that keeps track of how many bytes were written. Seeking is only
/// supported for querying the current position.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn finish(self) -> (W, u64) {
        (self.inner, self.count)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        position_only_seek(pos, self.count)
    }
}

fn position_only_seek(pos: SeekFrom, current: u64) -> io::Result<u64> {
    match pos {
        SeekFrom::Current(0) => Ok(current),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Stream can only report its position",
        )),
    }
}

/// A writer that feeds everything written through a digest context.
pub struct HashingWriter<W> {
    inner: W,
    context: Context,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, context: Context) -> Self {
        Self { inner, context }
    }

    pub fn finish(self) -> (W, Context) {
        (self.inner, self.context)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Return an [`io::ErrorKind::Interrupted`] error if the cancel signal is set.
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, passing each chunk to
/// `inspect` and checking the cancel signal between chunks.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..to_read])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Unexpected EOF with {size} bytes remaining"),
            ));
        }

        inspect(&buf[..n]);
        writer.write_all(&buf[..n])?;

        size -= n as u64;
    }

    Ok(())
}
