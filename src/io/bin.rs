use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use crc32fast::Hasher;

use crate::core::error::{Error, ErrorKind, Result};
use crate::io::varint::Varint;

const WRITE_BUFFER: usize = 256 * 1024;

/// Buffered little-endian segment file writer with a running CRC32.
pub struct BinWriter {
    pub file: File,
    pub buffer: Vec<u8>,
    pub hasher: Hasher,
    written: u64,
}

impl BinWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(&path).map_err(|e| {
            Error::io(format!("failed to create {}: {}", path.as_ref().display(), e))
        })?;
        Ok(BinWriter {
            file,
            buffer: Vec::with_capacity(WRITE_BUFFER),
            hasher: Hasher::new(),
            written: 0,
        })
    }

    /// Bytes written so far, including still-buffered ones.
    pub fn tell(&self) -> u64 {
        self.written
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.written += bytes.len() as u64;
        if self.buffer.len() >= WRITE_BUFFER {
            self.flush_buffer()?;
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_u32(v.to_bits())
    }

    pub fn write_varint_u32(&mut self, v: u32) -> Result<()> {
        let mut out = Vec::new();
        Varint::encode_u32(&mut out, v);
        self.write_bytes(&out)
    }

    pub fn write_varint_u64(&mut self, v: u64) -> Result<()> {
        let mut out = Vec::new();
        Varint::encode_u64(&mut out, v);
        self.write_bytes(&out)
    }

    /// Length-prefixed UTF-8 string (u32 length, then bytes).
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_bytes(s.as_bytes())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.hasher.update(&self.buffer);
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.file.flush()?;
        Ok(())
    }

    /// Flushes, syncs, and returns (bytes_written, crc32).
    pub fn finish(mut self) -> Result<(u64, u32)> {
        self.flush_buffer()?;
        self.file.sync_all()?;
        Ok((self.written, self.hasher.clone().finalize()))
    }
}

/// Buffered reader for sequential run files.
pub struct BinReader {
    reader: BufReader<File>,
    pub consumed: u64,
}

impl BinReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(&path).map_err(|e| {
            Error::io(format!("failed to open {}: {}", path.as_ref().display(), e))
        })?;
        Ok(BinReader {
            reader: BufReader::with_capacity(WRITE_BUFFER, file),
            consumed: 0,
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        self.consumed += 1;
        Ok(buf[0])
    }

    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 127) as u32) << shift;
            if byte & 128 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::new(ErrorKind::Parse, "varint overflow".to_string()));
            }
        }
    }

    pub fn read_varint_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 127) as u64) << shift;
            if byte & 128 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::new(ErrorKind::Parse, "varint overflow".to_string()));
            }
        }
    }
}

/// Cursor over an in-memory or memory-mapped byte slice.
#[derive(Clone)]
pub struct SliceReader<'a> {
    pub data: &'a [u8],
    pub pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        SliceReader { data, pos }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::io("short read".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let (value, used) = Varint::decode_u32(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_varint_u64(&mut self) -> Result<u64> {
        let (value, used) = Varint::decode_u64(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writer_reader_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");

        let mut w = BinWriter::create(&path).unwrap();
        w.write_u32(0xDEADBEEF).unwrap();
        w.write_u64(1 << 40).unwrap();
        w.write_varint_u32(300).unwrap();
        w.write_varint_u64(1 << 50).unwrap();
        w.write_string("hello").unwrap();
        let (len, crc) = w.finish().unwrap();
        assert!(len > 0);
        assert_ne!(crc, 0);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, len);

        let mut r = SliceReader::new(&data);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_varint_u32().unwrap(), 300);
        assert_eq!(r.read_varint_u64().unwrap(), 1 << 50);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert!(r.is_empty());
    }

    #[test]
    fn bin_reader_streams_varints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.bin");

        let mut w = BinWriter::create(&path).unwrap();
        for i in 0..1000u32 {
            w.write_varint_u32(i * 7).unwrap();
        }
        w.finish().unwrap();

        let mut r = BinReader::open(&path).unwrap();
        for i in 0..1000u32 {
            assert_eq!(r.read_varint_u32().unwrap(), i * 7);
        }
    }
}
