use parking_lot::Mutex;
use std::{fs, fs::OpenOptions, io::Read, io::Seek, io::SeekFrom, io::Write};

/// Interface for the byte-addressable backing store.
///
/// The store is either a real file or an in-memory buffer ( used for tests
/// and for non-destructive open-copy ).
pub trait Storage: Send + Sync {
    /// Get the current size of the underlying storage.
    fn size(&self) -> u64;

    /// Read from the underlying storage.
    fn read(&self, off: u64, bytes: &mut [u8]) -> std::io::Result<()>;

    /// Write to the underlying storage.
    fn write(&mut self, off: u64, bytes: &[u8]) -> std::io::Result<()>;

    /// Finish a batch of writes, size is the new size of the underlying storage.
    fn commit(&mut self, size: u64) -> std::io::Result<()>;
}

/// Simple implementation of Storage using std::fs::File.
pub struct SimpleFileStorage {
    ///
    pub file: Mutex<fs::File>,
}

impl SimpleFileStorage {
    ///
    pub fn new(filename: &str) -> std::io::Result<Self> {
        Ok(Self {
            file: Mutex::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(filename)?,
            ),
        })
    }
}

impl Storage for SimpleFileStorage {
    fn size(&self) -> u64 {
        let mut f = self.file.lock();
        f.seek(SeekFrom::End(0)).unwrap_or(0)
    }

    fn read(&self, off: u64, bytes: &mut [u8]) -> std::io::Result<()> {
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(off))?;
        f.read_exact(bytes)
    }

    fn write(&mut self, off: u64, bytes: &[u8]) -> std::io::Result<()> {
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(off))?;
        f.write_all(bytes)
    }

    fn commit(&mut self, size: u64) -> std::io::Result<()> {
        let f = self.file.lock();
        f.set_len(size)?;
        f.sync_data()
    }
}

/// In-memory storage.
#[derive(Default)]
pub struct MemFile {
    v: Vec<u8>,
}

impl MemFile {
    ///
    pub fn new() -> Box<Self> {
        Box::<Self>::default()
    }

    /// In-memory copy of existing bytes ( non-destructive open ).
    pub fn from_bytes(v: Vec<u8>) -> Box<Self> {
        Box::new(Self { v })
    }
}

impl Storage for MemFile {
    fn size(&self) -> u64 {
        self.v.len() as u64
    }

    fn read(&self, off: u64, bytes: &mut [u8]) -> std::io::Result<()> {
        let off = off as usize;
        let n = bytes.len();
        if off + n > self.v.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of storage",
            ));
        }
        bytes.copy_from_slice(&self.v[off..off + n]);
        Ok(())
    }

    fn write(&mut self, off: u64, bytes: &[u8]) -> std::io::Result<()> {
        let off = off as usize;
        if off + bytes.len() > self.v.len() {
            self.v.resize(off + bytes.len(), 0);
        }
        self.v[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn commit(&mut self, size: u64) -> std::io::Result<()> {
        self.v.resize(size as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfile_read_write() {
        let mut m = MemFile::new();
        m.write(10, b"hello").unwrap();
        assert_eq!(m.size(), 15);
        let mut buf = [0u8; 5];
        m.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(m.read(14, &mut buf).is_err());
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jdb");
        let mut s = SimpleFileStorage::new(path.to_str().unwrap()).unwrap();
        s.write(0, b"abcd").unwrap();
        s.commit(4).unwrap();
        let mut buf = [0u8; 4];
        s.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
