//! Sparse input adapter.
//!
//! Splits a local file into an ordered stream of hole and data sections
//! using `SEEK_DATA`/`SEEK_HOLE`, so the importer can skip holes without
//! reading them. Non-seekable inputs (pipes, stdin) degrade to one
//! unbounded data section.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;

/// One section of the input, in stream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// `n` data bytes, readable via [`SparseInput::read`]. `None` means
    /// "until end of stream" (non-seekable input).
    Data(Option<u64>),
    /// `n` bytes that read as zero and are not materialized on disk.
    Hole(u64),
}

/// Section-at-a-time reader over a possibly-sparse file.
pub struct SparseInput {
    file: File,
    offset: u64,
    /// Total size; `None` when the input is not seekable.
    size: Option<u64>,
    in_data: bool,
    done: bool,
}

fn lseek(fd: i32, offset: i64, whence: libc::c_int) -> io::Result<i64> {
    let rc = unsafe { libc::lseek(fd, offset, whence) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

impl SparseInput {
    pub fn new(file: File) -> io::Result<SparseInput> {
        let fd = file.as_raw_fd();

        let seekable = match lseek(fd, 0, libc::SEEK_SET) {
            Ok(_) => true,
            Err(e) if e.raw_os_error() == Some(libc::ESPIPE) => false,
            Err(e) => return Err(e),
        };
        if !seekable {
            return Ok(SparseInput {
                file,
                offset: 0,
                size: None,
                in_data: true,
                done: false,
            });
        }

        let size = file.metadata()?.len();
        // Probe whether the file opens with data or a hole; a file that is
        // one single hole makes SEEK_DATA fail with ENXIO.
        let in_data = match lseek(fd, 0, libc::SEEK_DATA) {
            Ok(position) => position == 0,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => false,
            Err(e) => return Err(e),
        };
        lseek(fd, 0, libc::SEEK_SET)?;

        Ok(SparseInput {
            file,
            offset: 0,
            size: Some(size),
            in_data,
            done: false,
        })
    }

    /// Next section of the stream, or `None` at end of input.
    ///
    /// After a `Data(Some(n))` section the caller must consume exactly `n`
    /// bytes through [`read`](Self::read) before asking for the next one.
    pub fn next_section(&mut self) -> io::Result<Option<Section>> {
        if self.done {
            return Ok(None);
        }
        let size = match self.size {
            Some(size) => size,
            None => {
                self.done = true;
                return Ok(Some(Section::Data(None)));
            }
        };

        loop {
            if self.offset >= size {
                self.done = true;
                return Ok(None);
            }

            let fd = self.file.as_raw_fd();
            let whence = if self.in_data { libc::SEEK_HOLE } else { libc::SEEK_DATA };
            let next_cut = match lseek(fd, self.offset as i64, whence) {
                Ok(position) => position as u64,
                // No further data: the rest of the file is one hole.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => size,
                Err(e) => return Err(e),
            };

            let section_len = next_cut - self.offset;
            let was_data = self.in_data;
            self.in_data = !self.in_data;

            if section_len == 0 {
                continue;
            }

            if was_data {
                lseek(fd, self.offset as i64, libc::SEEK_SET)?;
                self.offset += section_len;
                return Ok(Some(Section::Data(Some(section_len))));
            }
            self.offset += section_len;
            lseek(fd, self.offset as i64, libc::SEEK_SET)?;
            return Ok(Some(Section::Hole(section_len)));
        }
    }
}

impl Read for SparseInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
