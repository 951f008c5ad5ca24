//! Thin capability over a Linux NBD device node.
//!
//! Wraps the legacy NBD ioctl interface: hand the kernel one end of a
//! socket pair, describe the device geometry, then park a thread in
//! `NBD_DO_IT` until disconnect. Keeping the ioctls behind this type keeps
//! everything else in the workspace portable.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tracing::debug;

const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
const NBD_DISCONNECT: libc::c_ulong = 0xab08;
const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;

const NBD_FLAG_HAS_FLAGS: libc::c_ulong = 1 << 0;
const NBD_FLAG_READ_ONLY: libc::c_ulong = 1 << 1;

/// An open NBD device node (`/dev/nbdN`).
pub struct NbdDevice {
    file: File,
}

impl NbdDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<NbdDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(NbdDevice { file })
    }

    fn ioctl(&self, request: libc::c_ulong, argument: libc::c_ulong) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, argument) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Hand the kernel its end of the request socket.
    pub fn set_socket(&self, socket: RawFd) -> io::Result<()> {
        self.ioctl(NBD_SET_SOCK, socket as libc::c_ulong)
    }

    /// Advertise the device as read-only.
    pub fn set_read_only(&self) -> io::Result<()> {
        self.ioctl(NBD_SET_FLAGS, NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY)
    }

    pub fn set_block_size(&self, block_size: u32) -> io::Result<()> {
        self.ioctl(NBD_SET_BLKSIZE, block_size as libc::c_ulong)
    }

    pub fn set_block_count(&self, blocks: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_SIZE_BLOCKS, blocks as libc::c_ulong)
    }

    /// Enter the kernel's transmission loop. Blocks the calling thread
    /// until the device disconnects, so run it on a dedicated worker.
    pub fn run(&self) -> io::Result<()> {
        debug!("entering NBD_DO_IT");
        self.ioctl(NBD_DO_IT, 0)
    }

    /// Ask the kernel to disconnect the device.
    pub fn disconnect(&self) -> io::Result<()> {
        self.ioctl(NBD_DISCONNECT, 0)
    }

    pub fn clear_queue(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_QUE, 0)
    }

    pub fn clear_socket(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_SOCK, 0)
    }

    /// Teardown after `run` returns: flush the queue, drop the socket.
    pub fn shutdown(&self) {
        let _ = self.clear_queue();
        let _ = self.clear_socket();
    }
}
