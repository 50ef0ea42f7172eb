//! Pseudo-terminal allocation for the device simulator
//!
//! The simulator serves the radio side of the protocol on a PTY master while
//! the serial driver under test opens the slave path like any real device.
//! Only the master is kept open here; opening the slave is left entirely to
//! the consumer, the way a serial library would claim a USB device.
//!
//! Unix only. Windows has no PTY equivalent, so the simulator (and the tests
//! that need it) compile out there.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ProtoError, Result};

/// Async handle to a PTY master
pub struct PtyStream {
    inner: AsyncFd<File>,
}

impl PtyStream {
    fn from_file(file: File) -> std::io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    /// Duplicate the handle, sharing the underlying terminal
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Self::from_file(self.inner.get_ref().try_clone()?)
    }
}

/// Allocate a PTY pair in raw 8-bit mode.
///
/// Returns the master stream and the slave device path. The slave descriptor
/// opened by `openpty` is closed immediately; until a consumer opens the path,
/// master reads fail with `EIO`, which callers are expected to tolerate.
pub fn open() -> Result<(PtyStream, PathBuf)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut name = [0 as libc::c_char; 128];

    // SAFETY: out-pointers are valid for the duration of the call; the name
    // buffer is larger than any slave path the kernel produces.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            name.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(ProtoError::Pty(std::io::Error::last_os_error().to_string()));
    }

    let path = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    // SAFETY: master/slave are the descriptors openpty just returned.
    unsafe {
        // Raw mode so the line discipline never rewrites protocol bytes
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(master, &mut termios) == 0 {
            libc::cfmakeraw(&mut termios);
            termios.c_cc[libc::VMIN] = 1;
            termios.c_cc[libc::VTIME] = 0;
            libc::tcsetattr(master, libc::TCSANOW, &termios);
        }

        libc::close(slave);

        let flags = libc::fcntl(master, libc::F_GETFL);
        libc::fcntl(master, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    // SAFETY: master is an open descriptor we own from here on.
    let file = unsafe { File::from_raw_fd(master) };
    let stream = PtyStream::from_file(file).map_err(ProtoError::Io)?;

    Ok((stream, PathBuf::from(path)))
}

/// True for the transient errno a master read yields while no slave is open
pub(crate) fn is_no_slave_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
