//! Newline-delimited JSON frames with `SCM_RIGHTS` descriptor batches.
//!
//! A frame whose `fds` field is `N > 0` is followed by a single dummy byte
//! that carries exactly one control message with exactly `N` descriptors.
//! The reader records the stream offset at which each batch arrived and
//! pairs it with the dummy byte at that offset; any other arrangement is a
//! protocol error.

use serde_json::Value;
use std::collections::VecDeque;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixStream;

use super::RpcError;

/// Upper bound on descriptors in one frame.
pub const MAX_FDS: usize = 16;

/// Upper bound on a single JSON line.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 8192;

/// A decoded frame and the descriptors that travelled with it.
#[derive(Debug)]
pub struct Frame {
    pub body: Value,
    pub fds: Vec<OwnedFd>,
}

struct Batch {
    /// Stream offset of the byte the control message was attached to.
    offset: u64,
    fds: Vec<OwnedFd>,
}

pub struct FrameReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    consumed: u64,
    batches: VecDeque<Batch>,
    eof: bool,
}

#[derive(Clone)]
pub struct FrameWriter {
    stream: Arc<UnixStream>,
}

/// Create a connected pair: the host end registered with the runtime and
/// the peer end as a plain descriptor to hand to a child.
pub fn pair() -> io::Result<(UnixStream, OwnedFd)> {
    let (host, peer) = StdUnixStream::pair()?;
    host.set_nonblocking(true)?;
    Ok((UnixStream::from_std(host)?, OwnedFd::from(peer)))
}

/// Take ownership of an inherited control descriptor, checking it is a
/// connected unix stream socket.
pub fn adopt(fd: OwnedFd) -> Result<UnixStream, RpcError> {
    ensure_unix_stream(fd.as_fd())?;
    let stream = StdUnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Split a stream into its reading and writing halves.
pub fn split(stream: UnixStream) -> (FrameReader, FrameWriter) {
    let stream = Arc::new(stream);
    (
        FrameReader {
            stream: stream.clone(),
            buf: Vec::new(),
            consumed: 0,
            batches: VecDeque::new(),
            eof: false,
        },
        FrameWriter { stream },
    )
}

fn ensure_unix_stream(fd: BorrowedFd<'_>) -> Result<(), RpcError> {
    let domain = sockopt(fd.as_raw_fd(), libc::SO_DOMAIN)
        .map_err(|_| RpcError::NotASocket)?;
    let kind = sockopt(fd.as_raw_fd(), libc::SO_TYPE).map_err(|_| RpcError::NotASocket)?;
    if domain != libc::AF_UNIX || kind != libc::SOCK_STREAM {
        return Err(RpcError::NotASocket);
    }
    Ok(())
}

fn sockopt(fd: RawFd, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn declared_fds(body: &Value) -> Result<usize, RpcError> {
    match body.get("fds") {
        None | Some(Value::Null) => Ok(0),
        Some(value) => {
            let count = value
                .as_u64()
                .ok_or_else(|| RpcError::Malformed("fds must be a non-negative integer".into()))?;
            if count as usize > MAX_FDS {
                return Err(RpcError::Malformed(format!("too many descriptors: {count}")));
            }
            Ok(count as usize)
        }
    }
}

impl FrameReader {
    /// Read the next frame. `Ok(None)` is a clean end of stream.
    ///
    /// Cancel-safe: all partial state lives in `self`.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Truncated);
            }
            if self.buf.len() > MAX_FRAME {
                return Err(RpcError::Malformed("frame too large".into()));
            }
            self.fill().await?;
        }
    }

    fn take_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let body: Value = serde_json::from_slice(&self.buf[..newline])
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        let expected = declared_fds(&body)?;

        let frame_end = self.consumed + newline as u64 + 1;
        let fds = if expected == 0 {
            self.reject_stray(frame_end)?;
            self.advance(newline + 1);
            Vec::new()
        } else {
            if self.buf.len() < newline + 2 {
                // The dummy byte has not arrived yet.
                if self.eof {
                    return Err(RpcError::MissingDescriptors { expected });
                }
                return Ok(None);
            }
            let dummy_offset = frame_end;
            self.reject_stray(dummy_offset)?;
            let batch = match self.batches.pop_front() {
                Some(batch) if batch.offset == dummy_offset => batch,
                _ => return Err(RpcError::MissingDescriptors { expected }),
            };
            if batch.fds.len() != expected {
                return Err(RpcError::DescriptorCount {
                    expected,
                    received: batch.fds.len(),
                });
            }
            self.advance(newline + 2);
            batch.fds
        };
        Ok(Some(Frame { body, fds }))
    }

    /// Error if a descriptor batch is attached to any byte before `offset`.
    fn reject_stray(&self, offset: u64) -> Result<(), RpcError> {
        match self.batches.front() {
            Some(batch) if batch.offset < offset => Err(RpcError::DescriptorCount {
                expected: 0,
                received: batch.fds.len(),
            }),
            _ => Ok(()),
        }
    }

    fn advance(&mut self, n: usize) {
        self.buf.drain(..n);
        self.consumed += n as u64;
    }

    async fn fill(&mut self) -> Result<(), RpcError> {
        loop {
            self.stream.readable().await?;
            let mut chunk = [0u8; READ_CHUNK];
            let fd = self.stream.as_raw_fd();
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(fd, &mut chunk))
            {
                Ok((0, fds)) => {
                    if !fds.is_empty() {
                        return Err(RpcError::Truncated);
                    }
                    self.eof = true;
                    return Ok(());
                }
                Ok((n, fds)) => {
                    let end = self.consumed + self.buf.len() as u64 + n as u64;
                    self.buf.extend_from_slice(&chunk[..n]);
                    if !fds.is_empty() {
                        // The kernel stops a read right after the segment
                        // carrying descriptors, so they belong to its last byte.
                        self.batches.push_back(Batch {
                            offset: end - 1,
                            fds,
                        });
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(RpcError::Malformed(e.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl FrameWriter {
    /// Write one frame; `fds` are sent on a trailing dummy byte.
    ///
    /// The frame's `fds` field must already match `fds.len()`.
    pub async fn write_frame(&self, body: &Value, fds: &[BorrowedFd<'_>]) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(body).map_err(|e| RpcError::Malformed(e.to_string()))?;
        line.push(b'\n');
        self.write_all(&line).await?;
        if !fds.is_empty() {
            self.send_fds(fds).await?;
        }
        Ok(())
    }

    async fn write_all(&self, mut data: &[u8]) -> Result<(), RpcError> {
        while !data.is_empty() {
            self.stream.writable().await?;
            let fd = self.stream.as_raw_fd();
            match self.stream.try_io(Interest::WRITABLE, || send_bytes(fd, data)) {
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn send_fds(&self, fds: &[BorrowedFd<'_>]) -> Result<(), RpcError> {
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        loop {
            self.stream.writable().await?;
            let fd = self.stream.as_raw_fd();
            match self.stream.try_io(Interest::WRITABLE, || send_with_fds(fd, &raw)) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn cmsg_space(count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((count * size_of::<RawFd>()) as u32) as usize }
}

fn send_bytes(socket: RawFd, data: &[u8]) -> io::Result<usize> {
    let ret = unsafe {
        libc::send(
            socket,
            data.as_ptr().cast(),
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn send_with_fds(socket: RawFd, fds: &[RawFd]) -> io::Result<usize> {
    let data = [0u8; 1];
    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    let space = cmsg_space(fds.len());
    let mut cmsg_buf = vec![0u8; space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("CMSG_FIRSTHDR null"));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            fds.len() * size_of::<RawFd>(),
        );
    }

    let ret = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// `recvmsg` into `buf`, collecting any `SCM_RIGHTS` descriptors.
fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let space = cmsg_space(MAX_FDS);
    let mut cmsg_buf = vec![0u8; space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let ret = unsafe { libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    let mut messages = 0;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                messages += 1;
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    // Descriptors are owned (and closed) by now even on the error paths.
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }
    if messages > 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "more than one control message",
        ));
    }
    Ok((ret as usize, fds))
}
