mod listener;
mod tls_config;

pub use listener::Listener;
pub use tls_config::TlsAcceptorConfig;

use std::io::{self, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Relaxed};
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use rustls::{ServerConfig, ServerConnection};
use tokio::net::TcpStream;
use tracing::warn;

use crate::stranded::common::{Error, Result};

enum TlsState {
    Plain,
    Server(ServerConnection),
}

/// The abstract bidirectional byte stream a `ProtocolCore` drives: a plain
/// TCP socket, or TLS-over-TCP via a `rustls::ServerConnection`.
///
/// Reads are only ever issued by the owning strand's task, so the read path
/// needs no synchronization of its own. Writes can come from any strand
/// (`forward`), so both the ciphertext framing state and the socket's
/// writable half are guarded the same way the teacher guards its TLS
/// session: one mutex, held only for the duration of a single record.
pub struct Transport {
    stream: TcpStream,
    tls: Mutex<TlsState>,
    is_closing: AtomicBool,
}

/// Bridges rustls's synchronous `Read`/`Write` onto a non-blocking
/// `TcpStream`. `try_read`/`try_write` already don't block, so - unlike the
/// fd-duplicating trick older tokio required - this needs no unsafe code.
struct NonBlockingIo<'a>(&'a TcpStream);

impl Read for NonBlockingIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for NonBlockingIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

impl Transport {
    pub fn new_plain(stream: TcpStream) -> Arc<Self> {
        Arc::new(Transport {
            stream,
            tls: Mutex::new(TlsState::Plain),
            is_closing: AtomicBool::new(false),
        })
    }

    pub fn new_tls(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Arc<Self>> {
        let conn = ServerConnection::new(config).map_err(Error::from)?;
        Ok(Arc::new(Transport {
            stream,
            tls: Mutex::new(TlsState::Server(conn)),
            is_closing: AtomicBool::new(false),
        }))
    }

    pub fn is_open(&self) -> bool {
        !self.is_closing.load(Relaxed)
    }

    /// Idempotent. Shuts down the socket so any suspended `readable()`/
    /// `writable()` waiter on this Transport - on this strand or another -
    /// observes an error and unwinds through the disconnect path.
    pub fn close(&self) {
        if self.is_closing.swap(true, AcqRel) {
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// No-op for plain TCP. Drives the rustls handshake to completion for
    /// TLS, alternating on socket readiness the way the teacher's transport
    /// drains/fills TLS record buffers in `try_read`/`try_write`.
    pub async fn handshake(&self) -> Result<()> {
        loop {
            if !self.is_open() {
                return Err(Error::closed());
            }
            let (wants_read, wants_write, handshaking) = {
                let guard = self.tls.lock().unwrap();
                match &*guard {
                    TlsState::Plain => return Ok(()),
                    TlsState::Server(c) => (c.wants_read(), c.wants_write(), c.is_handshaking()),
                }
            };
            if !handshaking {
                return Ok(());
            }
            if wants_write {
                self.stream.writable().await.map_err(Error::from)?;
                let mut guard = self.tls.lock().unwrap();
                if let TlsState::Server(c) = &mut *guard {
                    match c.write_tls(&mut NonBlockingIo(&self.stream)) {
                        Ok(_) => {}
                        Err(e) if would_block(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if wants_read {
                self.stream.readable().await.map_err(Error::from)?;
                let mut guard = self.tls.lock().unwrap();
                if let TlsState::Server(c) = &mut *guard {
                    match c.read_tls(&mut NonBlockingIo(&self.stream)) {
                        Ok(0) => return Err(Error::closed()),
                        Ok(_) => {
                            c.process_new_packets().map_err(Error::from)?;
                        }
                        Err(e) if would_block(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Reads at least one byte into `buf`, suspending until some arrive.
    /// Only ever called from the owning strand.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.is_open() {
                return Err(Error::closed());
            }
            self.stream.readable().await.map_err(Error::from)?;
            match self.try_read(buf) {
                Ok(0) => {
                    self.close();
                    return Err(Error::closed());
                }
                Ok(n) => return Ok(n),
                Err(e) if would_block(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.tls.lock().unwrap();
        match &mut *guard {
            TlsState::Plain => self.stream.try_read(buf),
            TlsState::Server(conn) => {
                if !conn.wants_read() {
                    // No new ciphertext buffered yet but there may be leftover
                    // plaintext from a previous record; fall through to read().
                } else {
                    match conn.read_tls(&mut NonBlockingIo(&self.stream)) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            if let Err(e) = conn.process_new_packets() {
                                warn!(%e, "TLS protocol error");
                                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                match conn.reader().read(buf) {
                    Ok(0) if conn.wants_read() => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                    other => other,
                }
            }
        }
    }

    /// Writes `bufs` in order, without copying them into one contiguous
    /// buffer first. `send_line` uses this to append the delimiter to the
    /// payload as a second buffer.
    pub async fn write_vectored(&self, bufs: &[&[u8]]) -> Result<()> {
        let mut idx = 0usize;
        let mut offset = 0usize;
        while idx < bufs.len() {
            if offset >= bufs[idx].len() {
                idx += 1;
                offset = 0;
                continue;
            }
            if !self.is_open() {
                return Err(Error::closed());
            }
            self.stream.writable().await.map_err(Error::from)?;
            match self.try_write(&bufs[idx][offset..]) {
                Ok(0) => continue,
                Ok(n) => offset += n,
                Err(e) if would_block(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.write_vectored(&[buf]).await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.tls.lock().unwrap();
        match &mut *guard {
            TlsState::Plain => self.stream.try_write(buf),
            TlsState::Server(conn) => {
                let n = conn.writer().write(buf)?;
                loop {
                    match conn.write_tls(&mut NonBlockingIo(&self.stream)) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) if would_block(&e) => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(n)
            }
        }
    }
}
