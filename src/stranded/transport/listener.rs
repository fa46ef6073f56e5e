use std::io;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::stranded::common::{Error, Result};
use crate::stranded::config::LISTEN_BACKLOG;

/// A single listening socket. `Reactor::listen_tcp`/`listen_tls` each own
/// one of these, driving the accept loop described in the component
/// design: accept, construct a Transport, hand off to the caller.
pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn bind(host: &str, port: u16, reuseport: bool) -> Result<Self> {
        let address = format!("{host}:{port}");
        let addr = address.parse()?;
        let sock = TcpSocket::new_v4()?;
        #[cfg(unix)]
        if reuseport {
            sock.set_reuseport(true)?;
        }
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self { address, listener })
    }

    /// Accepts the next inbound connection. Returns `None` only when the
    /// listener socket itself has become unusable and the caller's accept
    /// loop should exit - a listener error, per the error-handling design,
    /// fatal to this port alone.
    pub async fn accept(&self) -> Option<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, server = %self.address, "accepted connection");
                    return Some(sock);
                }
                Err(e) => {
                    if is_transient_accept_error(&e) {
                        error!(%e, server = %self.address, "transient accept error, continuing");
                        continue;
                    }
                    error!(%e, server = %self.address, "fatal accept error, listener exiting");
                    return None;
                }
            }
        }
    }
}

#[cfg(unix)]
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ECONNABORTED)
            | Some(libc::EMFILE) // process file-descriptor limit
            | Some(libc::ENFILE) // system wide file-descriptor limit
            | Some(libc::ENOBUFS) // out of memory
            | Some(libc::ENOMEM) // out of memory
            | Some(libc::EPROTO) // protocol error
            | Some(libc::EINTR)
    )
}

#[cfg(not(unix))]
fn is_transient_accept_error(_e: &io::Error) -> bool {
    false
}
