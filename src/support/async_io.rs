//-
// Copyright (c) 2025, the Tidemap developers
//
// This file is part of Tidemap.
//
// Tidemap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemap is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without even the  implied warranty of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemap. If not, see <http://www.gnu.org/licenses/>.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{HandshakeError, SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// The main type for doing async I/O on a server connection.
///
/// This fulfils two roles:
///
/// - Supporting the switch from cleartext to TLS mid-stream (STARTTLS).
/// - Enabling simultaneous read and write even in TLS mode, where both
///   directions contend for the shared SSL stream.
///
/// Clones of `ServerIo` track the same underlying state. This allows what is
/// initially an `AsyncRead + AsyncWrite` to be split into separate reader
/// and writer handles which can be used concurrently, and which both observe
/// a TLS upgrade at the same instant.
#[derive(Clone)]
pub struct ServerIo {
    fd_pair: Rc<FdPair>,
    mode: Rc<RefCell<Mode>>,
    _owned: Option<Rc<dyn Any>>,
}

enum Mode {
    Cleartext(FdPairRw),
    Ssl(SslStream<FdPairRw>),
}

impl ServerIo {
    /// Sets up a `ServerIo` which runs over the given socket.
    ///
    /// The `ServerIo` will own the socket, and the socket will be closed
    /// when the last reference is dropped.
    ///
    /// This only fails if making the socket non-blocking fails.
    pub fn new_owned_socket(sock: impl AsRawFd + Any) -> Result<Self, Error> {
        let fd = sock.as_raw_fd();
        set_nonblock(fd)?;

        let fd_pair = Rc::new(FdPair {
            read: AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )?,
            write: None,
        });

        Ok(Self {
            fd_pair: Rc::clone(&fd_pair),
            mode: Rc::new(RefCell::new(Mode::Cleartext(FdPairRw(fd_pair)))),
            _owned: Some(Rc::new(sock)),
        })
    }

    /// Sets up a `ServerIo` using separate input and output file
    /// descriptors, as when the integration tests drive the server over a
    /// pipe pair.
    #[cfg(test)]
    pub fn new_owned_pair(
        inf: impl AsRawFd + Any,
        outf: impl AsRawFd + Any,
    ) -> Result<Self, Error> {
        let infd = inf.as_raw_fd();
        let outfd = outf.as_raw_fd();
        set_nonblock(infd)?;
        set_nonblock(outfd)?;

        let fd_pair = Rc::new(FdPair {
            read: AsyncFd::with_interest(
                infd,
                tokio::io::Interest::READABLE,
            )?,
            write: Some(AsyncFd::with_interest(
                outfd,
                tokio::io::Interest::WRITABLE,
            )?),
        });

        Ok(Self {
            fd_pair: Rc::clone(&fd_pair),
            mode: Rc::new(RefCell::new(Mode::Cleartext(FdPairRw(fd_pair)))),
            _owned: Some(Rc::new((inf, outf))),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Ssl(_))
    }

    /// Performs server-side TLS setup with the given acceptor, switching
    /// this `ServerIo` (and all its clones) from cleartext to TLS.
    ///
    /// The caller must ensure no concurrent reads or writes are in flight;
    /// concurrent access during the handshake panics.
    pub async fn ssl_accept(&self, acceptor: &SslAcceptor) -> Result<(), Error> {
        // Hold the borrow across the whole handshake so that concurrent
        // access panics instead of interleaving with the negotiation.
        #[allow(clippy::await_holding_refcell_ref)]
        let mut mode = self.mode.borrow_mut();
        let mut result = acceptor.accept(FdPairRw(Rc::clone(&self.fd_pair)));

        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss))
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    // OpenSSL just saw EWOULDBLOCK, so the readiness Tokio
                    // has recorded for the fd is stale; clear it, wait for
                    // the next edge, then resume the handshake.
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            self.fd_pair.read().readable().await?.clear_ready();
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            self.fd_pair
                                .write()
                                .writable()
                                .await?
                                .clear_ready();
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// Handles `WANT_READ`/`WANT_WRITE` by arranging a readiness check for
    /// the appropriate fd and clearing its stale readiness status. This must
    /// only be called immediately after `ssl_read`/`ssl_write` with no await
    /// point in between, so that the WANT status is known to be current.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.fd_pair.read().poll_read_ready(ctx))?
                    .clear_ready();
                futures::ready!(self.fd_pair.read().poll_read_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd_pair.write().poll_write_ready(ctx))?
                    .clear_ready();
                futures::ready!(self.fd_pair.write().poll_write_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF is reported as the SYSCALL code with no associated IO
            // error, which into_io_error() doesn't translate.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer writes itself and neither do we, so there's
        // nothing to do.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        let done = if let Mode::Ssl(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(FdPairRw(Rc::clone(&self.fd_pair)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Holds the `AsyncFd`s corresponding to the underlying socket(s).
///
/// This is tracked separately from the actual reader/writer since we need to
/// "see through" the SSL stream to wait on the raw fds becoming ready.
struct FdPair {
    read: AsyncFd<RawFd>,
    write: Option<AsyncFd<RawFd>>,
}

impl FdPair {
    fn read(&self) -> &AsyncFd<RawFd> {
        &self.read
    }

    fn write(&self) -> &AsyncFd<RawFd> {
        self.write.as_ref().unwrap_or(&self.read)
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the raw file descriptors.
///
/// The synchronous implementations exist because OpenSSL's `SslStream`
/// requires `Read + Write`; they return `WouldBlock` for the handshake and
/// `on_rw_ssl_error` machinery to translate.
struct FdPairRw(Rc<FdPair>);

impl io::Read for FdPairRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let fd = *self.0.read().get_ref();
        nix::unistd::read(fd, dst).map_err(nix_to_io)
    }
}

impl io::Write for FdPairRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let fd = *self.0.write().get_ref();
        nix::unistd::write(fd, src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FdPairRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let async_read = self.0.read();
        loop {
            let mut guard = futures::ready!(async_read.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdPairRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let async_write = self.0.write();
        loop {
            let mut guard = futures::ready!(async_write.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn set_nonblock(fd: RawFd) -> Result<(), Error> {
    nix::fcntl::fcntl(
        fd,
        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error(mhss: openssl::ssl::MidHandshakeSslStream<FdPairRw>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
