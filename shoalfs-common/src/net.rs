// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket plumbing shared by the daemons: TCP listeners with address reuse,
//! IPv4-only host resolution, and UNIX-domain listeners that evict a stale
//! socket file left behind by a crashed predecessor.

use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

/// Opens a TCP listener on `0.0.0.0:port` with `SO_REUSEADDR`, so a daemon
/// restarting into a TIME_WAIT port does not fail spuriously.
pub fn bind_and_listen(port: u16) -> io::Result<TcpListener> {
    let fd: OwnedFd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(&fd, Backlog::new(5)?)?;
    Ok(TcpListener::from(fd))
}

/// Resolves `host` to its first IPv4 address.
pub fn first_ipv4(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(|a| a.ip().is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for host '{host}'"),
            )
        })
}

/// Connects to `host:port` over IPv4.
pub fn connect_to_host(host: &str, port: u16) -> io::Result<TcpStream> {
    TcpStream::connect(first_ipv4(host, port)?)
}

/// Binds a UNIX-domain stream listener at `path`. If the address is in use
/// the stale socket file is unlinked and the bind retried once; anything
/// else listening there will make the retry fail too.
pub fn bind_unix_listener(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        Err(e) => Err(e),
    }
}

/// The peer's IPv4 address, for callers that key state by address.
pub fn peer_ipv4(stream: &TcpStream) -> io::Result<Ipv4Addr> {
    match stream.peer_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(v6) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("expected an IPv4 peer, got {v6}"),
        )),
    }
}
