// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The rsem server.
//!
//! One thread owns everything: the semaphore table is built before the
//! thread starts and touched by nobody else, so there is not a single lock
//! in the request path. The loop polls the listen socket and the self-pipe;
//! requests are accepted and serviced one at a time. This coordinator hands
//! out cluster-wide locks a few times a minute, so simplicity wins over
//! connection rate.
//!
//! Grant ordering: waiters queue FIFO and are woken head-to-tail, but a
//! waiter whose callback socket is unreachable is skipped so one dead node
//! cannot wedge the queue. That trades strict FIFO for liveness.

use crate::config::{RsemServerConfig, SemConfig};
use crate::fastlog::{op_entry, OP_RELEASE, OP_TAKE, OP_WAKE};
use crate::protocol::{
    read_json_body, read_message_type, write_json_body, write_message_type, MessageType,
    SemGrant, SemRelease, SemRequest,
};
use crate::RsemError;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use shoalfs_common::net::{bind_and_listen, peer_ipv4};
use shoalfs_common::SelfPipe;
use shoalfs_core::fast_log::FastLogBuffer;
use shoalfs_core::glitch;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a grant callback dial may take before the waiter is treated as
/// unreachable and skipped.
const WAKE_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Waiter {
    addr: Ipv4Addr,
    port: u16,
}

#[derive(Debug)]
struct Rsem {
    name: String,
    val: u32,
    wait: VecDeque<Waiter>,
}

/// Open-addressed, linear-probe table of semaphores. Sized to twice the
/// configured count at startup and never inserted into afterwards, so the
/// load factor stays at one half forever and probes are short.
#[derive(Debug)]
struct SemTable {
    slots: Box<[Option<Rsem>]>,
}

fn hash_name(name: &str) -> u32 {
    // FNV-1a; small, deterministic, good enough for a half-empty table.
    let mut h: u32 = 0x811c_9dc5;
    for b in name.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

impl SemTable {
    fn build(sems: &[SemConfig]) -> Result<Self, RsemError> {
        let nslots = (sems.len() * 2).max(1);
        let mut slots: Vec<Option<Rsem>> = (0..nslots).map(|_| None).collect();
        for sem in sems {
            let mut idx = hash_name(&sem.name) as usize % nslots;
            let mut seen = 0;
            loop {
                match &slots[idx] {
                    Some(existing) if existing.name == sem.name => {
                        return Err(RsemError::DuplicateSem(sem.name.clone()));
                    }
                    Some(_) => {}
                    None => {
                        slots[idx] = Some(Rsem {
                            name: sem.name.clone(),
                            val: sem.init_val,
                            wait: VecDeque::new(),
                        });
                        break;
                    }
                }
                idx = (idx + 1) % nslots;
                seen += 1;
                if seen == nslots {
                    // Cannot happen with 2x sizing; belt for the math.
                    return Err(RsemError::Config("semaphore table overflow".into()));
                }
            }
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Rsem> {
        let nslots = self.slots.len();
        let mut idx = hash_name(name) as usize % nslots;
        for _ in 0..nslots {
            if let Some(sem) = &self.slots[idx] {
                if sem.name == name {
                    return self.slots[idx].as_mut();
                }
            }
            idx = (idx + 1) % nslots;
        }
        None
    }
}

pub struct RsemServer {
    pipe: Arc<SelfPipe>,
    thread: Option<JoinHandle<()>>,
    port: u16,
}

impl RsemServer {
    /// Builds the semaphore table from configuration, binds the listen
    /// socket, and spawns the server thread.
    pub fn start(conf: &RsemServerConfig) -> Result<Self, RsemError> {
        let table = SemTable::build(&conf.sems)?;
        let listener = bind_and_listen(conf.port)?;
        let port = listener.local_addr()?.port();
        let pipe = Arc::new(SelfPipe::new().map_err(std::io::Error::from)?);
        let thread = {
            let pipe = Arc::clone(&pipe);
            std::thread::Builder::new()
                .name("rsem-server".into())
                .spawn(move || serve(listener, pipe, table))
                .map_err(RsemError::Io)?
        };
        Ok(Self {
            pipe,
            thread: Some(thread),
            port,
        })
    }

    /// The port actually bound, for configurations that asked for 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops the server thread and waits for it.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.pipe.notify_shutdown();
            let _ = handle.join();
        }
    }
}

impl Drop for RsemServer {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn serve(listener: TcpListener, pipe: Arc<SelfPipe>, mut table: SemTable) {
    // Per-thread diagnostic ring; registration can only fail when the
    // registry is full, which costs us the trace but nothing else.
    let mut flog = match FastLogBuffer::create("rsem_srv") {
        Ok(flog) => {
            if let Err(e) = flog.register() {
                glitch!("rsem server: fast log registration failed: {e}");
            }
            Some(flog)
        }
        Err(e) => {
            glitch!("rsem server: fast log creation failed: {e}");
            None
        }
    };

    loop {
        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(pipe.poll_fd_borrowed(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                glitch!("rsem server: poll error: {e}");
                break;
            }
            Ok(_) => {}
        }
        let listen_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let pipe_ready = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        drop(fds);

        if listen_ready {
            handle_conn(&listener, &mut table, flog.as_deref_mut());
        }
        if pipe_ready {
            match pipe.read_byte() {
                Ok(SelfPipe::SHUTDOWN) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

/// Accepts and services one request. Protocol violations are logged and
/// the connection closed without a reply.
fn handle_conn(listener: &TcpListener, table: &mut SemTable, flog: Option<&mut FastLogBuffer>) {
    let (mut stream, _) = match listener.accept() {
        Ok(conn) => conn,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
        Err(e) => {
            glitch!("rsem server: accept error: {e}");
            return;
        }
    };
    let ty = match read_message_type(&mut stream) {
        Ok(ty) => ty,
        Err(e) => {
            glitch!("rsem server: bad request framing: {e}");
            return;
        }
    };
    match ty {
        MessageType::ClientReqSem => {
            let req: SemRequest = match read_json_body(&mut stream) {
                Ok(req) => req,
                Err(e) => {
                    glitch!("rsem server: bad take body: {e}");
                    return;
                }
            };
            let addr = match peer_ipv4(&stream) {
                Ok(addr) => addr,
                Err(e) => {
                    glitch!("rsem server: peer address unavailable: {e}");
                    return;
                }
            };
            let reply = handle_take(&mut stream, table, &req, addr);
            if let Some(flog) = flog {
                flog.log(&op_entry(OP_TAKE, reply as u8, &req.name));
            }
        }
        MessageType::ClientRelSem => {
            let rel: SemRelease = match read_json_body(&mut stream) {
                Ok(rel) => rel,
                Err(e) => {
                    glitch!("rsem server: bad release body: {e}");
                    return;
                }
            };
            handle_release(&mut stream, table, &rel.name, flog);
        }
        other => {
            glitch!("rsem server: unexpected message type {other:?}");
        }
    }
}

fn reply(stream: &mut TcpStream, ty: MessageType) -> Result<(), std::io::Error> {
    write_message_type(stream, ty)
}

/// Take: grant if the value covers it, NACK a no-delay request, otherwise
/// queue the waiter for a callback. The reply type is returned for the
/// fast log.
fn handle_take(
    stream: &mut TcpStream,
    table: &mut SemTable,
    req: &SemRequest,
    addr: Ipv4Addr,
) -> MessageType {
    let Some(sem) = table.get_mut(&req.name) else {
        let _ = reply(stream, MessageType::ServerNoSuchSem);
        return MessageType::ServerNoSuchSem;
    };
    if sem.val > 0 {
        // Decrement only once the grant actually reached the client.
        if reply(stream, MessageType::ServerGiveSem).is_ok() {
            sem.val -= 1;
        }
        return MessageType::ServerGiveSem;
    }
    if req.port == 0 {
        let _ = reply(stream, MessageType::ServerNack);
        return MessageType::ServerNack;
    }
    sem.wait.push_back(Waiter {
        addr,
        port: req.port,
    });
    if reply(stream, MessageType::ServerDelaySem).is_err() {
        // The client never learned it was queued; forget it.
        sem.wait.pop_back();
    }
    MessageType::ServerDelaySem
}

/// Release: ack, bump the value, then try to hand the increment to the
/// oldest reachable waiter. When every dial fails the value stays
/// incremented and the queue untouched; the next release or a client retry
/// drains it.
fn handle_release(
    stream: &mut TcpStream,
    table: &mut SemTable,
    name: &str,
    flog: Option<&mut FastLogBuffer>,
) {
    let Some(sem) = table.get_mut(name) else {
        let _ = reply(stream, MessageType::ServerNoSuchSem);
        if let Some(flog) = flog {
            flog.log(&op_entry(
                OP_RELEASE,
                MessageType::ServerNoSuchSem as u8,
                name,
            ));
        }
        return;
    };
    if reply(stream, MessageType::ServerAck).is_err() {
        // The client never saw the ack and will retry; leave the value
        // alone so the retry isn't a double release.
        return;
    }
    sem.val += 1;
    let woke = wake_any_waiter(sem);
    if let Some(flog) = flog {
        flog.log(&op_entry(OP_RELEASE, MessageType::ServerAck as u8, name));
        if woke {
            flog.log(&op_entry(OP_WAKE, MessageType::ClientAck as u8, name));
        }
    }
}

/// Walks the waiter queue from the head and dials each waiter's callback
/// port until one takes the grant. A successful grant consumes the
/// release's increment, keeping "value > 0 implies no waiters" true.
fn wake_any_waiter(sem: &mut Rsem) -> bool {
    for i in 0..sem.wait.len() {
        let waiter = &sem.wait[i];
        match wake_waiter(&sem.name, waiter) {
            Ok(()) => {
                sem.wait.remove(i);
                sem.val -= 1;
                return true;
            }
            Err(e) => {
                glitch!(
                    "rsem server: waiter {}:{} for '{}' unreachable: {e}",
                    waiter.addr,
                    waiter.port,
                    sem.name
                );
            }
        }
    }
    false
}

/// One grant callback: dial the waiter, send GIVE_SEM plus the grant body,
/// and demand a CLIENT_ACK back.
fn wake_waiter(name: &str, waiter: &Waiter) -> Result<(), RsemError> {
    let addr = std::net::SocketAddr::from((waiter.addr, waiter.port));
    let mut stream = TcpStream::connect_timeout(&addr, WAKE_DIAL_TIMEOUT)?;
    write_message_type(&mut stream, MessageType::ServerGiveSem).map_err(RsemError::Io)?;
    write_json_body(
        &mut stream,
        &SemGrant {
            name: name.to_string(),
        },
    )?;
    match read_message_type(&mut stream)? {
        MessageType::ClientAck => Ok(()),
        other => Err(RsemError::UnexpectedReply(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sems(names: &[(&str, u32)]) -> Vec<SemConfig> {
        names
            .iter()
            .map(|(name, init_val)| SemConfig {
                name: name.to_string(),
                init_val: *init_val,
            })
            .collect()
    }

    #[test]
    fn test_table_finds_every_configured_name() {
        let mut table =
            SemTable::build(&sems(&[("foo", 1), ("bar", 2), ("baz", 0)])).unwrap();
        assert_eq!(table.slots.len(), 6);
        for (name, val) in [("foo", 1), ("bar", 2), ("baz", 0)] {
            let sem = table.get_mut(name).unwrap();
            assert_eq!(sem.name, name);
            assert_eq!(sem.val, val);
            assert!(sem.wait.is_empty());
        }
        assert!(table.get_mut("quux").is_none());
    }

    #[test]
    fn test_table_probes_past_collisions() {
        // Enough names that some must share a slot in a 40-wide table.
        let names: Vec<String> = (0..20).map(|i| format!("sem.{i}")).collect();
        let configs: Vec<SemConfig> = names
            .iter()
            .map(|name| SemConfig {
                name: name.clone(),
                init_val: 1,
            })
            .collect();
        let mut table = SemTable::build(&configs).unwrap();
        for name in &names {
            assert!(table.get_mut(name).is_some(), "lost '{name}'");
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = SemTable::build(&sems(&[("foo", 1), ("foo", 2)])).unwrap_err();
        assert!(matches!(err, RsemError::DuplicateSem(name) if name == "foo"));
    }

    #[test]
    fn test_empty_table_finds_nothing() {
        let mut table = SemTable::build(&[]).unwrap();
        assert!(table.get_mut("anything").is_none());
    }

    #[test]
    fn test_tag_is_nonzero() {
        // Tag 0 is the fast log's "empty slot" sentinel.
        assert_ne!(crate::fastlog::TAG_RSEM_OP, 0);
    }
}
