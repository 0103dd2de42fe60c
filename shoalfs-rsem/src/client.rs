// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The rsem client library.
//!
//! `post` (release) and `wait` (take) against the coordinator. Each
//! operation is a short-lived TCP exchange; a take that cannot be granted
//! immediately leaves the client listening on a reserved callback port for
//! the server's dial-back. The callback ports come from a configured range
//! and are handed out from a stack under a mutex; a thread that wants one
//! while all are lent out blocks on the condvar until a sibling finishes.

use crate::config::RsemClientConfig;
use crate::protocol::{
    read_json_body, read_message_type, write_json_body, write_message_type, MessageType,
    SemGrant, SemRelease, SemRequest,
};
use crate::RsemError;
use shoalfs_common::net::connect_to_host;
use shoalfs_core::glitch;
use std::net::TcpListener;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Spacing between release retries while the server is unreachable.
const POST_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct RsemClient {
    srv_host: String,
    srv_port: u16,
    free_ports: Mutex<Vec<u16>>,
    port_cond: Condvar,
}

/// Loan of one callback port; returns it to the stack on drop, on every
/// path out of `wait`.
struct PortGuard<'a> {
    client: &'a RsemClient,
    port: u16,
}

impl Drop for PortGuard<'_> {
    fn drop(&mut self) {
        let mut ports = self.client.lock_ports();
        ports.push(self.port);
        self.client.port_cond.notify_one();
    }
}

impl RsemClient {
    /// Validates the port range and pre-populates the free-port stack in
    /// descending order, so the lowest port is lent out first.
    pub fn new(conf: &RsemClientConfig) -> Result<Self, RsemError> {
        conf.validate()?;
        let free_ports: Vec<u16> = (conf.cli_port_start..=conf.cli_port_end).rev().collect();
        Ok(Self {
            srv_host: conf.srv_host.clone(),
            srv_port: conf.srv_port,
            free_ports: Mutex::new(free_ports),
            port_cond: Condvar::new(),
        })
    }

    fn lock_ports(&self) -> MutexGuard<'_, Vec<u16>> {
        self.free_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve_port(&self) -> PortGuard<'_> {
        let mut ports = self.lock_ports();
        loop {
            if let Some(port) = ports.pop() {
                return PortGuard { client: self, port };
            }
            ports = self
                .port_cond
                .wait(ports)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Releases `name`, retrying until the server acknowledges. The caller
    /// holds the semaphore, so giving up is not an option; the retry loop
    /// rides out server restarts.
    pub fn post(&self, name: &str) {
        loop {
            match self.post_once(name) {
                Ok(()) => return,
                Err(e) => {
                    glitch!("rsem post '{name}' failed, retrying: {e}");
                    std::thread::sleep(POST_RETRY_DELAY);
                }
            }
        }
    }

    fn post_once(&self, name: &str) -> Result<(), RsemError> {
        let mut stream = connect_to_host(&self.srv_host, self.srv_port)?;
        write_message_type(&mut stream, MessageType::ClientRelSem).map_err(RsemError::Io)?;
        write_json_body(
            &mut stream,
            &SemRelease {
                name: name.to_string(),
            },
        )?;
        match read_message_type(&mut stream)? {
            MessageType::ServerAck => Ok(()),
            MessageType::ServerNoSuchSem => Err(RsemError::NoSuchSem(name.to_string())),
            other => Err(RsemError::UnexpectedReply(other)),
        }
    }

    /// Takes `name`, blocking until the semaphore is granted or the
    /// exchange fails outright. There is no timeout: a held-up take only
    /// resolves when some holder posts.
    pub fn wait(&self, name: &str) -> Result<(), RsemError> {
        let guard = self.reserve_port();
        // Listen before the request goes out so the server's callback
        // cannot beat the listener into existence.
        let listener = TcpListener::bind(("0.0.0.0", guard.port))?;

        let mut stream = connect_to_host(&self.srv_host, self.srv_port)?;
        write_message_type(&mut stream, MessageType::ClientReqSem).map_err(RsemError::Io)?;
        write_json_body(
            &mut stream,
            &SemRequest {
                name: name.to_string(),
                port: guard.port,
            },
        )?;
        let resp = read_message_type(&mut stream)?;
        drop(stream);

        match resp {
            MessageType::ServerGiveSem => Ok(()),
            MessageType::ServerDelaySem => wait_for_callback(name, &listener),
            MessageType::ServerNoSuchSem => Err(RsemError::NoSuchSem(name.to_string())),
            other => Err(RsemError::UnexpectedReply(other)),
        }
        // guard drops here: the callback port goes back on the stack.
    }
}

/// Blocks on the callback listener until the server dials back with the
/// grant, verifies it names the right semaphore, and acks it.
fn wait_for_callback(name: &str, listener: &TcpListener) -> Result<(), RsemError> {
    let mut stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RsemError::Io(e)),
        }
    };
    match read_message_type(&mut stream)? {
        MessageType::ServerGiveSem => {}
        other => return Err(RsemError::UnexpectedReply(other)),
    }
    let grant: SemGrant = read_json_body(&mut stream)?;
    if grant.name != name {
        glitch!(
            "rsem wait: server granted '{}', but '{}' was requested",
            grant.name,
            name
        );
        return Err(RsemError::GrantMismatch {
            got: grant.name,
            want: name.to_string(),
        });
    }
    write_message_type(&mut stream, MessageType::ClientAck).map_err(RsemError::Io)?;
    Ok(())
}
