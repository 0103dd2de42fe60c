// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The observer output service.
//!
//! One dedicated thread serves the monitor's observers: tools that connect
//! over a UNIX-domain socket and get told when daemon state changes. The
//! thread polls two fds: the self-pipe that carries kicks and the shutdown
//! byte, and the listen socket. The listen socket only joins the poll set
//! while a free observer slot exists, so a full house back-pressures new
//! connections into the kernel backlog instead of accepting and dropping
//! them.
//!
//! An observer's first notification is `full_update` (resend everything);
//! after that it gets `partial_update` per kick. A failed write drops that
//! observer alone.

use crate::glitch;
use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use shoalfs_common::net::bind_unix_listener;
use shoalfs_common::SelfPipe;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

const MAX_OBSERVER_CONNS: usize = 10;
const FULL_UPDATE: &[u8] = b"full_update";
const PARTIAL_UPDATE: &[u8] = b"partial_update";

#[derive(Clone, Copy, Eq, PartialEq)]
enum ObserverState {
    New,
    Established,
}

struct ObserverConn {
    stream: UnixStream,
    state: ObserverState,
}

pub struct OutputService {
    pipe: Arc<SelfPipe>,
    thread: Option<JoinHandle<()>>,
}

impl OutputService {
    /// Binds the observer socket (unlinking a stale file once on
    /// EADDRINUSE) and spawns the service thread.
    pub fn start(sock_path: &Path) -> anyhow::Result<Self> {
        let listener = bind_unix_listener(sock_path).with_context(|| {
            format!(
                "failed to bind observer socket '{}'",
                sock_path.display()
            )
        })?;
        let pipe = Arc::new(SelfPipe::new().context("failed to open self-pipe")?);
        let thread = {
            let pipe = Arc::clone(&pipe);
            let sock_path = sock_path.to_path_buf();
            std::thread::Builder::new()
                .name("output-service".into())
                .spawn(move || run(listener, pipe, sock_path))
                .context("failed to spawn output-service thread")?
        };
        Ok(Self {
            pipe,
            thread: Some(thread),
        })
    }

    /// Broadcasts a state-change notification to every connected observer.
    pub fn kick(&self) {
        let _ = self.pipe.notify_event();
    }

    /// Stops the service thread and waits for it. All observers and the
    /// socket path are cleaned up by the thread on its way out.
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

impl Drop for OutputService {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn run(listener: UnixListener, pipe: Arc<SelfPipe>, sock_path: PathBuf) {
    let mut conns: [Option<ObserverConn>; MAX_OBSERVER_CONNS] =
        std::array::from_fn(|_| None);

    loop {
        let have_free = conns.iter().any(Option::is_none);
        let listen_events = if have_free {
            PollFlags::POLLIN
        } else {
            PollFlags::empty()
        };
        let mut fds = [
            PollFd::new(pipe.poll_fd_borrowed(), PollFlags::POLLIN),
            PollFd::new(listener.as_fd(), listen_events),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                glitch!("output service: poll error: {e}");
                break;
            }
            Ok(_) => {}
        }
        let pipe_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let listen_ready = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        drop(fds);

        if listen_ready {
            accept_observer(&listener, &mut conns);
        }
        if pipe_ready {
            match pipe.read_byte() {
                Ok(SelfPipe::EVENT) => update_observers(&mut conns),
                // Shutdown byte, unexpected byte, or a broken pipe all
                // mean the service is done.
                _ => break,
            }
        }
    }

    drop(conns);
    drop(listener);
    let _ = std::fs::remove_file(&sock_path);
}

fn accept_observer(
    listener: &UnixListener,
    conns: &mut [Option<ObserverConn>; MAX_OBSERVER_CONNS],
) {
    let stream = match listener.accept() {
        Ok((stream, _)) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
        Err(e) => {
            glitch!("output service: accept failed: {e}");
            return;
        }
    };
    match conns.iter_mut().find(|c| c.is_none()) {
        Some(slot) => {
            *slot = Some(ObserverConn {
                stream,
                state: ObserverState::New,
            });
        }
        None => {
            // Poll gating should have prevented this accept.
            glitch!("output service: accepted with no free observer slot");
        }
    }
}

fn update_observers(conns: &mut [Option<ObserverConn>; MAX_OBSERVER_CONNS]) {
    for slot in conns.iter_mut() {
        let Some(conn) = slot else { continue };
        let payload = match conn.state {
            ObserverState::New => FULL_UPDATE,
            ObserverState::Established => PARTIAL_UPDATE,
        };
        match conn.stream.write_all(payload) {
            Ok(()) => conn.state = ObserverState::Established,
            // This observer is gone; closing its stream is the whole of
            // the cleanup.
            Err(_) => *slot = None,
        }
    }
}
