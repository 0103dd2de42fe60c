// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Observer output-service behavior over a real UNIX-domain socket.

use shoalfs_core::output_service::OutputService;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::time::Duration;

const SETTLE: Duration = Duration::from_millis(100);

fn read_expected(stream: &mut UnixStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, expected.as_bytes());
}

#[test]
fn test_observers_get_full_then_partial_updates() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("mon.socket");
    let service = OutputService::start(&sock_path).unwrap();

    let mut first = UnixStream::connect(&sock_path).unwrap();
    let mut second = UnixStream::connect(&sock_path).unwrap();
    std::thread::sleep(SETTLE);

    service.kick();
    read_expected(&mut first, "full_update");
    read_expected(&mut second, "full_update");

    service.kick();
    read_expected(&mut first, "partial_update");
    read_expected(&mut second, "partial_update");

    // A late joiner starts from a full update while the veterans keep
    // getting deltas.
    let mut third = UnixStream::connect(&sock_path).unwrap();
    std::thread::sleep(SETTLE);
    service.kick();
    read_expected(&mut third, "full_update");
    read_expected(&mut first, "partial_update");
    read_expected(&mut second, "partial_update");

    service.shutdown();
    assert!(!sock_path.exists(), "socket path survived shutdown");
}

#[test]
fn test_disconnected_observer_is_dropped_alone() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("mon.socket");
    let service = OutputService::start(&sock_path).unwrap();

    let mut stayer = UnixStream::connect(&sock_path).unwrap();
    let leaver = UnixStream::connect(&sock_path).unwrap();
    std::thread::sleep(SETTLE);

    service.kick();
    read_expected(&mut stayer, "full_update");

    drop(leaver);
    std::thread::sleep(SETTLE);

    // The write to the dead observer fails and frees its slot; the
    // surviving observer is unaffected.
    service.kick();
    read_expected(&mut stayer, "partial_update");
    service.kick();
    read_expected(&mut stayer, "partial_update");

    service.shutdown();
}

#[test]
fn test_full_house_backpressures_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("mon.socket");
    let service = OutputService::start(&sock_path).unwrap();

    let mut observers: Vec<UnixStream> = (0..10)
        .map(|_| UnixStream::connect(&sock_path).unwrap())
        .collect();
    std::thread::sleep(SETTLE);

    service.kick();
    for obs in &mut observers {
        read_expected(obs, "full_update");
    }

    // Slot table is full: an 11th connection parks in the backlog and
    // sees no updates.
    let mut eleventh = UnixStream::connect(&sock_path).unwrap();
    std::thread::sleep(SETTLE);
    service.kick();
    eleventh
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert!(eleventh.read_exact(&mut buf).is_err());
    for obs in &mut observers {
        read_expected(obs, "partial_update");
    }

    // Freeing a slot lets the parked connection in on the next pass.
    drop(observers.remove(0));
    std::thread::sleep(SETTLE);
    service.kick(); // write failure frees the slot
    std::thread::sleep(SETTLE);
    service.kick(); // parked connection accepted, gets its full update
    read_expected(&mut eleventh, "full_update");

    service.shutdown();
}
