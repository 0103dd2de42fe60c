// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end rsem semantics over real sockets: immediate grants, delayed
//! grants via callback, FIFO ordering, release retries, and protocol
//! violations. Each test runs its own server on a kernel-assigned port and
//! its own callback-port range, so they can run concurrently.

use shoalfs_rsem::protocol::{
    read_message_type, write_json_body, write_message_type, MessageType, SemRelease,
};
use shoalfs_rsem::{RsemClient, RsemClientConfig, RsemServer, RsemServerConfig, SemConfig};
use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn start_server(sems: &[(&str, u32)]) -> RsemServer {
    let conf = RsemServerConfig {
        port: 0,
        sems: sems
            .iter()
            .map(|(name, init_val)| SemConfig {
                name: name.to_string(),
                init_val: *init_val,
            })
            .collect(),
        lc: Default::default(),
    };
    RsemServer::start(&conf).unwrap()
}

fn make_client(srv_port: u16, cli_port_start: u16, cli_port_end: u16) -> RsemClient {
    RsemClient::new(&RsemClientConfig {
        srv_host: "localhost".into(),
        srv_port,
        cli_port_start,
        cli_port_end,
    })
    .unwrap()
}

#[test]
fn test_post_then_wait_returns_immediately() {
    let server = start_server(&[("foo", 1)]);
    let client = make_client(server.port(), 42001, 42005);

    // Value goes 1 -> 2 -> 1; neither call blocks.
    client.post("foo");
    client.wait("foo").unwrap();
    server.shutdown();
}

#[test]
fn test_counting_semaphore_blocks_at_zero() {
    let server = start_server(&[("bar", 2)]);
    let client = Arc::new(make_client(server.port(), 42011, 42015));

    client.wait("bar").unwrap();
    client.wait("bar").unwrap();

    // Third take has to wait for a post.
    let third_done = Arc::new(AtomicBool::new(false));
    let third = {
        let client = Arc::clone(&client);
        let third_done = Arc::clone(&third_done);
        std::thread::spawn(move || {
            client.wait("bar").unwrap();
            third_done.store(true, Ordering::SeqCst);
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    assert!(
        !third_done.load(Ordering::SeqCst),
        "third take should have blocked"
    );

    client.post("bar");
    third.join().unwrap();
    assert!(third_done.load(Ordering::SeqCst));

    // Put both remaining takes back so the semaphore ends where it began.
    client.post("bar");
    client.post("bar");
    server.shutdown();
}

#[test]
fn test_delayed_grant_observes_writes_before_post() {
    let server = start_server(&[("baz", 0)]);
    let client = Arc::new(make_client(server.port(), 42021, 42025));
    let mcguffin = Arc::new(AtomicBool::new(false));

    let waiter = {
        let client = Arc::clone(&client);
        let mcguffin = Arc::clone(&mcguffin);
        std::thread::spawn(move || {
            client.wait("baz").unwrap();
            mcguffin.load(Ordering::SeqCst)
        })
    };

    // Let the waiter queue up, then publish and post.
    std::thread::sleep(Duration::from_millis(100));
    mcguffin.store(true, Ordering::SeqCst);
    client.post("baz");

    assert!(
        waiter.join().unwrap(),
        "the grant must happen after the post, so the flag must be visible"
    );
    server.shutdown();
}

#[test]
fn test_grants_follow_queue_order() {
    let server = start_server(&[("fifo", 0)]);
    let client = Arc::new(make_client(server.port(), 42031, 42035));
    let order = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |id: &'static str| {
        let client = Arc::clone(&client);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            client.wait("fifo").unwrap();
            order.lock().unwrap().push(id);
        })
    };

    let first = spawn_waiter("first");
    // Make sure "first" is queued before "second" even sends its request.
    std::thread::sleep(Duration::from_millis(200));
    let second = spawn_waiter("second");
    std::thread::sleep(Duration::from_millis(200));

    client.post("fifo");
    first.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first"]);

    client.post("fifo");
    second.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    server.shutdown();
}

#[test]
fn test_binary_semaphore_gives_mutual_exclusion() {
    let server = start_server(&[("mutex", 1)]);
    let client = Arc::new(make_client(server.port(), 42041, 42045));
    let in_critical = Arc::new(AtomicBool::new(false));

    let contender = |iterations: usize| {
        let client = Arc::clone(&client);
        let in_critical = Arc::clone(&in_critical);
        std::thread::spawn(move || {
            for _ in 0..iterations {
                client.wait("mutex").unwrap();
                assert!(
                    !in_critical.swap(true, Ordering::SeqCst),
                    "two holders inside the critical section"
                );
                std::thread::sleep(Duration::from_millis(5));
                in_critical.store(false, Ordering::SeqCst);
                client.post("mutex");
            }
        })
    };

    let a = contender(5);
    let b = contender(5);
    a.join().unwrap();
    b.join().unwrap();
    server.shutdown();
}

#[test]
fn test_post_retries_until_the_server_is_up() {
    // Grab a port the kernel considers free, then release it for the
    // server to claim a moment later.
    let parked = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = parked.local_addr().unwrap().port();
    drop(parked);

    let client = make_client(port, 42051, 42055);
    let poster = std::thread::spawn(move || {
        // First attempts get connection-refused; post keeps retrying.
        client.post("foo");
    });

    std::thread::sleep(Duration::from_millis(1500));
    let conf = RsemServerConfig {
        port,
        sems: vec![SemConfig {
            name: "foo".into(),
            init_val: 0,
        }],
        lc: Default::default(),
    };
    let server = RsemServer::start(&conf).unwrap();

    poster.join().unwrap();
    server.shutdown();
}

#[test]
fn test_unknown_name_gets_no_such_sem_and_mutates_nothing() {
    let server = start_server(&[("real", 1)]);

    // Raw release of a name the server has never heard of.
    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    write_message_type(&mut stream, MessageType::ClientRelSem).unwrap();
    write_json_body(
        &mut stream,
        &SemRelease {
            name: "imaginary".into(),
        },
    )
    .unwrap();
    assert_eq!(
        read_message_type(&mut stream).unwrap(),
        MessageType::ServerNoSuchSem
    );
    drop(stream);

    // The real semaphore's value is untouched: exactly one immediate take
    // is available.
    let client = Arc::new(make_client(server.port(), 42061, 42065));
    client.wait("real").unwrap();

    let second_done = Arc::new(AtomicBool::new(false));
    let second = {
        let client = Arc::clone(&client);
        let second_done = Arc::clone(&second_done);
        std::thread::spawn(move || {
            client.wait("real").unwrap();
            second_done.store(true, Ordering::SeqCst);
        })
    };
    std::thread::sleep(Duration::from_millis(200));
    assert!(!second_done.load(Ordering::SeqCst));
    client.post("real");
    second.join().unwrap();

    // Takes of unknown names are refused too.
    assert!(matches!(
        client.wait("imaginary"),
        Err(shoalfs_rsem::RsemError::NoSuchSem(_))
    ));
    server.shutdown();
}

#[test]
fn test_unknown_message_type_closes_without_reply() {
    let server = start_server(&[("real", 1)]);

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    std::io::Write::write_all(&mut stream, &0xffu32.to_be_bytes()).unwrap();

    // The server drops the connection silently: EOF, no reply bytes.
    let mut buf = [0u8; 4];
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    server.shutdown();
}
