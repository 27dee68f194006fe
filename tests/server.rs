use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use hive_net::{EventLoop, TcpServer, TcpServerOption};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn start_server<F>(
    num_threads: usize,
    configure: F,
) -> (Arc<EventLoop>, SocketAddr, thread::JoinHandle<()>)
where
    F: FnOnce(&TcpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &event_loop,
            &"127.0.0.1:0".parse().unwrap(),
            "test",
            TcpServerOption::NoReusePort,
        )
        .unwrap();

        server.set_thread_num(num_threads);
        configure(&server);
        server.start().unwrap();

        tx.send((event_loop.clone(), server.listen_addr().unwrap()))
            .unwrap();

        event_loop.run();
    });

    let (event_loop, addr) = rx.recv().unwrap();
    (event_loop, addr, handle)
}

#[test]
fn echo_single_worker() {
    let (state_tx, state_rx) = mpsc::channel();

    let (event_loop, addr, handle) = start_server(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            state_tx.send(conn.connected()).unwrap();
        }));
        server.set_message_callback(Arc::new(|conn, buffer, _| {
            let data = buffer.retrieve_all_as_vec();
            conn.send(&data);
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(state_rx.recv_timeout(RECV_TIMEOUT).unwrap());

    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    drop(client);
    assert!(!state_rx.recv_timeout(RECV_TIMEOUT).unwrap());

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn round_robin_distribution() {
    let (loop_tx, loop_rx) = mpsc::channel();

    let (event_loop, addr, handle) = start_server(4, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                loop_tx.send(Arc::as_ptr(conn.get_loop()) as usize).unwrap();
            }
        }));
    });

    let mut clients = Vec::new();
    let mut loops = Vec::new();
    for _ in 0..8 {
        // connect one at a time so accepts happen in a known order
        clients.push(TcpStream::connect(addr).unwrap());
        loops.push(loop_rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }

    let distinct: HashSet<usize> = loops[..4].iter().copied().collect();
    assert_eq!(distinct.len(), 4, "first four accepts hit four workers");
    assert_eq!(loops[..4], loops[4..], "second round repeats the rotation");

    // workers only, never the base loop
    assert!(!loops.contains(&(Arc::as_ptr(&event_loop) as usize)));

    drop(clients);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn high_water_mark_then_write_complete() {
    const PAYLOAD: usize = 8 * 1024 * 1024;

    let (event_tx, event_rx) = mpsc::channel();

    let hwm_tx = event_tx.clone();
    let wc_tx = event_tx.clone();
    let (event_loop, addr, handle) = start_server(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let tx = hwm_tx.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, size| tx.send(("hwm", size)).unwrap()),
                    1024,
                );
            }
        }));
        server.set_message_callback(Arc::new(|conn, buffer, _| {
            buffer.retrieve_all();
            conn.send(&vec![0u8; PAYLOAD]);
        }));
        server.set_write_complete_callback(Arc::new(move |_conn| {
            wc_tx.send(("write_complete", 0)).unwrap();
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();

    // one byte so the message callback fires exactly once; the peer does not
    // read yet, so the bulk of the payload has to queue in the output buffer
    client.write_all(b"g").unwrap();

    let (kind, size) = event_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(kind, "hwm");
    assert!(size >= 1024);

    let mut total = 0;
    let mut buf = vec![0u8; 64 * 1024];
    while total < PAYLOAD {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before the payload finished");
        total += n;
    }
    assert_eq!(total, PAYLOAD);

    let (kind, _) = event_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(kind, "write_complete");

    // both callbacks fire exactly once
    assert!(event_rx.recv_timeout(Duration::from_millis(300)).is_err());

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn graceful_shutdown_flushes_pending_output() {
    const PAYLOAD: usize = 1024 * 1024;

    let (event_loop, addr, handle) = start_server(1, |server| {
        server.set_connection_callback(Arc::new(|conn| {
            if conn.connected() {
                conn.send(&vec![1u8; PAYLOAD]);
                // half-close happens only after the buffered tail drains
                conn.shutdown();
            }
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let mut data = Vec::new();
    client.read_to_end(&mut data).unwrap();

    assert_eq!(data.len(), PAYLOAD);
    assert!(data.iter().all(|&b| b == 1));

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn cross_thread_send() {
    let (conn_tx, conn_rx) = mpsc::channel();

    let (event_loop, addr, handle) = start_server(1, move |server| {
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn_tx.send(conn.clone()).unwrap();
            }
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let conn = conn_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // the worker is idle in poll; this posts the write from a foreign thread
    conn.send(b"x");

    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"x");

    drop(client);
    drop(conn);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn unconsumed_bytes_persist_across_messages() {
    // the message callback consumes only complete 4-byte frames; a split
    // frame must survive in the input buffer until the rest arrives
    let (frame_tx, frame_rx) = mpsc::channel();

    let (event_loop, addr, handle) = start_server(1, move |server| {
        server.set_message_callback(Arc::new(move |_conn, buffer, _| {
            while buffer.readable_bytes() >= 4 {
                frame_tx.send(buffer.retrieve_as_vec(4)).unwrap();
            }
        }));
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"abcdef").unwrap();

    assert_eq!(frame_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"abcd");

    client.write_all(b"gh").unwrap();
    assert_eq!(frame_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"efgh");

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn server_start_is_idempotent() {
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            &event_loop,
            &"127.0.0.1:0".parse().unwrap(),
            "test",
            TcpServerOption::NoReusePort,
        )
        .unwrap();

        server.set_thread_num(1);
        server.start().unwrap();
        server.start().unwrap();

        tx.send((event_loop.clone(), server.listen_addr().unwrap()))
            .unwrap();
        event_loop.run();
    });

    let (event_loop, addr) = rx.recv().unwrap();

    // still accepts exactly as if started once
    let client = TcpStream::connect(addr).unwrap();
    drop(client);

    event_loop.quit();
    handle.join().unwrap();
}
