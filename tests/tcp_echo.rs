//! End-to-end scenario driving a listener and a client socket through one
//! loop: connect, exchange a message, half-close, confirm EOF.

#![cfg(unix)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use reactor_core::{Loop, RunMode};

#[test]
fn ping_pong_over_loopback() {
    let mut loop_ = Loop::new().unwrap();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let accept_ready = Rc::new(RefCell::new(false));
    let accept_ready_cb = accept_ready.clone();

    let listener_id = loop_
        .tcp_listen(addr, 16, move |res| {
            assert!(res.is_ok());
            *accept_ready_cb.borrow_mut() = true;
        })
        .unwrap();
    let bound_addr = loop_.tcp_local_addr(listener_id).unwrap();

    let client_id = loop_.tcp_connect(bound_addr).unwrap();

    // Drive the loop (non-blocking ticks) until the listener's readiness
    // callback has fired for the incoming connection.
    for _ in 0..100 {
        if *accept_ready.borrow() {
            break;
        }
        loop_.run(RunMode::NoWait);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(*accept_ready.borrow(), "listener never saw the connection");

    let server_id = loop_.tcp_accept(listener_id).unwrap().expect("pending connection");

    let server_received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let server_received_cb = server_received.clone();
    loop_
        .tcp_read_start(
            server_id,
            Box::new(|size| BytesMut::with_capacity(size)),
            Box::new(move |res| {
                if let Ok(bytes) = res {
                    server_received_cb.borrow_mut().extend_from_slice(&bytes);
                }
            }),
        )
        .unwrap();

    let write_done = Rc::new(RefCell::new(false));
    let write_done_cb = write_done.clone();
    loop_
        .tcp_write(client_id, Bytes::from_static(b"ping"), move |res| {
            assert!(res.is_ok());
            *write_done_cb.borrow_mut() = true;
        })
        .unwrap();

    for _ in 0..100 {
        if *write_done.borrow() && server_received.borrow().len() >= 4 {
            break;
        }
        loop_.run(RunMode::NoWait);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    assert_eq!(&*server_received.borrow(), b"ping");

    loop_.tcp_shutdown(client_id).unwrap();
    let closed = Rc::new(RefCell::new(0));
    for id in [client_id, server_id, listener_id] {
        let closed = closed.clone();
        loop_.close(id, move || *closed.borrow_mut() += 1);
    }
    loop_.run(RunMode::NoWait);
    loop_.run(RunMode::NoWait);
    assert_eq!(*closed.borrow(), 3);
}
