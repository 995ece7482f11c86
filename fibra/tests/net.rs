//! TCP channels driven by fibers on a single loop.

use std::net::SocketAddr;
use std::time::Duration;

use fibra::net::{TcpListener, TcpStream};
use fibra::{Error, EventLoop, Register};

const PAYLOAD_LEN: usize = 64 * 1024;

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn read_exact(stream: &TcpStream, len: usize) -> fibra::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = stream.read(len - out.len()).await?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[test]
fn echo_between_fibers_on_one_loop() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::bind(any_local()).unwrap();
    listener.register(&event_loop).unwrap();
    let addr = listener.local_addr().unwrap();

    let server_loop = event_loop.clone();
    let server = event_loop.launch(async move {
        let (stream, _peer) = listener.accept().await?;
        stream.register(&server_loop)?;
        let request = read_exact(&stream, PAYLOAD_LEN).await?;
        stream.write_all(request).await?;
        Ok::<_, Error>(())
    });

    let client_loop = event_loop.clone();
    let client = event_loop.launch(async move {
        let stream = TcpStream::connect(addr, &client_loop).await?;
        let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
        stream.write_all(payload.clone()).await?;
        let echoed = read_exact(&stream, PAYLOAD_LEN).await?;
        client_loop.stop();
        Ok::<_, Error>(echoed == payload)
    });

    let watchdog = event_loop.clone();
    event_loop.run_after(Duration::from_secs(10), move || watchdog.stop());
    event_loop.run().unwrap();

    server.get().unwrap().unwrap();
    assert!(client.get().unwrap().unwrap());
}

#[test]
fn operations_before_registration_are_rejected() {
    let listener = TcpListener::bind(any_local()).unwrap();
    let pending = fibra::Future::new();
    assert!(matches!(
        listener.accept_async(&pending),
        Err(Error::NotRegistered)
    ));
    assert!(listener.event_loop().is_none());
}

#[test]
fn cancel_fails_a_parked_accept() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::bind(any_local()).unwrap();
    listener.register(&event_loop).unwrap();

    let accepting = listener.clone();
    let outcome = event_loop.launch(async move { accepting.accept().await.map(|_| ()) });

    let canceller = listener.clone();
    let stopper = event_loop.clone();
    event_loop.run_after(Duration::from_millis(20), move || {
        canceller.cancel();
        stopper.stop();
    });
    event_loop.run().unwrap();

    assert!(matches!(outcome.get().unwrap(), Err(Error::Canceled)));
}

#[test]
fn connect_to_a_closed_port_fails() {
    let event_loop = EventLoop::new().unwrap();
    let addr = {
        let spare = std::net::TcpListener::bind(any_local()).unwrap();
        spare.local_addr().unwrap()
    };

    let connecting = event_loop.clone();
    let outcome = event_loop.launch(async move {
        let result = TcpStream::connect(addr, &connecting).await.map(|_| ());
        connecting.stop();
        result
    });
    let watchdog = event_loop.clone();
    event_loop.run_after(Duration::from_secs(10), move || watchdog.stop());
    event_loop.run().unwrap();

    let err = outcome.get().unwrap().unwrap_err();
    assert!(err.io_kind().is_some(), "unexpected error: {err}");
}
