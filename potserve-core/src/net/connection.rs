// MIT License
// Copyright 2023--present potserve developers

//! One client connection: read a request, evaluate, write the response,
//! repeat until the peer hangs up or something goes wrong.
//!
//! There is no error frame in the protocol. Any failure closes the
//! connection and the peer sees EOF.

use std::future::Future;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::control::{ActiveHandler, ControlHandle};
use crate::error::{ConnectionError, HandlerError, ProtocolError};
use crate::potential::{Evaluation, ForceInput, SharedPotential};
use crate::status::panic_message;
use crate::wire::{self, IntWidth, PayloadLayout, Request, WIDTH_TAG_SIZE};

/// Upper bound on the buffer reserved for one payload section before any of
/// it has arrived.
const SECTION_PREALLOC: usize = 64 * 1024;

/// Per-connection bounds taken from the server configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionLimits {
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    pub max_atoms: usize,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            recv_timeout: config.recv_timeout(),
            send_timeout: config.send_timeout(),
            max_atoms: config.max_atoms,
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

async fn timed<F, T>(limit: Duration, fut: F) -> Result<T, ConnectionError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::Timeout(limit)),
    }
}

/// Read the width tag. `Ok(None)` means the peer closed cleanly between
/// requests.
async fn read_width_tag<S>(stream: &mut S, limit: Duration) -> Result<Option<IntWidth>, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut tag = [0u8; WIDTH_TAG_SIZE];
    let mut filled = 0;
    while filled < WIDTH_TAG_SIZE {
        let n = timed(limit, stream.read(&mut tag[filled..])).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated {
                expected: WIDTH_TAG_SIZE,
                actual: filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(Some(IntWidth::from_tag(tag)?))
}

async fn read_request<S>(
    stream: &mut S,
    width: IntWidth,
    limits: &ConnectionLimits,
) -> Result<Request, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    let count = &mut buf[..width.bytes()];
    timed(limits.recv_timeout, stream.read_exact(count)).await?;
    let n_atoms = wire::decode_atom_count(width, count, limits.max_atoms)?;
    debug!(int_width = width.bytes(), n_atoms, "request header");

    let layout = PayloadLayout::new(width, n_atoms);
    let numbers = read_section(stream, layout.atomic_numbers_len(), limits.recv_timeout).await?;
    let positions = read_section(stream, layout.positions_len(), limits.recv_timeout).await?;
    let contributing = read_section(stream, layout.contributing_len(), limits.recv_timeout).await?;
    Ok(wire::decode_payload(layout, &numbers, &positions, &contributing)?)
}

/// Read exactly `len` bytes. The buffer grows with the bytes actually
/// received, never with the size the peer claims.
async fn read_section<S>(stream: &mut S, len: usize, limit: Duration) -> Result<Vec<u8>, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(len.min(SECTION_PREALLOC));
    timed(limit, (&mut *stream).take(len as u64).read_to_end(&mut buf)).await?;
    if buf.len() < len {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, peer sent {}", buf.len()),
        )
        .into());
    }
    Ok(buf)
}

/// Run `handler` on `request`, turning a panic into a [`HandlerError`].
pub fn evaluate(handler: &SharedPotential, request: &Request) -> Result<Evaluation, HandlerError> {
    let input = ForceInput::from(request);
    std::panic::catch_unwind(AssertUnwindSafe(|| handler.compute(&input)))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

/// Serve requests on `stream` until the peer disconnects or a request fails.
///
/// Pending reloads are applied once a request has been read, before it is
/// evaluated. A pending shutdown ends the loop between requests. Returns the number of requests answered.
pub async fn handle_connection<S>(
    stream: &mut S,
    active: &mut ActiveHandler,
    control: &ControlHandle,
    limits: &ConnectionLimits,
) -> Result<u64, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut served = 0;
    loop {
        if control.is_shutdown_requested() {
            debug!("shutdown requested, closing connection");
            return Ok(served);
        }

        let Some(width) = read_width_tag(stream, limits.recv_timeout).await? else {
            return Ok(served);
        };
        let request = read_request(stream, width, limits).await?;
        let n_atoms = request.n_atoms();

        // A reload requested while this peer was idle applies here. The
        // handler is then pinned for the request; a later reload only
        // affects the next one.
        active.apply_pending(control);
        let handler = active.current();
        let started = Instant::now();
        let evaluation = evaluate(&handler, &request)?;
        let response = wire::encode_response(&evaluation, n_atoms)?;

        timed(limits.send_timeout, stream.write_all(&response)).await?;
        timed(limits.send_timeout, stream.flush()).await?;

        served += 1;
        info!(
            n_atoms,
            handler = handler.name(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1e3,
            "request served"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lennard_jones::{LennardJones, LennardJonesParams};
    use crate::error::ReloadError;
    use crate::potential::FnPotential;
    use crate::registry::FnSource;
    use crate::wire::{decode_response, encode_request, response_len};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn lj_active() -> ActiveHandler {
        ActiveHandler::new(Arc::new(LennardJones::new(LennardJonesParams::default()).unwrap()))
    }

    fn dimer() -> Request {
        Request::new(vec![2, 2], vec![[0.0, 0.0, 0.0], [3.0, 0.0, 0.0]])
    }

    #[tokio::test]
    async fn serves_requests_until_clean_eof() {
        let (mut client, mut server) = duplex(4096);
        let control = ControlHandle::default();
        let task = tokio::spawn(async move {
            let mut active = lj_active();
            handle_connection(&mut server, &mut active, &control, &ConnectionLimits::default()).await
        });

        for width in [IntWidth::Four, IntWidth::Eight] {
            let request = dimer().with_int_width(width);
            client.write_all(&encode_request(&request).unwrap()).await.unwrap();
            let mut buf = vec![0u8; response_len(2)];
            client.read_exact(&mut buf).await.unwrap();
            let eval = decode_response(&buf, 2).unwrap();
            assert!(eval.energy < 0.0);
            assert_eq!(eval.forces[0][0], -eval.forces[1][0]);
        }
        drop(client);

        assert_eq!(task.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn bad_width_tag_is_malformed_header() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&7i32.to_le_bytes()).await.unwrap();
        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::MalformedHeader(7))));
    }

    #[tokio::test]
    async fn partial_width_tag_is_truncated() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[4, 0]).await.unwrap();
        drop(client);
        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::Truncated { expected: 4, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn invalid_atom_counts_never_reach_handler() {
        for n_atoms in [0i32, -3, 11] {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let mut active = ActiveHandler::new(Arc::new(FnPotential::new("count", move |input: &ForceInput<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Evaluation::zeros(input.n_atoms()))
            })));
            let limits = ConnectionLimits {
                max_atoms: 10,
                ..Default::default()
            };

            let (mut client, mut server) = duplex(64);
            let mut frame = 4i32.to_le_bytes().to_vec();
            frame.extend_from_slice(&n_atoms.to_le_bytes());
            client.write_all(&frame).await.unwrap();

            let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &limits)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ConnectionError::Protocol(ProtocolError::InvalidAtomCount { .. })
            ));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn short_payload_is_transport_error() {
        let (mut client, mut server) = duplex(256);
        let frame = encode_request(&dimer()).unwrap();
        client.write_all(&frame[..frame.len() - 5]).await.unwrap();
        drop(client);
        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(_)));
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&4i32.to_le_bytes()).await.unwrap();
        let limits = ConnectionLimits {
            recv_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
        drop(client);
    }

    #[tokio::test]
    async fn handler_panic_closes_connection() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&encode_request(&dimer()).unwrap()).await.unwrap();
        let mut active = ActiveHandler::new(Arc::new(FnPotential::new("boom", |_: &ForceInput<'_>| {
            panic!("exploded")
        })));
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        match err {
            ConnectionError::Handler(HandlerError::Panicked(msg)) => assert_eq!(msg, "exploded"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_force_count_closes_connection() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&encode_request(&dimer()).unwrap()).await.unwrap();
        let mut active = ActiveHandler::new(Arc::new(FnPotential::new("short", |_: &ForceInput<'_>| {
            Ok(Evaluation::zeros(1))
        })));
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::ForceCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn oversized_atom_claim_fails_without_reserving_payload() {
        let (mut client, mut server) = duplex(64);
        let mut frame = 8i32.to_le_bytes().to_vec();
        frame.extend_from_slice(&1_000_000_000i64.to_le_bytes());
        client.write_all(&frame).await.unwrap();
        drop(client);

        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        match err {
            ConnectionError::Transport(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn constant(name: &'static str, energy: f64) -> SharedPotential {
        Arc::new(FnPotential::new(name, move |input: &ForceInput<'_>| {
            Ok(Evaluation {
                energy,
                forces: vec![[0.0; 3]; input.n_atoms()],
            })
        }))
    }

    async fn round_trip(client: &mut tokio::io::DuplexStream) -> Evaluation {
        client.write_all(&encode_request(&dimer()).unwrap()).await.unwrap();
        let mut buf = vec![0u8; response_len(2)];
        client.read_exact(&mut buf).await.unwrap();
        decode_response(&buf, 2).unwrap()
    }

    #[tokio::test]
    async fn reload_applies_to_next_request_on_open_connection() {
        let generation = Arc::new(AtomicUsize::new(1));
        let loads = Arc::clone(&generation);
        let source = Arc::new(FnSource::new("counter", move || {
            match loads.fetch_add(1, Ordering::SeqCst) {
                1 => Ok(constant("second", 2.0)),
                _ => Err(ReloadError::UnknownPotential("gone".into())),
            }
        }));
        let control = ControlHandle::default();
        let server_control = control.clone();
        let (mut client, mut server) = duplex(4096);
        let task = tokio::spawn(async move {
            let mut active = ActiveHandler::with_source(constant("first", 1.0), source);
            let served =
                handle_connection(&mut server, &mut active, &server_control, &ConnectionLimits::default()).await;
            (served, active.current().name().to_string())
        });

        assert_eq!(round_trip(&mut client).await.energy, 1.0);

        control.request_reload();
        assert_eq!(round_trip(&mut client).await.energy, 2.0);

        // The source now fails; the loaded handler keeps answering.
        control.request_reload();
        assert_eq!(round_trip(&mut client).await.energy, 2.0);
        drop(client);

        let (served, name) = task.await.unwrap();
        assert_eq!(served.unwrap(), 3);
        assert_eq!(name, "second");
        assert_eq!(generation.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn response_to_departed_peer_is_transport_error() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&encode_request(&dimer()).unwrap()).await.unwrap();
        drop(client);

        let mut active = lj_active();
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &ConnectionLimits::default())
            .await
            .unwrap_err();
        match err {
            ConnectionError::Transport(e) => assert_eq!(e.kind(), ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_that_never_reads_times_out_on_send() {
        let (mut client, mut server) = duplex(64);
        let request = Request::new(vec![1; 10], vec![[0.0; 3]; 10]);
        let frame = encode_request(&request).unwrap();
        let writer = tokio::spawn(async move {
            client.write_all(&frame).await.unwrap();
            client
        });

        let mut active = ActiveHandler::new(constant("zeros", 0.0));
        let limits = ConnectionLimits {
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let err = handle_connection(&mut server, &mut active, &ControlHandle::default(), &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(t) if t == Duration::from_millis(50)));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn pending_shutdown_stops_before_reading() {
        let (_client, mut server) = duplex(64);
        let control = ControlHandle::default();
        control.request_shutdown();
        let mut active = lj_active();
        let served = handle_connection(&mut server, &mut active, &control, &ConnectionLimits::default())
            .await
            .unwrap();
        assert_eq!(served, 0);
    }
}
