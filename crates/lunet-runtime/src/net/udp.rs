//! UDP datagram primitive (spec §4.6): `bind`, `recv`, `send`, with
//! optional PAXE in-place decrypt/encrypt when the socket is opened with
//! `paxe: true`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use lunet_sdk::{CoroutineId, HostContext, HostValue, LunetError};

use crate::coref::CorefId;
use crate::handle::HandleCtx;
use crate::runtime::Runtime;

use super::validate_bind;

const MAX_DATAGRAM: usize = 65_507;

struct UdpState {
    socket: Arc<UdpSocket>,
    recv_busy: AtomicBool,
    paxe: bool,
}

/// A bound UDP socket.
pub type UdpCtx = HandleCtx<UdpState>;

/// Bind a UDP socket. `reuse_addr` sets `SO_REUSEADDR` before binding (spec
/// §4.6's bind options); `paxe` enables transparent PAXE
/// decrypt-on-`recv`/encrypt-on-`send` through `runtime`'s keystore.
pub async fn bind(
    runtime: &Arc<Runtime>,
    host: &str,
    port: u16,
    paxe: bool,
    reuse_addr: bool,
) -> Result<u64, LunetError> {
    let ctx = bind_ctx(runtime, host, port, paxe, reuse_addr).await?;
    Ok(runtime.udp_sockets.insert(ctx))
}

/// Same as [`bind`] but returns the context directly instead of registering
/// it; used internally by tests that want to drive the socket without going
/// through the numeric handle table.
async fn bind_ctx(
    runtime: &Arc<Runtime>,
    host: &str,
    port: u16,
    paxe: bool,
    reuse_addr: bool,
) -> Result<UdpCtx, LunetError> {
    validate_bind(runtime, host, port)?;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| LunetError::ArgumentError(format!("bad bind address: {e}")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(LunetError::from)?;
    if reuse_addr {
        socket.set_reuse_address(true).map_err(LunetError::from)?;
    }
    socket.set_nonblocking(true).map_err(LunetError::from)?;
    socket.bind(&addr.into()).map_err(LunetError::from)?;
    let socket = UdpSocket::from_std(socket.into()).map_err(LunetError::from)?;

    Ok(HandleCtx::new(UdpState {
        socket: Arc::new(socket),
        recv_busy: AtomicBool::new(false),
        paxe: paxe && runtime.config.paxe_enabled,
    }))
}

/// Receive one datagram, suspending `coroutine` until one arrives. When the
/// socket was bound with PAXE enabled, the payload is decrypted in place
/// before being handed to the host; decrypt failures surface as a generic
/// protocol error, never the underlying AEAD failure reason (spec §4.8's
/// oracle-avoidance rule, [`lunet_sdk::LunetError::is_oracle_sensitive`]).
pub fn recv(
    runtime: &Arc<Runtime>,
    udp: &UdpCtx,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
) -> Result<(), LunetError> {
    let claimed = udp
        .with_data(|state| {
            if state.recv_busy.swap(true, Ordering::AcqRel) {
                return Err(LunetError::InvariantViolation(
                    "concurrent recv on the same UDP socket".into(),
                ));
            }
            Ok((Arc::clone(&state.socket), state.paxe))
        })
        .ok_or_else(|| LunetError::LifecycleError("socket is closed".into()))??;
    let (socket, paxe) = claimed;
    let coref = runtime.coref_registry.create(coroutine);
    runtime.alive_set.mark_alive(coroutine);
    let udp = udp.clone();
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let result = socket.recv_from(&mut buf).await;
        runtime.net_trace.incr("udp_recv");
        let completion = match result {
            Ok((n, from)) => {
                buf.truncate(n);
                build_recv_completion(&runtime, paxe, buf, from)
            }
            Err(e) => Err(LunetError::from(e).to_string()),
        };
        finish_recv(&runtime, &udp, host.as_ref(), coref, completion);
    });
    Ok(())
}

fn build_recv_completion(
    runtime: &Runtime,
    paxe: bool,
    mut buf: Vec<u8>,
    from: SocketAddr,
) -> Result<HostValue, String> {
    if !paxe {
        return Ok(HostValue::tuple([
            HostValue::Bytes(buf),
            HostValue::Addr(from.to_string()),
        ]));
    }
    match runtime.paxe_decoder.try_decrypt(&mut buf) {
        Ok(outcome) => {
            buf.truncate(outcome.plaintext_len);
            Ok(HostValue::tuple([
                HostValue::Bytes(buf),
                HostValue::Addr(from.to_string()),
                HostValue::Int(outcome.key_id as i64),
                HostValue::Int(outcome.flags as i64),
            ]))
        }
        Err(_) => Err(LunetError::ProtocolError("paxe decrypt failed".into()).to_string()),
    }
}

fn finish_recv(
    runtime: &Runtime,
    udp: &UdpCtx,
    host: &dyn HostContext,
    coref: CorefId,
    completion: Result<HostValue, String>,
) {
    let closing = udp.with_data(|state| state.recv_busy.store(false, Ordering::Release));
    if closing.is_none() || udp.is_closing() {
        runtime.coref_registry.release(coref);
        return;
    }
    let coroutine = runtime.coref_registry.release(coref);
    if let Some(coroutine) = coroutine {
        let status = host.resume(coroutine, completion);
        if !status.is_suspended() {
            runtime.alive_set.remove(coroutine);
        }
    }
}

/// Send one datagram. Unlike `recv`, multiple sends may be outstanding at
/// once (spec §4.6: "send has no single-outstanding-call restriction",
/// since UDP sends do not contend over a shared read cursor).
pub fn send(
    runtime: &Arc<Runtime>,
    udp: &UdpCtx,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    to: SocketAddr,
    data: Vec<u8>,
    key_id: Option<u32>,
) -> Result<(), LunetError> {
    let claimed = udp
        .with_data(|state| (Arc::clone(&state.socket), state.paxe))
        .ok_or_else(|| LunetError::LifecycleError("socket is closed".into()))?;
    let (socket, paxe) = claimed;
    runtime.alive_set.mark_alive(coroutine);
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let payload = if paxe {
            match key_id {
                Some(id) => match runtime.paxe_encoder.encrypt_standard(&data, id) {
                    Ok(packet) => packet.into_bytes(),
                    Err(e) => {
                        let status = host.resume(coroutine, Err(e.to_string()));
                        if !status.is_suspended() {
                            runtime.alive_set.remove(coroutine);
                        }
                        return;
                    }
                },
                None => {
                    let status = host.resume(
                        coroutine,
                        Err(LunetError::ArgumentError(
                            "paxe-enabled socket requires a key_id for send".into(),
                        )
                        .to_string()),
                    );
                    if !status.is_suspended() {
                        runtime.alive_set.remove(coroutine);
                    }
                    return;
                }
            }
        } else {
            data
        };
        let result = socket.send_to(&payload, to).await;
        runtime.net_trace.incr("udp_send");
        let completion = match result {
            Ok(n) => Ok(HostValue::Int(n as i64)),
            Err(e) => Err(LunetError::from(e).to_string()),
        };
        let status = host.resume(coroutine, completion);
        if !status.is_suspended() {
            runtime.alive_set.remove(coroutine);
        }
    });
    Ok(())
}

/// Close a UDP socket. Idempotent, same as TCP's `close`.
pub fn close(udp: &UdpCtx) {
    udp.mark_closing();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use lunet_sdk::ResumeStatus;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHost {
        calls: StdMutex<Vec<(CoroutineId, Result<HostValue, String>)>>,
    }

    impl HostContext for RecordingHost {
        fn resume(&self, id: CoroutineId, completion: Result<HostValue, String>) -> ResumeStatus {
            self.calls.lock().unwrap().push((id, completion));
            ResumeStatus::Completed
        }
    }

    #[tokio::test]
    async fn send_then_recv_round_trip_without_paxe() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let a = bind_ctx(&runtime, "127.0.0.1", 0, false, false).await.unwrap();
        let b = bind_ctx(&runtime, "127.0.0.1", 0, false, false).await.unwrap();
        let b_addr = b.with_data(|s| s.socket.local_addr().unwrap()).unwrap();

        let recorder = Arc::new(RecordingHost::default());
        let host: Arc<dyn HostContext> = recorder.clone();

        recv(&runtime, &b, Arc::clone(&host), CoroutineId(1)).unwrap();
        send(
            &runtime,
            &a,
            Arc::clone(&host),
            CoroutineId(2),
            b_addr,
            b"ping".to_vec(),
            None,
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let recv_call = calls.iter().find(|(id, _)| *id == CoroutineId(1)).unwrap();
        match &recv_call.1 {
            Ok(HostValue::Tuple(values)) => {
                assert_eq!(values[0], HostValue::Bytes(b"ping".to_vec()));
            }
            other => panic!("unexpected recv completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_recv_is_rejected() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let sock = bind_ctx(&runtime, "127.0.0.1", 0, false, false).await.unwrap();
        let recorder = Arc::new(RecordingHost::default());
        let host: Arc<dyn HostContext> = recorder.clone();
        recv(&runtime, &sock, Arc::clone(&host), CoroutineId(1)).unwrap();
        assert!(recv(&runtime, &sock, host, CoroutineId(2)).is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let sock = bind_ctx(&runtime, "127.0.0.1", 0, false, false).await.unwrap();
        close(&sock);
        close(&sock);
        assert!(sock.is_closing());
    }
}
