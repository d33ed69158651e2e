//! TCP and Unix-domain stream primitives (spec §4.5): `listen`, `accept`,
//! `read`, `write`, `connect`, `close`.
//!
//! The event loop is tokio's reactor. Each `read`/`write`/`connect` submits
//! a request to the event loop and suspends by spawning a `tokio::task`
//! that awaits the underlying socket call and, on completion, runs the same
//! four-step callback-guard template `handle.rs` establishes (look up the
//! handle's data, check `is_closing`, release the coref, call
//! `HostContext::resume`) before the task exits. `accept` is different: a
//! background task spawned once at `listen` time runs the accept loop for
//! as long as the listener lives, independent of any particular `accept()`
//! call, and either resolves a waiting coroutine directly or enqueues the
//! new connection into `pending_accepts` (spec §8 scenario 2).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;

use lunet_sdk::{CoroutineId, HostContext, HostValue, LunetError};

use crate::coref::CorefId;
use crate::handle::HandleCtx;
use crate::runtime::Runtime;

use super::validate_bind;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-connection state. Only one read and one write may be outstanding at
/// a time (tracked by `read_coref`/`write_coref`), but a read and a write
/// may run concurrently against the same connection (spec §8 scenario 1) —
/// the halves are independent `tokio::sync::Mutex`es for exactly that
/// reason, never one lock shared between directions.
struct ConnState {
    reader: Arc<AsyncMutex<BoxedReader>>,
    writer: Arc<AsyncMutex<BoxedWriter>>,
    read_coref: Option<CorefId>,
    write_coref: Option<CorefId>,
    peer_addr: String,
}

/// A live TCP or Unix connection, shared between script and the event loop.
pub type ConnCtx = HandleCtx<ConnState>;

struct ListenerState {
    pending_accepts: VecDeque<ConnCtx>,
    accept_waiter: Option<(CorefId, CoroutineId)>,
    backlog: usize,
}

/// A listening TCP or Unix socket.
pub type ListenerCtx = HandleCtx<ListenerState>;

fn build_conn_ctx<R, W>(reader: R, writer: W, peer_addr: String) -> ConnCtx
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    HandleCtx::new(ConnState {
        reader: Arc::new(AsyncMutex::new(Box::new(reader))),
        writer: Arc::new(AsyncMutex::new(Box::new(writer))),
        read_coref: None,
        write_coref: None,
        peer_addr,
    })
}

/// Bind and start listening on a loopback TCP address (spec §4.5 `listen`,
/// backlog fixed at `runtime.config.accept_backlog`, default 128).
pub async fn listen_tcp(
    runtime: &Arc<Runtime>,
    host_ctx: Arc<dyn HostContext>,
    host: &str,
    port: u16,
) -> Result<u64, LunetError> {
    validate_bind(runtime, host, port)?;
    let listener = TcpListener::bind((host, port)).await?;
    let ctx = HandleCtx::new(ListenerState {
        pending_accepts: VecDeque::new(),
        accept_waiter: None,
        backlog: runtime.config.accept_backlog,
    });
    spawn_tcp_accept_loop(Arc::clone(runtime), listener, ctx.clone(), host_ctx);
    Ok(runtime.tcp_listeners.insert(ctx))
}

/// Bind and start listening on a Unix-domain socket path.
pub async fn listen_unix(
    runtime: &Arc<Runtime>,
    host_ctx: Arc<dyn HostContext>,
    path: &str,
) -> Result<u64, LunetError> {
    let listener = UnixListener::bind(path)
        .map_err(|e| LunetError::IoError(format!("bind {path}: {e}")))?;
    let ctx = HandleCtx::new(ListenerState {
        pending_accepts: VecDeque::new(),
        accept_waiter: None,
        backlog: runtime.config.accept_backlog,
    });
    spawn_unix_accept_loop(Arc::clone(runtime), listener, ctx.clone(), host_ctx);
    Ok(runtime.tcp_listeners.insert(ctx))
}

fn spawn_tcp_accept_loop(
    runtime: Arc<Runtime>,
    listener: TcpListener,
    ctx: ListenerCtx,
    host: Arc<dyn HostContext>,
) {
    tokio::spawn(async move {
        loop {
            if ctx.is_closing() {
                break;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    let conn = build_conn_ctx(read_half, write_half, addr.to_string());
                    deliver_accepted(&runtime, &ctx, host.as_ref(), conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tcp accept loop terminating");
                    break;
                }
            }
        }
    });
}

fn spawn_unix_accept_loop(
    runtime: Arc<Runtime>,
    listener: UnixListener,
    ctx: ListenerCtx,
    host: Arc<dyn HostContext>,
) {
    tokio::spawn(async move {
        loop {
            if ctx.is_closing() {
                break;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let peer = addr
                        .as_pathname()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unix>".to_string());
                    let (read_half, write_half) = stream.into_split();
                    let conn = build_conn_ctx(read_half, write_half, peer);
                    deliver_accepted(&runtime, &ctx, host.as_ref(), conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unix accept loop terminating");
                    break;
                }
            }
        }
    });
}

fn deliver_accepted(runtime: &Runtime, ctx: &ListenerCtx, host: &dyn HostContext, conn: ConnCtx) {
    runtime.net_trace.incr("tcp_accept");
    let resolved = ctx.with_data(|state| {
        if let Some((coref, coroutine)) = state.accept_waiter.take() {
            Some((coref, coroutine, conn.clone()))
        } else {
            if state.pending_accepts.len() >= state.backlog {
                state.pending_accepts.pop_front();
                tracing::warn!("accept backlog full, dropping oldest pending connection");
                runtime.net_trace.incr("tcp_accept_backlog_drop");
            }
            state.pending_accepts.push_back(conn);
            None
        }
    });
    if let Some(Some((coref, coroutine, conn))) = resolved {
        runtime.coref_registry.release(coref);
        let id = runtime.tcp_conns.insert(conn);
        host.resume(coroutine, Ok(HostValue::Int(id as i64)));
    }
}

/// Accept the next pending connection, or suspend `coroutine` until one
/// arrives (spec §4.5 `accept`, spec §9 "Queue of pending accepts").
pub fn accept(
    runtime: &Arc<Runtime>,
    listener: &ListenerCtx,
    coroutine: CoroutineId,
) -> Result<Option<u64>, LunetError> {
    if listener.is_closing() {
        return Err(LunetError::LifecycleError("listener is closed".into()));
    }
    let outcome = listener
        .with_data(|state| {
            if let Some(conn) = state.pending_accepts.pop_front() {
                Ok(Some(conn))
            } else if state.accept_waiter.is_some() {
                Err(LunetError::InvariantViolation(
                    "concurrent accept on the same listener".into(),
                ))
            } else {
                let coref = runtime.coref_registry.create(coroutine);
                runtime.alive_set.mark_alive(coroutine);
                state.accept_waiter = Some((coref, coroutine));
                Ok(None)
            }
        })
        .ok_or_else(|| LunetError::LifecycleError("listener is closed".into()))??;
    Ok(outcome.map(|conn| runtime.tcp_conns.insert(conn)))
}

/// Read up to `max_bytes` from `conn`, resuming `coroutine` with the bytes
/// read (spec §4.5 `read`, one-shot: the caller must call `read` again for
/// more data, there is no persistent "readable" callback).
pub fn read(
    runtime: &Arc<Runtime>,
    conn: &ConnCtx,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    max_bytes: usize,
) -> Result<(), LunetError> {
    let claimed = conn
        .with_data(|state| {
            if state.read_coref.is_some() {
                return Err(LunetError::InvariantViolation(
                    "concurrent read on the same connection".into(),
                ));
            }
            let coref = runtime.coref_registry.create(coroutine);
            runtime.alive_set.mark_alive(coroutine);
            state.read_coref = Some(coref);
            Ok((Arc::clone(&state.reader), coref))
        })
        .ok_or_else(|| LunetError::LifecycleError("connection is closed".into()))??;
    let (reader, coref) = claimed;
    let conn = conn.clone();
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_bytes];
        let result = {
            let mut guard = reader.lock().await;
            guard.read(&mut buf).await
        };
        runtime.net_trace.incr("tcp_read");
        let completion = match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(HostValue::Bytes(buf))
            }
            Err(e) => Err(LunetError::from(e).to_string()),
        };
        finish_read(&runtime, &conn, host.as_ref(), coref, completion);
    });
    Ok(())
}

fn finish_read(
    runtime: &Runtime,
    conn: &ConnCtx,
    host: &dyn HostContext,
    coref: CorefId,
    completion: Result<HostValue, String>,
) {
    let closing = conn.with_data(|state| state.read_coref = None);
    if closing.is_none() || conn.is_closing() {
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

/// Queue `data` for write, resuming `coroutine` once the kernel has
/// accepted all of it (spec §4.5 `write`: "allocates a write request plus a
/// copied data buffer", modelled here as the `Vec<u8>` moved into the
/// spawned task).
pub fn write(
    runtime: &Arc<Runtime>,
    conn: &ConnCtx,
    host: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    data: Vec<u8>,
) -> Result<(), LunetError> {
    let claimed = conn
        .with_data(|state| {
            if state.write_coref.is_some() {
                return Err(LunetError::InvariantViolation(
                    "concurrent write on the same connection".into(),
                ));
            }
            let coref = runtime.coref_registry.create(coroutine);
            runtime.alive_set.mark_alive(coroutine);
            state.write_coref = Some(coref);
            Ok((Arc::clone(&state.writer), coref))
        })
        .ok_or_else(|| LunetError::LifecycleError("connection is closed".into()))??;
    let (writer, coref) = claimed;
    let conn = conn.clone();
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let result = {
            let mut guard = writer.lock().await;
            guard.write_all(&data).await
        };
        runtime.net_trace.incr("tcp_write");
        let completion = match result {
            Ok(()) => Ok(HostValue::Int(data.len() as i64)),
            Err(e) => Err(LunetError::from(e).to_string()),
        };
        finish_write(&runtime, &conn, host.as_ref(), coref, completion);
    });
    Ok(())
}

fn finish_write(
    runtime: &Runtime,
    conn: &ConnCtx,
    host: &dyn HostContext,
    coref: CorefId,
    completion: Result<HostValue, String>,
) {
    let closing = conn.with_data(|state| state.write_coref = None);
    if closing.is_none() || conn.is_closing() {
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

/// Dial out to a TCP peer (spec §4.5 `connect`; unlike `listen`/`accept`
/// there is no Unix-domain equivalent in this port — a client dialling a
/// Unix path has no counterpart in the original's feature set).
pub fn connect(
    runtime: &Arc<Runtime>,
    host_ctx: Arc<dyn HostContext>,
    coroutine: CoroutineId,
    host: String,
    port: u16,
) -> Result<(), LunetError> {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let result = TcpStream::connect((host.as_str(), port)).await;
        runtime.net_trace.incr("tcp_connect");
        match result {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| format!("{host}:{port}"));
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                let conn = build_conn_ctx(read_half, write_half, peer);
                let id = runtime.tcp_conns.insert(conn);
                host_ctx.resume(coroutine, Ok(HostValue::Int(id as i64)));
            }
            Err(e) => {
                host_ctx.resume(coroutine, Err(LunetError::from(e).to_string()));
            }
        }
    });
    Ok(())
}

/// Close a connection or listener handle. Idempotent (spec §4.5 `close`):
/// a second call observes `is_closing() == true` and is a no-op.
pub fn close(ctx: &ConnCtx) {
    ctx.mark_closing();
}

/// Close a listener, stopping its accept loop on the next iteration.
pub fn close_listener(ctx: &ListenerCtx) {
    ctx.mark_closing();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use lunet_sdk::ResumeStatus;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

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
    async fn read_then_write_round_trip_over_a_duplex_pair() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default(), 1 << 16));
        let (client, server) = duplex(64);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let client_conn = build_conn_ctx(client_read, client_write, "client".into());
        let server_conn = build_conn_ctx(server_read, server_write, "server".into());

        let recorder = Arc::new(RecordingHost::default());
        let host: Arc<dyn HostContext> = recorder.clone();

        write(
            &runtime,
            &client_conn,
            Arc::clone(&host),
            CoroutineId(1),
            b"hello".to_vec(),
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        read(
            &runtime,
            &server_conn,
            Arc::clone(&host),
            CoroutineId(2),
            64,
        )
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, CoroutineId(1));
        assert_eq!(calls[0].1, Ok(HostValue::Int(5)));
        assert_eq!(calls[1].0, CoroutineId(2));
        assert_eq!(calls[1].1, Ok(HostValue::Bytes(b"hello".to_vec())));
    }

    #[test]
    fn close_is_idempotent() {
        let ctx = build_conn_ctx(tokio::io::empty(), tokio::io::sink(), "peer".into());
        close(&ctx);
        close(&ctx);
        assert!(ctx.is_closing());
    }
}
