//! One connection's request multiplexer.
//!
//! The session reads frames, tracks every request from arrival to the moment
//! its response hits the socket, and fans work out so that independent
//! operations overlap while operations on the same handle stay strictly
//! ordered:
//!
//! - path-keyed operations (stat, lookup, mkdir, ...) run as free tasks,
//!   any number at a time;
//! - handle-keyed operations (read, write, readdir, ...) are queued on their
//!   handle's lane, a dedicated worker that executes them one by one in
//!   arrival order;
//! - all responses funnel through a single writer task, so frames are sent
//!   whole, in completion order, never interleaved.
//!
//! Requests are correlated by client-chosen id. An id may not be reused
//! while its request is in flight; responses for requests that were in
//! flight when the connection dropped are discarded, never sent into a
//! later connection.

use crate::config::Config;
use crate::executor::{Executor, HandleResource};
use crate::handle::{HandleEntry, HandleKind, HandleTable, LaneJob};
use crate::protocol::{
    FrameEvent, Opcode, Request, RequestFrameCodec, Response, ResponseBody, ResponseFrameCodec,
};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue depth of a single handle lane
const LANE_DEPTH: usize = 64;

/// Queue depth of the outbound response channel
const OUTBOUND_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InflightState {
    /// Handed to an executor task; a response is owed
    Dispatched,
    /// Connection dropped before the response was sent; the late response
    /// must be discarded
    Abandoned,
}

/// Set of requests currently owned by the session, keyed by request id.
#[derive(Debug, Default)]
struct InflightTable {
    inner: Mutex<HashMap<u64, InflightState>>,
}

impl InflightTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, InflightState>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a request id, rejecting ids already in flight.
    fn begin(&self, request_id: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.contains_key(&request_id) {
            return Err(Error::DuplicateRequestId(request_id));
        }
        inner.insert(request_id, InflightState::Dispatched);
        Ok(())
    }

    /// Retire a request id at send time. Returns false if the response must
    /// be discarded instead of sent.
    fn finish(&self, request_id: u64) -> bool {
        matches!(
            self.lock().remove(&request_id),
            Some(InflightState::Dispatched)
        )
    }

    /// Mark every in-flight request abandoned. Their responses, whenever
    /// they complete, are dropped.
    fn abandon_all(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.len();
        for state in inner.values_mut() {
            *state = InflightState::Abandoned;
        }
        count
    }
}

/// A completed response on its way to the writer task.
#[derive(Debug)]
struct Outbound {
    response: Response,
    /// Request id to retire on send; `None` for protocol errors that never
    /// entered the in-flight set
    retire: Option<u64>,
}

/// Shared state cloned into every executor task of one session
#[derive(Clone)]
struct SessionCtx {
    executor: Arc<Executor>,
    outbound: mpsc::Sender<Outbound>,
    inflight: Arc<InflightTable>,
    handles: Arc<Mutex<HandleTable>>,
    op_timeout: Duration,
}

impl SessionCtx {
    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serves one connection over any framed byte stream.
pub struct Session {
    executor: Arc<Executor>,
    max_payload: usize,
    max_open_handles: usize,
    op_timeout: Duration,
}

impl Session {
    pub fn new(config: &Config, executor: Arc<Executor>) -> Self {
        Self {
            executor,
            max_payload: config.max_payload,
            max_open_handles: config.max_open_handles,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
        }
    }

    /// Run the session until the peer disconnects, the stream corrupts, or
    /// shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport-level failures; per-request
    /// failures travel back to the client inside response frames.
    pub async fn run<S>(&self, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, RequestFrameCodec::new(self.max_payload));
        let sink = FramedWrite::new(writer, ResponseFrameCodec);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let inflight = Arc::new(InflightTable::default());
        let handles = Arc::new(Mutex::new(HandleTable::new(self.max_open_handles)));

        // Child token: server shutdown stops the writer, and a writer
        // failure stops this session without touching other server state.
        let session_cancel = shutdown.child_token();
        let writer_handle = tokio::spawn(writer_task(
            sink,
            outbound_rx,
            Arc::clone(&inflight),
            session_cancel.clone(),
        ));

        let ctx = SessionCtx {
            executor: Arc::clone(&self.executor),
            outbound: outbound_tx,
            inflight: Arc::clone(&inflight),
            handles: Arc::clone(&handles),
            op_timeout: self.op_timeout,
        };

        let result = loop {
            tokio::select! {
                () = session_cancel.cancelled() => {
                    debug!(event = "session_cancelled", "session cancelled");
                    break Ok(());
                }
                frame = frames.next() => match frame {
                    Some(Ok(event)) => dispatch(&ctx, event).await,
                    Some(Err(e)) => {
                        // A header-level failure means we can no longer tell
                        // where frames begin; the connection must die.
                        error!(event = "stream_corrupt", error = %e, "terminating corrupt stream");
                        break Err(e);
                    }
                    None => {
                        debug!(event = "peer_disconnected", "peer closed the connection");
                        break Ok(());
                    }
                }
            }
        };

        // Teardown: late completions must not leak into a future
        // connection, and every handle the session issued is released.
        let abandoned = inflight.abandon_all();
        let drained = {
            let mut table = handles.lock().unwrap_or_else(PoisonError::into_inner);
            table.drain()
        };
        info!(
            event = "session_closed",
            abandoned_requests = abandoned,
            released_handles = drained.len(),
            "session closed"
        );
        drop(drained); // closes every lane; workers drop their resources
        session_cancel.cancel();
        let _ = writer_handle.await;

        result
    }
}

/// Route one decoded frame event.
async fn dispatch(ctx: &SessionCtx, event: FrameEvent) {
    match event {
        FrameEvent::Oversized {
            opcode,
            request_id,
            declared,
        } => {
            warn!(
                event = "oversized_frame",
                opcode, request_id, declared, "rejecting oversized frame"
            );
            let err = Error::malformed(format!("declared payload length {declared} exceeds limit"));
            respond_protocol_error(ctx, opcode, request_id, &err).await;
        }
        FrameEvent::Invalid {
            opcode,
            request_id,
            error,
        } => {
            warn!(
                event = "invalid_frame",
                opcode, request_id, error = %error, "rejecting invalid frame"
            );
            // An unrecognizable operation echoes opcode 0 so the client
            // knows the tag itself was the problem.
            let echo = if matches!(error, Error::UnknownOperation(_)) {
                0
            } else {
                opcode
            };
            respond_protocol_error(ctx, echo, request_id, &error).await;
        }
        FrameEvent::Request {
            request_id,
            request,
        } => {
            if let Err(err) = ctx.inflight.begin(request_id) {
                warn!(
                    event = "duplicate_request_id",
                    request_id, "rejecting duplicate request id"
                );
                respond_protocol_error(ctx, request.opcode() as u8, request_id, &err).await;
                return;
            }

            debug!(
                event = "request_dispatched",
                request_id,
                opcode = ?request.opcode(),
                "request dispatched"
            );

            match request.target_handle() {
                Some(handle) => dispatch_handle_op(ctx, handle, request_id, request).await,
                None => match request {
                    Request::Open { .. } | Request::Opendir { .. } => {
                        spawn_open(ctx.clone(), request_id, request);
                    }
                    other => spawn_path_op(ctx.clone(), request_id, other),
                },
            }
        }
    }
}

/// Protocol errors answer immediately and never enter the in-flight set.
async fn respond_protocol_error(ctx: &SessionCtx, opcode: u8, request_id: u64, err: &Error) {
    let outbound = Outbound {
        response: Response::error(opcode, request_id, err),
        retire: None,
    };
    let _ = ctx.outbound.send(outbound).await;
}

/// Queue a handle-keyed operation on its handle's lane.
///
/// Release removes the table entry first, so the id is invalid the moment
/// the release is admitted; operations already queued on the lane still
/// finish before the worker drops the resource.
async fn dispatch_handle_op(ctx: &SessionCtx, handle: u64, request_id: u64, request: Request) {
    let opcode = request.opcode() as u8;
    let release = matches!(request, Request::Release { .. });

    let lane = {
        let mut table = ctx.lock_handles();
        if release {
            table.remove(handle).map(|entry| entry.lane)
        } else {
            table.get(handle).map(|entry| entry.lane.clone())
        }
    };

    let err = match lane {
        Ok(lane) => {
            if lane.send(LaneJob { request_id, request }).await.is_ok() {
                return;
            }
            // Lane worker already gone; treat like a released handle.
            Error::HandleNotFound(handle)
        }
        Err(err) => err,
    };

    let outbound = Outbound {
        response: Response::error(opcode, request_id, &err),
        retire: Some(request_id),
    };
    let _ = ctx.outbound.send(outbound).await;
}

/// Run a path-keyed operation as a free task; any number may overlap.
fn spawn_path_op(ctx: SessionCtx, request_id: u64, request: Request) {
    tokio::spawn(async move {
        let opcode = request.opcode();
        let started = std::time::Instant::now();
        let outcome = timeout(ctx.op_timeout, execute_path_op(&ctx.executor, &request)).await;

        let response = match outcome {
            Ok(Ok(body)) => Response::ok(opcode, request_id, body),
            Ok(Err(err)) => Response::error(opcode as u8, request_id, &err),
            Err(_) => {
                warn!(
                    event = "operation_timeout",
                    request_id,
                    opcode = ?opcode,
                    timeout_secs = ctx.op_timeout.as_secs(),
                    "path operation timed out"
                );
                Response::error(
                    opcode as u8,
                    request_id,
                    &Error::OperationTimeout(ctx.op_timeout),
                )
            }
        };

        debug!(
            event = "request_completed",
            request_id,
            opcode = ?opcode,
            duration_us = started.elapsed().as_micros() as u64,
            ok = response.result.is_ok(),
            "path operation completed"
        );

        let _ = ctx
            .outbound
            .send(Outbound {
                response,
                retire: Some(request_id),
            })
            .await;
    });
}

async fn execute_path_op(executor: &Executor, request: &Request) -> Result<ResponseBody> {
    match request {
        Request::Lookup { parent, name } => {
            Ok(ResponseBody::Attrs(executor.lookup(parent, name).await?))
        }
        Request::Stat { path } => Ok(ResponseBody::Attrs(executor.stat(path).await?)),
        Request::Create { path, mode } => {
            executor.create(path, *mode).await?;
            Ok(ResponseBody::Empty)
        }
        Request::Mkdir { path, mode } => {
            executor.mkdir(path, *mode).await?;
            Ok(ResponseBody::Empty)
        }
        Request::Rmdir { path } => {
            executor.rmdir(path).await?;
            Ok(ResponseBody::Empty)
        }
        Request::Unlink { path } => {
            executor.unlink(path).await?;
            Ok(ResponseBody::Empty)
        }
        Request::Rename { from, to } => {
            executor.rename(from, to).await?;
            Ok(ResponseBody::Empty)
        }
        Request::Truncate { path, size } => {
            executor.truncate(path, *size).await?;
            Ok(ResponseBody::Empty)
        }
        other => Err(Error::unsupported(format!(
            "{:?} is not a path operation",
            other.opcode()
        ))),
    }
}

/// Open a file or directory, then bring its handle to life: allocate an id,
/// start the lane worker, and answer with the id.
fn spawn_open(ctx: SessionCtx, request_id: u64, request: Request) {
    tokio::spawn(async move {
        let opcode = request.opcode();
        let outcome = timeout(ctx.op_timeout, open_resource(&ctx.executor, &request)).await;

        let response = match outcome {
            Ok(Ok(resource)) => match install_handle(&ctx, resource) {
                Ok(id) => {
                    debug!(event = "handle_issued", request_id, handle = id, "handle issued");
                    Response::ok(opcode, request_id, ResponseBody::Handle(id))
                }
                Err(err) => {
                    warn!(event = "handle_exhausted", request_id, error = %err, "handle allocation failed");
                    Response::error(opcode as u8, request_id, &err)
                }
            },
            Ok(Err(err)) => Response::error(opcode as u8, request_id, &err),
            Err(_) => {
                warn!(
                    event = "operation_timeout",
                    request_id,
                    opcode = ?opcode,
                    timeout_secs = ctx.op_timeout.as_secs(),
                    "open timed out"
                );
                Response::error(
                    opcode as u8,
                    request_id,
                    &Error::OperationTimeout(ctx.op_timeout),
                )
            }
        };

        let _ = ctx
            .outbound
            .send(Outbound {
                response,
                retire: Some(request_id),
            })
            .await;
    });
}

async fn open_resource(executor: &Executor, request: &Request) -> Result<HandleResource> {
    match request {
        Request::Open { path, flags, mode } => Ok(HandleResource::File(
            executor.open(path, *flags, *mode).await?,
        )),
        Request::Opendir { path } => Ok(HandleResource::Dir(executor.opendir(path).await?)),
        other => Err(Error::unsupported(format!(
            "{:?} does not open a handle",
            other.opcode()
        ))),
    }
}

/// Register an opened resource in the table and start its lane worker.
fn install_handle(ctx: &SessionCtx, resource: HandleResource) -> Result<u64> {
    let kind = match resource {
        HandleResource::File(_) => HandleKind::File,
        HandleResource::Dir(_) => HandleKind::Directory,
    };

    let (lane_tx, lane_rx) = mpsc::channel(LANE_DEPTH);
    let degraded = Arc::new(AtomicBool::new(false));

    let id = ctx.lock_handles().allocate(HandleEntry {
        kind,
        lane: lane_tx,
        degraded: Arc::clone(&degraded),
    })?;

    tokio::spawn(lane_worker(ctx.clone(), resource, degraded, lane_rx));
    Ok(id)
}

/// Executes one handle's operations strictly in arrival order.
///
/// The worker owns the file/directory resource outright. It exits when a
/// release job arrives or the lane closes at session teardown; either way
/// the resource drops here and the OS handle closes.
async fn lane_worker(
    ctx: SessionCtx,
    mut resource: HandleResource,
    degraded: Arc<AtomicBool>,
    mut jobs: mpsc::Receiver<LaneJob>,
) {
    while let Some(LaneJob {
        request_id,
        request,
    }) = jobs.recv().await
    {
        let opcode = request.opcode();

        // Release always succeeds, degraded or not: it is the way out.
        if matches!(request, Request::Release { .. }) {
            let outbound = Outbound {
                response: Response::ok(Opcode::Release, request_id, ResponseBody::Empty),
                retire: Some(request_id),
            };
            let _ = ctx.outbound.send(outbound).await;
            break;
        }

        let started = std::time::Instant::now();
        let response = if degraded.load(Ordering::Acquire) {
            let handle = request.target_handle().unwrap_or_default();
            Response::error(opcode as u8, request_id, &Error::StaleHandle(handle))
        } else {
            let outcome = timeout(
                ctx.op_timeout,
                execute_handle_op(&ctx.executor, &mut resource, &request),
            )
            .await;

            match outcome {
                Ok(Ok(body)) => Response::ok(opcode, request_id, body),
                Ok(Err(err)) => Response::error(opcode as u8, request_id, &err),
                Err(_) => {
                    // The operation future was dropped mid-syscall; the
                    // resource's position and stream state are unknown.
                    degraded.store(true, Ordering::Release);
                    warn!(
                        event = "operation_timeout",
                        request_id,
                        opcode = ?opcode,
                        timeout_secs = ctx.op_timeout.as_secs(),
                        "handle operation timed out, marking handle degraded"
                    );
                    Response::error(
                        opcode as u8,
                        request_id,
                        &Error::OperationTimeout(ctx.op_timeout),
                    )
                }
            }
        };

        debug!(
            event = "request_completed",
            request_id,
            opcode = ?opcode,
            duration_us = started.elapsed().as_micros() as u64,
            ok = response.result.is_ok(),
            "handle operation completed"
        );

        let _ = ctx
            .outbound
            .send(Outbound {
                response,
                retire: Some(request_id),
            })
            .await;
    }
}

async fn execute_handle_op(
    executor: &Executor,
    resource: &mut HandleResource,
    request: &Request,
) -> Result<ResponseBody> {
    match (resource, request) {
        (HandleResource::File(file), Request::Read { offset, len, .. }) => Ok(ResponseBody::Data(
            Bytes::from(executor.read(file, *offset, *len).await?),
        )),
        (HandleResource::File(file), Request::Write { offset, data, .. }) => Ok(
            ResponseBody::Written(executor.write(file, *offset, data).await?),
        ),
        (HandleResource::File(file), Request::Flush { .. }) => {
            executor.flush(file).await?;
            Ok(ResponseBody::Empty)
        }
        (HandleResource::Dir(dir), Request::Readdir { rewind, .. }) => {
            let (entries, eof) = executor.readdir(dir, *rewind).await?;
            Ok(ResponseBody::Dirents { entries, eof })
        }
        (HandleResource::Dir(_), _) => Err(Error::WrongType(
            "operation requires a file handle".to_string(),
        )),
        (HandleResource::File(_), _) => Err(Error::WrongType(
            "operation requires a directory handle".to_string(),
        )),
    }
}

/// Drains completed responses onto the socket, one frame at a time.
///
/// This is the only task that writes, so frames can never interleave. Each
/// response retires its request id here, at the moment of sending; a
/// response whose request was abandoned is silently dropped.
async fn writer_task<W>(
    mut sink: FramedWrite<W, ResponseFrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    inflight: Arc<InflightTable>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(Outbound { response, retire }) = msg else {
                    break;
                };

                if let Some(request_id) = retire {
                    if !inflight.finish(request_id) {
                        debug!(
                            event = "response_discarded",
                            request_id, "discarding response for abandoned request"
                        );
                        continue;
                    }
                }

                if let Err(e) = sink.send(response).await {
                    error!(event = "response_write_failed", error = %e, "failed to write response");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_rejects_duplicates() {
        let table = InflightTable::default();
        table.begin(5).unwrap();
        assert!(matches!(table.begin(5), Err(Error::DuplicateRequestId(5))));

        // Retiring frees the id for reuse.
        assert!(table.finish(5));
        table.begin(5).unwrap();
    }

    #[test]
    fn test_abandoned_requests_are_not_sent() {
        let table = InflightTable::default();
        table.begin(1).unwrap();
        table.begin(2).unwrap();

        assert_eq!(table.abandon_all(), 2);
        assert!(!table.finish(1));
        assert!(!table.finish(2));
    }

    #[test]
    fn test_finish_unknown_id_is_discarded() {
        let table = InflightTable::default();
        assert!(!table.finish(42));
    }
}
