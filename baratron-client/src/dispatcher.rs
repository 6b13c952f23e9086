use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use baratron_core::protocol::{self, Command, ProtocolError};
use baratron_core::{Field, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::connection::deadline_after;
use crate::{ClientConfig, Connection, Error};

/// Whether the device's socket is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// A request in flight, owned by the worker until it resolves.
struct Request {
    command: Command,
    frame: Vec<u8>,
    submitted: Instant,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<Value, Error>>,
}

impl Request {
    fn resolve(self, result: Result<Value, Error>) {
        // the caller may have stopped waiting; the result is simply unobserved
        let _ = self.reply.send(result);
    }
}

/// Completion handle returned by [`Dispatcher::submit`].
///
/// Await it for the decoded value. Dropping it abandons interest in the
/// result; the request itself still runs to completion on the wire.
#[derive(Debug)]
pub struct Completion {
    field: Field,
    rx: oneshot::Receiver<Result<Value, Error>>,
}

impl Completion {
    pub fn field(&self) -> Field {
        self.field
    }
}

impl Future for Completion {
    type Output = Result<Value, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Shutdown)))
    }
}

/// Serializes requests to one device.
///
/// The protocol has no request ids, so a reply can only be matched to the
/// oldest outstanding request. A background worker therefore keeps at most
/// one request on the wire and takes the queue strictly in submission order.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Request>,
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl Dispatcher {
    /// Spawns the worker that owns `connection`. Must be called from within a
    /// Tokio runtime.
    pub fn new(connection: Connection, config: &ClientConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let cancel = CancellationToken::new();

        let worker = Worker {
            connection,
            rx,
            link: link_tx,
            cancel: cancel.clone(),
            resync_grace: config.resync_grace(),
        };
        tokio::spawn(worker.run());

        Self {
            tx,
            link: link_rx,
            cancel,
            timeout: config.timeout(),
        }
    }

    /// Queues `command` with the default timeout.
    pub fn submit(&self, command: Command) -> Result<Completion, Error> {
        self.submit_with_timeout(command, self.timeout)
    }

    /// Queues `command` and returns immediately.
    ///
    /// The command is encoded here, so validation errors come back directly
    /// and never reach the queue. The deadline starts now, not when the
    /// request reaches the wire.
    pub fn submit_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Completion, Error> {
        let frame = protocol::encode(&command)?;
        let (reply, rx) = oneshot::channel();
        let submitted = Instant::now();

        let request = Request {
            command,
            frame,
            submitted,
            deadline: deadline_after(submitted, timeout),
            timeout,
            reply,
        };
        self.tx.send(request).map_err(|_| Error::Shutdown)?;

        Ok(Completion {
            field: command.field,
            rx,
        })
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Waits for the next change of link state.
    pub async fn link_changed(&mut self) -> Result<LinkState, Error> {
        self.link.changed().await.map_err(|_| Error::Shutdown)?;
        Ok(*self.link.borrow_and_update())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stops the worker and closes the connection. Requests still queued
    /// resolve with [`Error::Shutdown`]; one already on the wire finishes first.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Worker {
    connection: Connection,
    rx: mpsc::UnboundedReceiver<Request>,
    link: watch::Sender<LinkState>,
    cancel: CancellationToken,
    resync_grace: Duration,
}

impl Worker {
    #[instrument(name = "dispatcher", skip_all, fields(addr = %self.connection.addr()))]
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            self.process(request).await;
        }

        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            request.resolve(Err(Error::Shutdown));
        }
        self.connection.disconnect();
        self.publish();
        debug!("dispatcher stopped");
    }

    async fn process(&mut self, request: Request) {
        let field = request.command.field;

        if Instant::now() >= request.deadline {
            debug!(%field, "deadline passed while queued");
            let timeout = request.timeout;
            request.resolve(Err(Error::Timeout(timeout)));
            return;
        }

        if let Err(e) = self.connection.ensure_connected().await {
            self.fail_pending(request, e.into());
            return;
        }
        self.publish();

        if let Err(e) = self.connection.send(&request.frame).await {
            self.fail_pending(request, e.into());
            return;
        }

        let remaining = request.deadline.saturating_duration_since(Instant::now());
        match self.connection.receive_until(remaining).await {
            Ok(frame) => self.complete(request, &frame),
            Err(Error::Timeout(_)) => {
                warn!(%field, timeout = ?request.timeout, "request timed out");
                let timeout = request.timeout;
                request.resolve(Err(Error::Timeout(timeout)));
                self.resync(field).await;
            }
            Err(e @ Error::Connection(_)) => self.fail_pending(request, e),
            Err(e) => {
                self.publish();
                request.resolve(Err(e));
            }
        }
    }

    fn complete(&mut self, request: Request, frame: &[u8]) {
        let field = request.command.field;
        let result = protocol::decode(field, frame).map_err(Error::from);

        if let Err(Error::ProtocolDesync(reason)) = &result {
            warn!(%field, %reason, "reply out of step, dropping connection");
            self.connection.disconnect();
            self.publish();
        }

        debug!(%field, elapsed = ?request.submitted.elapsed(), ok = result.is_ok(), "request resolved");
        request.resolve(result);
    }

    /// Consumes the reply owed to a timed-out request so it cannot be taken
    /// for the answer to the next one.
    async fn resync(&mut self, field: Field) {
        match self.connection.receive_until(self.resync_grace).await {
            Ok(frame) => match protocol::decode(field, &frame) {
                Err(ProtocolError::FieldMismatch { actual, .. }) => {
                    warn!(%field, %actual, "late reply out of step, dropping connection");
                    self.connection.disconnect();
                }
                _ => debug!(%field, "discarded late reply"),
            },
            Err(Error::Timeout(_)) => {
                warn!(%field, grace = ?self.resync_grace, "late reply never came, dropping connection");
                self.connection.disconnect();
            }
            Err(e @ Error::Connection(_)) => {
                debug!(%field, error = %e, "connection lost while waiting for late reply");
                self.connection.disconnect();
                self.publish();
                self.fail_queued(e, 0);
                return;
            }
            Err(e) => debug!(%field, error = %e, "late reply unusable"),
        }
        self.publish();
    }

    /// Fails `request` and everything queued behind it with `error`.
    fn fail_pending(&mut self, request: Request, error: Error) {
        self.connection.disconnect();
        self.publish();

        request.resolve(Err(error.clone()));
        self.fail_queued(error, 1);
    }

    fn fail_queued(&mut self, error: Error, mut failed: usize) {
        while let Ok(queued) = self.rx.try_recv() {
            queued.resolve(Err(error.clone()));
            failed += 1;
        }
        warn!(error = %error, failed, "connection failed, pending requests failed");
    }

    fn publish(&self) {
        let state = if self.connection.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.link.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}
