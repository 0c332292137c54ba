//! # Receive Engine
//!
//! Binds a TCP or UDP endpoint and runs accept/receive cycles until stopped
//! or until the endpoint's termination limit is reached.
//!
//! - **Single-socket mode** ([`Listener::run_socket`]): cycles run one after
//!   another on a single engine instance.
//! - **Server mode** ([`Listener::run_server`]): every accepted connection or
//!   received datagram becomes a tokio task running a fresh engine cloned from
//!   the template, optionally bounded by an [`AdmissionGate`].
//!
//! Every accepted peer and every accept error is one termination. Accept
//! timeouts are not.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{EndpointConfig, ServerOptions, TransportKind};
use crate::error::{ErrorCategory, ProtocolError, Result};
use crate::protocol::context::ConnectionContext;
use crate::protocol::engine::{ProtocolEngine, TaskReport};
use crate::service::gate::AdmissionGate;
use crate::service::{RunControl, RunSummary};
use crate::transport::stream::boxed;
use crate::transport::tls::{self, TlsServerConfig};
use crate::transport::{tcp, udp};
use crate::utils::metrics::Metrics;

/// The bound endpoint
enum Bound {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

/// One accepted peer
enum Incoming {
    Stream(TcpStream, SocketAddr),
    Datagram {
        socket: Arc<UdpSocket>,
        datagram: Bytes,
        peer: SocketAddr,
    },
}

impl Bound {
    async fn next(&self, buffer_size: usize) -> std::io::Result<Incoming> {
        match self {
            Bound::Stream(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Incoming::Stream(stream, peer))
            }
            Bound::Datagram(socket) => {
                let mut buf = vec![0u8; buffer_size];
                let (len, peer) = socket.recv_from(&mut buf).await?;
                buf.truncate(len);
                Ok(Incoming::Datagram {
                    socket: Arc::clone(socket),
                    datagram: Bytes::from(buf),
                    peer,
                })
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Bound::Stream(listener) => listener.local_addr().ok(),
            Bound::Datagram(socket) => socket.local_addr().ok(),
        }
    }
}

/// Everything a unit needs besides its engine and token
#[derive(Clone)]
struct UnitEnv {
    tls: Option<TlsAcceptor>,
    timeout: Duration,
    buffer_size: usize,
    metrics: Arc<Metrics>,
}

enum UnitOutcome {
    Finished(Result<TaskReport>),
    Rejected(ProtocolError),
}

/// The receive engine
pub struct Listener {
    endpoint: EndpointConfig,
    template: ProtocolEngine,
    options: ServerOptions,
    control: Arc<RunControl>,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint)
            .field("template", &self.template)
            .field("options", &self.options)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Create a listener for `endpoint`.
    ///
    /// The template's communication type must run over the endpoint's
    /// transport. TLS material is loaded here so that a bad certificate is a
    /// construction error rather than a failure on every connection.
    pub fn new(
        endpoint: EndpointConfig,
        template: ProtocolEngine,
        options: ServerOptions,
    ) -> Result<Self> {
        let communication = template.task().communication;
        if communication.transport() != endpoint.transport() {
            return Err(ProtocolError::ConfigError(format!(
                "{communication:?} cannot run on a {:?} endpoint",
                endpoint.transport()
            )));
        }

        let errors = options.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let tls = endpoint
            .tls()
            .map(|settings| TlsServerConfig::from_settings(settings)?.acceptor())
            .transpose()?;

        Ok(Self {
            endpoint,
            template: template.fresh(),
            options,
            control: Arc::new(RunControl::new()),
            tls,
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Stop flags and termination counter shared with every unit
    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.template.metrics()
    }

    /// Stop the running loop and cancel in-flight units
    pub fn stop_socket(&self) {
        info!(address = %self.endpoint.address(), "Listener stop requested");
        self.control.stop();
    }

    /// Run cycles one at a time on a single engine instance
    #[instrument(skip(self), fields(address = %self.endpoint.address(), transport = ?self.endpoint.transport()))]
    pub async fn run_socket(&self) -> Result<RunSummary> {
        self.serve(false).await
    }

    /// Run every cycle as its own task on a fresh engine
    #[instrument(skip(self), fields(address = %self.endpoint.address(), transport = ?self.endpoint.transport()))]
    pub async fn run_server(&self) -> Result<RunSummary> {
        self.serve(true).await
    }

    async fn bind(&self) -> Result<Bound> {
        Ok(match self.endpoint.transport() {
            TransportKind::Tcp => Bound::Stream(tcp::bind_listener(&self.endpoint).await?),
            TransportKind::Udp => {
                Bound::Datagram(Arc::new(udp::bind_receiver(&self.endpoint).await?))
            }
        })
    }

    async fn serve(&self, concurrent: bool) -> Result<RunSummary> {
        let bound = self.bind().await?;
        let cancel = self.control.cancel_token().clone();
        let metrics = self.metrics();
        let env = UnitEnv {
            tls: self.tls.clone(),
            timeout: self.endpoint.timeout(),
            buffer_size: self.endpoint.buffer_size(),
            metrics: Arc::clone(&metrics),
        };
        let gate = if concurrent {
            self.options.pool_size.map(AdmissionGate::new)
        } else {
            None
        };

        info!(
            local = ?bound.local_addr(),
            concurrent,
            pool_size = ?gate.as_ref().map(AdmissionGate::capacity),
            max_terminations = self.endpoint.max_terminations(),
            "Listener started"
        );

        let mut engine = self.template.fresh();
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        let mut summary = RunSummary::default();

        while !self.control.is_stopped() {
            while let Some(joined) = units.try_join_next() {
                self.tally(&mut summary, joined);
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(
                    self.endpoint.timeout(),
                    bound.next(self.endpoint.buffer_size()),
                ) => next,
            };

            let incoming = match next {
                Err(_) => {
                    trace!("Accept timed out");
                    summary.idle_timeouts += 1;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Accept failed");
                    summary.failed_cycles += 1;
                    metrics.cycle_completed(true);
                    self.count_termination(&mut summary);
                    continue;
                }
                Ok(Ok(incoming)) => incoming,
            };
            if matches!(incoming, Incoming::Datagram { .. }) {
                metrics.datagram_received();
            }

            let token = self.control.child_token();
            if concurrent {
                let mut unit = self.template.fresh();
                let env = env.clone();
                let gate = gate.clone();
                let admission_timeout = self.options.admission_timeout;
                units.spawn(async move {
                    let _ticket = match &gate {
                        Some(gate) => match gate.acquire_or_cancel(admission_timeout, &token).await
                        {
                            Ok(ticket) => Some(ticket),
                            Err(e) => return UnitOutcome::Rejected(e),
                        },
                        None => None,
                    };
                    UnitOutcome::Finished(serve_unit(&mut unit, incoming, &env, token).await)
                });
            } else {
                let result = serve_unit(&mut engine, incoming, &env, token).await;
                self.tally(&mut summary, Ok(UnitOutcome::Finished(result)));
            }
            self.count_termination(&mut summary);
        }

        self.drain(&mut units, &mut summary).await;
        if let Bound::Datagram(socket) = &bound {
            udp::leave_group(socket, &self.endpoint);
        }
        info!(
            cycles = summary.cycles,
            failed = summary.failed_cycles,
            rejected = summary.rejected,
            limit_reached = summary.limit_reached,
            "Listener stopped"
        );
        metrics.log_snapshot();
        Ok(summary)
    }

    /// Count a termination; at the limit, stop taking new cycles
    fn count_termination(&self, summary: &mut RunSummary) {
        summary.cycles += 1;
        let count = self.control.record_termination();
        if self.endpoint.termination_limit_reached(count) {
            debug!(count, "Termination limit reached");
            summary.limit_reached = true;
            self.control.set_stopped();
        }
    }

    /// Wait for outstanding units.
    ///
    /// After an explicit stop the units are already cancelled and get the
    /// shutdown grace before being aborted. After the termination limit they
    /// run to completion under their own timeouts.
    async fn drain(&self, units: &mut JoinSet<UnitOutcome>, summary: &mut RunSummary) {
        if units.is_empty() {
            return;
        }
        if !self.control.server_stopped() {
            debug!(outstanding = units.len(), "Draining units");
            while let Some(joined) = units.join_next().await {
                self.tally(summary, joined);
            }
            return;
        }

        let grace = self.options.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = units.join_next().await {
                self.tally(summary, joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = units.len(), ?grace, "Aborting units after shutdown grace");
            units.abort_all();
            while let Some(joined) = units.join_next().await {
                self.tally(summary, joined);
            }
        }
    }

    fn tally(&self, summary: &mut RunSummary, joined: std::result::Result<UnitOutcome, JoinError>) {
        let metrics = &self.template.metrics;
        match joined {
            Ok(UnitOutcome::Finished(Ok(report))) => {
                metrics.cycle_completed(false);
                trace!(?report, "Cycle finished");
            }
            Ok(UnitOutcome::Finished(Err(e))) => {
                if !e.is_cancellation() {
                    summary.failed_cycles += 1;
                }
                metrics.cycle_completed(!e.is_cancellation());
                log_cycle_error(&e);
            }
            Ok(UnitOutcome::Rejected(e)) => {
                if e.is_cancellation() {
                    debug!("Unit cancelled while waiting for admission");
                    return;
                }
                summary.rejected += 1;
                metrics.admission_rejected();
                metrics.cycle_completed(true);
                warn!(error = %e, "Unit rejected by admission gate");
            }
            Err(e) if e.is_cancelled() => debug!("Unit aborted"),
            Err(e) => {
                summary.failed_cycles += 1;
                metrics.cycle_completed(true);
                error!(error = %e, "Unit panicked");
            }
        }
    }
}

/// Run one cycle: wrap the peer, attach it, run the task and tear it down
async fn serve_unit(
    engine: &mut ProtocolEngine,
    incoming: Incoming,
    env: &UnitEnv,
    cancel: CancellationToken,
) -> Result<TaskReport> {
    let ctx = match incoming {
        Incoming::Stream(stream, peer) => {
            let local = stream.local_addr().ok();
            env.metrics.connection_established();
            let stream = match &env.tls {
                Some(acceptor) => match tls::accept(acceptor, stream, env.timeout, &cancel).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        env.metrics.tls_failure();
                        env.metrics.connection_closed();
                        return Err(e);
                    }
                },
                None => boxed(stream),
            };
            debug!(%peer, "Connection accepted");
            ConnectionContext::boxed_stream(stream, local, Some(peer), cancel, env.timeout)
        }
        Incoming::Datagram {
            socket,
            datagram,
            peer,
        } => {
            trace!(%peer, len = datagram.len(), "Datagram received");
            ConnectionContext::datagram(socket, peer, Some(datagram), cancel, env.timeout)
        }
    }
    .with_buffer_size(env.buffer_size);

    let is_stream = ctx.kind() == TransportKind::Tcp;
    let result = match engine.attach(ctx) {
        Ok(()) => engine.run_task().await,
        Err(e) => Err(e),
    };
    engine.close().await;
    if is_stream {
        env.metrics.connection_closed();
    }
    result
}

pub(crate) fn log_cycle_error(e: &ProtocolError) {
    match e.category() {
        ErrorCategory::Cancellation => debug!("Cycle cancelled"),
        category => warn!(error = %e, ?category, "Cycle failed"),
    }
}
