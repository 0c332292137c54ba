//! # Send Engine
//!
//! Connects outbound and runs one engine cycle per connection (TCP) or per
//! datagram (UDP).
//!
//! TCP connections optionally go through a SOCKS5 proxy and are optionally
//! upgraded to TLS. Failures are counted against the endpoint's termination
//! limit, except in "just once" mode (`max_terminations == 1`) where up to
//! [`DIALER_EXCEPTION_BUDGET`] consecutive failures are retried first.

use std::sync::Arc;

use rustls::ServerName;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{DialerOptions, EndpointConfig, TransportKind, DIALER_EXCEPTION_BUDGET};
use crate::error::{ProtocolError, Result};
use crate::protocol::context::ConnectionContext;
use crate::protocol::engine::{ProtocolEngine, TaskReport};
use crate::service::listener::log_cycle_error;
use crate::service::{RunControl, RunSummary};
use crate::transport::stream::{boxed, BoxedStream};
use crate::transport::tls::{self, TlsClientConfig};
use crate::transport::{socks, tcp, udp};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::sleep_or_cancel;

/// Client TLS state built once and reused by every cycle
struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName,
}

/// The send engine
pub struct Dialer {
    endpoint: EndpointConfig,
    template: ProtocolEngine,
    options: DialerOptions,
    control: Arc<RunControl>,
    tls: Option<ClientTls>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("endpoint", &self.endpoint)
            .field("template", &self.template)
            .field("options", &self.options)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Create a dialer for `endpoint`
    pub fn new(
        endpoint: EndpointConfig,
        template: ProtocolEngine,
        options: DialerOptions,
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
        if options.proxy.is_some() && endpoint.transport() == TransportKind::Udp {
            return Err(ProtocolError::ConfigError(
                "SOCKS5 proxying is only supported for TCP endpoints".into(),
            ));
        }

        let tls = endpoint
            .tls()
            .map(|settings| {
                let config = TlsClientConfig::from_settings(settings, endpoint.host())?;
                Ok::<_, ProtocolError>(ClientTls {
                    connector: config.connector()?,
                    server_name: config.server_name()?,
                })
            })
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

    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.template.metrics()
    }

    /// Stop the running loop and cancel the cycle in flight
    pub fn stop_socket(&self) {
        info!(address = %self.endpoint.address(), "Dialer stop requested");
        self.control.stop();
    }

    /// Connect and run cycles until stopped, out of budget, past the
    /// reconnect timeout or at the termination limit
    #[instrument(skip(self), fields(address = %self.endpoint.address(), transport = ?self.endpoint.transport()))]
    pub async fn run_socket(&self) -> Result<RunSummary> {
        let cancel = self.control.cancel_token().clone();
        let metrics = self.metrics();
        let initiates = self.template.task().communication.initiates_with_send();
        let just_once = self.endpoint.max_terminations() == 1;
        let interval = self.options.interval;

        let mut engine = self.template.fresh();
        let mut summary = RunSummary::default();
        let mut consecutive_failures = 0u32;
        let mut last_success = Instant::now();

        info!(
            proxy = self.options.proxy.is_some(),
            tls = self.tls.is_some(),
            max_terminations = self.endpoint.max_terminations(),
            "Dialer started"
        );

        while !self.control.is_stopped() {
            if last_success.elapsed() > self.options.reconnect_timeout {
                warn!(timeout = ?self.options.reconnect_timeout, "No successful cycle within reconnect timeout");
                self.control.set_stopped();
                break;
            }

            if initiates && !engine.has_outbound() {
                trace!("Nothing queued, idling");
                summary.idle_timeouts += 1;
                // idle passes do not age the reconnect deadline
                last_success = Instant::now();
                if !sleep_or_cancel(interval, &cancel).await {
                    break;
                }
                continue;
            }

            let result = self.cycle(&mut engine).await;
            let failed = matches!(&result, Err(e) if !e.is_cancellation());
            metrics.cycle_completed(failed);

            match result {
                Ok(report) => {
                    consecutive_failures = 0;
                    last_success = Instant::now();
                    trace!(?report, "Cycle finished");
                }
                Err(e) if e.is_cancellation() => {
                    log_cycle_error(&e);
                    break;
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    log_cycle_error(&e);
                    if just_once {
                        consecutive_failures += 1;
                        if consecutive_failures > DIALER_EXCEPTION_BUDGET {
                            warn!(failures = consecutive_failures, "Exception budget exhausted");
                            self.control.set_stopped();
                            break;
                        }
                        debug!(failures = consecutive_failures, "Retrying after failure");
                        if !sleep_or_cancel(interval, &cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            summary.cycles += 1;
            let count = self.control.record_termination();
            if self.endpoint.termination_limit_reached(count) {
                debug!(count, "Termination limit reached");
                summary.limit_reached = true;
                self.control.set_stopped();
                break;
            }

            if !sleep_or_cancel(interval, &cancel).await {
                break;
            }
        }

        info!(
            cycles = summary.cycles,
            failed = summary.failed_cycles,
            limit_reached = summary.limit_reached,
            "Dialer stopped"
        );
        metrics.log_snapshot();
        Ok(summary)
    }

    /// Connect, run the task once and tear the connection down
    async fn cycle(&self, engine: &mut ProtocolEngine) -> Result<TaskReport> {
        let token = self.control.child_token();
        let timeout = self.endpoint.timeout();
        let metrics = self.metrics();

        let ctx = match self.endpoint.transport() {
            TransportKind::Tcp => {
                let (stream, local, peer) = self.connect_stream(&token).await?;
                metrics.connection_established();
                ConnectionContext::boxed_stream(stream, local, peer, token, timeout)
            }
            TransportKind::Udp => {
                let (socket, target) = udp::bind_sender(&self.endpoint).await?;
                ConnectionContext::datagram(Arc::new(socket), target, None, token, timeout)
            }
        }
        .with_buffer_size(self.endpoint.buffer_size())
        .initiated();

        let is_stream = ctx.kind() == TransportKind::Tcp;
        let result = match engine.attach(ctx) {
            Ok(()) => engine.run_task().await,
            Err(e) => Err(e),
        };
        engine.close().await;
        if is_stream {
            metrics.connection_closed();
        }
        result
    }

    async fn connect_stream(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(
        BoxedStream,
        Option<std::net::SocketAddr>,
        Option<std::net::SocketAddr>,
    )> {
        let timeout = self.endpoint.timeout();
        let buffer_size = self.endpoint.buffer_size();

        let connect = async {
            match &self.options.proxy {
                Some(proxy) => {
                    socks::connect_via_proxy(
                        proxy,
                        self.endpoint.host(),
                        self.endpoint.port(),
                        buffer_size,
                        timeout,
                    )
                    .await
                }
                None => {
                    let addr = tcp::resolve(&self.endpoint.address()).await?;
                    tcp::connect(addr, buffer_size, timeout).await
                }
            }
        };
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            stream = connect => stream?,
        };

        let local = stream.local_addr().ok();
        // through a proxy this is the proxy's address
        let peer = stream.peer_addr().ok();
        debug!(?local, ?peer, "Connected");

        let stream = match &self.tls {
            Some(client) => {
                tls::connect(
                    &client.connector,
                    client.server_name.clone(),
                    stream,
                    timeout,
                    cancel,
                )
                .await
                .map_err(|e| {
                    self.template.metrics.tls_failure();
                    e
                })?
            }
            None => boxed(stream),
        };
        Ok((stream, local, peer))
    }
}
