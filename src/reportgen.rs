//! The reportgen actor is responsible for generating a single netcheck report.
//!
//! It is implemented as an actor with [`Client`] as handle.
//!
//! The actor starts generating the report as soon as it is created, it does not receive
//! any messages from the client.  It follows roughly these steps:
//!
//! - Determines host IPv6 support.
//! - Creates the hairpin actor.
//! - Creates the portmapper future.
//! - Creates the captive portal detection future.
//! - Creates the probe set futures.
//!   - These send messages to the reportgen actor.
//! - Loops driving the futures and handling actor messages:
//!   - Disables futures as they are completed or aborted.
//!   - Starts the HTTPS latency fallback once the STUN phase ends without any UDP.
//!   - Stops if there are no outstanding tasks/futures, or on timeout.
//! - Sends the completed report to the netcheck actor.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use rand::seq::IteratorRandom;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, debug_span, error, info_span, trace, warn, Instrument, Span};

use crate as netcheck;
use crate::defaults::DEFAULT_STUN_PORT;
use crate::dns;
use crate::interfaces;
use crate::portmapper;
use crate::relay_map::{RelayMap, RelayNode, RelayRegion, UseIpv4, UseIpv6};
use crate::stun;
use crate::util::{CancelOnDrop, MaybeFuture};
use crate::{Inflight, Report};

mod hairpin;
mod probes;

use probes::{Probe, ProbePlan, ProbeProto};

/// The maximum amount of time netcheck will spend gathering a single report.
const OVERALL_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// The maximum amount of time netcheck will spend probing with STUN packets without
/// getting a reply before moving on to the HTTPS fallback, on the assumption that
/// outbound UDP is blocked.
const STUN_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to delay the start of the captive portal detection.
///
/// Chosen so it starts after good-working STUN probes would have finished, but not too
/// long so the delay is bearable if STUN is blocked.
const CAPTIVE_PORTAL_DELAY: Duration = Duration::from_millis(200);

/// Timeout for captive portal checks.
///
/// Must be lower than [`OVERALL_REPORT_TIMEOUT`] minus [`CAPTIVE_PORTAL_DELAY`].
const CAPTIVE_PORTAL_TIMEOUT: Duration = Duration::from_secs(2);

/// The number of regions that must report latency before further probes are abandoned.
const ENOUGH_REGIONS: usize = 3;

/// Environment variable which, when set non-empty, makes reports collect latencies for
/// (practically) all regions instead of stopping at [`ENOUGH_REGIONS`].
const ENV_VERBOSE: &str = "NETCHECK_VERBOSE";

const DNS_TIMEOUT: Duration = Duration::from_secs(1);

/// How much of an HTTPS latency-check body is drained before taking the time.
const HTTPS_LATENCY_BODY_LIMIT: u64 = 8 << 10;

fn enough_regions() -> usize {
    match std::env::var(ENV_VERBOSE) {
        Ok(value) if !value.is_empty() => 100,
        _ => ENOUGH_REGIONS,
    }
}

/// Holds the state for a single invocation of [`netcheck::Client::get_report`].
///
/// Dropping this will cancel the actor and stop the report generation.
#[derive(Debug)]
pub(super) struct Client {
    _drop_guard: CancelOnDrop,
}

impl Client {
    /// Creates a new actor generating a single report.
    ///
    /// The actor starts running immediately and only generates a single report, after
    /// which it shuts down.  Dropping this handle will abort the actor.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        netcheck: netcheck::Addr,
        last_report: Option<Arc<Report>>,
        port_mapper: Option<portmapper::Client>,
        skip_external_network: bool,
        relay_map: RelayMap,
        stun_sock4: Option<Arc<UdpSocket>>,
        stun_sock6: Option<Arc<UdpSocket>>,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let addr = Addr {
            sender: msg_tx.clone(),
        };
        let incremental = last_report.is_some();
        let mut actor = Actor {
            msg_tx,
            msg_rx,
            netcheck: netcheck.clone(),
            last_report,
            port_mapper,
            skip_external_network,
            incremental,
            relay_map,
            stun_sock4,
            stun_sock6,
            report: Report::default(),
            hairpin_actor: hairpin::Client::new(netcheck, addr),
            outstanding_tasks: OutstandingTasks::default(),
        };
        let task = tokio::spawn(
            async move { actor.run().await }.instrument(info_span!("reportgen.actor")),
        );
        Self {
            _drop_guard: CancelOnDrop::new("reportgen actor", task.abort_handle()),
        }
    }
}

/// The address of the reportgen [`Actor`].
///
/// Unlike the [`Client`] struct itself this is the raw channel to send messages over.
/// Keeping this alive will not keep the actor alive, which makes this handy to pass to
/// internal tasks.
#[derive(Debug, Clone)]
pub(super) struct Addr {
    sender: mpsc::Sender<Message>,
}

impl Addr {
    async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        trace!(
            "sending {:?} to channel with cap {}",
            msg,
            self.sender.capacity()
        );
        self.sender.send(msg).await
    }
}

/// Messages to send to the reportgen [`Actor`].
#[derive(Debug)]
enum Message {
    /// Set the hairpinning availability in the report.
    HairpinResult(bool),
    /// Check whether executing a probe would still help.
    ProbeWouldHelp(Probe, Arc<RelayNode>, oneshot::Sender<bool>),
    /// Abort all remaining probes.
    AbortProbes,
}

/// The reportgen actor.
///
/// This actor starts, generates a single report and exits.
#[derive(Debug)]
struct Actor {
    /// The sender of the message channel, so we can give out [`Addr`].
    msg_tx: mpsc::Sender<Message>,
    /// The receiver of the message channel.
    msg_rx: mpsc::Receiver<Message>,
    /// The address of the netcheck actor.
    netcheck: netcheck::Addr,

    // Provided state
    /// The previous report, if it exists.
    last_report: Option<Arc<Report>>,
    /// The portmapper client, if there is one.
    port_mapper: Option<portmapper::Client>,
    /// Whether the actor should only probe localhost-reachable things.
    ///
    /// Set by tests to avoid probing the local LAN's router.
    skip_external_network: bool,
    /// The relay configuration.
    relay_map: RelayMap,
    /// Socket to send IPv4 STUN requests from.
    stun_sock4: Option<Arc<UdpSocket>>,
    /// Socket to send IPv6 STUN requests from.
    stun_sock6: Option<Arc<UdpSocket>>,

    // Internal state.
    /// Whether we're doing an incremental report.
    incremental: bool,
    /// The report being built.
    report: Report,
    /// The hairpin actor.
    hairpin_actor: hairpin::Client,
    /// Which tasks the [`Actor`] is still waiting on.
    ///
    /// This is essentially the summary of all the work the [`Actor`] is doing.
    outstanding_tasks: OutstandingTasks,
}

impl Actor {
    fn addr(&self) -> Addr {
        Addr {
            sender: self.msg_tx.clone(),
        }
    }

    async fn run(&mut self) {
        match self.run_inner().await {
            Ok(_) => debug!("reportgen actor finished"),
            Err(err) => {
                error!("reportgen actor failed: {err:#}");
                self.netcheck
                    .send(netcheck::Message::ReportAborted)
                    .await
                    .ok();
            }
        }
    }

    /// Runs the main reportgen actor logic.
    async fn run_inner(&mut self) -> Result<()> {
        debug!(
            port_mapper = %self.port_mapper.is_some(),
            incremental = %self.incremental,
            "reportgen actor starting",
        );

        self.report.os_has_ipv6 = netcheck::os_has_ipv6().await;
        if self.incremental {
            // Hairpinning is not re-probed on incremental reports, the previous verdict
            // is carried over.
            self.report.hair_pinning = self.last_report.as_ref().and_then(|r| r.hair_pinning);
        }

        let mut port_mapping = self.prepare_portmapper_task();
        let mut captive_task = self.prepare_captive_portal_task();
        let mut probes = self.spawn_probes_task().await?;
        let mut https_probes: MaybeFuture<
            Pin<Box<dyn Future<Output = Vec<(u16, Duration, IpAddr)>> + Send>>,
        > = MaybeFuture::default();
        let mut https_started = false;

        let total_timer = time::sleep(OVERALL_REPORT_TIMEOUT);
        tokio::pin!(total_timer);
        let probe_timer = time::sleep(STUN_PROBE_TIMEOUT);
        tokio::pin!(probe_timer);

        loop {
            trace!(awaiting = ?self.outstanding_tasks, "tick; awaiting tasks");

            // Once the STUN phase is over without any UDP, fall back to HTTPS latency
            // probes for the regions still missing data.
            if !self.outstanding_tasks.probes && !self.report.udp && !https_started {
                https_started = true;
                https_probes = self.prepare_https_fallback_task();
            }
            if self.outstanding_tasks.all_done() {
                debug!("all tasks done");
                break;
            }
            tokio::select! {
                biased;
                _ = &mut total_timer => {
                    // A partially-populated report is a valid result, return what we
                    // have learned so far.
                    warn!("tick: report timed out");
                    break;
                }

                _ = &mut probe_timer, if self.outstanding_tasks.probes => {
                    warn!("tick: probes timed out");
                    probes.abort_all();
                    self.handle_abort_probes();
                }

                // Drive the portmapper.
                pm = &mut port_mapping, if self.outstanding_tasks.port_mapper => {
                    debug!(probe=%pm, "tick: portmapper probe report");
                    self.report.upnp = Some(pm.upnp);
                    self.report.pmp = Some(pm.pmp);
                    self.report.pcp = Some(pm.pcp);
                    port_mapping.inner = None;
                    self.outstanding_tasks.port_mapper = false;
                }

                // Check for probes finishing.
                set_result = probes.join_next(), if self.outstanding_tasks.probes => {
                    trace!("tick: probes done: {:?}", set_result);
                    match set_result {
                        Some(Ok(Ok(report))) => self.handle_probe_report(report),
                        Some(Ok(Err(_))) => (),
                        Some(Err(err)) => {
                            warn!("probes task error: {:?}", err);
                        }
                        None => {
                            self.handle_abort_probes();
                        }
                    }
                }

                // Drive the captive portal task.
                found = &mut captive_task, if self.outstanding_tasks.captive_task => {
                    trace!("tick: captive portal task done");
                    self.report.captive_portal = found;
                    captive_task.inner = None;
                    self.outstanding_tasks.captive_task = false;
                }

                // Drive the HTTPS fallback.
                latencies = &mut https_probes, if self.outstanding_tasks.https_probes => {
                    trace!("tick: HTTPS fallback done");
                    for (region_id, latency, ip) in latencies {
                        self.report.region_latency.update_region(region_id, latency);
                        // These are not entirely meaningful and not necessarily both
                        // set: with UDP blocked, which family the TCP connection used is
                        // basically arbitrary.
                        match ip {
                            IpAddr::V4(_) => self.report.ipv4_can_send = true,
                            IpAddr::V6(_) => self.report.ipv6_can_send = true,
                        }
                    }
                    https_probes.inner = None;
                    self.outstanding_tasks.https_probes = false;
                }

                // Handle actor messages.
                msg = self.msg_rx.recv() => {
                    trace!("tick: msg recv: {:?}", msg);
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => bail!("msg_rx closed, reportgen client must be dropped"),
                    }
                }
            }
        }

        if !probes.is_empty() {
            debug!(
                "aborting {} probe sets, already have enough reports",
                probes.len()
            );
            drop(probes);
        }

        debug!("sending report to netcheck actor");
        self.netcheck
            .send(netcheck::Message::ReportReady {
                report: Box::new(self.report.clone()),
            })
            .await?;

        Ok(())
    }

    /// Handles an actor message.
    fn handle_message(&mut self, msg: Message) {
        trace!(?msg, "handling message");
        match msg {
            Message::HairpinResult(works) => {
                self.report.hair_pinning = Some(works);
                self.outstanding_tasks.hairpin = false;
            }
            Message::ProbeWouldHelp(probe, node, response_tx) => {
                let res = self.probe_would_help(probe, node);
                if response_tx.send(res).is_err() {
                    debug!("probe dropped before ProbeWouldHelp response sent");
                }
            }
            Message::AbortProbes => {
                self.handle_abort_probes();
            }
        }
    }

    fn handle_probe_report(&mut self, probe_report: ProbeReport) {
        debug!(?probe_report, "finished probe");
        update_report(&mut self.report, probe_report);

        // When we discover the first IPv4 address we want to start the hairpin check.
        // Incremental reports carry the previous verdict instead of re-probing.
        if !self.incremental {
            if let Some(SocketAddr::V4(addr)) = self.report.global_v4 {
                if !self.hairpin_actor.has_started() {
                    self.hairpin_actor.start_check(addr);
                    self.outstanding_tasks.hairpin = true;
                }
            }
        }

        // Once we've heard from enough regions (3), start a timer to give up on the
        // other probes.  The timer's duration is a function of whether this is our
        // initial full probe or an incremental one.  For incremental ones, wait for the
        // duration of the slowest region.  For initial ones, double that.  Smaller maps
        // never reach the threshold; there the probe phase timers bound the wait.
        if self.report.region_latency.len() == enough_regions() {
            let timeout = self.report.region_latency.max_latency();
            let timeout = match self.incremental {
                true => timeout,
                false => timeout * 2,
            };
            let reportcheck = self.addr();
            debug!(
                regions = self.report.region_latency.len(),
                delay = ?timeout,
                "have enough probe reports, aborting further probes soon",
            );
            tokio::spawn(
                async move {
                    time::sleep(timeout).await;
                    // Because we do this after a timeout it is entirely normal that the
                    // actor is no longer there by the time we send this message.
                    reportcheck
                        .send(Message::AbortProbes)
                        .await
                        .map_err(|err| trace!("failed to abort all probes: {err:#}"))
                        .ok();
                }
                .instrument(Span::current()),
            );
        }
    }

    /// Whether running this probe would still improve our report.
    fn probe_would_help(&mut self, probe: Probe, node: Arc<RelayNode>) -> bool {
        // If the probe is for a region we don't yet know about, that would help.
        if self.report.region_latency.get(node.region_id).is_none() {
            return true;
        }

        // If the probe is for IPv6 and we don't yet have any IPv6 data, that would help.
        if probe.proto() == ProbeProto::StunIpv6 && self.report.region_v6_latency.is_empty() {
            return true;
        }

        // For IPv4, we need at least two IPv4 results overall to determine whether we're
        // behind a NAT that shows us as different source IPs and/or ports depending on
        // who we're talking to.  If we don't yet have two results
        // (`mapping_varies_by_dest_ip` is blank), then another IPv4 probe would be good.
        if probe.proto() == ProbeProto::StunIpv4 && self.report.mapping_varies_by_dest_ip.is_none()
        {
            return true;
        }

        // Otherwise not interesting.
        false
    }

    /// Stops further probes.
    ///
    /// This makes sure that no further probes are run and also cancels the captive
    /// portal task if there were successful probes.  Be sure to only handle this after
    /// all the required [`ProbeReport`]s have been processed.
    fn handle_abort_probes(&mut self) {
        trace!("handle abort probes");
        self.outstanding_tasks.probes = false;
        if self.report.udp {
            // We know the captive portal is not blocking us.
            self.outstanding_tasks.captive_task = false;
        }
    }

    /// Creates the future which will perform the portmapper probe.
    fn prepare_portmapper_task(
        &mut self,
    ) -> MaybeFuture<Pin<Box<impl Future<Output = portmapper::ProbeOutput>>>> {
        let mut port_mapping = MaybeFuture::default();
        if self.skip_external_network {
            return port_mapping;
        }
        if let Some(port_mapper) = self.port_mapper.clone() {
            port_mapping.inner = Some(Box::pin(async move {
                match port_mapper.probe().await {
                    Ok(probe) => probe,
                    Err(err) => {
                        // The probe failed, which counts as all three protocols having
                        // been checked and found absent.
                        warn!("port mapping probe failed: {err:#}");
                        portmapper::ProbeOutput::default()
                    }
                }
            }));
            self.outstanding_tasks.port_mapper = true;
        }
        port_mapping
    }

    /// Creates the future which will perform the captive portal check.
    ///
    /// Only full reports check for captive portals, and only when the STUN probes have
    /// not proven working UDP by [`CAPTIVE_PORTAL_DELAY`].
    fn prepare_captive_portal_task(
        &mut self,
    ) -> MaybeFuture<Pin<Box<impl Future<Output = Option<bool>>>>> {
        if self.incremental {
            return MaybeFuture::default();
        }
        // Even on a full probe we may want to try our preferred region first.
        let preferred_region = self.last_report.as_ref().map(|r| r.preferred_region);
        let relay_map = self.relay_map.clone();
        self.outstanding_tasks.captive_task = true;
        MaybeFuture {
            inner: Some(Box::pin(async move {
                time::sleep(CAPTIVE_PORTAL_DELAY).await;
                debug!("captive portal check started after {CAPTIVE_PORTAL_DELAY:?}");
                let check = time::timeout(
                    CAPTIVE_PORTAL_TIMEOUT,
                    check_captive_portal(&relay_map, preferred_region)
                        .instrument(debug_span!("captive-portal")),
                );
                match check.await {
                    Ok(Ok(found)) => Some(found),
                    Ok(Err(err)) => {
                        debug!("check_captive_portal failed: {err:#}");
                        None
                    }
                    Err(_) => {
                        warn!("check_captive_portal timed out");
                        None
                    }
                }
            })),
        }
    }

    /// Prepares the future which runs the HTTPS latency fallback.
    ///
    /// Covers the regions which have an HTTP(S)-capable node but no recorded latency.
    fn prepare_https_fallback_task(
        &mut self,
    ) -> MaybeFuture<Pin<Box<dyn Future<Output = Vec<(u16, Duration, IpAddr)>> + Send>>> {
        let need: Vec<Arc<RelayRegion>> = self
            .relay_map
            .regions()
            .filter(|region| !region.avoid)
            .filter(|region| self.report.region_latency.get(region.region_id).is_none())
            .filter(|region| region.nodes.iter().any(|node| !node.stun_only))
            .cloned()
            .collect();
        if need.is_empty() {
            return MaybeFuture::default();
        }
        debug!("UDP is blocked, trying HTTPS");
        self.outstanding_tasks.https_probes = true;
        MaybeFuture {
            inner: Some(Box::pin(async move {
                let mut tasks = JoinSet::default();
                for region in need {
                    let region_id = region.region_id;
                    tasks.spawn(
                        async move {
                            match measure_https_latency(&region).await {
                                Ok((latency, ip)) => {
                                    debug!(region = region_id, ?latency, "HTTPS latency measured");
                                    Some((region_id, latency, ip))
                                }
                                Err(err) => {
                                    debug!(
                                        region = region_id,
                                        "HTTPS latency measurement failed: {err:#}"
                                    );
                                    None
                                }
                            }
                        }
                        .instrument(debug_span!("measure-https", region = region_id)),
                    );
                }
                let mut results = Vec::new();
                while let Some(res) = tasks.join_next().await {
                    if let Ok(Some(result)) = res {
                        results.push(result);
                    }
                }
                results
            })),
        }
    }

    /// Prepares the future which will run all the probes as per the generated plan.
    ///
    /// Probes operate like the following:
    ///
    /// - A future is created for each probe in all probe sets.
    /// - All probes in a set are grouped in a [`JoinSet`].
    /// - All those probe sets are grouped in one overall [`JoinSet`].
    ///   - This future is polled by the main actor loop to make progress.
    /// - Once a probe future is polled:
    ///   - Many probes start with a delay, they sleep during this time.
    ///   - When a probe starts it first asks the reportgen [`Actor`] if it is still
    ///     useful to run.  If not it aborts the entire probe set.
    ///   - When a probe finishes, its [`ProbeReport`] is yielded to the reportgen actor.
    /// - Probes get aborted in several ways:
    ///   - A running probe can fail and abort the entire probe set if it deems the
    ///     failure permanent.  Probes in a probe set are essentially retries.
    ///   - Once there are reports from enough regions, all remaining probes are aborted.
    async fn spawn_probes_task(&mut self) -> Result<JoinSet<Result<ProbeReport>>> {
        let if_state = interfaces::State::new().await;
        debug!(?if_state, "local interfaces");
        let plan = match self.last_report {
            Some(ref report) => ProbePlan::with_last_report(&self.relay_map, &if_state, report),
            None => ProbePlan::initial(&self.relay_map, &if_state),
        };
        trace!(%plan, "probe plan");

        // A collection of futures running probe sets.
        let mut probes = JoinSet::default();
        for probe_set in plan.iter() {
            let mut set = JoinSet::default();
            for probe in probe_set {
                let reportstate = self.addr();
                let stun_sock4 = self.stun_sock4.clone();
                let stun_sock6 = self.stun_sock6.clone();
                let node = probe.node().clone();
                let probe = probe.clone();
                let netcheck = self.netcheck.clone();

                set.spawn(
                    run_probe(reportstate, stun_sock4, stun_sock6, node, probe.clone(), netcheck)
                        .instrument(debug_span!("run_probe", %probe)),
                );
            }

            // Add the probe set to all futures of probe sets.  Handle aborting a probe
            // set if needed, only normal errors means the set continues.
            probes.spawn(async move {
                while let Some(res) = set.join_next().await {
                    match res {
                        Ok(Ok(report)) => return Ok(report),
                        Ok(Err(ProbeError::Error(err, probe))) => {
                            warn!(?probe, "probe failed: {:#}", err);
                            continue;
                        }
                        Ok(Err(ProbeError::AbortSet(err, probe))) => {
                            debug!(?probe, "probe set aborted: {:#}", err);
                            set.abort_all();
                            return Err(err);
                        }
                        Err(err) => {
                            warn!("fatal probe set error, aborting: {:#}", err);
                            continue;
                        }
                    }
                }
                Err(anyhow!("all probes in probe set failed"))
            });
        }
        self.outstanding_tasks.probes = true;

        Ok(probes)
    }
}

/// Tasks on which the reportgen [`Actor`] is still waiting.
///
/// There is no particular progression, e.g. hairpin starts `false`, moves to `true` when
/// a check is started and then becomes `false` again once it is finished.
#[derive(Debug, Default)]
struct OutstandingTasks {
    probes: bool,
    port_mapper: bool,
    captive_task: bool,
    hairpin: bool,
    https_probes: bool,
}

impl OutstandingTasks {
    fn all_done(&self) -> bool {
        !(self.probes
            || self.port_mapper
            || self.captive_task
            || self.hairpin
            || self.https_probes)
    }
}

/// The success result of [`run_probe`].
#[derive(Debug, Clone)]
struct ProbeReport {
    /// Whether we can send IPv4 UDP packets.
    ipv4_can_send: bool,
    /// Whether we can send IPv6 UDP packets.
    ipv6_can_send: bool,
    /// The latency to the relay node.
    latency: Option<Duration>,
    /// The probe that generated this report.
    probe: Probe,
    /// The discovered public address.
    addr: Option<SocketAddr>,
}

impl ProbeReport {
    fn new(probe: Probe) -> Self {
        ProbeReport {
            probe,
            ipv4_can_send: false,
            ipv6_can_send: false,
            latency: None,
            addr: None,
        }
    }
}

/// Errors for [`run_probe`].
///
/// The main purpose is to signal whether other probes in this probe set should still be
/// run.  Recall that a probe set is normally a set of identical probes with delays,
/// effectively creating retries, and the first successful probe of a probe set will
/// cancel the others in the set.  So this allows an unsuccessful probe to cancel the
/// remainder of the set or not.
#[derive(Debug)]
enum ProbeError {
    /// Abort the current set.
    AbortSet(anyhow::Error, Probe),
    /// Continue the other probes in the set.
    Error(anyhow::Error, Probe),
}

/// Executes a particular [`Probe`], including using a delayed start if needed.
async fn run_probe(
    reportstate: Addr,
    stun_sock4: Option<Arc<UdpSocket>>,
    stun_sock6: Option<Arc<UdpSocket>>,
    node: Arc<RelayNode>,
    probe: Probe,
    netcheck: netcheck::Addr,
) -> Result<ProbeReport, ProbeError> {
    if !probe.delay().is_zero() {
        trace!("delaying probe");
        time::sleep(probe.delay()).await;
    }
    debug!("starting probe");

    let (would_help_tx, would_help_rx) = oneshot::channel();
    if let Err(err) = reportstate
        .send(Message::ProbeWouldHelp(
            probe.clone(),
            node.clone(),
            would_help_tx,
        ))
        .await
    {
        // This happens on shutdown or if the report is already finished.
        debug!("failed to check if probe would help: {err:#}");
        return Err(ProbeError::AbortSet(err.into(), probe.clone()));
    }

    if !would_help_rx.await.map_err(|_| {
        ProbeError::AbortSet(
            anyhow!("reportgen actor dropped sender while waiting for ProbeWouldHelp response"),
            probe.clone(),
        )
    })? {
        return Err(ProbeError::AbortSet(
            anyhow!("reportgen says probe set no longer useful"),
            probe,
        ));
    }

    let relay_addr = get_node_addr(&node, probe.proto())
        .await
        .context("no relay node addr")
        .map_err(|e| ProbeError::AbortSet(e, probe.clone()))?;

    let maybe_sock = match probe.proto() {
        ProbeProto::StunIpv4 => stun_sock4.as_ref(),
        ProbeProto::StunIpv6 => stun_sock6.as_ref(),
    };
    match maybe_sock {
        Some(sock) => run_stun_probe(sock, relay_addr, netcheck, probe).await,
        None => Err(ProbeError::AbortSet(
            anyhow!("no socket for {}, aborting probe set", probe.proto()),
            probe.clone(),
        )),
    }
}

/// Run a STUN IPv4 or IPv6 probe.
async fn run_stun_probe(
    sock: &Arc<UdpSocket>,
    relay_addr: SocketAddr,
    netcheck: netcheck::Addr,
    probe: Probe,
) -> Result<ProbeReport, ProbeError> {
    let txid = stun::TransactionId::default();
    let req = stun::request(txid);

    // Setup netcheck to give us back the incoming STUN response.
    let (stun_tx, stun_rx) = oneshot::channel();
    let (inflight_ready_tx, inflight_ready_rx) = oneshot::channel();
    netcheck
        .send(netcheck::Message::InFlightStun(
            Inflight {
                txn: txid,
                start: Instant::now(),
                s: stun_tx,
            },
            inflight_ready_tx,
        ))
        .await
        .map_err(|e| ProbeError::Error(e.into(), probe.clone()))?;
    inflight_ready_rx
        .await
        .map_err(|e| ProbeError::Error(e.into(), probe.clone()))?;

    // Send the probe.
    match sock.send_to(&req, relay_addr).await {
        Ok(n) if n == req.len() => {
            debug!(%relay_addr, %txid, "sending {} probe", probe.proto());
            let mut result = ProbeReport::new(probe.clone());

            if matches!(probe, Probe::StunIpv4 { .. }) {
                result.ipv4_can_send = true;
            } else {
                result.ipv6_can_send = true;
            }
            let (delay, addr) = stun_rx
                .await
                .map_err(|e| ProbeError::Error(e.into(), probe.clone()))?;
            result.latency = Some(delay);
            result.addr = Some(addr);
            Ok(result)
        }
        Ok(n) => {
            let err = anyhow!("failed to send full STUN request: {}", probe.proto());
            error!(%relay_addr, sent_len=n, req_len=req.len(), "{err:#}");
            Err(ProbeError::Error(err, probe.clone()))
        }
        Err(err) => {
            let kind = err.kind();
            let err = anyhow::Error::new(err)
                .context(format!("failed to send STUN request: {}", probe.proto()));

            // It is entirely normal that we are on a dual-stack machine with no routed
            // IPv6 network, so silence that case.  NetworkUnreachable is not matchable
            // by ErrorKind on our MSRV (io_error_more), hence the hack.
            match format!("{kind:?}").as_str() {
                "NetworkUnreachable" => {
                    debug!(%relay_addr, "{err:#}");
                    Err(ProbeError::AbortSet(err, probe.clone()))
                }
                _ => {
                    // No need to log this, our caller does already log this.
                    Err(ProbeError::Error(err, probe.clone()))
                }
            }
        }
    }
}

/// Reports whether or not we think the system is behind a captive portal, detected by
/// making a request to a URL that we know should return a "204 No Content" response and
/// checking if that's what we get.
///
/// The boolean return is whether we think we have a captive portal.
async fn check_captive_portal(relay_map: &RelayMap, preferred_region: Option<u16>) -> Result<bool> {
    // If we have a preferred region with a non-STUN-only node, use that; otherwise pick
    // a random node suitable for HTTP requests.
    let node = preferred_region
        .and_then(|region_id| relay_map.get_region(region_id))
        .and_then(|region| region.nodes.iter().find(|node| !node.stun_only).cloned());
    let node = match node {
        Some(node) => node,
        None => {
            let candidates: Vec<_> = relay_map
                .regions()
                .filter(|region| !region.avoid)
                .flat_map(|region| region.nodes.iter())
                .filter(|node| !node.stun_only)
                .cloned()
                .collect();
            match candidates.into_iter().choose(&mut rand::thread_rng()) {
                Some(node) => node,
                None => {
                    debug!("no suitable relay node for captive portal check");
                    return Ok(false);
                }
            }
        }
    };

    if node.host_name.ends_with(".invalid") {
        // Don't try to connect to invalid hostnames.  This occurred in tests.
        return Ok(false);
    }

    let client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    // Note: the set of valid characters in a challenge and the total length is limited.
    let challenge = format!("nc_{}", node.host_name);
    let portal_url = format!("http://{}/generate_204", node.host_name);
    let res = client
        .get(portal_url)
        .header("X-Netcheck-Challenge", &challenge)
        .send()
        .await?;

    let expected_response = format!("response {challenge}");
    let is_valid_response = res
        .headers()
        .get("X-Netcheck-Response")
        .map(|s| s.to_str().unwrap_or_default())
        == Some(expected_response.as_str());

    debug!(
        "check_captive_portal url={} status_code={} valid_response={}",
        res.url(),
        res.status(),
        is_valid_response,
    );
    let has_captive = res.status().as_u16() != 204 || !is_valid_response;

    Ok(has_captive)
}

/// Returns the socket address to use to communicate with this relay node.
///
/// The port defaults to the STUN default.  A configured `stun_test_ip` wins over
/// everything, subject to matching the probe's address family; next are the configured
/// address literals; last the first family-matching DNS answer for the host name.
async fn get_node_addr(node: &RelayNode, proto: ProbeProto) -> Result<SocketAddr> {
    let port = if node.stun_port == 0 {
        DEFAULT_STUN_PORT
    } else {
        node.stun_port
    };

    if let Some(ip) = node.stun_test_ip {
        match (proto, ip) {
            (ProbeProto::StunIpv4, IpAddr::V6(_)) => {
                bail!("STUN test IP of {} has the wrong family", node.name)
            }
            (ProbeProto::StunIpv6, IpAddr::V4(_)) => {
                bail!("STUN test IP of {} has the wrong family", node.name)
            }
            _ => return Ok(SocketAddr::new(ip, port)),
        }
    }

    match proto {
        ProbeProto::StunIpv4 => {
            match node.ipv4 {
                UseIpv4::Some(ip) => return Ok(SocketAddr::new(ip.into(), port)),
                UseIpv4::Disabled => bail!("IPv4 disabled for {}", node.name),
                UseIpv4::TryDns => {}
            }
            debug!(host = %node.host_name, "performing DNS A lookup for relay addr");
            let addrs = dns::lookup_ipv4(&node.host_name, DNS_TIMEOUT).await?;
            addrs
                .first()
                .map(|addr| SocketAddr::new(IpAddr::V4(*addr), port))
                .ok_or_else(|| anyhow!("no suitable relay addr found"))
        }
        ProbeProto::StunIpv6 => {
            match node.ipv6 {
                UseIpv6::Some(ip) => return Ok(SocketAddr::new(ip.into(), port)),
                UseIpv6::Disabled => bail!("IPv6 disabled for {}", node.name),
                UseIpv6::TryDns => {}
            }
            debug!(host = %node.host_name, "performing DNS AAAA lookup for relay addr");
            let addrs = dns::lookup_ipv6(&node.host_name, DNS_TIMEOUT).await?;
            addrs
                .first()
                .map(|addr| SocketAddr::new(IpAddr::V6(*addr), port))
                .ok_or_else(|| anyhow!("no suitable relay addr found"))
        }
    }
}

/// Measures the latency of one region over HTTPS.
///
/// Times a `GET /derp/latency-check` against the region's first HTTP-capable node,
/// draining the response body up to a small limit.  Also returns the peer address the
/// connection used, which tells the caller which address family worked.
async fn measure_https_latency(region: &RelayRegion) -> Result<(Duration, IpAddr)> {
    let node = region
        .nodes
        .iter()
        .find(|node| !node.stun_only)
        .context("no relay node with an HTTP endpoint")?;
    ensure!(
        !node.host_name.ends_with(".invalid"),
        "invalid hostname for HTTPS probe"
    );

    let client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let url = format!("https://{}/derp/latency-check", node.host_name);

    let start = Instant::now();
    let mut response = client.get(url).send().await?;
    let remote_ip = response
        .remote_addr()
        .context("missing remote addr")?
        .ip();

    // Relays should give us a nominal status code, anything else is probably an access
    // denied by a MITM proxy, or at the very least a signal not to trust this latency.
    ensure!(
        response.status().as_u16() <= 299,
        "unexpected status code: {}",
        response.status()
    );

    let mut drained: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        drained += chunk.len() as u64;
        if drained >= HTTPS_LATENCY_BODY_LIMIT {
            break;
        }
    }
    let latency = start.elapsed();

    Ok((latency, remote_ip))
}

/// Updates a [`Report`] with a new [`ProbeReport`].
///
/// Latencies are merged keeping the per-region minimum.  The first reflexive IPv4
/// address becomes `global_v4`; later differing ones decide the mapping variance.
fn update_report(report: &mut Report, probe_report: ProbeReport) {
    let node = probe_report.probe.node();
    if let Some(latency) = probe_report.latency {
        report.udp = true;
        report.region_latency.update_region(node.region_id, latency);

        match probe_report.addr {
            Some(ipp @ SocketAddr::V4(_)) => {
                report.ipv4 = true;
                report.region_v4_latency.update_region(node.region_id, latency);
                if report.global_v4.is_none() {
                    report.global_v4 = Some(ipp);
                } else if report.global_v4 != Some(ipp) {
                    report.mapping_varies_by_dest_ip = Some(true);
                } else if report.mapping_varies_by_dest_ip.is_none() {
                    report.mapping_varies_by_dest_ip = Some(false);
                }
            }
            Some(ipp @ SocketAddr::V6(_)) => {
                report.ipv6 = true;
                report.region_v6_latency.update_region(node.region_id, latency);
                report.global_v6 = Some(ipp);
                // Mapping variance is not assessed for IPv6.
            }
            None => {
                // If we are here we had a latency reported from a STUN probe, thus we
                // must have a reported address.
                debug_assert!(probe_report.addr.is_some());
            }
        }
    }
    report.ipv4_can_send |= probe_report.ipv4_can_send;
    report.ipv6_can_send |= probe_report.ipv6_can_send;
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use crate::relay_map::RelayRegion;

    use super::*;

    fn test_node(region_id: u16) -> Arc<RelayNode> {
        Arc::new(RelayNode {
            name: format!("{region_id}a"),
            region_id,
            host_name: format!("relay-{region_id}.example.net"),
            stun_port: 0,
            stun_only: false,
            stun_test_ip: None,
            ipv4: UseIpv4::TryDns,
            ipv6: UseIpv6::TryDns,
        })
    }

    #[test]
    fn test_update_report_stun_working() {
        let node_1 = test_node(1);
        let node_2 = test_node(2);

        let mut report = Report::default();

        // A STUN IPv4 probe from region 1.
        let probe_report_1 = ProbeReport {
            ipv4_can_send: true,
            ipv6_can_send: false,
            latency: Some(Duration::from_millis(5)),
            probe: Probe::StunIpv4 {
                delay: Duration::ZERO,
                node: node_1.clone(),
            },
            addr: Some((Ipv4Addr::new(203, 0, 113, 1), 1234).into()),
        };
        update_report(&mut report, probe_report_1.clone());

        assert!(report.udp);
        assert!(report.ipv4);
        assert_eq!(report.region_latency.get(1).unwrap(), Duration::from_millis(5));
        assert_eq!(
            report.region_v4_latency.get(1).unwrap(),
            Duration::from_millis(5)
        );
        assert!(report.ipv4_can_send);
        assert!(!report.ipv6_can_send);
        assert_eq!(
            report.global_v4,
            Some((Ipv4Addr::new(203, 0, 113, 1), 1234).into())
        );
        assert_eq!(report.mapping_varies_by_dest_ip, None);

        // A second STUN IPv4 probe, same region, slower; the region latency keeps the
        // minimum.
        let probe_report_slow = ProbeReport {
            latency: Some(Duration::from_millis(8)),
            ..probe_report_1.clone()
        };
        update_report(&mut report, probe_report_slow);
        assert_eq!(report.region_latency.get(1).unwrap(), Duration::from_millis(5));
        // Same external endpoint seen again: mapping does not vary.
        assert_eq!(report.mapping_varies_by_dest_ip, Some(false));

        // A STUN IPv6 probe, faster.
        let probe_report_v6 = ProbeReport {
            ipv4_can_send: false,
            ipv6_can_send: true,
            latency: Some(Duration::from_millis(4)),
            probe: Probe::StunIpv6 {
                delay: Duration::ZERO,
                node: node_2.clone(),
            },
            addr: Some((Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 1234).into()),
        };
        update_report(&mut report, probe_report_v6);

        assert!(report.ipv6);
        assert_eq!(report.region_latency.get(2).unwrap(), Duration::from_millis(4));
        assert_eq!(
            report.region_v6_latency.get(2).unwrap(),
            Duration::from_millis(4)
        );
        assert!(report.ipv4_can_send);
        assert!(report.ipv6_can_send);
        assert!(report.global_v6.is_some());
    }

    #[test]
    fn test_update_report_mapping_varies() {
        let mut report = Report::default();

        let probe_report = |region_id: u16, port: u16| ProbeReport {
            ipv4_can_send: true,
            ipv6_can_send: false,
            latency: Some(Duration::from_millis(5)),
            probe: Probe::StunIpv4 {
                delay: Duration::ZERO,
                node: test_node(region_id),
            },
            addr: Some((Ipv4Addr::new(198, 51, 100, 7), port).into()),
        };

        update_report(&mut report, probe_report(1, 40000));
        assert_eq!(report.mapping_varies_by_dest_ip, None);

        // A different reflexive endpoint from another region: endpoint-dependent
        // mapping.
        update_report(&mut report, probe_report(2, 40001));
        assert_eq!(report.mapping_varies_by_dest_ip, Some(true));
        // The first endpoint stays the global one.
        assert_eq!(
            report.global_v4,
            Some((Ipv4Addr::new(198, 51, 100, 7), 40000).into())
        );
    }

    #[tokio::test]
    async fn test_get_node_addr_stun_test_ip() {
        let mut node = (*test_node(1)).clone();
        node.stun_test_ip = Some("127.0.0.1".parse().unwrap());
        node.stun_port = 1234;

        let addr = get_node_addr(&node, ProbeProto::StunIpv4).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());

        // Family mismatch: the probe is skipped.
        assert!(get_node_addr(&node, ProbeProto::StunIpv6).await.is_err());
    }

    #[tokio::test]
    async fn test_get_node_addr_literals_and_disabled() {
        let mut node = (*test_node(1)).clone();
        node.ipv4 = UseIpv4::Some("192.0.2.10".parse().unwrap());
        node.ipv6 = UseIpv6::Disabled;

        let addr = get_node_addr(&node, ProbeProto::StunIpv4).await.unwrap();
        assert_eq!(addr, "192.0.2.10:3478".parse().unwrap());
        assert!(get_node_addr(&node, ProbeProto::StunIpv6).await.is_err());
    }

    #[tokio::test]
    async fn test_measure_https_latency_rejects_stun_only_regions() {
        let mut node = (*test_node(1)).clone();
        node.stun_only = true;
        let region = RelayRegion {
            region_id: 1,
            region_code: "one".into(),
            avoid: false,
            nodes: vec![Arc::new(node)],
        };
        assert!(measure_https_latency(&region).await.is_err());
    }
}
