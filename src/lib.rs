//! Checks the network conditions from the current host.
//!
//! Netcheck probes the relay regions of a [`RelayMap`] and produces a [`Report`]
//! characterizing the host's connectivity: the fastest region, whether UDP works at all,
//! whether IPv4 and IPv6 work end-to-end, how the NAT in front of the host behaves
//! (endpoint-dependent mapping, hairpinning) and which port mapping protocols the LAN
//! gateway speaks.
//!
//! [`RelayMap`]: crate::relay_map::RelayMap

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::ip::to_canonical;
use crate::relay_map::RelayMap;
use crate::util::CancelOnDrop;

pub mod defaults;
mod dns;
pub mod interfaces;
mod ip;
pub mod portmapper;
pub mod relay_map;
mod reportgen;
pub mod stun;
mod util;

/// How often a full (non-incremental) report is forced.
const FULL_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long reports are kept for preferred-region selection.
const REPORT_HISTORY_AGE: Duration = Duration::from_secs(5 * 60);

/// The maximum latency of all regions, if none are found yet.
///
/// Normally the max latency of all regions is computed, but if we don't yet know any
/// region latencies we return this as default.  This is the value of the initial STUN
/// probe delays.  It is only used as time to wait for further latencies to arrive, which
/// *should* never happen unless there already is at least one latency.  Yet here we are,
/// defining a default which will never be used.
const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(100);

/// A netcheck report.
///
/// Can be obtained by calling [`Client::get_report`].
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Report {
    /// A UDP STUN round trip completed.
    pub udp: bool,
    /// An IPv4 STUN round trip completed.
    pub ipv4: bool,
    /// An IPv6 STUN round trip completed.
    pub ipv6: bool,
    /// An IPv4 packet was able to be sent.
    pub ipv4_can_send: bool,
    /// An IPv6 packet was able to be sent.
    pub ipv6_can_send: bool,
    /// Could bind a socket to ::1.
    pub os_has_ipv6: bool,
    /// Whether STUN results depend on which STUN server you're talking to (on IPv4).
    ///
    /// `None` means not checked; fewer than two distinct IPv4 answers arrived.
    pub mapping_varies_by_dest_ip: Option<bool>,
    /// Whether the router supports communicating between two local devices through the
    /// NATted public IP address (on IPv4).  `None` means not checked.
    pub hair_pinning: Option<bool>,
    /// Whether UPnP appears present on the LAN.  `None` means not checked.
    pub upnp: Option<bool>,
    /// Whether NAT-PMP appears present on the LAN.  `None` means not checked.
    pub pmp: Option<bool>,
    /// Whether PCP appears present on the LAN.  `None` means not checked.
    pub pcp: Option<bool>,
    /// The preferred region id, `0` for unknown.
    pub preferred_region: u16,
    /// Lowest latency observed per region, over any address family.
    pub region_latency: RegionLatencies,
    /// Lowest latency observed per region over IPv4.
    pub region_v4_latency: RegionLatencies,
    /// Lowest latency observed per region over IPv6.
    pub region_v6_latency: RegionLatencies,
    /// `ip:port` of our IPv4 address as a STUN server saw it, if any.
    pub global_v4: Option<SocketAddr>,
    /// `[ip]:port` of our IPv6 address as a STUN server saw it, if any.
    pub global_v6: Option<SocketAddr>,
    /// Set when we think there's a captive portal intercepting HTTP traffic.
    pub captive_portal: Option<bool>,
}

impl Report {
    /// Reports whether any of UPnP, PMP or PCP was checked.
    pub fn any_port_mapping_checked(&self) -> bool {
        self.upnp.is_some() || self.pmp.is_some() || self.pcp.is_some()
    }

    /// Region ids which have any family-specific latency data, sorted.
    fn latency_region_ids(&self) -> Vec<u16> {
        let mut ids: BTreeSet<u16> = self.region_v4_latency.iter().map(|(id, _)| id).collect();
        ids.extend(self.region_v6_latency.iter().map(|(id, _)| id));
        ids.into_iter().collect()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

/// Latencies per relay region.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct RegionLatencies(HashMap<u16, Duration>);

impl RegionLatencies {
    /// Creates an empty set of latencies.
    pub fn new() -> Self {
        Default::default()
    }

    /// Updates a region's latency, if it is faster than before.
    pub(crate) fn update_region(&mut self, region_id: u16, latency: Duration) {
        let val = self.0.entry(region_id).or_insert(latency);
        if latency < *val {
            *val = latency;
        }
    }

    /// Merges another [`RegionLatencies`] into this one.
    ///
    /// For each region the latency is updated using [`RegionLatencies::update_region`].
    fn merge(&mut self, other: &RegionLatencies) {
        for (region_id, latency) in other.iter() {
            self.update_region(region_id, latency);
        }
    }

    /// Returns the maximum latency over all regions.
    ///
    /// If there are not yet any latencies this will return [`DEFAULT_MAX_LATENCY`].
    pub(crate) fn max_latency(&self) -> Duration {
        self.0
            .values()
            .max()
            .copied()
            .unwrap_or(DEFAULT_MAX_LATENCY)
    }

    /// Returns an iterator over all the regions and their latencies.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Duration)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// The number of regions with latency data.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there is no latency data at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the latency of a region, if known.
    pub fn get(&self, region_id: u16) -> Option<Duration> {
        self.0.get(&region_id).copied()
    }
}

/// Client to run netchecks.
///
/// Creating this creates a netcheck actor which runs in the background.  Most of the
/// time it is idle unless [`Client::get_report`] is called, which is the main interface.
///
/// The [`Client`] struct can be cloned resulting in multiple handles to the running
/// actor.  If all [`Client`]s are dropped the actor stops running.
///
/// While running, the netcheck actor expects to be passed all received STUN packets
/// using [`Client::receive_stun_packet`] whenever the caller owns the sockets probes are
/// sent from.
#[derive(Debug, Clone)]
pub struct Client {
    /// Channel to send messages to the [`Actor`].
    ///
    /// If all senders are dropped, in other words all clones of this struct are dropped,
    /// the actor will terminate.
    addr: Addr,
    /// Ensures the actor is terminated when the client is dropped.
    _drop_guard: Arc<CancelOnDrop>,
}

/// All the reports this netcheck actor has generated.
#[derive(Debug)]
struct Reports {
    /// Do a full region scan, even if `last` is `Some`.
    next_full: bool,
    /// Some previous reports.
    prev: HashMap<Instant, Arc<Report>>,
    /// Most recent report.
    last: Option<Arc<Report>>,
    /// Time of last full (non-incremental) report.
    last_full: Instant,
}

impl Default for Reports {
    fn default() -> Self {
        Self {
            next_full: Default::default(),
            prev: Default::default(),
            last: Default::default(),
            last_full: Instant::now(),
        }
    }
}

impl Client {
    /// Creates a new netcheck client.
    ///
    /// This starts a connected actor in the background.  Once the client is dropped it
    /// will stop running.  Must be called from within a tokio runtime.
    pub fn new(port_mapper: Option<portmapper::Client>) -> Result<Self> {
        let mut actor = Actor::new(port_mapper)?;
        let addr = actor.addr();
        let task =
            tokio::spawn(async move { actor.run().await }.instrument(info_span!("netcheck.actor")));
        let drop_guard = CancelOnDrop::new("netcheck actor", task.abort_handle());
        Ok(Client {
            addr,
            _drop_guard: Arc::new(drop_guard),
        })
    }

    /// Pass a received STUN packet to the netchecker.
    ///
    /// Normally the UDP sockets to send STUN messages from are passed in so that STUN
    /// packets are sent from the sockets that carry the real traffic.  However because
    /// these sockets carry real traffic they will also receive non-STUN traffic, thus
    /// the netcheck actor does not read from such sockets directly.  If you receive a
    /// STUN packet on a socket you passed in, hand it to this method.
    ///
    /// It is safe to call this even when the netcheck actor does not currently have any
    /// in-flight STUN probes.  The actor will simply ignore any stray STUN packets.
    ///
    /// There is an implicit queue here which may drop packets if the actor does not keep
    /// up consuming them.
    pub fn receive_stun_packet(&self, payload: Bytes, src: SocketAddr) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.addr.try_send(Message::StunPacket {
            payload,
            from_addr: src,
        }) {
            warn!("dropping stun packet from {}", src);
        }
    }

    /// Forces the next [`Client::get_report`] call to be a full (non-incremental) probe
    /// of all regions.
    pub async fn make_next_report_full(&self) -> Result<()> {
        self.addr
            .send(Message::MakeNextReportFull)
            .await
            .context("netcheck actor gone")
    }

    /// Runs a netcheck, returning the report.
    ///
    /// It may not be called concurrently with itself, `&mut self` takes care of that.
    ///
    /// The *stun_conn4* and *stun_conn6* endpoints are bound UDP sockets to use to send
    /// out STUN packets.  This function **will not read from the sockets**, as they may
    /// be receiving other traffic as well; all STUN packets received on them must be
    /// passed to [`Client::receive_stun_packet`] for this function to work correctly.
    ///
    /// If these are not passed in this will bind sockets for STUN itself, and read from
    /// them.
    pub async fn get_report(
        &mut self,
        relay_map: RelayMap,
        stun_conn4: Option<Arc<UdpSocket>>,
        stun_conn6: Option<Arc<UdpSocket>>,
    ) -> Result<Arc<Report>> {
        let rx = self
            .get_report_channel(relay_map, stun_conn4, stun_conn6)
            .await?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("channel closed, actor awol")),
        }
    }

    /// Starts a netcheck, returning a channel the report will arrive on.
    pub async fn get_report_channel(
        &mut self,
        relay_map: RelayMap,
        stun_conn4: Option<Arc<UdpSocket>>,
        stun_conn6: Option<Arc<UdpSocket>>,
    ) -> Result<oneshot::Receiver<Result<Arc<Report>>>> {
        let (tx, rx) = oneshot::channel();
        self.addr
            .send(Message::RunCheck {
                relay_map,
                stun_sock_v4: stun_conn4,
                stun_sock_v6: stun_conn6,
                response_tx: tx,
            })
            .await?;
        Ok(rx)
    }
}

/// A probe that has been sent and is waiting for its STUN response.
#[derive(Debug)]
pub(crate) struct Inflight {
    /// The STUN transaction ID.
    txn: stun::TransactionId,
    /// The time the STUN probe was sent.
    start: Instant,
    /// Response to send STUN results: latency of the STUN response and the discovered
    /// address.
    s: oneshot::Sender<(Duration, SocketAddr)>,
}

/// Messages to send to the [`Actor`].
#[derive(Debug)]
pub(crate) enum Message {
    /// Run a netcheck.
    ///
    /// Only one netcheck can be run at a time, trying to run multiple concurrently will
    /// fail.
    RunCheck {
        /// The relay configuration.
        relay_map: RelayMap,
        /// Socket to send IPv4 STUN probes from.
        ///
        /// Responses are never read from this socket, they must be passed in via the
        /// [`Message::StunPacket`] message since the socket is also used to receive
        /// other packets by the caller.
        ///
        /// If not provided this will attempt to bind a suitable socket itself.
        stun_sock_v4: Option<Arc<UdpSocket>>,
        /// Socket to send IPv6 STUN probes from, like `stun_sock_v4`.
        stun_sock_v6: Option<Arc<UdpSocket>>,
        /// Channel to receive the response.
        response_tx: oneshot::Sender<Result<Arc<Report>>>,
    },
    /// A report produced by the [`reportgen`] actor.
    ReportReady {
        /// The completed report.
        report: Box<Report>,
    },
    /// The [`reportgen`] actor failed to produce a report.
    ReportAborted,
    /// An incoming STUN packet to parse.
    StunPacket {
        /// The raw UDP payload.
        payload: Bytes,
        /// The address this was claimed to be received from.
        from_addr: SocketAddr,
    },
    /// A probe wants to register an in-flight STUN request.
    ///
    /// The sender is signalled once the transaction ID is registered with the actor and
    /// the STUN response will correctly be forwarded.
    InFlightStun(Inflight, oneshot::Sender<()>),
    /// Makes the next report a full one.
    MakeNextReportFull,
}

/// Sender to the [`Actor`].
///
/// Unlike [`Client`] this is the raw channel to send messages over.  Keeping this alive
/// will not keep the actor alive, which makes this handy to pass to internal tasks.
#[derive(Debug, Clone)]
pub(crate) struct Addr {
    sender: mpsc::Sender<Message>,
}

impl Addr {
    pub(crate) async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.sender.send(msg).await.map_err(|err| {
            error!("netcheck actor lost");
            err
        })
    }

    fn try_send(&self, msg: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.sender.try_send(msg).map_err(|err| {
            match &err {
                mpsc::error::TrySendError::Full(_) => warn!("netcheck actor inbox full"),
                mpsc::error::TrySendError::Closed(_) => error!("netcheck actor lost"),
            }
            err
        })
    }
}

/// The netcheck actor.
///
/// This actor runs for the entire duration there's a [`Client`] connected.
#[derive(Debug)]
struct Actor {
    // Actor plumbing.
    /// Actor messages channel.
    ///
    /// If there are no more senders the actor stops.
    receiver: mpsc::Receiver<Message>,
    /// The sender side of the messages channel.
    ///
    /// This allows creating new [`Addr`]s from the actor.
    sender: mpsc::Sender<Message>,
    /// A collection of previously generated reports.
    ///
    /// Sometimes it is useful to look at past reports to decide what to do.
    reports: Reports,

    // Actor configuration.
    /// Whether the client should try to reach things other than localhost.
    ///
    /// This is set to true in tests to avoid probing the local LAN's router, etc.
    skip_external_network: bool,
    /// The port mapper client, if those checks are requested.
    port_mapper: Option<portmapper::Client>,

    // Actor state.
    /// Information about the currently in-flight STUN requests.
    ///
    /// This is used to complete the STUN probe when receiving STUN packets.
    in_flight_stun_requests: HashMap<stun::TransactionId, Inflight>,
    /// The [`reportgen`] actor currently generating a report.
    current_report_run: Option<ReportRun>,
}

impl Actor {
    /// Creates a new actor.
    ///
    /// This does not start the actor, see [`Actor::run`] for this.  You should not
    /// normally create this directly but rather create a [`Client`].
    fn new(port_mapper: Option<portmapper::Client>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(32);
        Ok(Self {
            receiver,
            sender,
            reports: Default::default(),
            skip_external_network: false,
            port_mapper,
            in_flight_stun_requests: Default::default(),
            current_report_run: None,
        })
    }

    /// Returns the channel to send messages to the actor.
    fn addr(&self) -> Addr {
        Addr {
            sender: self.sender.clone(),
        }
    }

    /// Run the actor.
    ///
    /// It will now run and handle messages.  Once the connected [`Client`] (including
    /// all its clones) is dropped this will terminate.
    async fn run(&mut self) {
        debug!("netcheck actor starting");
        while let Some(msg) = self.receiver.recv().await {
            trace!(?msg, "handling message");
            match msg {
                Message::RunCheck {
                    relay_map,
                    stun_sock_v4,
                    stun_sock_v6,
                    response_tx,
                } => {
                    self.handle_run_check(relay_map, stun_sock_v4, stun_sock_v6, response_tx)
                        .await;
                }
                Message::ReportReady { report } => {
                    self.handle_report_ready(report);
                }
                Message::ReportAborted => {
                    self.handle_report_aborted();
                }
                Message::StunPacket { payload, from_addr } => {
                    self.handle_stun_packet(&payload, from_addr);
                }
                Message::InFlightStun(inflight, response_tx) => {
                    self.handle_in_flight_stun(inflight, response_tx);
                }
                Message::MakeNextReportFull => {
                    self.reports.next_full = true;
                }
            }
        }
    }

    /// Starts a check run as requested by the [`Message::RunCheck`] message.
    ///
    /// If *stun_sock_v4* or *stun_sock_v6* are not provided this will bind the sockets
    /// itself.  This is not ideal since really you want to send STUN probes from the
    /// sockets you will be using for traffic.
    async fn handle_run_check(
        &mut self,
        relay_map: RelayMap,
        stun_sock_v4: Option<Arc<UdpSocket>>,
        stun_sock_v6: Option<Arc<UdpSocket>>,
        response_tx: oneshot::Sender<Result<Arc<Report>>>,
    ) {
        if self.current_report_run.is_some() {
            response_tx
                .send(Err(anyhow!(
                    "ignoring RunCheck request: reportgen actor already running"
                )))
                .ok();
            return;
        }

        let now = Instant::now();

        let cancel_token = CancellationToken::new();
        let stun_sock_v4 = match stun_sock_v4 {
            Some(sock) => Some(sock),
            None => {
                bind_local_stun_socket(
                    (Ipv4Addr::UNSPECIFIED, 0).into(),
                    self.addr(),
                    cancel_token.clone(),
                )
                .await
            }
        };
        let stun_sock_v6 = match stun_sock_v6 {
            Some(sock) => Some(sock),
            None => {
                bind_local_stun_socket(
                    (Ipv6Addr::UNSPECIFIED, 0).into(),
                    self.addr(),
                    cancel_token.clone(),
                )
                .await
            }
        };
        let mut do_full = self.reports.next_full
            || now.duration_since(self.reports.last_full) > FULL_REPORT_INTERVAL;

        // If the last report had a captive portal and reported no UDP access, it's
        // possible that we didn't get a useful netcheck due to the captive portal
        // blocking us.  If so, make this report a full (non-incremental) one.
        if !do_full {
            if let Some(ref last) = self.reports.last {
                do_full = !last.udp && last.captive_portal.unwrap_or_default();
            }
        }
        if do_full {
            self.reports.last = None; // causes ProbePlan::initial below
            self.reports.next_full = false;
            self.reports.last_full = now;
        }

        let reportgen = reportgen::Client::new(
            self.addr(),
            self.reports.last.clone(),
            self.port_mapper.clone(),
            self.skip_external_network,
            relay_map,
            stun_sock_v4,
            stun_sock_v6,
        );

        self.current_report_run = Some(ReportRun {
            _reportgen: reportgen,
            _drop_guard: cancel_token.drop_guard(),
            report_tx: response_tx,
        });
    }

    fn handle_report_ready(&mut self, report: Box<Report>) {
        let report = self.finish_and_store_report(*report);
        self.in_flight_stun_requests.clear();
        if let Some(ReportRun { report_tx, .. }) = self.current_report_run.take() {
            report_tx.send(Ok(report)).ok();
        }
    }

    fn handle_report_aborted(&mut self) {
        self.in_flight_stun_requests.clear();
        if let Some(ReportRun { report_tx, .. }) = self.current_report_run.take() {
            report_tx.send(Err(anyhow!("report aborted"))).ok();
        }
    }

    /// Handles [`Message::StunPacket`].
    ///
    /// If there are currently no in-flight stun requests registered this is dropped,
    /// otherwise forwarded to the probe.  The hairpin probe sends a binding *request* to
    /// ourselves and is matched by transaction ID on the request parse path.
    fn handle_stun_packet(&mut self, pkt: &[u8], src: SocketAddr) {
        trace!(%src, "received STUN packet");
        if self.in_flight_stun_requests.is_empty() {
            return;
        }

        match stun::parse_response(pkt) {
            Ok((txn, addr_port)) => match self.in_flight_stun_requests.remove(&txn) {
                Some(inf) => {
                    debug!(%src, %txn, "received known STUN packet");
                    let elapsed = inf.start.elapsed();
                    inf.s.send((elapsed, addr_port)).ok();
                }
                None => {
                    debug!(%src, %txn, "received unexpected STUN message response");
                }
            },
            Err(err) => {
                match stun::parse_binding_request(pkt) {
                    Ok(txn) => {
                        // Is this our hairpin request?
                        match self.in_flight_stun_requests.remove(&txn) {
                            Some(inf) => {
                                debug!(%src, %txn, "received our hairpin STUN request");
                                let elapsed = inf.start.elapsed();
                                inf.s.send((elapsed, src)).ok();
                            }
                            None => {
                                debug!(%src, %txn, "unknown STUN request");
                            }
                        }
                    }
                    Err(_) => {
                        debug!(%src, "received invalid STUN response: {err:#}");
                    }
                }
            }
        }
    }

    /// Handles [`Message::InFlightStun`].
    ///
    /// The in-flight request is added to [`Actor::in_flight_stun_requests`] so that
    /// [`Actor::handle_stun_packet`] can forward packets correctly.
    ///
    /// *response_tx* is to signal the actor message has been handled.
    fn handle_in_flight_stun(&mut self, inflight: Inflight, response_tx: oneshot::Sender<()>) {
        self.in_flight_stun_requests.insert(inflight.txn, inflight);
        response_tx.send(()).ok();
    }

    fn finish_and_store_report(&mut self, report: Report) -> Arc<Report> {
        let report = self.add_report_history_and_set_preferred_region(report);
        self.log_concise_report(&report);

        report
    }

    /// Adds `report` to the history and fills in its `preferred_region`.
    ///
    /// The preferred region is the region of this report with the best latency over
    /// the retained history window, with some hysteresis in favor of the previously
    /// preferred region.  The report is stored ref counted and a reference is
    /// returned.
    fn add_report_history_and_set_preferred_region(&mut self, mut report: Report) -> Arc<Report> {
        let now = Instant::now();

        // Expire old history first, then compute the best latency any retained report
        // has seen per region, the report under construction included.
        self.reports
            .prev
            .retain(|probed_at, _| now.duration_since(*probed_at) <= REPORT_HISTORY_AGE);
        let mut best_recent = RegionLatencies::new();
        for prev_report in self.reports.prev.values() {
            best_recent.merge(&prev_report.region_latency);
        }
        best_recent.merge(&report.region_latency);

        report.preferred_region = self.pick_preferred_region(&report, &best_recent);

        let report = Arc::new(report);
        self.reports.prev.insert(now, report.clone());
        self.reports.last = Some(report.clone());

        report
    }

    /// Picks the preferred region for `report`.
    ///
    /// Candidates are only the regions the current report actually reached; they
    /// compete on their best latency over the history window.  The previously
    /// preferred region wins anyway unless the challenger beats two thirds of its
    /// current latency, so a marginally faster region does not make the preferred
    /// home flip flop.
    fn pick_preferred_region(&self, report: &Report, best_recent: &RegionLatencies) -> u16 {
        let mut winner: Option<(u16, Duration)> = None;
        for (region_id, _) in report.region_latency.iter() {
            let best = best_recent.get(region_id).expect("merged from this report");
            if winner.map_or(true, |(_, fastest)| best < fastest) {
                winner = Some((region_id, best));
            }
        }
        let Some((winner, winner_best)) = winner else {
            return 0;
        };

        let previous = self
            .reports
            .last
            .as_ref()
            .map(|last| last.preferred_region)
            .unwrap_or_default();
        if previous != 0 && winner != previous {
            // Only stick with the old preferred region while the current report still
            // reaches it.
            if let Some(previous_latency) = report.region_latency.get(previous) {
                if winner_best > previous_latency * 2 / 3 {
                    return previous;
                }
            }
        }
        winner
    }

    fn log_concise_report(&self, r: &Report) {
        // Writes to a String are infallible.
        use std::fmt::Write;

        let mut log = String::with_capacity(256);
        write!(log, "report: ").ok();
        write!(log, "udp={}", r.udp).ok();
        if !r.ipv4 {
            write!(log, " v4={}", r.ipv4).ok();
        }

        write!(log, " v6={}", r.ipv6).ok();
        if !r.ipv6 {
            write!(log, " v6os={}", r.os_has_ipv6).ok();
        }
        write!(log, " mapvarydest={:?}", r.mapping_varies_by_dest_ip).ok();
        write!(log, " hair={:?}", r.hair_pinning).ok();
        if r.any_port_mapping_checked() {
            write!(
                log,
                " portmap={}{}{}",
                concise_opt_bool(r.upnp, "U"),
                concise_opt_bool(r.pmp, "M"),
                concise_opt_bool(r.pcp, "C")
            )
            .ok();
        } else {
            write!(log, " portmap=?").ok();
        }
        if let Some(ipp) = r.global_v4 {
            write!(log, " v4a={ipp}").ok();
        }
        if let Some(ipp) = r.global_v6 {
            write!(log, " v6a={ipp}").ok();
        }
        if let Some(c) = r.captive_portal {
            write!(log, " captiveportal={c}").ok();
        }
        write!(log, " region={}", r.preferred_region).ok();
        if r.preferred_region != 0 {
            write!(log, " regiondist=").ok();
            let mut need_comma = false;
            for rid in r.latency_region_ids() {
                if let Some(d) = r.region_v4_latency.get(rid) {
                    if need_comma {
                        write!(log, ",").ok();
                    }
                    write!(log, "{}v4:{}", rid, d.as_millis()).ok();
                    need_comma = true;
                }
                if let Some(d) = r.region_v6_latency.get(rid) {
                    if need_comma {
                        write!(log, ",").ok();
                    }
                    write!(log, "{}v6:{}", rid, d.as_millis()).ok();
                    need_comma = true;
                }
            }
        }
        debug!("{}", log);
    }
}

fn concise_opt_bool(value: Option<bool>, name: &str) -> String {
    match value {
        None => format!("{name}?"),
        Some(true) => name.to_string(),
        Some(false) => String::new(),
    }
}

/// State the netcheck actor needs for an in-progress report generation.
#[derive(Debug)]
struct ReportRun {
    /// The handle of the [`reportgen`] actor, cancels the actor on drop.
    _reportgen: reportgen::Client,
    /// Drop guard to optionally kill workers started by netcheck to support reportgen.
    _drop_guard: tokio_util::sync::DropGuard,
    /// Where to send the completed report.
    report_tx: oneshot::Sender<Result<Arc<Report>>>,
}

/// Attempts to bind a local socket to send STUN packets from.
///
/// If successful this returns the bound socket and will forward STUN responses to the
/// provided *actor_addr*.  The *cancel_token* serves to stop the packet forwarding when
/// the socket is no longer needed.
async fn bind_local_stun_socket(
    addr: SocketAddr,
    actor_addr: Addr,
    cancel_token: CancellationToken,
) -> Option<Arc<UdpSocket>> {
    let sock = match UdpSocket::bind(addr).await {
        Ok(sock) => Arc::new(sock),
        Err(err) => {
            debug!("failed to bind STUN socket at {addr}: {err}");
            return None;
        }
    };
    let span = info_span!(
        "stun_udp_listener",
        local_addr = sock
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or(String::from("-")),
    );
    {
        let sock = sock.clone();
        tokio::spawn(
            async move {
                debug!("udp stun socket listener started");
                let mut buf = vec![0u8; 64 << 10];
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => break,
                        res = recv_stun_once(&sock, &mut buf, &actor_addr) => {
                            if let Err(err) = res {
                                warn!(%err, "stun recv failed");
                                break;
                            }
                        }
                    }
                }
                debug!("udp stun socket listener stopped");
            }
            .instrument(span),
        );
    }
    Some(sock)
}

/// Receives one packet from a UDP socket, passing STUN packets on to the actor.
async fn recv_stun_once(sock: &UdpSocket, buf: &mut [u8], actor_addr: &Addr) -> Result<()> {
    let (count, mut from_addr) = sock
        .recv_from(buf)
        .await
        .context("error reading from stun socket")?;
    let payload = &buf[..count];
    if !stun::is(payload) {
        trace!(%from_addr, "ignoring non STUN packet");
        return Ok(());
    }
    from_addr.set_ip(to_canonical(from_addr.ip()));
    let msg = Message::StunPacket {
        payload: Bytes::from(payload.to_vec()),
        from_addr,
    };
    actor_addr.send(msg).await.context("actor stopped")
}

/// Test if IPv6 works at all, or if it's been hard disabled at the OS level.
pub(crate) async fn os_has_ipv6() -> bool {
    UdpSocket::bind("[::1]:0").await.is_ok()
}

#[cfg(test)]
pub(crate) mod test_utils {
    /// Installs a subscriber logging to the test output, once.
    pub(crate) fn setup_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "netcheck=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}
