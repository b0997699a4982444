//! Probing for UPnP, NAT-PMP and PCP port mapping services on the LAN.
//!
//! This client only answers the question "which port mapping protocols are present on
//! the gateway", it never installs mappings.  Positive sightings are cached: a service
//! seen within the trust window is reported present without putting packets on the wire.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use crate::interfaces::HomeRouter;
use crate::util::CancelOnDrop;

pub mod nat_pmp;
pub mod pcp;
mod upnp;

/// If a port mapping service has been seen within the last
/// [`TRUST_SERVICE_STILL_AVAILABLE_DURATION`] it is reported as present without
/// re-probing.
pub(crate) const TRUST_SERVICE_STILL_AVAILABLE_DURATION: Duration = Duration::from_secs(60 * 10);

/// How long a single probe attempt waits for responses on its socket.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Budget for one cycle of the background UPnP prober.
const UPNP_CYCLE_TIMEOUT: Duration = Duration::from_secs(6);

/// Liveness attempts per background UPnP cycle.
const UPNP_CYCLE_RETRIES: usize = 5;

/// Sleep between UPnP liveness attempts within a cycle.
const UPNP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The port NAT-PMP and PCP servers listen on.
///
/// IANA reassigned the NAT-PMP port to PCP, both protocols answer on it.  See
/// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>.
const SERVER_PORT: u16 = 5351;

/// No gateway to probe could be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no gateway found")]
pub struct GatewayNotFound;

/// Output of a port mapping probe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("portmap={{ UPnP: {upnp}, PMP: {pmp}, PCP: {pcp} }}")]
pub struct ProbeOutput {
    /// If UPnP is considered available.
    pub upnp: bool,
    /// If NAT-PMP is considered available.
    pub pmp: bool,
    /// If PCP is considered available.
    pub pcp: bool,
}

/// Configures which port mapping protocols are probed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether UPnP is probed.
    pub enable_upnp: bool,
    /// Whether PCP is probed.
    pub enable_pcp: bool,
    /// Whether NAT-PMP is probed.
    pub enable_nat_pmp: bool,
}

impl Default for Config {
    /// By default all port mapping protocols are probed.
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_pcp: true,
            enable_nat_pmp: true,
        }
    }
}

/// Port mapping probe client.
///
/// Cheap to clone, all clones share the gateway and last-seen caches.
#[derive(Debug, Clone)]
pub struct Client {
    config: Config,
    inner: Arc<Mutex<Inner>>,
}

/// Shared cache of the client.
///
/// The gateway is resolved once and kept until [`Client::network_changed`], the
/// per-service timestamps implement the trust window.
#[derive(Debug)]
struct Inner {
    gateway_and_my_ip: Option<(Ipv4Addr, Ipv4Addr)>,
    server_port: u16,
    last_probe: Option<Instant>,
    last_upnp: Option<Instant>,
    last_pmp: Option<Instant>,
    last_pcp: Option<Instant>,
    /// Public IPv4 and epoch most recently reported by NAT-PMP.
    pmp_public_ip: Option<Ipv4Addr>,
    pmp_last_epoch: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            gateway_and_my_ip: None,
            server_port: SERVER_PORT,
            last_probe: None,
            last_upnp: None,
            last_pmp: None,
            last_pcp: None,
            pmp_public_ip: None,
            pmp_last_epoch: 0,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new(Config::default())
    }
}

impl Client {
    /// Creates a new client.
    pub fn new(config: Config) -> Self {
        Client {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Invalidates the cached gateway.  Call this when the local network changed.
    pub fn network_changed(&self) {
        self.inner.lock().expect("poisoned").gateway_and_my_ip = None;
    }

    /// The public IPv4 most recently reported by NAT-PMP, with its epoch.
    pub fn pmp_public_ip(&self) -> Option<(Ipv4Addr, u32)> {
        let inner = self.inner.lock().expect("poisoned");
        inner.pmp_public_ip.map(|ip| (ip, inner.pmp_last_epoch))
    }

    /// The time the last complete probe finished, if any.
    pub fn last_probe(&self) -> Option<Instant> {
        self.inner.lock().expect("poisoned").last_probe
    }

    fn gateway_and_my_ip(&self) -> Result<(Ipv4Addr, Ipv4Addr), GatewayNotFound> {
        let mut inner = self.inner.lock().expect("poisoned");
        if let Some(cached) = inner.gateway_and_my_ip {
            return Ok(cached);
        }
        let HomeRouter { gateway, my_ip } = HomeRouter::new().ok_or(GatewayNotFound)?;
        let IpAddr::V4(gateway) = gateway else {
            // PCP and NAT-PMP are spoken over IPv4 only.
            return Err(GatewayNotFound);
        };
        let my_ip = match my_ip {
            Some(IpAddr::V4(ip))
                if !ip.is_unspecified() && !ip.is_loopback() && !ip.is_multicast() =>
            {
                ip
            }
            other => {
                debug!("no address suitable for port mapping found ({other:?}), using localhost");
                Ipv4Addr::LOCALHOST
            }
        };
        inner.gateway_and_my_ip = Some((gateway, my_ip));
        Ok((gateway, my_ip))
    }

    fn saw_upnp_recently(&self) -> bool {
        saw_recently(self.inner.lock().expect("poisoned").last_upnp)
    }

    fn saw_pmp_recently(&self) -> bool {
        saw_recently(self.inner.lock().expect("poisoned").last_pmp)
    }

    fn saw_pcp_recently(&self) -> bool {
        saw_recently(self.inner.lock().expect("poisoned").last_pcp)
    }

    /// Returns a summary of which port mapping services are available on the network.
    ///
    /// If a probe has run recently, and there haven't been any network changes since,
    /// parts of the result may be served from the client's cache without sending any
    /// packets.
    pub async fn probe(&self) -> Result<ProbeOutput> {
        let (gateway, my_ip) = self.gateway_and_my_ip()?;

        let mut output = ProbeOutput::default();
        let do_upnp = self.config.enable_upnp && !self.saw_upnp_recently();
        output.upnp = self.config.enable_upnp && !do_upnp;

        // UPnP discovery runs in parallel with the NAT-PMP/PCP exchange, all bounded by
        // the same deadline.
        let upnp_probe = async {
            if do_upnp {
                upnp::probe_available(PROBE_TIMEOUT).await.is_some()
            } else {
                false
            }
        };
        let services_probe = self.probe_pmp_and_pcp(gateway, my_ip);

        let (upnp_found, services) = tokio::join!(upnp_probe, services_probe);
        if upnp_found {
            output.upnp = true;
            self.inner.lock().expect("poisoned").last_upnp = Some(Instant::now());
        }
        let (pcp, pmp) = services?;
        output.pcp = pcp;
        output.pmp = pmp;

        self.inner.lock().expect("poisoned").last_probe = Some(Instant::now());
        Ok(output)
    }

    /// Sends NAT-PMP and PCP probes to the gateway, unless cached, and reads replies
    /// until both services have been heard from or the deadline fires.
    ///
    /// Returns `(pcp, pmp)`.
    async fn probe_pmp_and_pcp(&self, gateway: Ipv4Addr, my_ip: Ipv4Addr) -> Result<(bool, bool)> {
        let server_port = self.inner.lock().expect("poisoned").server_port;
        let server_addr = SocketAddrV4::new(gateway, server_port);

        let mut pmp = false;
        let mut pcp = false;
        // "done" means no more wire evidence is awaited for the service.
        let mut pmp_done = !self.config.enable_nat_pmp;
        let mut pcp_done = !self.config.enable_pcp;

        // Don't send probes to services we recently learned (for the same gateway and
        // local ip) are available.
        if !pmp_done && self.saw_pmp_recently() {
            pmp = true;
            pmp_done = true;
        }
        if !pcp_done && self.saw_pcp_recently() {
            pcp = true;
            pcp_done = true;
        }
        if pmp_done && pcp_done {
            return Ok((pcp, pmp));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("failed to bind probe socket")?;

        if !pmp_done {
            socket
                .send_to(&nat_pmp::Request::ExternalAddress.encode(), server_addr)
                .await
                .context("failed to send NAT-PMP probe")?;
        }
        if !pcp_done {
            socket
                .send_to(&pcp::announce_request(my_ip), server_addr)
                .await
                .context("failed to send PCP probe")?;
        }

        let deadline = tokio::time::sleep(PROBE_TIMEOUT);
        tokio::pin!(deadline);
        let mut buf = vec![0u8; 1500];
        while !(pmp_done && pcp_done) {
            tokio::select! {
                _ = &mut deadline => break,
                res = socket.recv_from(&mut buf) => {
                    let (n, src) = res.context("error reading probe socket")?;
                    trace!(%src, len = n, "probe response");
                    self.handle_probe_response(
                        &buf[..n],
                        &mut pcp,
                        &mut pcp_done,
                        &mut pmp,
                        &mut pmp_done,
                    );
                }
            }
        }
        Ok((pcp, pmp))
    }

    fn handle_probe_response(
        &self,
        pkt: &[u8],
        pcp_present: &mut bool,
        pcp_done: &mut bool,
        pmp_present: &mut bool,
        pmp_done: &mut bool,
    ) {
        match pcp::Response::decode(pkt) {
            Ok(response) => {
                debug!(epoch = response.epoch_time, "PCP announce response");
                *pcp_present = true;
                *pcp_done = true;
                self.inner.lock().expect("poisoned").last_pcp = Some(Instant::now());
                return;
            }
            Err(pcp::Error::ErrorCode(pcp::ErrorCode::NotAuthorized)) => {
                // A PCP service is running, but refuses to provide port mapping services.
                debug!("PCP present but refuses to provide mappings");
                *pcp_present = false;
                *pcp_done = true;
                return;
            }
            Err(pcp::Error::ErrorCode(code)) => {
                debug!("unexpected PCP probe response: {code}");
                return;
            }
            // Not a PCP packet, it may still be a NAT-PMP one.
            Err(pcp::Error::Decode(_)) => {}
        }

        match nat_pmp::Response::decode(pkt) {
            Ok(nat_pmp::Response::PublicAddress {
                epoch_time,
                public_ip,
            }) => {
                debug!(%public_ip, epoch = epoch_time, "NAT-PMP public address response");
                *pmp_present = true;
                *pmp_done = true;
                let mut inner = self.inner.lock().expect("poisoned");
                inner.last_pmp = Some(Instant::now());
                inner.pmp_public_ip = Some(public_ip);
                inner.pmp_last_epoch = epoch_time;
            }
            Ok(response) => {
                debug!("unexpected NAT-PMP probe response: {response:?}");
            }
            Err(nat_pmp::Error::ErrorCode(code)) => {
                debug!("NAT-PMP error response: {code:?}");
            }
            Err(_) => {
                trace!("not a port mapping probe response");
            }
        }
    }

    /// Starts a background prober for this client.
    ///
    /// Runs until [`Prober::stop`] is called or the returned [`Prober`] is dropped.
    pub fn new_prober(&self) -> Prober {
        let stop = CancellationToken::new();
        let pmp = ProbeSubResult::new();
        let pcp = ProbeSubResult::new();
        let upnp = ProbeSubResult::new();

        let pmp_pcp_task = {
            let client = self.clone();
            let stop = stop.clone();
            let pmp = pmp.clone();
            let pcp = pcp.clone();
            tokio::spawn(
                async move {
                    loop {
                        let result = match client.gateway_and_my_ip() {
                            Ok((gateway, my_ip)) => {
                                client.probe_pmp_and_pcp(gateway, my_ip).await
                            }
                            Err(err) => Err(err.into()),
                        };
                        match result {
                            Ok((pcp_present, pmp_present)) => {
                                pmp.set(pmp_present, None);
                                pcp.set(pcp_present, None);
                            }
                            Err(err) => {
                                pmp.set(false, Some(err.to_string()));
                                pcp.set(false, Some(err.to_string()));
                            }
                        }
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(TRUST_SERVICE_STILL_AVAILABLE_DURATION * 3 / 4) => {}
                        }
                    }
                }
                .instrument(info_span!("portmap.prober.pmp-pcp")),
            )
        };

        let upnp_task = {
            let enabled = self.config.enable_upnp;
            let stop = stop.clone();
            let upnp = upnp.clone();
            tokio::spawn(
                async move {
                    if !enabled {
                        upnp.set(false, None);
                        return;
                    }
                    // Pay the cost of acquiring a gateway handle once, without a search
                    // deadline.  The cycles below reuse it.
                    let gateway = tokio::select! {
                        _ = stop.cancelled() => return,
                        res = upnp::get_gateway() => match res {
                            Ok(gateway) => gateway,
                            Err(err) => {
                                upnp.set(false, Some(err.to_string()));
                                return;
                            }
                        }
                    };
                    debug!(gateway = %gateway.addr, "found upnp gateway");
                    loop {
                        let cycle = async {
                            let mut last_err = None;
                            for attempt in 0..UPNP_CYCLE_RETRIES {
                                if attempt > 0 {
                                    tokio::time::sleep(UPNP_RETRY_DELAY).await;
                                }
                                match gateway.get_external_ip().await {
                                    Ok(_) => return (true, None),
                                    Err(err) => last_err = Some(err.to_string()),
                                }
                            }
                            (false, last_err)
                        };
                        let (present, err) = tokio::select! {
                            _ = stop.cancelled() => return,
                            res = tokio::time::timeout(UPNP_CYCLE_TIMEOUT, cycle) => match res {
                                Ok(outcome) => outcome,
                                Err(_) => (false, Some("upnp status check timed out".into())),
                            }
                        };
                        upnp.set(present, err);
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(TRUST_SERVICE_STILL_AVAILABLE_DURATION * 3 / 4) => {}
                        }
                    }
                }
                .instrument(info_span!("portmap.prober.upnp")),
            )
        };

        Prober {
            stop,
            pmp,
            pcp,
            upnp,
            _pmp_pcp_task: CancelOnDrop::new("pmp-pcp prober", pmp_pcp_task.abort_handle()),
            _upnp_task: CancelOnDrop::new("upnp prober", upnp_task.abort_handle()),
        }
    }
}

fn saw_recently(last_seen: Option<Instant>) -> bool {
    last_seen
        .map(|t| t.elapsed() < TRUST_SERVICE_STILL_AVAILABLE_DURATION)
        .unwrap_or_default()
}

/// A long-running prober keeping the presence of each port mapping service fresh.
///
/// Two independent tasks run until [`Prober::stop`] is called or the prober is dropped:
/// one cycling NAT-PMP and PCP probes, one watching the UPnP gateway.  Both cycle at 3/4
/// of the trust window so a present service never goes stale between cycles.
#[derive(Debug)]
pub struct Prober {
    stop: CancellationToken,
    /// Latched NAT-PMP result.
    pub pmp: ProbeSubResult,
    /// Latched PCP result.
    pub pcp: ProbeSubResult,
    /// Latched UPnP result.
    pub upnp: ProbeSubResult,
    _pmp_pcp_task: CancelOnDrop,
    _upnp_task: CancelOnDrop,
}

impl Prober {
    /// Gracefully stops both prober tasks.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Returns the current results, regardless of whether the probes have completed.
    ///
    /// The error, if any, is the first error among the sub-results.
    pub fn current_status(&self) -> (ProbeOutput, Option<String>) {
        let (pmp, pmp_err) = self.pmp.present_current();
        let (upnp, upnp_err) = self.upnp.present_current();
        let (pcp, pcp_err) = self.pcp.present_current();
        let err = pmp_err.or(upnp_err).or(pcp_err);
        (ProbeOutput { upnp, pmp, pcp }, err)
    }
}

/// A latched probe result for a single service.
///
/// Starts out uncompleted.  [`set`] stamps the current time and wakes all waiters, later
/// values replace earlier ones.
///
/// [`set`]: ProbeSubResult::set
#[derive(Debug, Clone)]
pub struct ProbeSubResult {
    tx: Arc<watch::Sender<Option<SubResult>>>,
}

#[derive(Debug, Clone)]
struct SubResult {
    present: bool,
    err: Option<String>,
    saw_time: Instant,
}

impl ProbeSubResult {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Completes this result, stamping the current time.
    fn set(&self, present: bool, err: Option<String>) {
        self.tx.send_replace(Some(SubResult {
            present,
            err,
            saw_time: Instant::now(),
        }));
    }

    /// Waits until the probe completed at least once, then returns that result.
    pub async fn present_block(&self) -> (bool, Option<String>) {
        let mut rx = self.tx.subscribe();
        let guard = rx
            .wait_for(|value| value.is_some())
            .await
            .expect("sender kept alive by self");
        let value = guard.clone().expect("validated by wait_for");
        (value.present, value.err)
    }

    /// Returns the latest value, regardless of whether the probe has completed.
    ///
    /// A positive sighting older than the trust window is reported absent, without
    /// error.
    pub fn present_current(&self) -> (bool, Option<String>) {
        match &*self.tx.borrow() {
            Some(value) => {
                let present =
                    value.present && value.saw_time.elapsed() < TRUST_SERVICE_STILL_AVAILABLE_DURATION;
                (present, value.err.clone())
            }
            None => (false, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    impl Client {
        /// Points the client at a fake gateway for tests.
        fn for_test(config: Config, gateway: SocketAddrV4) -> Self {
            let client = Client::new(config);
            {
                let mut inner = client.inner.lock().expect("poisoned");
                inner.gateway_and_my_ip = Some((*gateway.ip(), Ipv4Addr::LOCALHOST));
                inner.server_port = gateway.port();
            }
            client
        }
    }

    /// A fake NAT-PMP/PCP gateway on localhost.
    ///
    /// Counts the NAT-PMP requests it saw, answers them with a public address reply.
    /// PCP announces are answered with `pcp_result_code` if set, ignored otherwise.
    async fn fake_gateway(
        pmp_requests: Arc<AtomicUsize>,
        pcp_result_code: Option<u8>,
    ) -> SocketAddrV4 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!("bound v4"),
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let (n, src) = socket.recv_from(&mut buf).await.unwrap();
                let pkt = &buf[..n];
                if pkt == nat_pmp::Request::ExternalAddress.encode().as_slice() {
                    pmp_requests.fetch_add(1, Ordering::SeqCst);
                    let mut reply = vec![0u8; nat_pmp::Response::MIN_SIZE];
                    reply[1] = nat_pmp::Response::INDICATOR;
                    reply[4..8].copy_from_slice(&1u32.to_be_bytes());
                    reply[8..12].copy_from_slice(&[203, 0, 113, 1]);
                    socket.send_to(&reply, src).await.unwrap();
                } else if pkt.len() == pcp::ANNOUNCE_REQUEST_SIZE && pkt[0] == 2 {
                    if let Some(code) = pcp_result_code {
                        let mut reply = vec![0u8; pcp::Response::MIN_SIZE];
                        reply[0] = 2;
                        reply[1] = pcp::Response::RESPONSE_INDICATOR;
                        reply[3] = code;
                        socket.send_to(&reply, src).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    fn no_upnp_config() -> Config {
        Config {
            enable_upnp: false,
            enable_pcp: true,
            enable_nat_pmp: true,
        }
    }

    #[tokio::test]
    async fn test_probe_pmp_and_cache() {
        let pmp_requests = Arc::new(AtomicUsize::new(0));
        let gateway = fake_gateway(pmp_requests.clone(), None).await;
        let client = Client::for_test(no_upnp_config(), gateway);

        let output = client.probe().await.unwrap();
        assert!(output.pmp, "want PMP from the wire");
        assert!(!output.pcp);
        assert!(!output.upnp);
        assert_eq!(pmp_requests.load(Ordering::SeqCst), 1);
        assert!(client.pmp_public_ip().is_some());

        // A second probe within the trust window serves PMP from cache.
        let output = client.probe().await.unwrap();
        assert!(output.pmp, "want PMP from cache");
        assert_eq!(pmp_requests.load(Ordering::SeqCst), 1, "no new request on the wire");
    }

    #[tokio::test]
    async fn test_probe_pcp_ok_and_not_authorized() {
        let gateway = fake_gateway(Default::default(), Some(0)).await;
        let client = Client::for_test(no_upnp_config(), gateway);
        let output = client.probe().await.unwrap();
        assert!(output.pcp, "want PCP available");
        assert!(output.pmp);

        // NotAuthorized means a PCP server is present but refuses, reported absent.
        let gateway = fake_gateway(Default::default(), Some(2)).await;
        let client = Client::for_test(no_upnp_config(), gateway);
        let output = client.probe().await.unwrap();
        assert!(!output.pcp, "refused PCP reported absent");
        assert!(output.pmp);
        // and it is not cached as a sighting
        assert!(!client.saw_pcp_recently());
    }

    #[tokio::test]
    async fn test_probe_all_disabled() {
        let gateway = fake_gateway(Default::default(), None).await;
        let client = Client::for_test(
            Config {
                enable_upnp: false,
                enable_pcp: false,
                enable_nat_pmp: false,
            },
            gateway,
        );
        let output = client.probe().await.unwrap();
        assert_eq!(output, ProbeOutput::default());
    }

    #[tokio::test]
    async fn test_prober_pmp_pcp_task() {
        let gateway = fake_gateway(Default::default(), Some(0)).await;
        let client = Client::for_test(no_upnp_config(), gateway);
        let prober = client.new_prober();

        let (pmp, err) = prober.pmp.present_block().await;
        assert!(pmp);
        assert!(err.is_none());
        let (pcp, _) = prober.pcp.present_block().await;
        assert!(pcp);

        let (status, err) = prober.current_status();
        assert!(status.pmp);
        assert!(status.pcp);
        assert!(err.is_none());

        prober.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_sub_result_ttl() {
        let result = ProbeSubResult::new();
        assert_eq!(result.present_current(), (false, None));

        result.set(true, None);
        assert_eq!(result.present_current(), (true, None));
        assert_eq!(result.present_block().await, (true, None));

        // Stale positive sightings report absent without error.
        tokio::time::advance(TRUST_SERVICE_STILL_AVAILABLE_DURATION + Duration::from_secs(1)).await;
        assert_eq!(result.present_current(), (false, None));
    }
}
