//! The hairpinning check.
//!
//! Working hairpinning means the NAT lets a host reach its own public `ip:port` from
//! the inside.  The check sends a STUN binding request from a dedicated socket to the
//! reflexive address the report discovered; if the request comes back around the NAT,
//! matched by transaction ID through the shared correlator, hairpinning works.
//!
//! The check runs at most once per report.  The socket is bound and its NAT mapping
//! primed as soon as the reportgen actor starts, so the mapping exists by the time the
//! probe is triggered.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate as netcheck;
use crate::reportgen;
use crate::stun;
use crate::util::CancelOnDrop;
use crate::Inflight;

/// The amount of time we wait for the hairpinned packet to come back.
const HAIRPIN_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to the hairpin check task.
///
/// Dropping it aborts the task.
#[derive(Debug)]
pub(super) struct Client {
    trigger: Option<oneshot::Sender<SocketAddrV4>>,
    _drop_guard: CancelOnDrop,
}

impl Client {
    pub(super) fn new(netcheck: netcheck::Addr, reportgen: reportgen::Addr) -> Self {
        let (trigger, trigger_rx) = oneshot::channel();
        let task =
            tokio::spawn(run(netcheck, reportgen, trigger_rx).instrument(info_span!("hairpin")));
        Self {
            trigger: Some(trigger),
            _drop_guard: CancelOnDrop::new("hairpin check", task.abort_handle()),
        }
    }

    /// Returns `true` once [`Client::start_check`] has been called.
    pub(super) fn has_started(&self) -> bool {
        self.trigger.is_none()
    }

    /// Triggers the check against *dst*, our own address as discovered by STUN.
    ///
    /// Only the first call does anything, the check runs at most once.
    pub(super) fn start_check(&mut self, dst: SocketAddrV4) {
        if let Some(trigger) = self.trigger.take() {
            trigger.send(dst).ok();
        }
    }
}

/// Drives one hairpin check from socket priming to verdict.
async fn run(
    netcheck: netcheck::Addr,
    reportgen: reportgen::Addr,
    trigger_rx: oneshot::Receiver<SocketAddrV4>,
) {
    let verdict = match check(&netcheck, trigger_rx).await {
        Ok(Some(works)) => works,
        Ok(None) => {
            trace!("hairpin check never triggered");
            return;
        }
        Err(err) => {
            warn!("hairpin check failed: {err:#}");
            return;
        }
    };
    reportgen
        .send(super::Message::HairpinResult(verdict))
        .await
        .map_err(|_| debug!("reportgen actor gone before the hairpin result"))
        .ok();
}

/// Performs the hairpin probe, returning `None` if it was never triggered.
async fn check(
    netcheck: &netcheck::Addr,
    trigger_rx: oneshot::Receiver<SocketAddrV4>,
) -> Result<Option<bool>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("failed to bind hairpin socket")?;
    if let Err(err) = prime_mapping(&socket).await {
        // Continue anyway, most routers don't need the priming.
        warn!("unable to send hairpin priming packet: {err:#}");
    }

    // The trigger never fires when the report finds no reflexive IPv4 address.
    let Ok(dst) = trigger_rx.await else {
        return Ok(None);
    };

    let txn = stun::TransactionId::default();
    trace!(%txn, %dst, "sending hairpin probe");
    let (response_tx, response_rx) = oneshot::channel();
    let (registered_tx, registered_rx) = oneshot::channel();
    netcheck
        .send(netcheck::Message::InFlightStun(
            Inflight {
                txn,
                start: Instant::now(), // unused, hairpinning is a yes/no question
                s: response_tx,
            },
            registered_tx,
        ))
        .await
        .context("netcheck actor gone")?;
    registered_rx.await.context("netcheck actor died")?;

    socket
        .send_to(&stun::request(txn), SocketAddr::V4(dst))
        .await
        .context("failed to send hairpin probe")?;

    let start = Instant::now();
    let works = match tokio::time::timeout(HAIRPIN_CHECK_TIMEOUT, response_rx).await {
        Ok(Ok(_)) => true,
        Ok(Err(_)) => bail!("correlator dropped the hairpin response channel"),
        Err(_) => false, // nothing came back in time
    };
    debug!(works, "hairpin check done in {:?}", start.elapsed());
    Ok(Some(works))
}

/// Primes the NAT mapping for the hairpin socket.
///
/// At least the Apple Airport Extreme doesn't allow hairpin sends from a private
/// socket until it has seen traffic from that `ip:port` to somewhere on the internet,
/// and a single datagram towards an RFC 5737 documentation-only address is enough to
/// install the mapping.
async fn prime_mapping(socket: &UdpSocket) -> Result<()> {
    let documentation_addr: SocketAddr = "203.0.113.1:12345".parse().expect("valid address");
    socket
        .send_to(b"hairpin priming; safe to drop", documentation_addr)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    /// Runs a hairpin check against a local "public address" socket.
    ///
    /// The correlator side of the netcheck actor is played by the test: it registers
    /// the in-flight transaction and, when `nat_hairpins` is set, completes it as soon
    /// as the probe arrives on the public socket, like a hairpinning NAT would.
    async fn run_hairpin_check(nat_hairpins: bool) -> bool {
        let (netcheck_tx, mut netcheck_rx) = mpsc::channel(8);
        let (reportgen_tx, mut reportgen_rx) = mpsc::channel(8);
        let mut client = Client::new(
            netcheck::Addr {
                sender: netcheck_tx,
            },
            reportgen::Addr {
                sender: reportgen_tx,
            },
        );

        // Bind the socket playing our discovered public address.
        let public_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let SocketAddr::V4(public_addr) = public_socket.local_addr().unwrap() else {
            unreachable!("bound v4");
        };

        assert!(!client.has_started());
        client.start_check(public_addr);
        assert!(client.has_started());

        // Accept the in-flight registration.
        let Some(netcheck::Message::InFlightStun(inflight, registered_tx)) =
            netcheck_rx.recv().await
        else {
            panic!("expected an in-flight registration");
        };
        registered_tx.send(()).unwrap();

        // The probe must arrive at our public address and carry the registered
        // transaction ID.
        let mut buf = vec![0u8; 1500];
        let (len, from) = public_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            stun::parse_binding_request(&buf[..len]).unwrap(),
            inflight.txn
        );

        if nat_hairpins {
            inflight.s.send((Duration::ZERO, from)).unwrap();
        }

        match reportgen_rx.recv().await {
            Some(super::super::Message::HairpinResult(works)) => works,
            other => panic!("unexpected reportgen message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hairpin_detected() {
        crate::test_utils::setup_logging();
        assert!(run_hairpin_check(true).await);
    }

    #[tokio::test]
    async fn test_hairpin_timeout() {
        crate::test_utils::setup_logging();
        assert!(!run_hairpin_check(false).await);
    }

    #[tokio::test]
    async fn test_check_runs_only_once() {
        crate::test_utils::setup_logging();
        let (netcheck_tx, mut netcheck_rx) = mpsc::channel(8);
        let (reportgen_tx, _reportgen_rx) = mpsc::channel(8);
        let mut client = Client::new(
            netcheck::Addr {
                sender: netcheck_tx,
            },
            reportgen::Addr {
                sender: reportgen_tx,
            },
        );

        let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3478);
        client.start_check(dst);
        client.start_check(dst);

        // Only one in-flight registration may ever be requested, and none after the
        // task is gone.
        let first = netcheck_rx.recv().await;
        assert!(matches!(first, Some(netcheck::Message::InFlightStun(..))));
        drop(client);
        assert!(netcheck_rx.recv().await.is_none());
    }
}
