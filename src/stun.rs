//! STUN packets sending and receiving.
//!
//! Netcheck only ever uses STUN binding requests, to learn its NAT-reflexive address
//! and the round-trip time to a relay node.  Everything here serves that: building
//! requests with fresh transaction IDs, classifying datagrams cheaply, and pulling the
//! reflexive address out of responses.

use std::net::SocketAddr;

use stun_rs::{
    attributes::stun::{Fingerprint, XorMappedAddress},
    DecoderContextBuilder, MessageDecoderBuilder, MessageEncoderBuilder, StunMessage,
    StunMessageBuilder,
};
pub use stun_rs::{
    attributes::StunAttribute, error::StunDecodeError, methods, MessageClass, MessageDecoder,
    TransactionId,
};

use crate::ip::to_canonical;

/// Errors that can occur when handling a STUN packet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The packet could not be decoded as a STUN message.
    #[error("malformed STUN message")]
    Malformed,
    /// The message is not a binding request when one was expected.
    #[error("not a binding request")]
    NotABindingRequest,
    /// The message is not a successful binding response when one was expected.
    #[error("not a success response")]
    NotAResponse,
    /// The response carries no address attribute we can use.
    #[error("no mapped address attribute")]
    NoMappedAddress,
    /// A binding request without a trailing fingerprint is not one of ours.
    #[error("missing fingerprint")]
    MissingFingerprint,
}

/// Generates a binding request STUN packet.
///
/// The transaction ID is the correlation handle: responses, including our own
/// hairpinned requests, are matched back to the probe that sent them by it.
pub fn request(tx: TransactionId) -> Vec<u8> {
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::Request)
        .with_transaction_id(tx)
        .with_attribute(Fingerprint::default())
        .build();
    encode(&msg)
}

/// Generates a binding response claiming *addr* is the sender's reflexive address.
pub fn response(tx: TransactionId, addr: SocketAddr) -> Vec<u8> {
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::SuccessResponse)
        .with_transaction_id(tx)
        .with_attribute(XorMappedAddress::from(addr))
        .build();
    encode(&msg)
}

fn encode(msg: &StunMessage) -> Vec<u8> {
    let encoder = MessageEncoderBuilder::default().build();
    let mut buf = vec![0u8; 150];
    let len = encoder
        .encode(&mut buf, msg)
        .expect("binding messages always fit the buffer");
    buf.truncate(len);
    buf
}

/// The RFC 5389 magic cookie, in wire order.
const MAGIC_COOKIE: [u8; 4] = 0x2112_a442u32.to_be_bytes();

/// Reports whether b looks like a STUN message.
///
/// Cheap enough to run against every datagram arriving on a shared socket: checks the
/// length, the two zero top bits of the message type, and the magic cookie.
pub fn is(b: &[u8]) -> bool {
    if b.len() < stun_rs::MESSAGE_HEADER_SIZE {
        return false;
    }
    if b[0] & 0b1100_0000 != 0 {
        return false;
    }
    b[4..8] == MAGIC_COOKIE
}

/// Parses a binding request, returning its transaction ID.
///
/// Netcheck receives binding requests in exactly one situation: its own hairpin probe
/// coming back around the NAT.  Requiring a valid trailing fingerprint filters out
/// anyone else's STUN traffic.
pub fn parse_binding_request(b: &[u8]) -> Result<TransactionId, Error> {
    let ctx = DecoderContextBuilder::default()
        .with_validation() // reject messages with a corrupt fingerprint
        .build();
    let decoder = MessageDecoderBuilder::default().with_context(ctx).build();
    let (msg, _) = decoder.decode(b).map_err(|_| Error::Malformed)?;

    if msg.method() != methods::BINDING || msg.class() != MessageClass::Request {
        return Err(Error::NotABindingRequest);
    }
    let fingerprinted = msg
        .attributes()
        .last()
        .map(|attr| attr.is_fingerprint())
        .unwrap_or_default();
    if !fingerprinted {
        return Err(Error::MissingFingerprint);
    }

    Ok(*msg.transaction_id())
}

/// Parses a successful binding response, returning the transaction ID and the
/// reflexive address the server reported.
///
/// XOR-MAPPED-ADDRESS is authoritative; a plain MAPPED-ADDRESS is accepted as fallback
/// for servers predating RFC 5389.
pub fn parse_response(b: &[u8]) -> Result<(TransactionId, SocketAddr), Error> {
    let decoder = MessageDecoder::default();
    let (msg, _) = decoder.decode(b).map_err(|_| Error::Malformed)?;

    if msg.class() != MessageClass::SuccessResponse {
        return Err(Error::NotAResponse);
    }
    let tx = *msg.transaction_id();

    let mut fallback = None;
    for attr in msg.attributes() {
        match attr {
            StunAttribute::XorMappedAddress(addr) => {
                return Ok((tx, canonical(*addr.socket_address())));
            }
            StunAttribute::MappedAddress(addr) => {
                fallback = Some(canonical(*addr.socket_address()));
            }
            _ => {}
        }
    }

    fallback
        .map(|addr| (tx, addr))
        .ok_or(Error::NoMappedAddress)
}

fn canonical(mut addr: SocketAddr) -> SocketAddr {
    addr.set_ip(to_canonical(addr.ip()));
    addr
}

#[cfg(test)]
pub(crate) mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::Result;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;
    use tracing::{debug, trace};

    use crate::relay_map::{RelayMap, RelayNode, RelayRegion, UseIpv4, UseIpv6};

    use super::*;

    /// An in-process STUN server for tests.
    ///
    /// Answers every binding request, either with the true source address of the
    /// request or with a fixed configured address.  The latter lets tests fake
    /// whatever NAT behavior they need, e.g. endpoint-dependent mappings.
    ///
    /// The server task stops when the [`StunServer`] is dropped.
    #[derive(Debug)]
    pub(crate) struct StunServer {
        addr: SocketAddr,
        requests: Arc<AtomicUsize>,
        _shutdown: oneshot::Sender<()>,
    }

    impl StunServer {
        /// Starts a server which reports the true source address of each request.
        pub(crate) async fn start() -> Result<Self> {
            Self::bind(None).await
        }

        /// Starts a server which claims every client's reflexive address is
        /// *reply_addr*.
        pub(crate) async fn start_lying(reply_addr: SocketAddr) -> Result<Self> {
            Self::bind(Some(reply_addr)).await
        }

        async fn bind(reply_addr: Option<SocketAddr>) -> Result<Self> {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            let mut addr = socket.local_addr()?;
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            debug!(%addr, "test STUN server listening");

            let requests = Arc::new(AtomicUsize::new(0));
            let answered = requests.clone();
            let (shutdown, mut shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 << 10];
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            debug!("test STUN server shutting down");
                            break;
                        }
                        res = socket.recv_from(&mut buf) => {
                            let Ok((len, src)) = res else { break };
                            let pkt = &buf[..len];
                            if !is(pkt) {
                                trace!(%src, "ignoring non STUN packet");
                                continue;
                            }
                            let Ok(txid) = parse_binding_request(pkt) else {
                                continue;
                            };
                            answered.fetch_add(1, Ordering::SeqCst);
                            let reflexive = reply_addr.unwrap_or(src);
                            socket.send_to(&response(txid, reflexive), src).await.ok();
                        }
                    }
                }
            });

            Ok(StunServer {
                addr,
                requests,
                _shutdown: shutdown,
            })
        }

        /// The address clients should send binding requests to.
        pub(crate) fn addr(&self) -> SocketAddr {
            self.addr
        }

        /// How many binding requests the server has answered so far.
        pub(crate) fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    /// Builds a [`RelayMap`] with one single-node region per given STUN server address.
    ///
    /// Region ids are assigned starting from 1 in iteration order.  The nodes use
    /// `stun_test_ip`, so no DNS is involved.
    pub(crate) fn relay_map_of(stun: impl Iterator<Item = SocketAddr>) -> RelayMap {
        let regions = stun.enumerate().map(|(i, addr)| {
            let region_id = (i + 1) as u16;
            let node = RelayNode {
                name: format!("test-{region_id}a"),
                region_id,
                host_name: format!("test-{region_id}.invalid"),
                stun_port: addr.port(),
                stun_only: true,
                stun_test_ip: Some(addr.ip()),
                ipv4: UseIpv4::TryDns,
                ipv6: UseIpv6::Disabled,
            };
            RelayRegion {
                region_id,
                region_code: format!("test-{region_id}"),
                avoid: false,
                nodes: vec![Arc::new(node)],
            }
        });
        RelayMap::from_regions(regions).expect("generated invalid region")
    }
}
