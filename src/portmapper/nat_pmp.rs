//! NAT-PMP request and response encoding.
//!
//! Only the subset of [RFC 6886] the probe needs: the external-address request and the
//! response parsers.
//!
//! [RFC 6886]: https://datatracker.ietf.org/doc/html/rfc6886

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// NAT-PMP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// Version 0, the only NAT-PMP version.
    NatPmp = 0,
}

/// Opcodes for client requests.  Responses OR in [`Response::INDICATOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Request the gateway's external address.
    DetermineExternalAddress = 0,
    /// Request a UDP mapping.
    MapUdp = 1,
}

/// Result codes, see [RFC 6886 Result Codes](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// Request succeeded.
    Success = 0,
    /// The sent version is not supported.
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed, e.g. the box supports mapping but the
    /// feature is turned off.
    NotAuthorizedOrRefused = 2,
    /// Network failure, e.g. the NAT box has not obtained a DHCP lease.
    NetworkFailure = 3,
    /// The NAT box cannot create any more mappings at this time.
    OutOfResources = 4,
    /// The sent opcode is not supported.
    UnsupportedOpcode = 5,
}

/// A NAT-PMP request.
#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// Request to determine the gateway's external address.
    ExternalAddress,
}

impl Request {
    /// Encode this [`Request`].
    ///
    /// The external-address request is exactly two zero bytes: version 0, opcode 0.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
        }
    }
}

/// A successful NAT-PMP response.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// Answer to [`Request::ExternalAddress`].
    PublicAddress {
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// The public IPv4 address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// Answer to a UDP mapping request.  The probe never sends one, but gateways are
    /// allowed to notify about mappings, so the parser understands them.
    PortMap {
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// The mapped local port.
        private_port: u16,
        /// The port the mapping is reachable from on the outside.
        external_port: u16,
        /// Remaining lifetime of the mapping in seconds.
        lifetime_seconds: u32,
    },
}

/// Errors that can occur when decoding a [`Response`].
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The [`Response::INDICATOR`] is not present.
    #[display("packet does not appear to be a response")]
    NotAResponse,
    /// The received opcode is not recognized.
    #[display("invalid opcode received")]
    InvalidOpcode,
    /// The received version is not recognized.
    #[display("invalid version received")]
    InvalidVersion,
    /// The received result code is not recognized.
    #[display("invalid result code received")]
    InvalidResultCode,
    /// The gateway answered with the given error code.
    #[display("gateway error: {_0:?}")]
    ErrorCode(ResultCode),
}

impl Response {
    /// Minimum size of an encoded [`Response`]: the external-address reply.
    pub const MIN_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Maximum size of an encoded [`Response`]: the mapping reply.
    pub const MAX_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::Malformed);
        }
        let _: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;
        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        let result_bytes = u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| Error::InvalidResultCode)?;
        if result_code != ResultCode::Success {
            return Err(Error::ErrorCode(result_code));
        }

        let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::MIN_SIZE {
                    return Err(Error::Malformed);
                }
                let ip_bytes: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            Opcode::MapUdp => {
                if buf.len() != Self::MAX_SIZE {
                    return Err(Error::Malformed);
                }
                let private_port_bytes = buf[8..10].try_into().expect("slice has the right len");
                let private_port = u16::from_be_bytes(private_port_bytes);

                let external_port_bytes = buf[10..12].try_into().expect("slice has the right len");
                let external_port = u16::from_be_bytes(external_port_bytes);

                let lifetime_bytes = buf[12..16].try_into().expect("slice has the right len");
                let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

                Response::PortMap {
                    epoch_time,
                    private_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_addr_request_bytes() {
        // The request wire format is fixed, two zero bytes.
        assert_eq!(Request::ExternalAddress.encode(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_decode_public_address_response() {
        let mut buf = vec![0u8; Response::MIN_SIZE];
        buf[0] = Version::NatPmp.into();
        buf[1] = Response::INDICATOR | u8::from(Opcode::DetermineExternalAddress);
        // result code: success
        buf[2..4].copy_from_slice(&0u16.to_be_bytes());
        buf[4..8].copy_from_slice(&7212u32.to_be_bytes());
        buf[8..12].copy_from_slice(&[198, 51, 100, 7]);

        let response = Response::decode(&buf).unwrap();
        assert_eq!(
            response,
            Response::PublicAddress {
                epoch_time: 7212,
                public_ip: "198.51.100.7".parse().unwrap(),
            }
        );
    }

    #[test]
    fn test_decode_refused_response() {
        let mut buf = vec![0u8; Response::MIN_SIZE];
        buf[1] = Response::INDICATOR;
        buf[2..4].copy_from_slice(&2u16.to_be_bytes());

        let err = Response::decode(&buf).unwrap_err();
        assert_eq!(err, Error::ErrorCode(ResultCode::NotAuthorizedOrRefused));
    }

    #[test]
    fn test_decode_rejects_request_packets() {
        // A request (no indicator bit) must not parse as a response.
        let mut buf = vec![0u8; Response::MIN_SIZE];
        buf[1] = u8::from(Opcode::DetermineExternalAddress);
        assert_eq!(Response::decode(&buf).unwrap_err(), Error::NotAResponse);
    }
}
