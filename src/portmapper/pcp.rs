//! PCP announce request and response encoding.
//!
//! The probe only ever sends ANNOUNCE, see [RFC 6887 ANNOUNCE Opcode], which is enough to
//! learn whether a PCP server is present and willing.
//!
//! [RFC 6887 ANNOUNCE Opcode]: https://datatracker.ietf.org/doc/html/rfc6887#section-14.1

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

/// PCP version, see [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// Version 2.
    Pcp = 2,
}

/// Opcode as defined in [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Announce Opcode.
    ///
    /// Used by the server to announce restarts (loss of state) and changes to mappings
    /// and external addresses, and by clients to solicit such an announcement.
    Announce = 0,
}

/// Result code in a response when said code is an error.
///
/// Refer to [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, derive_more::Display, thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// The version number at the start of the PCP Request header is not recognized.
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    /// The requested operation is disabled, or cannot be fulfilled by the server's
    /// security policy.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// Unsupported Opcode.
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    /// Unsupported option in the mandatory-to-process range.
    #[display("option is not supported")]
    UnsuppOption = 5,
    /// Malformed option.
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The server or the device it controls is experiencing a network failure.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// The server has insufficient resources to complete the operation at this time.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// Unsupported transport protocol.
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    /// The mapping would exceed the subscriber's port quota.
    #[display("quota exceeded")]
    UserExQuota = 10,
    /// The suggested external port and/or external address cannot be provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The source IP address of the request does not match the declared client address.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The server was not able to create the filters in this request.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// Result code of a PCP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// A successful response.
    Success,
    /// An error code, see [`ErrorCode`].
    Error(ErrorCode),
}

impl TryFrom<u8> for ResultCode {
    type Error = TryFromPrimitiveError<ErrorCode>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<ErrorCode>> {
        if value == 0 {
            Ok(ResultCode::Success)
        } else {
            ErrorCode::try_from(value).map(ResultCode::Error)
        }
    }
}

/// Size of the announce request this client sends, in bytes.
pub const ANNOUNCE_REQUEST_SIZE: usize = // parts:
    1 + // version
    1 + // opcode
    2 + // reserved
    4 + // lifetime
    16; // client ip

/// Creates an announce request.
///
/// The announce opcode requires a lifetime of 0 and carries no opcode-specific payload.
/// The client's IPv4 address is encoded as an IPv4-mapped IPv6 address.
pub fn announce_request(client_addr: Ipv4Addr) -> [u8; ANNOUNCE_REQUEST_SIZE] {
    let mut buf = [0u8; ANNOUNCE_REQUEST_SIZE];
    buf[0] = Version::Pcp.into();
    buf[1] = Opcode::Announce.into();
    // buf[2..4] reserved
    // buf[4..8] lifetime, 0 for announce
    buf[8..24].copy_from_slice(&client_addr.to_ipv6_mapped().octets());
    buf
}

/// A successful PCP response.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2).
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    /// The opcode this response answers.
    pub opcode: Opcode,
    /// Lifetime in seconds that can be assumed by this response.
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    pub epoch_time: u32,
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Response is too short or is otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The [`Response::RESPONSE_INDICATOR`] is not present.
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
}

/// Reasons decoding a response does not yield a usable [`Response`].
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The packet could not be decoded.
    #[display("{_0}")]
    Decode(#[from] DecodeError),
    /// The packet decoded to an error response.
    #[display("{_0}")]
    ErrorCode(#[from] ErrorCode),
}

impl Response {
    /// Max size of a PCP packet as indicated in
    /// [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7).
    pub const MAX_SIZE: usize = 1100;

    /// Minimum size of an encoded [`Response`] sent by a server to this client.
    pub const MIN_SIZE: usize = // parts:
        1 + // version
        1 + // opcode ORd with [`Response::RESPONSE_INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::MIN_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(DecodeError::Malformed.into());
        }

        let _version: Version = buf[0].try_into().map_err(|_| DecodeError::InvalidVersion)?;

        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(DecodeError::NotAResponse.into());
        }
        let opcode: Opcode = (opcode & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| DecodeError::InvalidOpcode)?;

        // buf[2] reserved

        let result_code: ResultCode = buf[3]
            .try_into()
            .map_err(|_| DecodeError::InvalidResultCode)?;
        match result_code {
            ResultCode::Success => {}
            ResultCode::Error(error_code) => return Err(error_code.into()),
        }

        let lifetime_bytes = buf[4..8].try_into().expect("slice has the right len");
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        // buf[12..24] reserved

        Ok(Response {
            opcode,
            lifetime_seconds,
            epoch_time,
        })
    }
}
