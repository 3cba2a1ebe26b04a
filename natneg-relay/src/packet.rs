//! Wire format of NatNeg packets.
//!
//! Every NatNeg packet starts with the same 8-byte header:
//!
//! ```text
//! offset 0..6   magic    FD FC 1E 66 6A B2
//! offset 6      version  (opaque)
//! offset 7      step
//! offset 8..    step-dependent payload
//! ```
//!
//! The functions in this module never allocate; callers own the buffers.

use std::fmt;
use std::net::Ipv4Addr;

/// Magic bytes identifying a NatNeg packet.
pub const MAGIC: [u8; 6] = [0xFD, 0xFC, 0x1E, 0x66, 0x6A, 0xB2];

const VERSION_LEN: usize = 1;
const STEP_LEN: usize = 1;
const HEADER_LEN: usize = MAGIC.len() + VERSION_LEN + STEP_LEN;

const STEP_OFFSET: usize = 7;
const NATNEG_ID_OFFSET: usize = 8;

/// Offset of the sequence-number byte within an `init` packet.
pub const INIT_SEQUENCE_NUMBER_OFFSET: usize = 12;

/// The sequence number of the `init` packet sent from the client's public
/// (game-plane) endpoint.
///
/// Its semantics beyond "marks the client-public leg" are undocumented;
/// nothing else is inferred from it.
pub const INIT_SEQ_CLIENT_PUBLIC: u8 = 0;

/// The negotiation identifier embedded in most NatNeg packets.
///
/// The four bytes on the wire are copied verbatim, without byte-swapping:
/// the upstream service compares them byte-wise, so normalizing the order
/// would change the key.
pub type NatNegId = u32;

/// Identifies one of the two sides of a negotiation.
pub type PlayerId = i8;

/// One side of one negotiation; sessions are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub natneg_id: NatNegId,
    pub player_id: PlayerId,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.natneg_id, self.player_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    InitAck,
    Connect,
    ConnectAck,
    ConnectPing,
    Report,
    ReportAck,
    PreInit,
    PreInitAck,
    /// Steps we don't know about are tolerated; they carry no session key
    /// and are discarded by the dispatcher.
    Unknown(u8),
}

impl From<u8> for Step {
    fn from(value: u8) -> Self {
        match value {
            0 => Step::Init,
            1 => Step::InitAck,
            5 => Step::Connect,
            6 => Step::ConnectAck,
            7 => Step::ConnectPing,
            13 => Step::Report,
            14 => Step::ReportAck,
            15 => Step::PreInit,
            16 => Step::PreInitAck,
            other => Step::Unknown(other),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Step::Init => 0,
            Step::InitAck => 1,
            Step::Connect => 5,
            Step::ConnectAck => 6,
            Step::ConnectPing => 7,
            Step::Report => 13,
            Step::ReportAck => 14,
            Step::PreInit => 15,
            Step::PreInitAck => 16,
            Step::Unknown(other) => *other,
        };

        value.fmt(f)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("packet too small to contain a NatNeg ID")]
    TruncatedNatNegId,
    #[error("packet too small to contain a player ID")]
    TruncatedPlayerId,
    #[error("packet too small to contain an embedded address")]
    TruncatedAddress,
}

/// Whether `packet` is a NatNeg packet: long enough for the common header
/// and carrying the magic prefix.
pub fn is_natneg(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[..MAGIC.len()] == MAGIC
}

/// The step of `packet`; requires [`is_natneg`].
pub fn step(packet: &[u8]) -> Step {
    debug_assert!(is_natneg(packet));

    Step::from(packet[STEP_OFFSET])
}

/// The [`NatNegId`] of `packet`, if its step carries one.
pub fn natneg_id(packet: &[u8]) -> Result<Option<NatNegId>, MalformedPacket> {
    match step(packet) {
        Step::Init
        | Step::InitAck
        | Step::Connect
        | Step::ConnectAck
        | Step::ConnectPing
        | Step::Report
        | Step::ReportAck => {
            let bytes = packet
                .get(NATNEG_ID_OFFSET..NATNEG_ID_OFFSET + 4)
                .ok_or(MalformedPacket::TruncatedNatNegId)?;

            // Raw copy, never byte-swapped; see `NatNegId`.
            Ok(Some(NatNegId::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        Step::PreInit | Step::PreInitAck | Step::Unknown(_) => Ok(None),
    }
}

/// The [`SessionKey`] of `packet`, if its step carries both a NatNeg ID and
/// a player ID.
pub fn session_key(packet: &[u8]) -> Result<Option<SessionKey>, MalformedPacket> {
    let Some(natneg_id) = natneg_id(packet)? else {
        return Ok(None);
    };

    let player_id_offset = match step(packet) {
        Step::Init | Step::InitAck | Step::ConnectAck | Step::Report | Step::ReportAck => 13,
        Step::PreInit | Step::PreInitAck => 12,
        Step::Connect | Step::ConnectPing | Step::Unknown(_) => return Ok(None),
    };

    let player_id = *packet
        .get(player_id_offset)
        .ok_or(MalformedPacket::TruncatedPlayerId)? as PlayerId;

    Ok(Some(SessionKey {
        natneg_id,
        player_id,
    }))
}

/// Offset of the embedded (IPv4, port) pair for steps that carry one.
pub fn address_offset(step: Step) -> Option<usize> {
    match step {
        Step::Connect | Step::ConnectPing => Some(12),
        Step::Init
        | Step::InitAck
        | Step::ConnectAck
        | Step::Report
        | Step::ReportAck
        | Step::PreInit
        | Step::PreInitAck
        | Step::Unknown(_) => None,
    }
}

/// Reads the 4-byte IPv4 address and big-endian port at `offset`.
///
/// The returned port is in host order.
pub fn parse_address(packet: &[u8], offset: usize) -> Result<(Ipv4Addr, u16), MalformedPacket> {
    let bytes = packet
        .get(offset..offset + 6)
        .ok_or(MalformedPacket::TruncatedAddress)?;

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok((ip, port))
}

/// Overwrites the 6 address bytes at `offset` with `ip` and `port`.
///
/// `port` is in host order and is serialized big-endian.
pub fn rewrite_address(
    packet: &mut [u8],
    offset: usize,
    ip: Ipv4Addr,
    port: u16,
) -> Result<(), MalformedPacket> {
    let bytes = packet
        .get_mut(offset..offset + 6)
        .ok_or(MalformedPacket::TruncatedAddress)?;

    bytes[..4].copy_from_slice(&ip.octets());
    bytes[4..].copy_from_slice(&port.to_be_bytes());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn accepts_packet_with_magic() {
        let packet = hex!("FDFC1E666AB2 02 00");

        assert!(is_natneg(&packet));
        assert_eq!(step(&packet), Step::Init);
    }

    #[test]
    fn rejects_packet_with_broken_magic() {
        let packet = hex!("00FC1E666AB2 02 00");

        assert!(!is_natneg(&packet));
    }

    #[test]
    fn rejects_packet_shorter_than_header() {
        assert!(!is_natneg(&hex!("FDFC1E666AB2 02")));
    }

    #[test]
    fn is_natneg_is_pure() {
        let packet = hex!("FDFC1E666AB2 02 00");

        assert_eq!(is_natneg(&packet), is_natneg(&packet));
        assert_eq!(step(&packet), step(&packet));
    }

    #[test]
    fn tolerates_unknown_step() {
        let packet = hex!("FDFC1E666AB2 02 2A");

        assert_eq!(step(&packet), Step::Unknown(42));
        assert_eq!(session_key(&packet), Ok(None));
    }

    #[test]
    fn extracts_session_key_from_init() {
        // magic | version | step | NatNeg ID | sequence number | player ID
        let packet = hex!("FDFC1E666AB2 02 00 11223344 00 05 0000");

        let key = session_key(&packet).unwrap().unwrap();

        assert_eq!(key.natneg_id, NatNegId::from_ne_bytes([0x11, 0x22, 0x33, 0x44]));
        assert_eq!(key.player_id, 5);

        #[cfg(target_endian = "little")]
        assert_eq!(key.natneg_id, 0x4433_2211);
    }

    #[test]
    fn player_id_is_signed() {
        let packet = hex!("FDFC1E666AB2 02 00 11223344 00 FF 0000");

        let key = session_key(&packet).unwrap().unwrap();

        assert_eq!(key.player_id, -1);
    }

    #[test]
    fn connect_carries_id_but_no_session_key() {
        let packet = hex!("FDFC1E666AB2 02 05 AABBCCDD C0A8010A 1A0A");

        assert_eq!(
            natneg_id(&packet),
            Ok(Some(NatNegId::from_ne_bytes([0xAA, 0xBB, 0xCC, 0xDD])))
        );
        assert_eq!(session_key(&packet), Ok(None));
    }

    #[test]
    fn errors_on_packet_too_short_for_id() {
        let packet = hex!("FDFC1E666AB2 02 00 1122");

        assert_eq!(natneg_id(&packet), Err(MalformedPacket::TruncatedNatNegId));
    }

    #[test]
    fn errors_on_packet_too_short_for_player_id() {
        let packet = hex!("FDFC1E666AB2 02 00 11223344 00");

        assert_eq!(
            session_key(&packet),
            Err(MalformedPacket::TruncatedPlayerId)
        );
    }

    #[test]
    fn only_connect_steps_embed_an_address() {
        assert_eq!(address_offset(Step::Connect), Some(12));
        assert_eq!(address_offset(Step::ConnectPing), Some(12));
        assert_eq!(address_offset(Step::Init), None);
        assert_eq!(address_offset(Step::ReportAck), None);
        assert_eq!(address_offset(Step::Unknown(42)), None);
    }

    #[test]
    fn parses_embedded_address() {
        let packet = hex!("FDFC1E666AB2 02 05 AABBCCDD C0A8010A 1A0A");

        let (ip, port) = parse_address(&packet, 12).unwrap();

        assert_eq!(ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(port, 6666);
    }

    #[test]
    fn rewrites_embedded_address_in_place() {
        let mut packet = hex!("FDFC1E666AB2 02 05 AABBCCDD C0A8010A 1A0A 000000000000");

        rewrite_address(&mut packet, 12, Ipv4Addr::new(203, 0, 113, 7), 51000).unwrap();

        assert_eq!(packet[12..18], hex!("CB007107 C738"));
        assert_eq!(
            parse_address(&packet, 12),
            Ok((Ipv4Addr::new(203, 0, 113, 7), 51000))
        );
    }

    #[test]
    fn errors_on_address_past_end_of_packet() {
        let mut packet = hex!("FDFC1E666AB2 02 05 AABBCCDD C0A8");

        assert_eq!(
            parse_address(&packet, 12),
            Err(MalformedPacket::TruncatedAddress)
        );
        assert_eq!(
            rewrite_address(&mut packet, 12, Ipv4Addr::LOCALHOST, 1),
            Err(MalformedPacket::TruncatedAddress)
        );
    }
}
