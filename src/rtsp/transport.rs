//! `Transport` header negotiation for SETUP. Two delivery modes: TCP
//! interleaved (RTP/RTCP multiplexed onto the RTSP control connection,
//! framed with the 4-byte `$` header) and UDP (RTP/RTCP sent to a pair of
//! server-allocated ports, named back to the client via `server_port`).
//! A client lists its preferred transports in order; the first one this
//! parser recognizes wins.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::UdpSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedChannels {
    pub rtp: u8,
    pub rtcp: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpClientPorts {
    pub rtp: u16,
    pub rtcp: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpServerPorts {
    pub rtp: u16,
    pub rtcp: u16,
}

pub enum ParsedTransport {
    Interleaved(InterleavedChannels),
    Udp(UdpClientPorts),
}

/// Parses the first transport spec this crate supports out of a (possibly
/// comma-separated, client-preference-ordered) `Transport` header.
pub fn parse_transport(header: &str) -> Result<Option<ParsedTransport>> {
    for spec in header.split(',') {
        if let Some(channels) = parse_interleaved_spec(spec)? {
            return Ok(Some(ParsedTransport::Interleaved(channels)));
        }
        if let Some(ports) = parse_client_port_spec(spec)? {
            return Ok(Some(ParsedTransport::Udp(ports)));
        }
    }
    Ok(None)
}

/// Same as `parse_transport`, narrowed to the interleaved case; kept for
/// callers (and tests) that only ever deal with TCP-interleaved delivery.
pub fn parse_interleaved(header: &str) -> Result<Option<InterleavedChannels>> {
    match parse_transport(header)? {
        Some(ParsedTransport::Interleaved(c)) => Ok(Some(c)),
        _ => Ok(None),
    }
}

fn parse_interleaved_spec(spec: &str) -> Result<Option<InterleavedChannels>> {
    let lower = spec.to_ascii_lowercase();
    let Some(pos) = lower.find("interleaved=") else {
        return Ok(None);
    };
    let rest = &spec[pos + "interleaved=".len()..];
    let range = rest.split(';').next().unwrap_or(rest).trim();
    let mut parts = range.splitn(2, '-');
    let rtp: u8 = parts
        .next()
        .ok_or_else(|| anyhow!("transport spec has an empty interleaved channel"))?
        .trim()
        .parse()?;
    let rtcp = match parts.next() {
        Some(s) if !s.trim().is_empty() => s.trim().parse()?,
        _ => rtp.wrapping_add(1),
    };
    Ok(Some(InterleavedChannels { rtp, rtcp }))
}

fn parse_client_port_spec(spec: &str) -> Result<Option<UdpClientPorts>> {
    let lower = spec.to_ascii_lowercase();
    let Some(pos) = lower.find("client_port=") else {
        return Ok(None);
    };
    let rest = &spec[pos + "client_port=".len()..];
    let range = rest.split(';').next().unwrap_or(rest).trim();
    let mut parts = range.splitn(2, '-');
    let rtp: u16 = parts
        .next()
        .ok_or_else(|| anyhow!("transport spec has an empty client_port"))?
        .trim()
        .parse()?;
    let rtcp = match parts.next() {
        Some(s) if !s.trim().is_empty() => s.trim().parse()?,
        _ => rtp.wrapping_add(1),
    };
    Ok(Some(UdpClientPorts { rtp, rtcp }))
}

pub fn response_header_interleaved(channels: InterleavedChannels) -> String {
    format!(
        "RTP/AVP/TCP;unicast;interleaved={}-{}",
        channels.rtp, channels.rtcp
    )
}

pub fn response_header_udp(client: UdpClientPorts, server: UdpServerPorts) -> String {
    format!(
        "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
        client.rtp, client.rtcp, server.rtp, server.rtcp
    )
}

/// Back-compat name for the interleaved-only response header.
pub fn response_header(channels: InterleavedChannels) -> String {
    response_header_interleaved(channels)
}

/// Binds a UDP RTP/RTCP socket pair on ephemeral ports and connects both
/// to the client's advertised `client_port` pair, so the rest of the
/// session can use `send`/`recv` instead of tracking the peer address on
/// every datagram.
pub struct UdpEndpoint {
    pub client: UdpClientPorts,
    pub server: UdpServerPorts,
    pub rtp_socket: Arc<UdpSocket>,
    pub rtcp_socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    pub async fn bind_and_connect(bind_ip: IpAddr, peer_ip: IpAddr, client: UdpClientPorts) -> Result<Self> {
        let rtp_socket = UdpSocket::bind((bind_ip, 0)).await?;
        let rtcp_socket = UdpSocket::bind((bind_ip, 0)).await?;
        let server = UdpServerPorts {
            rtp: rtp_socket.local_addr()?.port(),
            rtcp: rtcp_socket.local_addr()?.port(),
        };
        rtp_socket.connect((peer_ip, client.rtp)).await?;
        rtcp_socket.connect((peer_ip, client.rtcp)).await?;
        Ok(Self {
            client,
            server,
            rtp_socket: Arc::new(rtp_socket),
            rtcp_socket: Arc::new(rtcp_socket),
        })
    }
}

/// One SETUP track's negotiated delivery, carried for the life of the
/// RECORD/PLAY loop that follows.
pub enum NegotiatedTransport {
    Interleaved(InterleavedChannels),
    Udp(UdpEndpoint),
}

impl NegotiatedTransport {
    pub fn response_header(&self) -> String {
        match self {
            NegotiatedTransport::Interleaved(c) => response_header_interleaved(*c),
            NegotiatedTransport::Udp(u) => response_header_udp(u.client, u.server),
        }
    }

    pub fn as_interleaved(&self) -> Option<InterleavedChannels> {
        match self {
            NegotiatedTransport::Interleaved(c) => Some(*c),
            NegotiatedTransport::Udp(_) => None,
        }
    }

    pub fn rtp_socket(&self) -> Option<&Arc<UdpSocket>> {
        match self {
            NegotiatedTransport::Udp(u) => Some(&u.rtp_socket),
            NegotiatedTransport::Interleaved(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interleaved_range() {
        let parsed = parse_interleaved("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap().unwrap();
        assert_eq!(parsed, InterleavedChannels { rtp: 0, rtcp: 1 });
    }

    #[test]
    fn defaults_rtcp_channel_when_only_one_number_given() {
        let parsed = parse_interleaved("RTP/AVP/TCP;interleaved=4").unwrap().unwrap();
        assert_eq!(parsed, InterleavedChannels { rtp: 4, rtcp: 5 });
    }

    #[test]
    fn parses_udp_client_port_range() {
        match parse_transport("RTP/AVP;unicast;client_port=4000-4001").unwrap().unwrap() {
            ParsedTransport::Udp(ports) => assert_eq!(ports, UdpClientPorts { rtp: 4000, rtcp: 4001 }),
            ParsedTransport::Interleaved(_) => panic!("expected udp"),
        }
    }

    #[test]
    fn udp_client_port_defaults_rtcp_when_only_one_number_given() {
        match parse_transport("RTP/AVP;unicast;client_port=4000").unwrap().unwrap() {
            ParsedTransport::Udp(ports) => assert_eq!(ports, UdpClientPorts { rtp: 4000, rtcp: 4001 }),
            ParsedTransport::Interleaved(_) => panic!("expected udp"),
        }
    }

    #[test]
    fn prefers_the_first_recognized_spec_in_a_comma_separated_list() {
        // A client listing UDP first, interleaved as fallback.
        match parse_transport("RTP/AVP;unicast;client_port=4000-4001,RTP/AVP/TCP;interleaved=0-1")
            .unwrap()
            .unwrap()
        {
            ParsedTransport::Udp(ports) => assert_eq!(ports, UdpClientPorts { rtp: 4000, rtcp: 4001 }),
            ParsedTransport::Interleaved(_) => panic!("expected udp, the first listed spec"),
        }
    }

    #[test]
    fn returns_none_for_a_header_naming_neither_transport() {
        let parsed = parse_transport("RTP/AVP;unicast").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn formats_interleaved_response_header() {
        let header = response_header_interleaved(InterleavedChannels { rtp: 2, rtcp: 3 });
        assert_eq!(header, "RTP/AVP/TCP;unicast;interleaved=2-3");
    }

    #[test]
    fn formats_udp_response_header() {
        let header = response_header_udp(
            UdpClientPorts { rtp: 4000, rtcp: 4001 },
            UdpServerPorts { rtp: 6000, rtcp: 6001 },
        );
        assert_eq!(header, "RTP/AVP;unicast;client_port=4000-4001;server_port=6000-6001");
    }
}
