//! Normalized ARP packet representation
//!
//! A `Packet` is one observed ARP frame, already parsed. It can be built
//! directly, deserialized from an NDJSON record, or parsed from the raw
//! 28-byte ARP body that follows the Ethernet header.

use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ArpWardenError, Result};

/// Hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;
/// Protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;
/// Ethernet hardware address length
pub const HW_LEN_ETHERNET: u8 = 6;
/// IPv4 protocol address length
pub const PROTO_LEN_IPV4: u8 = 4;

/// Size of an ARP body for IPv4 over Ethernet
pub const ARP_IPV4_LEN: usize = 28;

/// 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        MacAddr([a, b, c, d, e, f])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ArpWardenError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`, any case.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(ArpWardenError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(ArpWardenError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ArpWardenError::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ARP operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ArpOp {
    Request,
    Reply,
    Other(u16),
}

impl From<u16> for ArpOp {
    fn from(val: u16) -> Self {
        match val {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            other => ArpOp::Other(other),
        }
    }
}

impl From<ArpOp> for u16 {
    fn from(val: ArpOp) -> Self {
        match val {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
            ArpOp::Other(v) => v,
        }
    }
}

impl std::fmt::Display for ArpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArpOp::Request => write!(f, "request"),
            ArpOp::Reply => write!(f, "reply"),
            ArpOp::Other(n) => write!(f, "op({})", n),
        }
    }
}

fn default_hw_type() -> u16 {
    HW_TYPE_ETHERNET
}

fn default_proto_type() -> u16 {
    PROTO_TYPE_IPV4
}

fn default_hw_len() -> u8 {
    HW_LEN_ETHERNET
}

fn default_proto_len() -> u8 {
    PROTO_LEN_IPV4
}

/// One observed ARP frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Operation (request=1, reply=2)
    pub operation: ArpOp,
    /// Sender hardware address
    pub src_mac: MacAddr,
    /// Target hardware address
    pub dst_mac: MacAddr,
    /// Sender protocol address
    pub src_ip: Ipv4Addr,
    /// Target protocol address
    pub dst_ip: Ipv4Addr,
    #[serde(default = "default_hw_type")]
    pub hw_type: u16,
    #[serde(default = "default_proto_type")]
    pub proto_type: u16,
    #[serde(default = "default_hw_len")]
    pub hw_len: u8,
    #[serde(default = "default_proto_len")]
    pub proto_len: u8,
}

impl Packet {
    /// Build an Ethernet/IPv4 ARP packet with standard header fields
    pub fn new(
        timestamp: DateTime<Utc>,
        operation: ArpOp,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
    ) -> Self {
        Self {
            timestamp,
            operation,
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            hw_type: HW_TYPE_ETHERNET,
            proto_type: PROTO_TYPE_IPV4,
            hw_len: HW_LEN_ETHERNET,
            proto_len: PROTO_LEN_IPV4,
        }
    }

    /// "Who has `target_ip`? Tell `src_ip`"
    pub fn request(
        timestamp: DateTime<Utc>,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self::new(timestamp, ArpOp::Request, src_mac, src_ip, MacAddr::ZERO, target_ip)
    }

    /// "`src_ip` is at `src_mac`", addressed to `dst_mac`/`dst_ip`
    pub fn reply(
        timestamp: DateTime<Utc>,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
    ) -> Self {
        Self::new(timestamp, ArpOp::Reply, src_mac, src_ip, dst_mac, dst_ip)
    }

    /// Unsolicited reply announcing `ip` at `mac`
    pub fn gratuitous(timestamp: DateTime<Utc>, mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self::new(timestamp, ArpOp::Reply, mac, ip, MacAddr::BROADCAST, ip)
    }

    pub fn with_header(mut self, hw_type: u16, proto_type: u16, hw_len: u8, proto_len: u8) -> Self {
        self.hw_type = hw_type;
        self.proto_type = proto_type;
        self.hw_len = hw_len;
        self.proto_len = proto_len;
        self
    }

    /// Parse the ARP body (after the Ethernet header)
    ///
    /// Non-Ethernet hardware or non-IPv4 protocol types are kept as-is so
    /// that they can be flagged downstream; only address lengths other than
    /// 6/4 and truncated bodies are rejected.
    pub fn parse(data: &[u8], timestamp: DateTime<Utc>) -> Result<Self> {
        if data.len() < 8 {
            return Err(ArpWardenError::MalformedPacket(format!(
                "ARP header truncated: {} bytes",
                data.len()
            )));
        }

        let hw_type = u16::from_be_bytes([data[0], data[1]]);
        let proto_type = u16::from_be_bytes([data[2], data[3]]);
        let hw_len = data[4];
        let proto_len = data[5];
        let operation = ArpOp::from(u16::from_be_bytes([data[6], data[7]]));

        if hw_len != HW_LEN_ETHERNET || proto_len != PROTO_LEN_IPV4 {
            return Err(ArpWardenError::MalformedPacket(format!(
                "unsupported address lengths hw={} proto={}",
                hw_len, proto_len
            )));
        }

        if data.len() < ARP_IPV4_LEN {
            return Err(ArpWardenError::MalformedPacket(format!(
                "ARP body truncated: {} of {} bytes",
                data.len(),
                ARP_IPV4_LEN
            )));
        }

        let src_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
        let src_ip = Ipv4Addr::new(data[14], data[15], data[16], data[17]);
        let dst_mac = MacAddr([data[18], data[19], data[20], data[21], data[22], data[23]]);
        let dst_ip = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        Ok(Self {
            timestamp,
            operation,
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            hw_type,
            proto_type,
            hw_len,
            proto_len,
        })
    }

    /// Structural validation applied before a packet reaches the rules
    pub fn validate(&self) -> Result<()> {
        if let ArpOp::Other(code) = self.operation {
            return Err(ArpWardenError::MalformedPacket(format!(
                "unknown ARP operation {}",
                code
            )));
        }
        if self.src_mac.is_zero() {
            return Err(ArpWardenError::MalformedPacket(
                "zero sender hardware address".to_string(),
            ));
        }
        if self.src_mac.is_broadcast() {
            return Err(ArpWardenError::MalformedPacket(
                "broadcast sender hardware address".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_request(&self) -> bool {
        self.operation == ArpOp::Request
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ArpOp::Reply
    }

    /// Sender and target protocol addresses are the same
    pub fn is_gratuitous(&self) -> bool {
        self.src_ip == self.dst_ip && !self.src_ip.is_unspecified()
    }

    /// ARP probe (RFC 5227): sender IP is 0.0.0.0
    pub fn is_probe(&self) -> bool {
        self.src_ip.is_unspecified()
    }

    /// Header fields that deviate from Ethernet/IPv4 ARP
    pub fn header_anomalies(&self) -> Vec<&'static str> {
        let mut anomalies = Vec::new();
        if self.hw_type != HW_TYPE_ETHERNET {
            anomalies.push("hw_type");
        }
        if self.proto_type != PROTO_TYPE_IPV4 {
            anomalies.push("proto_type");
        }
        if self.hw_len != HW_LEN_ETHERNET {
            anomalies.push("hw_len");
        }
        if self.proto_len != PROTO_LEN_IPV4 {
            anomalies.push("proto_len");
        }
        anomalies
    }
}
