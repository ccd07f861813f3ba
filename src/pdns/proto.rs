//! PowerDNS protobuf logging schema, hand-derived for prost.
//!
//! Declares the subset of PBDNSMessage this agent consumes; unknown fields
//! (resource records, policy metadata, EDNS subnets) are skipped by the
//! decoder. Tags and types follow the PowerDNS dnsmessage.proto (proto2).

/// One DNS query or response observation from the recursor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDnsMessage {
    #[prost(enumeration = "PbMessageType", required, tag = "1")]
    pub r#type: i32,

    /// Client address for queries, server address for responses.
    #[prost(bytes = "vec", optional, tag = "6")]
    pub from: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "7")]
    pub to: Option<Vec<u8>>,

    /// Message timestamp (seconds).
    #[prost(uint32, optional, tag = "9")]
    pub time_sec: Option<u32>,

    /// Message timestamp (microsecond remainder).
    #[prost(uint32, optional, tag = "10")]
    pub time_usec: Option<u32>,

    #[prost(message, optional, tag = "12")]
    pub question: Option<PbDnsQuestion>,

    #[prost(message, optional, tag = "13")]
    pub response: Option<PbDnsResponse>,

    #[prost(uint32, optional, tag = "20")]
    pub from_port: Option<u32>,

    #[prost(uint32, optional, tag = "21")]
    pub to_port: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PbMessageType {
    DnsQuery = 1,
    DnsResponse = 2,
    DnsOutgoingQuery = 3,
    DnsIncomingResponse = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDnsQuestion {
    #[prost(string, optional, tag = "1")]
    pub q_name: Option<String>,

    #[prost(uint32, optional, tag = "2")]
    pub q_type: Option<u32>,

    #[prost(uint32, optional, tag = "3")]
    pub q_class: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDnsResponse {
    #[prost(uint32, optional, tag = "1")]
    pub rcode: Option<u32>,

    #[prost(string, optional, tag = "3")]
    pub applied_policy: Option<String>,

    /// When the matching query was received (seconds).
    #[prost(uint32, optional, tag = "5")]
    pub query_time_sec: Option<u32>,

    /// When the matching query was received (microsecond remainder).
    #[prost(uint32, optional, tag = "6")]
    pub query_time_usec: Option<u32>,
}

/// Batch envelope some senders use to coalesce messages per frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbDnsMessageList {
    #[prost(message, repeated, tag = "1")]
    pub msg: Vec<PbDnsMessage>,
}
