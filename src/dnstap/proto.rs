//! dnstap protobuf schema, hand-derived for prost.
//!
//! Only the fields this agent consumes are declared; protobuf decoding skips
//! unknown fields, so producers sending the full schema remain compatible.
//! Tags and types follow dnstap.proto (proto2).

/// Top-level dnstap container frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Dnstap {
    /// DNS server identity, free-form.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub identity: Option<Vec<u8>>,

    /// DNS server version, free-form.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub version: Option<Vec<u8>>,

    #[prost(message, optional, tag = "14")]
    pub message: Option<Message>,

    #[prost(enumeration = "DnstapType", required, tag = "15")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DnstapType {
    Message = 1,
}

/// One observed DNS message exchange.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", required, tag = "1")]
    pub r#type: i32,

    #[prost(enumeration = "SocketFamily", optional, tag = "2")]
    pub socket_family: Option<i32>,

    #[prost(enumeration = "SocketProtocol", optional, tag = "3")]
    pub socket_protocol: Option<i32>,

    /// Initiator address: 4 bytes for IPv4, 16 for IPv6.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub query_address: Option<Vec<u8>>,

    /// Responder address: 4 bytes for IPv4, 16 for IPv6.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub response_address: Option<Vec<u8>>,

    #[prost(uint32, optional, tag = "6")]
    pub query_port: Option<u32>,

    #[prost(uint32, optional, tag = "7")]
    pub response_port: Option<u32>,

    #[prost(uint64, optional, tag = "8")]
    pub query_time_sec: Option<u64>,

    #[prost(fixed32, optional, tag = "9")]
    pub query_time_nsec: Option<u32>,

    /// Wire-format DNS query payload.
    #[prost(bytes = "vec", optional, tag = "10")]
    pub query_message: Option<Vec<u8>>,

    /// Wire-format DNS response payload.
    #[prost(bytes = "vec", optional, tag = "11")]
    pub response_message: Option<Vec<u8>>,

    #[prost(uint64, optional, tag = "13")]
    pub response_time_sec: Option<u64>,

    #[prost(fixed32, optional, tag = "14")]
    pub response_time_nsec: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    AuthQuery = 1,
    AuthResponse = 2,
    ResolverQuery = 3,
    ResolverResponse = 4,
    ClientQuery = 5,
    ClientResponse = 6,
    ForwarderQuery = 7,
    ForwarderResponse = 8,
    StubQuery = 9,
    StubResponse = 10,
    ToolQuery = 11,
    ToolResponse = 12,
    UpdateQuery = 13,
    UpdateResponse = 14,
}

impl MessageType {
    /// Stable lowercase label for logs and counters.
    pub fn as_label(self) -> &'static str {
        match self {
            MessageType::AuthQuery => "auth_query",
            MessageType::AuthResponse => "auth_response",
            MessageType::ResolverQuery => "resolver_query",
            MessageType::ResolverResponse => "resolver_response",
            MessageType::ClientQuery => "client_query",
            MessageType::ClientResponse => "client_response",
            MessageType::ForwarderQuery => "forwarder_query",
            MessageType::ForwarderResponse => "forwarder_response",
            MessageType::StubQuery => "stub_query",
            MessageType::StubResponse => "stub_response",
            MessageType::ToolQuery => "tool_query",
            MessageType::ToolResponse => "tool_response",
            MessageType::UpdateQuery => "update_query",
            MessageType::UpdateResponse => "update_response",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SocketFamily {
    Inet = 1,
    Inet6 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SocketProtocol {
    Udp = 1,
    Tcp = 2,
}
