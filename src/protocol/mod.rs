//! Signaling protocol
//!
//! Request/response pairs plus unsolicited events, carried over one ordered
//! connection per session:
//!
//! ```text
//! Publisher                          Server                         Subscriber
//!   |-- getRouterRtpCapabilities ----->|                                 |
//!   |-- createProducerTransport ------>|                                 |
//!   |-- connectProducerTransport ----->|                                 |
//!   |-- produce ---------------------->|------- newProducer (event) ---->|
//!   |                                  |<----- createConsumerTransport --|
//!   |                                  |<----- consume ------------------|
//!   |                                  |<----- connectConsumerTransport -|
//!   |                                  |<----- resume -------------------|
//! ```

pub mod message;

pub use message::{
    decode_request, ConnectTransportParams, ConsumeParams, ConsumerDescriptor,
    CreateTransportParams, ErrorBody, ProduceParams, ProduceResponse, Request, ResumeParams,
    ServerEvent, ServerMessage,
};

/// Wire names of requests and events
pub mod methods {
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_PRODUCER_TRANSPORT: &str = "createProducerTransport";
    pub const CREATE_CONSUMER_TRANSPORT: &str = "createConsumerTransport";
    pub const CONNECT_PRODUCER_TRANSPORT: &str = "connectProducerTransport";
    pub const CONNECT_CONSUMER_TRANSPORT: &str = "connectConsumerTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
    pub const RESUME: &str = "resume";

    pub const NEW_PRODUCER: &str = "newProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";
}
