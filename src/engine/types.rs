//! Media engine data types
//!
//! Identifiers and parameter sets exchanged with the media engine. ICE, DTLS
//! and RTP parameter blobs are opaque to the coordinator: they are relayed
//! between the client and the engine as JSON without inspection.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier
            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Engine-assigned transport identifier
    TransportId
);
opaque_id!(
    /// Engine-assigned producer identifier
    ProducerId
);
opaque_id!(
    /// Engine-assigned consumer identifier
    ConsumerId
);

macro_rules! opaque_params {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl $name {
            /// Borrow the raw JSON value
            pub fn as_value(&self) -> &Value {
                &self.0
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_params!(
    /// Router or device RTP capabilities
    RtpCapabilities
);
opaque_params!(
    /// RTP send/receive parameters of a producer or consumer
    RtpParameters
);
opaque_params!(
    /// DTLS role and fingerprints
    DtlsParameters
);
opaque_params!(
    /// ICE username fragment and password
    IceParameters
);
opaque_params!(
    /// Gathered ICE candidates
    IceCandidates
);

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Both kinds, video first (the preferred consume target)
    pub const ALL: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forwarding type of a consumer as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// DTLS state of an engine transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// Whether the transport can no longer carry media
    pub fn is_terminal(&self) -> bool {
        matches!(self, DtlsState::Failed | DtlsState::Closed)
    }
}

/// Preferred spatial/temporal layers for a simulcast or SVC consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: u8,
}

impl Default for ConsumerLayers {
    fn default() -> Self {
        // Highest layers of the three-encoding simulcast browsers publish
        Self {
            spatial_layer: 2,
            temporal_layer: 2,
        }
    }
}

/// A local address the engine binds transports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenIp {
    /// Local interface address
    pub ip: IpAddr,
    /// Public address announced in ICE candidates (for NAT deployments)
    pub announced_ip: Option<String>,
}

impl ListenIp {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            announced_ip: None,
        }
    }

    pub fn announced(mut self, announced_ip: impl Into<String>) -> Self {
        self.announced_ip = Some(announced_ip.into());
        self
    }
}

/// Options for creating a WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Connection material of a freshly created transport, relayed to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), json!("video"));
        let kind: MediaKind = serde_json::from_value(json!("audio")).unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_value::<MediaKind>(json!("data")).is_err());
    }

    #[test]
    fn test_transport_parameters_camel_case() {
        let params = TransportParameters {
            id: TransportId::from("t1"),
            ice_parameters: IceParameters(json!({"usernameFragment": "u"})),
            ice_candidates: IceCandidates(json!([])),
            dtls_parameters: DtlsParameters(json!({"role": "auto"})),
        };

        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["id"], "t1");
        assert_eq!(value["iceParameters"]["usernameFragment"], "u");
        assert_eq!(value["dtlsParameters"]["role"], "auto");
        assert!(value["iceCandidates"].is_array());
    }

    #[test]
    fn test_random_ids_are_distinct() {
        assert_ne!(ProducerId::random(), ProducerId::random());
    }

    #[test]
    fn test_terminal_dtls_states() {
        assert!(DtlsState::Failed.is_terminal());
        assert!(DtlsState::Closed.is_terminal());
        assert!(!DtlsState::Connecting.is_terminal());
    }
}
