//! ICE and DTLS transport documents

use serde::{Deserialize, Serialize};

/// ICE credentials of one side of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

/// ICE candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl IceCandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceCandidateType::Host => "host",
            IceCandidateType::Srflx => "srflx",
            IceCandidateType::Prflx => "prflx",
            IceCandidateType::Relay => "relay",
        }
    }
}

/// ICE candidate as exchanged with the SFU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub typ: IceCandidateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

impl IceCandidate {
    /// Render as the value of an `a=candidate` attribute (component 1)
    pub fn to_sdp_value(&self) -> String {
        let mut value = format!(
            "{} 1 {} {} {} {} typ {}",
            self.foundation,
            self.protocol.as_str(),
            self.priority,
            self.ip,
            self.port,
            self.typ.as_str()
        );
        if let Some(ref tcp_type) = self.tcp_type {
            value.push_str(" tcptype ");
            value.push_str(tcp_type);
        }
        value
    }

    /// Parse the value of an `a=candidate` attribute
    ///
    /// Only RTP (component 1) candidates are returned, since everything is
    /// bundled over one rtcp-muxed transport.
    pub fn from_sdp_value(value: &str) -> Option<Self> {
        let value = value.strip_prefix("candidate:").unwrap_or(value);
        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < 8 || fields[1] != "1" || fields[6] != "typ" {
            return None;
        }

        let protocol = match fields[2].to_ascii_lowercase().as_str() {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            _ => return None,
        };
        let typ = match fields[7] {
            "host" => IceCandidateType::Host,
            "srflx" => IceCandidateType::Srflx,
            "prflx" => IceCandidateType::Prflx,
            "relay" => IceCandidateType::Relay,
            _ => return None,
        };
        let tcp_type = fields
            .windows(2)
            .skip(8)
            .find(|w| w[0] == "tcptype")
            .map(|w| w[1].to_string());

        Some(Self {
            foundation: fields[0].to_string(),
            priority: fields[3].parse().ok()?,
            ip: fields[4].to_string(),
            protocol,
            port: fields[5].parse().ok()?,
            typ,
            tcp_type,
        })
    }
}

/// DTLS role of a transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

impl DtlsRole {
    /// Role the other endpoint must take
    pub fn opposite(&self) -> Self {
        match self {
            DtlsRole::Auto => DtlsRole::Auto,
            DtlsRole::Client => DtlsRole::Server,
            DtlsRole::Server => DtlsRole::Client,
        }
    }

    /// Value of the `a=setup` attribute announcing this role
    pub fn sdp_setup(&self) -> &'static str {
        match self {
            DtlsRole::Auto => "actpass",
            DtlsRole::Client => "active",
            DtlsRole::Server => "passive",
        }
    }

    /// Role announced by an `a=setup` attribute
    pub fn from_sdp_setup(setup: &str) -> Option<Self> {
        match setup.trim() {
            "active" => Some(DtlsRole::Client),
            "passive" => Some(DtlsRole::Server),
            "actpass" => Some(DtlsRole::Auto),
            _ => None,
        }
    }
}

impl std::fmt::Display for DtlsRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DtlsRole::Auto => write!(f, "auto"),
            DtlsRole::Client => write!(f, "client"),
            DtlsRole::Server => write!(f, "server"),
        }
    }
}

/// Certificate fingerprint (`a=fingerprint`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of one side of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Transport parameters of the SFU side, handed to the handler at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRemoteParameters {
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Transport parameters of the local side, produced once the first local
/// description exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportLocalParameters {
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_parameters: Option<IceParameters>,
    #[serde(default)]
    pub ice_candidates: Vec<IceCandidate>,
}
