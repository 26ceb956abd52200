use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const CONTENT_TYPE_FLOW_DESCRIPTOR: &str = "application/serv_desc+json";
pub const CONTENT_TYPE_ATTRIBUTES: &str = "text/plain";

pub const METHOD_MESSAGE: &str = "MESSAGE";
pub const METHOD_BYE: &str = "BYE";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid SIP URI `{uri}`: {reason}")]
pub struct UriError {
    pub uri: String,
    pub reason: &'static str,
}

/// Destination or address-of-record as carried in a request line or a
/// From/To header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SipUri {
    pub scheme: String,
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: String,
}

impl SipUri {
    /// `user@host`, the key shared by the context, chain and dialog tables.
    pub fn principal(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

impl FromStr for SipUri {
    type Err = UriError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = |reason| UriError {
            uri: raw.to_string(),
            reason,
        };
        let mut text = raw.trim();
        if let Some(start) = text.find('<') {
            let len = text[start..]
                .find('>')
                .ok_or_else(|| err("unterminated '<'"))?;
            text = &text[start + 1..start + len];
        }

        let (scheme, rest) = match text.split_once(':') {
            Some((s, r)) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic()) => {
                (s.to_ascii_lowercase(), r)
            }
            _ => ("sip".to_string(), text),
        };
        let (addr, params) = rest.split_once(';').unwrap_or((rest, ""));
        let (user, hostport) = match addr.rsplit_once('@') {
            Some((u, h)) => (u, h),
            None => ("", addr),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse::<u16>().map_err(|_| err("bad port"))?)),
            None => (hostport, None),
        };
        if host.is_empty() {
            return Err(err("missing host"));
        }
        Ok(Self {
            scheme,
            user: user.to_string(),
            host: host.to_string(),
            port,
            params: params.to_string(),
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for SipUri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SipUri> for String {
    fn from(value: SipUri) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CSeq {
    pub seq: u32,
    pub method: String,
}

impl CSeq {
    pub fn bump(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SipRequest {
    pub method: String,
    pub uri: SipUri,
    pub dialog_id: String,
    pub from: SipUri,
    pub to: SipUri,
    pub cseq: CSeq,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub dialog_id: String,
    pub from: SipUri,
    pub to: SipUri,
    pub cseq: CSeq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Outbound {
    Request(SipRequest),
    Response(SipResponse),
}

/// Send/receive primitives of the signaling stack, bound to the transaction
/// the inbound message arrived on.
pub trait UserAgent: Send {
    /// Builds a request copying `basis`' headers, with the request target and
    /// To rewritten to `destination`.
    fn create_request(&mut self, method: &str, destination: &SipUri, basis: &SipRequest)
        -> SipRequest;
    fn send_request(&mut self, request: SipRequest);
    fn create_response(&mut self, code: u16, reason: &str) -> SipResponse;
    fn send_response(&mut self, response: SipResponse);
}

/// A node of the tree produced by the flow design tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoredNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub children: Vec<AuthoredNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthoredFlow {
    pub name: String,
    pub root: AuthoredNode,
}

/// Body of an `application/serv_desc+json` control message.
pub type FlowDescriptor = BTreeMap<String, Vec<AuthoredFlow>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    Forwarded { destination: SipUri, via_policy: bool },
    Rejected { status: u16, destination: SipUri },
    Relayed,
    Continued { destination: SipUri },
    Advanced { block_id: String },
    Control { applied: bool },
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Disposition::Forwarded { .. } => "forwarded",
            Disposition::Rejected { .. } => "rejected",
            Disposition::Relayed => "relayed",
            Disposition::Continued { .. } => "continued",
            Disposition::Advanced { .. } => "advanced",
            Disposition::Control { .. } => "control",
        }
    }

    pub fn destination(&self) -> Option<&SipUri> {
        match self {
            Disposition::Forwarded { destination, .. }
            | Disposition::Rejected { destination, .. }
            | Disposition::Continued { destination } => Some(destination),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingReport {
    pub dialog_id: String,
    pub disposition: Disposition,
    pub messages: Vec<Outbound>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::path::PathBuf;

    #[test]
    fn parses_bracketed_uri_with_port_and_params() {
        let uri: SipUri = "\"Bob\" <sip:bob@example.test:5070;transport=udp>"
            .parse()
            .unwrap();
        assert_eq!(uri.user, "bob");
        assert_eq!(uri.host, "example.test");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.params, "transport=udp");
        assert_eq!(uri.to_string(), "sip:bob@example.test:5070;transport=udp");
        assert_eq!(uri.principal(), "bob@example.test");
    }

    #[test]
    fn scheme_defaults_to_sip() {
        let uri: SipUri = "voicemail@example.test".parse().unwrap();
        assert_eq!(uri.scheme, "sip");
        assert_eq!(uri.to_string(), "sip:voicemail@example.test");
    }

    #[test]
    fn rejects_uri_without_host() {
        assert!("sip:bob@".parse::<SipUri>().is_err());
        assert!("sip:bob@host:notaport".parse::<SipUri>().is_err());
    }

    #[test]
    fn cseq_bump_increments_sequence() {
        let mut cseq = CSeq {
            seq: 7,
            method: "INVITE".to_string(),
        };
        cseq.bump();
        assert_eq!(cseq.seq, 8);
        assert_eq!(cseq.method, "INVITE");
    }

    #[test]
    fn schema_files_are_valid_json_schema() {
        let dir = repo_path("contracts/v1");
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if !path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
            {
                continue;
            }
            let text = std::fs::read_to_string(&path).unwrap();
            let schema: Value = serde_json::from_str(&text).unwrap();
            let _validator = jsonschema::validator_for(&schema)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", path.display()));
        }
    }

    #[test]
    fn sample_flow_descriptor_matches_schema_and_type() {
        let schema_text =
            std::fs::read_to_string(repo_path("contracts/v1/flow-descriptor.schema.json"))
                .unwrap();
        let schema: Value = serde_json::from_str(&schema_text).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();

        let sample = serde_json::json!({
            "bob@example.test": [{
                "name": "busy-to-voicemail",
                "root": {
                    "id": "start", "name": "Start", "type": "start",
                    "children": [{
                        "id": "c1", "name": "status", "type": "condition", "value": "status",
                        "children": [{
                            "id": "o1", "name": "busy", "type": "condition_option", "value": "busy",
                            "children": [{
                                "id": "s1", "name": "voicemail", "type": "service",
                                "value": "sip:voicemail@example.test"
                            }]
                        }]
                    }]
                }
            }]
        });
        assert!(validator.validate(&sample).is_ok());
        let descriptor: FlowDescriptor = serde_json::from_value(sample).unwrap();
        assert_eq!(descriptor["bob@example.test"][0].root.children[0].id, "c1");
    }

    #[test]
    fn request_uris_serialize_in_canonical_form() {
        let json = serde_json::json!({
            "method": "INVITE",
            "uri": "sip:bob@example.test",
            "dialog_id": "d1",
            "from": "<sip:alice@example.test>",
            "to": "sip:bob@example.test",
            "cseq": {"seq": 1, "method": "INVITE"}
        });
        let request: SipRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.from.principal(), "alice@example.test");
        let back = serde_json::to_value(&request).unwrap();
        assert_eq!(back["from"], "sip:alice@example.test");
    }

    fn repo_path(relative: &str) -> PathBuf {
        let mut base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        base.push("../..");
        base.push(relative);
        base
    }
}
