use std::collections::BTreeMap;
use std::sync::Arc;

use scim_contracts::{SipRequest, SipUri};
use tracing::warn;

use crate::flow::{Block, BlockKind};

/// Condition type whose unmatched value falls back to matching branch keys
/// against the caller's identity.
pub const CONTACT_CONDITION: &str = "contact";

pub type Attributes = BTreeMap<String, String>;

/// Read access to per-principal attributes during evaluation.
pub trait ContextLookup {
    fn attribute(&self, principal: &str, name: &str) -> Option<&str>;
}

impl ContextLookup for BTreeMap<String, Attributes> {
    fn attribute(&self, principal: &str, name: &str) -> Option<&str> {
        self.get(principal)
            .and_then(|attrs| attrs.get(name))
            .map(|v| v.as_str())
    }
}

/// A destination together with the service block that produced it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub destination: SipUri,
    pub block: Arc<Block>,
}

/// Walks the graph from `block`. Only a service block yields a destination;
/// `None` means the graph made no decision.
pub fn evaluate(
    block: &Arc<Block>,
    request: &SipRequest,
    to_identity: &str,
    from_identity: &str,
    context: &dyn ContextLookup,
) -> Option<Resolution> {
    match &block.kind {
        BlockKind::Service { destination } => match resolve_destination(destination, request) {
            Some(resolved) => Some(Resolution {
                destination: resolved,
                block: block.clone(),
            }),
            None => {
                warn!(
                    block_id = %block.id,
                    template = %destination,
                    target = %request.uri,
                    "service destination did not resolve to a SIP URI"
                );
                None
            }
        },
        BlockKind::Condition { condition_type } => {
            let matched = context
                .attribute(to_identity, condition_type)
                .and_then(|value| block.branch(value));
            let next = match matched {
                Some(next) => Some(next),
                None if condition_type == CONTACT_CONDITION => contact_branch(block, from_identity),
                None => None,
            };
            next.and_then(|next| evaluate(next, request, to_identity, from_identity, context))
        }
        BlockKind::ConditionOption { .. } | BlockKind::SipResponse { .. } => block
            .next_blocks
            .first()
            .and_then(|b| evaluate(&b.block, request, to_identity, from_identity, context)),
    }
}

fn contact_branch<'a>(block: &'a Block, from_identity: &str) -> Option<&'a Arc<Block>> {
    let from = from_identity.to_lowercase();
    block
        .next_blocks
        .iter()
        .find(|b| !b.key.is_empty() && from.contains(&b.key.to_lowercase()))
        .map(|b| &b.block)
}

/// Expands `${user}` and `${host}` against the request target.
pub fn resolve_destination(template: &str, request: &SipRequest) -> Option<SipUri> {
    template
        .replace("${user}", &request.uri.user)
        .replace("${host}", &request.uri.host)
        .parse()
        .ok()
}

pub fn is_reserved_destination(uri: &SipUri, reserved_hosts: &[String]) -> bool {
    let host = uri.host.to_ascii_lowercase();
    host == "invalid"
        || host.ends_with(".invalid")
        || reserved_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host))
}
