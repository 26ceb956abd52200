mod control;
mod flow;
mod responses;
mod routing;

pub use control::{
    compile_descriptor, parse_attribute_updates, parse_flow_descriptor, AttributeBatch,
    AttributeUpdate, CompiledChains, ControlKind, FlowRejection,
};
pub use flow::{
    compile_flow, Block, BlockKind, BlockRecord, BlockType, Branch, BranchRecord, FlowError,
    FlowRecord, ServiceFlow,
};
pub use responses::{candidate_codes, match_response, CODE_EQUIVALENCES};
pub use routing::{
    evaluate, is_reserved_destination, resolve_destination, Attributes, ContextLookup,
    Resolution, CONTACT_CONDITION,
};

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Canonical digest of a chain; equal for identical flow lists regardless of
/// block map iteration order.
pub fn chain_digest<'a, I>(flows: I) -> Result<String, String>
where
    I: IntoIterator<Item = &'a ServiceFlow>,
{
    let records = flows
        .into_iter()
        .map(|flow| serde_json::to_value(flow).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    jcs_sha256_hex(&Value::Array(records))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
