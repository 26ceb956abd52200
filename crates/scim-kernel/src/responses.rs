use crate::flow::{Block, Branch};

/// Response codes that also satisfy branches keyed by another code, tried in
/// order after the literal code.
pub const CODE_EQUIVALENCES: &[(u16, &[u16])] = &[
    // session progress counts as "call is being forwarded"
    (183, &[181]),
];

pub fn candidate_codes(status: u16) -> Vec<u16> {
    let mut codes = vec![status];
    for (code, equivalents) in CODE_EQUIVALENCES {
        if *code == status {
            codes.extend_from_slice(equivalents);
        }
    }
    codes
}

/// First branch of `block` whose key contains the response code, or whose
/// response waypoint lists it, preferring the literal code over its
/// equivalents.
pub fn match_response(block: &Block, status: u16) -> Option<&Branch> {
    candidate_codes(status).into_iter().find_map(|code| {
        let code = code.to_string();
        block
            .next_blocks
            .iter()
            .find(|b| b.key.contains(&code) || b.block.lists_code(&code))
    })
}
