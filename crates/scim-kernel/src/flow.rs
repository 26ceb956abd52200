use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use scim_contracts::{AuthoredNode, SipUri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow `{flow}`: authored root has no children")]
    EmptyFlow { flow: String },
    #[error("flow `{flow}`: node `{node_id}` has unrecognized type `{node_type}`")]
    UnknownNodeType {
        flow: String,
        node_id: String,
        node_type: String,
    },
    #[error("flow `{flow}`: service block `{block_id}` has no destination")]
    MissingDestination { flow: String, block_id: String },
    #[error("flow `{flow}`: service block `{block_id}` destination `{destination}` is not a SIP URI")]
    InvalidDestination {
        flow: String,
        block_id: String,
        destination: String,
    },
    #[error("flow `{flow}`: block `{block_id}` is defined more than once")]
    DuplicateBlock { flow: String, block_id: String },
    #[error("flow `{flow}`: block `{block_id}` references unknown block `{missing}`")]
    DanglingBlock {
        flow: String,
        block_id: String,
        missing: String,
    },
    #[error("flow `{flow}`: block `{block_id}` is part of a cycle")]
    Cycle { flow: String, block_id: String },
    #[error("flow `{flow}`: first block `{block_id}` is not defined")]
    MissingFirstBlock { flow: String, block_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Condition,
    Service,
    ConditionOption,
    SipResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// Branches on the value of a context attribute of the called principal.
    Condition { condition_type: String },
    /// Resolves to a destination URI template.
    Service { destination: String },
    ConditionOption { value: String },
    SipResponse { codes: Vec<String> },
}

impl BlockKind {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockKind::Condition { .. } => BlockType::Condition,
            BlockKind::Service { .. } => BlockType::Service,
            BlockKind::ConditionOption { .. } => BlockType::ConditionOption,
            BlockKind::SipResponse { .. } => BlockType::SipResponse,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Block {
    pub id: String,
    pub name: String,
    pub kind: BlockKind,
    pub next_blocks: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub key: String,
    pub block: Arc<Block>,
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        self.kind.block_type()
    }

    pub fn branch(&self, key: &str) -> Option<&Arc<Block>> {
        self.next_blocks
            .iter()
            .find(|b| b.key == key)
            .map(|b| &b.block)
    }

    /// Whether this is a response waypoint listing `code` among its codes.
    pub fn lists_code(&self, code: &str) -> bool {
        match &self.kind {
            BlockKind::SipResponse { codes } => codes.iter().any(|c| c == code),
            _ => false,
        }
    }
}

/// One compiled routing policy. Blocks are shared, so a dialog holding a
/// block keeps its graph alive after the owning chain is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FlowRecord", into = "FlowRecord")]
pub struct ServiceFlow {
    pub name: String,
    pub first_block_id: String,
    pub blocks: HashMap<String, Arc<Block>>,
}

impl ServiceFlow {
    pub fn first_block(&self) -> Option<&Arc<Block>> {
        self.blocks.get(&self.first_block_id)
    }

    pub fn block(&self, id: &str) -> Option<&Arc<Block>> {
        self.blocks.get(id)
    }
}

/// Compiles an authored tree. The root is the synthetic start container and
/// is never materialized; its first child is the entry block.
pub fn compile_flow(name: &str, root: &AuthoredNode) -> Result<ServiceFlow, FlowError> {
    let first = root.children.first().ok_or_else(|| FlowError::EmptyFlow {
        flow: name.to_string(),
    })?;
    let mut blocks = HashMap::new();
    for child in &root.children {
        compile_node(name, child, &mut blocks)?;
    }
    Ok(ServiceFlow {
        name: name.to_string(),
        first_block_id: first.id.clone(),
        blocks,
    })
}

fn compile_node(
    flow: &str,
    node: &AuthoredNode,
    blocks: &mut HashMap<String, Arc<Block>>,
) -> Result<Arc<Block>, FlowError> {
    let kind = block_kind(flow, node)?;
    let mut next_blocks = Vec::with_capacity(node.children.len());
    for child in &node.children {
        let block = compile_node(flow, child, blocks)?;
        // named branches under conditions and services, enumerated ones elsewhere
        let key = match kind.block_type() {
            BlockType::Condition | BlockType::Service => child.name.clone(),
            BlockType::ConditionOption | BlockType::SipResponse => child.id.clone(),
        };
        next_blocks.push(Branch { key, block });
    }

    let block = Arc::new(Block {
        id: node.id.clone(),
        name: node.name.clone(),
        kind,
        next_blocks,
    });
    if blocks.insert(node.id.clone(), block.clone()).is_some() {
        return Err(FlowError::DuplicateBlock {
            flow: flow.to_string(),
            block_id: node.id.clone(),
        });
    }
    Ok(block)
}

fn block_kind(flow: &str, node: &AuthoredNode) -> Result<BlockKind, FlowError> {
    let value = node.value.trim();
    let value_or_name = if value.is_empty() {
        node.name.trim()
    } else {
        value
    };
    let kind = match node.node_type.as_str() {
        "condition" | "ConditionNode" => BlockKind::Condition {
            condition_type: value_or_name.to_lowercase(),
        },
        "service" | "ServiceNode" => {
            if value.is_empty() {
                return Err(FlowError::MissingDestination {
                    flow: flow.to_string(),
                    block_id: node.id.clone(),
                });
            }
            check_destination(flow, &node.id, value)?;
            BlockKind::Service {
                destination: value.to_string(),
            }
        }
        "condition_option" | "ConditionValueNode" => BlockKind::ConditionOption {
            value: value_or_name.to_string(),
        },
        "sip_response" | "SIPResponseNode" => BlockKind::SipResponse {
            codes: value_or_name
                .split_whitespace()
                .map(|c| c.to_string())
                .collect(),
        },
        other => {
            return Err(FlowError::UnknownNodeType {
                flow: flow.to_string(),
                node_id: node.id.clone(),
                node_type: other.to_string(),
            })
        }
    };
    Ok(kind)
}

/// Templates must parse once `${user}`/`${host}` are filled in.
fn check_destination(flow: &str, block_id: &str, template: &str) -> Result<(), FlowError> {
    let sample = template
        .replace("${user}", "user")
        .replace("${host}", "host.test");
    sample
        .parse::<SipUri>()
        .map(|_| ())
        .map_err(|_| FlowError::InvalidDestination {
            flow: flow.to_string(),
            block_id: block_id.to_string(),
            destination: template.to_string(),
        })
}

/// Flat persisted form of a [`ServiceFlow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowRecord {
    pub name: String,
    pub first_block_id: String,
    pub blocks: BTreeMap<String, BlockRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockRecord {
    #[serde(default)]
    pub name: String,
    pub kind: BlockKind,
    #[serde(default)]
    pub next: Vec<BranchRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchRecord {
    pub key: String,
    pub block_id: String,
}

impl From<ServiceFlow> for FlowRecord {
    fn from(flow: ServiceFlow) -> Self {
        let blocks = flow
            .blocks
            .iter()
            .map(|(id, block)| {
                (
                    id.clone(),
                    BlockRecord {
                        name: block.name.clone(),
                        kind: block.kind.clone(),
                        next: block
                            .next_blocks
                            .iter()
                            .map(|b| BranchRecord {
                                key: b.key.clone(),
                                block_id: b.block.id.clone(),
                            })
                            .collect(),
                    },
                )
            })
            .collect();
        Self {
            name: flow.name,
            first_block_id: flow.first_block_id,
            blocks,
        }
    }
}

impl TryFrom<FlowRecord> for ServiceFlow {
    type Error = FlowError;

    fn try_from(record: FlowRecord) -> Result<Self, Self::Error> {
        if !record.blocks.contains_key(&record.first_block_id) {
            return Err(FlowError::MissingFirstBlock {
                flow: record.name,
                block_id: record.first_block_id,
            });
        }
        let mut built = HashMap::with_capacity(record.blocks.len());
        let mut visiting = HashSet::new();
        for id in record.blocks.keys() {
            rebuild_block(&record, id, &mut built, &mut visiting)?;
        }
        Ok(ServiceFlow {
            name: record.name,
            first_block_id: record.first_block_id,
            blocks: built,
        })
    }
}

fn rebuild_block(
    record: &FlowRecord,
    id: &str,
    built: &mut HashMap<String, Arc<Block>>,
    visiting: &mut HashSet<String>,
) -> Result<Arc<Block>, FlowError> {
    if let Some(block) = built.get(id) {
        return Ok(block.clone());
    }
    if !visiting.insert(id.to_string()) {
        return Err(FlowError::Cycle {
            flow: record.name.clone(),
            block_id: id.to_string(),
        });
    }
    // callers only pass ids present in the record
    let Some(block_record) = record.blocks.get(id) else {
        return Err(FlowError::MissingFirstBlock {
            flow: record.name.clone(),
            block_id: id.to_string(),
        });
    };

    let mut next_blocks = Vec::with_capacity(block_record.next.len());
    for branch in &block_record.next {
        if !record.blocks.contains_key(&branch.block_id) {
            return Err(FlowError::DanglingBlock {
                flow: record.name.clone(),
                block_id: id.to_string(),
                missing: branch.block_id.clone(),
            });
        }
        let child = rebuild_block(record, &branch.block_id, built, visiting)?;
        next_blocks.push(Branch {
            key: branch.key.clone(),
            block: child,
        });
    }
    visiting.remove(id);

    if let BlockKind::Service { destination } = &block_record.kind {
        check_destination(&record.name, id, destination)?;
    }
    let block = Arc::new(Block {
        id: id.to_string(),
        name: block_record.name.clone(),
        kind: block_record.kind.clone(),
        next_blocks,
    });
    built.insert(id.to_string(), block.clone());
    Ok(block)
}
