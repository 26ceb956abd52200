use std::collections::BTreeMap;

use scim_contracts::{FlowDescriptor, CONTENT_TYPE_ATTRIBUTES, CONTENT_TYPE_FLOW_DESCRIPTOR};

use crate::flow::{compile_flow, FlowError, ServiceFlow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    FlowDescriptor,
    Attributes,
}

impl ControlKind {
    /// Case-insensitive; parameters after `;` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match media.as_str() {
            CONTENT_TYPE_FLOW_DESCRIPTOR => Some(ControlKind::FlowDescriptor),
            CONTENT_TYPE_ATTRIBUTES => Some(ControlKind::Attributes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeUpdate {
    pub principal: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeBatch {
    pub updates: Vec<AttributeUpdate>,
    /// 1-based line numbers and text of lines that were not `principal:name:value`.
    pub skipped: Vec<(usize, String)>,
}

pub fn parse_attribute_updates(body: &str) -> AttributeBatch {
    let mut batch = AttributeBatch::default();
    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ':').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(principal), Some(name), Some(value))
                if !principal.is_empty() && !name.is_empty() =>
            {
                batch.updates.push(AttributeUpdate {
                    principal: principal.to_string(),
                    name: name.to_lowercase(),
                    value: value.to_string(),
                });
            }
            _ => batch.skipped.push((idx + 1, line.to_string())),
        }
    }
    batch
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRejection {
    pub principal: String,
    pub flow: String,
    pub error: FlowError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledChains {
    pub chains: BTreeMap<String, Vec<ServiceFlow>>,
    pub rejected: Vec<FlowRejection>,
}

pub fn parse_flow_descriptor(body: &str) -> Result<FlowDescriptor, serde_json::Error> {
    serde_json::from_str(body)
}

/// Compiles every flow independently; a rejected flow is left out of its
/// principal's list without affecting the others.
pub fn compile_descriptor(descriptor: &FlowDescriptor) -> CompiledChains {
    let mut compiled = CompiledChains::default();
    for (principal, flows) in descriptor {
        let mut chain = Vec::with_capacity(flows.len());
        for authored in flows {
            match compile_flow(&authored.name, &authored.root) {
                Ok(flow) => chain.push(flow),
                Err(error) => compiled.rejected.push(FlowRejection {
                    principal: principal.clone(),
                    flow: authored.name.clone(),
                    error,
                }),
            }
        }
        compiled.chains.insert(principal.clone(), chain);
    }
    compiled
}
