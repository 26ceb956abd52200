use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use scim_config::{Config, Routing};
use scim_contracts::{
    Disposition, SipRequest, SipResponse, SipUri, UserAgent, METHOD_BYE, METHOD_MESSAGE,
};
use scim_kernel::{
    compile_descriptor, evaluate, is_reserved_destination, match_response,
    parse_attribute_updates, parse_flow_descriptor, ContextLookup, ControlKind, Resolution,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dialogs::{ActiveFlow, DialogGuard, DialogTable};
use crate::persistence::SnapshotStore;
use crate::stores::{ChainStore, ContextStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub principals_with_chains: usize,
    pub principals_with_context: usize,
    pub active_dialogs: usize,
}

/// The service-flow router: owns chains, contexts and in-progress dialogs.
pub struct Scim {
    control_user: String,
    routing: Routing,
    contexts: ContextStore,
    chains: ChainStore,
    dialogs: DialogTable,
    snapshots: Arc<dyn SnapshotStore>,
    // held from taking a snapshot until it is written
    persist_lock: Mutex<()>,
}

impl Scim {
    pub fn new(cfg: &Config, snapshots: Arc<dyn SnapshotStore>) -> Self {
        let chains = snapshots.load_chains().unwrap_or_else(|e| {
            error!(error = %e, "failed to load chain snapshot, starting empty");
            Default::default()
        });
        let contexts = snapshots.load_contexts().unwrap_or_else(|e| {
            error!(error = %e, "failed to load context snapshot, starting empty");
            Default::default()
        });
        info!(
            chains = chains.len(),
            contexts = contexts.len(),
            "restored routing state"
        );
        Self {
            control_user: cfg.service.control_user.clone(),
            routing: cfg.routing.clone(),
            contexts: ContextStore::from_snapshot(contexts),
            chains: ChainStore::from_snapshot(chains),
            dialogs: DialogTable::default(),
            snapshots,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn is_control_message(&self, request: &SipRequest) -> bool {
        request.method.eq_ignore_ascii_case(METHOD_MESSAGE)
            && request.to.user.eq_ignore_ascii_case(&self.control_user)
    }

    pub async fn on_request(&self, request: SipRequest, ua: &mut dyn UserAgent) -> Disposition {
        if self.is_control_message(&request) {
            let ok = ua.create_response(200, "OK");
            ua.send_response(ok);
            let content_type = request.content_type.as_deref().unwrap_or("");
            let applied = self.apply_control(content_type, &request.body);
            return Disposition::Control { applied };
        }

        let to_identity = request.uri.principal();
        let from_identity = request.from.principal();
        let context = self.contexts.for_principal(&to_identity);

        let mut dialog = self.dialogs.acquire(&request.dialog_id).await;
        let resolution = match dialog.active() {
            Some(active) => {
                debug!(dialog_id = %request.dialog_id, block_id = %active.last_block.id, "resuming flow");
                evaluate(&active.last_block, &request, &to_identity, &from_identity, &context)
            }
            None => self.route_new(&request, &to_identity, &from_identity, &context),
        };

        let via_policy = resolution.is_some();
        let destination = resolution
            .as_ref()
            .map(|r| r.destination.clone())
            .unwrap_or_else(|| request.uri.clone());

        let disposition = if is_reserved_destination(&destination, &self.routing.reserved_hosts) {
            dialog.clear();
            self.reject(ua, &request.dialog_id, destination)
        } else {
            let forwarded = ua.create_request(&request.method, &destination, &request);
            ua.send_request(forwarded.clone());
            if let Some(Resolution { block, .. }) = resolution {
                dialog.upsert(&request, forwarded, block);
            }
            debug!(dialog_id = %request.dialog_id, %destination, via_policy, "forwarded request");
            Disposition::Forwarded {
                destination,
                via_policy,
            }
        };
        self.dialogs.release(dialog);
        disposition
    }

    pub async fn on_response(&self, response: SipResponse, ua: &mut dyn UserAgent) -> Disposition {
        let Some(mut dialog) = self.dialogs.acquire_existing(&response.dialog_id).await else {
            ua.send_response(response);
            return Disposition::Relayed;
        };
        let disposition = self.continue_dialog(&mut dialog, response, ua);
        self.dialogs.release(dialog);
        disposition
    }

    fn continue_dialog(
        &self,
        dialog: &mut DialogGuard,
        response: SipResponse,
        ua: &mut dyn UserAgent,
    ) -> Disposition {
        let dialog_id = dialog.dialog_id().to_string();
        let Some(active) = dialog.active_mut() else {
            ua.send_response(response);
            return Disposition::Relayed;
        };
        active.touch();
        active.last_response = Some(response.clone());

        let Some(branch) = match_response(&active.last_block, response.status)
            .map(|b| Arc::clone(&b.block))
        else {
            let ends = ends_dialog(&response);
            ua.send_response(response);
            if ends {
                debug!(%dialog_id, "dialog finished");
                dialog.clear();
            }
            return Disposition::Relayed;
        };

        active.last_request.cseq.bump();
        ua.send_response(response);

        let to_identity = active.original_request.uri.principal();
        let from_identity = active.original_request.from.principal();
        let context = self.contexts.for_principal(&to_identity);
        match evaluate(&branch, &active.last_request, &to_identity, &from_identity, &context) {
            Some(resolution) => {
                let destination = resolution.destination;
                if is_reserved_destination(&destination, &self.routing.reserved_hosts) {
                    dialog.clear();
                    return self.reject(ua, &dialog_id, destination);
                }
                let forwarded = ua.create_request(
                    &active.last_request.method,
                    &destination,
                    &active.last_request,
                );
                ua.send_request(forwarded.clone());
                active.last_request = forwarded;
                active.last_block = resolution.block;
                info!(%dialog_id, %destination, "continued flow on response");
                Disposition::Continued { destination }
            }
            None => {
                active.last_block = Arc::clone(&branch);
                debug!(%dialog_id, block_id = %branch.id, "advanced flow on response");
                Disposition::Advanced {
                    block_id: branch.id.clone(),
                }
            }
        }
    }

    fn route_new(
        &self,
        request: &SipRequest,
        to_identity: &str,
        from_identity: &str,
        context: &dyn ContextLookup,
    ) -> Option<Resolution> {
        let chain = self.chains.get(to_identity);
        chain.iter().find_map(|flow| {
            let first = flow.first_block()?;
            let resolution = evaluate(first, request, to_identity, from_identity, context)?;
            debug!(flow = %flow.name, block_id = %resolution.block.id, "service flow matched");
            Some(resolution)
        })
    }

    fn reject(&self, ua: &mut dyn UserAgent, dialog_id: &str, destination: SipUri) -> Disposition {
        let status = self.routing.reject_status;
        let response = ua.create_response(status, &self.routing.reject_reason);
        ua.send_response(response);
        warn!(%dialog_id, %destination, status, "rejected request to reserved destination");
        Disposition::Rejected {
            status,
            destination,
        }
    }

    /// Applies a control message body. Returns whether the content type was
    /// understood and the body accepted.
    pub fn apply_control(&self, content_type: &str, body: &str) -> bool {
        match ControlKind::from_content_type(content_type) {
            Some(ControlKind::FlowDescriptor) => self.apply_flow_descriptor(body),
            Some(ControlKind::Attributes) => self.apply_attributes(body),
            None => {
                error!(%content_type, "unhandled control message content type");
                false
            }
        }
    }

    fn apply_flow_descriptor(&self, body: &str) -> bool {
        let descriptor = match parse_flow_descriptor(body) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(error = %e, "unreadable flow descriptor");
                return false;
            }
        };
        let compiled = compile_descriptor(&descriptor);
        for rejected in &compiled.rejected {
            warn!(
                principal = %rejected.principal,
                flow = %rejected.flow,
                error = %rejected.error,
                "rejected service flow"
            );
        }

        let mut changed = false;
        for (principal, flows) in compiled.chains {
            let count = flows.len();
            if self.chains.replace(&principal, flows) {
                info!(%principal, flows = count, "installed service flows");
                changed = true;
            }
        }
        if changed {
            self.persist_chains();
        }
        true
    }

    fn apply_attributes(&self, body: &str) -> bool {
        let batch = parse_attribute_updates(body);
        for (line, text) in &batch.skipped {
            warn!(line, %text, "malformed attribute line");
        }
        let mut changed = false;
        for update in batch.updates {
            debug!(principal = %update.principal, attribute = %update.name, "attribute update");
            changed |= self
                .contexts
                .set(&update.principal, update.name, update.value);
        }
        if changed {
            self.persist_contexts();
        }
        true
    }

    fn persist_chains(&self) {
        let _persisting = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.snapshots.save_chains(&self.chains.snapshot()) {
            error!(error = %e, "failed to save chain snapshot");
        }
    }

    fn persist_contexts(&self) {
        let _persisting = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.snapshots.save_contexts(&self.contexts.snapshot()) {
            error!(error = %e, "failed to save context snapshot");
        }
    }

    pub fn save_all(&self) {
        self.persist_chains();
        self.persist_contexts();
    }

    /// Drops dialogs idle for longer than `idle`.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let idle = chrono::Duration::from_std(idle).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(idle)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.dialogs.evict_idle(cutoff)
    }

    pub async fn active_flow(&self, dialog_id: &str) -> Option<ActiveFlow> {
        self.dialogs.get(dialog_id).await
    }

    pub fn stats(&self) -> Stats {
        Stats {
            principals_with_chains: self.chains.len(),
            principals_with_context: self.contexts.len(),
            active_dialogs: self.dialogs.active_count(),
        }
    }

    pub fn chains(&self) -> &ChainStore {
        &self.chains
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }
}

/// A final failure, or the success answer to a BYE, closes the dialog.
fn ends_dialog(response: &SipResponse) -> bool {
    response.status >= 300
        || ((200..300).contains(&response.status)
            && response.cseq.method.eq_ignore_ascii_case(METHOD_BYE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Outbox;
    use crate::persistence::{MemorySnapshots, PersistError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use scim_config::{DecisionLog, Dialogs, Server, Service, Store, Transport};
    use scim_contracts::{CSeq, Outbound, CONTENT_TYPE_ATTRIBUTES, CONTENT_TYPE_FLOW_DESCRIPTOR};
    use serde_json::json;

    fn config() -> Config {
        Config {
            server: Server {
                listen_addr: "127.0.0.1:0".to_string(),
            },
            service: Service::default(),
            store: Store {
                kind: "memory".to_string(),
                sqlite_path: None,
                snapshot_dir: None,
            },
            routing: Routing::default(),
            dialogs: Dialogs::default(),
            transport: Transport::default(),
            decision_log: DecisionLog {
                jsonl_path: "unused.jsonl".to_string(),
            },
        }
    }

    fn scim() -> (Scim, Arc<MemorySnapshots>) {
        let snapshots = Arc::new(MemorySnapshots::default());
        (Scim::new(&config(), snapshots.clone()), snapshots)
    }

    fn request(method: &str, to: &str, dialog_id: &str) -> SipRequest {
        SipRequest {
            method: method.to_string(),
            uri: to.parse().unwrap(),
            dialog_id: dialog_id.to_string(),
            from: "sip:alice@example.test".parse().unwrap(),
            to: to.parse().unwrap(),
            cseq: CSeq {
                seq: 1,
                method: method.to_string(),
            },
            content_type: None,
            body: String::new(),
        }
    }

    fn control(content_type: &str, body: &str) -> SipRequest {
        let mut req = request("MESSAGE", "sip:scim@example.test", "ctl-1");
        req.content_type = Some(content_type.to_string());
        req.body = body.to_string();
        req
    }

    fn response(status: u16, dialog_id: &str, cseq_method: &str) -> SipResponse {
        SipResponse {
            status,
            reason: "reason".to_string(),
            dialog_id: dialog_id.to_string(),
            from: "sip:alice@example.test".parse().unwrap(),
            to: "sip:bob@example.test".parse().unwrap(),
            cseq: CSeq {
                seq: 1,
                method: cseq_method.to_string(),
            },
        }
    }

    fn status_descriptor() -> String {
        json!({
            "bob@example.test": [{
                "name": "busy-to-voicemail",
                "root": {"id": "start", "type": "start", "children": [{
                    "id": "c1", "name": "status", "type": "condition", "value": "status",
                    "children": [{"id": "o1", "name": "busy", "type": "condition_option", "children": [
                        {"id": "s1", "name": "vm", "type": "service", "value": "sip:voicemail@example.test"}
                    ]}]
                }]}
            }]
        })
        .to_string()
    }

    fn no_answer_descriptor(fallback: &str) -> String {
        json!({
            "bob@example.test": [{
                "name": "desk-then-fallback",
                "root": {"id": "start", "type": "start", "children": [{
                    "id": "s1", "name": "desk", "type": "service", "value": "sip:desk@example.test",
                    "children": [
                        {"id": "r1", "name": "486", "type": "sip_response", "value": "486", "children": [
                            {"id": "s2", "name": "vm", "type": "service", "value": fallback}
                        ]},
                        {"id": "r2", "name": "180", "type": "sip_response", "value": "180"}
                    ]
                }]}
            }]
        })
        .to_string()
    }

    async fn install(scim: &Scim, content_type: &str, body: &str) -> Disposition {
        let req = control(content_type, body);
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await
    }

    fn forwarded_targets(outbox: &Outbox) -> Vec<String> {
        outbox
            .messages()
            .iter()
            .filter_map(|m| match m {
                Outbound::Request(r) => Some(r.uri.to_string()),
                Outbound::Response(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn busy_callee_is_sent_to_voicemail() {
        let (scim, _) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy").await;

        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        let disposition = scim.on_request(req, &mut outbox).await;

        assert_eq!(
            disposition,
            Disposition::Forwarded {
                destination: "sip:voicemail@example.test".parse().unwrap(),
                via_policy: true
            }
        );
        assert_eq!(forwarded_targets(&outbox), vec!["sip:voicemail@example.test"]);
        let active = scim.active_flow("dlg-1").await.unwrap();
        assert_eq!(active.last_block.id, "s1");
        assert_eq!(active.original_request.uri.to_string(), "sip:bob@example.test");
    }

    #[tokio::test]
    async fn unmatched_context_keeps_original_target() {
        let (scim, _) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:available").await;

        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        let disposition = scim.on_request(req, &mut outbox).await;

        assert_eq!(
            disposition,
            Disposition::Forwarded {
                destination: "sip:bob@example.test".parse().unwrap(),
                via_policy: false
            }
        );
        assert!(scim.active_flow("dlg-1").await.is_none());
        assert_eq!(scim.stats().active_dialogs, 0);
    }

    #[tokio::test]
    async fn principal_without_chain_is_forwarded_unchanged() {
        let (scim, _) = scim();
        let req = request("INVITE", "sip:carol@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;
        assert_eq!(forwarded_targets(&outbox), vec!["sip:carol@example.test"]);
    }

    #[tokio::test]
    async fn busy_response_continues_to_fallback() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &no_answer_descriptor("sip:voicemail@example.test"),
        )
        .await;

        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;
        assert_eq!(forwarded_targets(&outbox), vec!["sip:desk@example.test"]);

        let resp = response(486, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        let disposition = scim.on_response(resp, &mut outbox).await;

        assert_eq!(
            disposition,
            Disposition::Continued {
                destination: "sip:voicemail@example.test".parse().unwrap()
            }
        );
        match outbox.messages() {
            [Outbound::Response(relayed), Outbound::Request(fwd)] => {
                assert_eq!(relayed.status, 486);
                assert_eq!(fwd.uri.to_string(), "sip:voicemail@example.test");
                assert_eq!(fwd.cseq.seq, 2);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
        let active = scim.active_flow("dlg-1").await.unwrap();
        assert_eq!(active.last_block.id, "s2");
        assert_eq!(active.last_request.cseq.seq, 2);
    }

    #[tokio::test]
    async fn waypoint_response_advances_flow() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &no_answer_descriptor("sip:voicemail@example.test"),
        )
        .await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        let resp = response(180, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        let disposition = scim.on_response(resp, &mut outbox).await;
        assert_eq!(
            disposition,
            Disposition::Advanced {
                block_id: "r2".to_string()
            }
        );
        assert_eq!(outbox.messages().len(), 1);
        let active = scim.active_flow("dlg-1").await.unwrap();
        assert_eq!(active.last_block.id, "r2");
        assert_eq!(active.last_request.cseq.seq, 2);
    }

    #[tokio::test]
    async fn response_without_branch_leaves_flow_in_place() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &no_answer_descriptor("sip:voicemail@example.test"),
        )
        .await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        let resp = response(183, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        assert_eq!(scim.on_response(resp, &mut outbox).await, Disposition::Relayed);
        assert_eq!(
            scim.active_flow("dlg-1").await.unwrap().last_block.id,
            "s1"
        );
    }

    #[tokio::test]
    async fn unmatched_final_failure_evicts_dialog() {
        let (scim, _) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy").await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        let resp = response(404, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        assert_eq!(scim.on_response(resp, &mut outbox).await, Disposition::Relayed);
        assert!(scim.active_flow("dlg-1").await.is_none());
    }

    #[tokio::test]
    async fn bye_success_evicts_dialog() {
        let (scim, _) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy").await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        let ok = response(200, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&ok);
        scim.on_response(ok, &mut outbox).await;
        assert!(scim.active_flow("dlg-1").await.is_some());

        let bye_ok = response(200, "dlg-1", "BYE");
        let mut outbox = Outbox::for_response(&bye_ok);
        scim.on_response(bye_ok, &mut outbox).await;
        assert!(scim.active_flow("dlg-1").await.is_none());
    }

    #[tokio::test]
    async fn response_for_unknown_dialog_is_relayed() {
        let (scim, _) = scim();
        let resp = response(486, "nobody", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        assert_eq!(scim.on_response(resp.clone(), &mut outbox).await, Disposition::Relayed);
        assert_eq!(outbox.into_messages(), vec![Outbound::Response(resp)]);
        assert_eq!(scim.stats().active_dialogs, 0);
    }

    #[tokio::test]
    async fn reserved_destination_is_rejected() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &json!({
                "bob@example.test": [{
                    "name": "block",
                    "root": {"id": "start", "type": "start", "children": [
                        {"id": "s1", "name": "drop", "type": "service", "value": "sip:anonymous@anonymous.invalid"}
                    ]}
                }]
            })
            .to_string(),
        )
        .await;

        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        let disposition = scim.on_request(req, &mut outbox).await;
        assert!(matches!(disposition, Disposition::Rejected { status: 403, .. }));
        match outbox.messages() {
            [Outbound::Response(r)] => assert_eq!(r.status, 403),
            other => panic!("unexpected messages: {other:?}"),
        }
        assert!(scim.active_flow("dlg-1").await.is_none());
    }

    #[tokio::test]
    async fn reserved_fallback_on_response_is_rejected() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &no_answer_descriptor("sip:anonymous@anonymous.invalid"),
        )
        .await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        let resp = response(486, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        let disposition = scim.on_response(resp, &mut outbox).await;
        assert!(matches!(disposition, Disposition::Rejected { .. }));
        assert!(scim.active_flow("dlg-1").await.is_none());
    }

    #[tokio::test]
    async fn control_message_is_acknowledged_not_routed() {
        let (scim, _) = scim();
        let req = control(CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy");
        let mut outbox = Outbox::for_request(&req);
        let disposition = scim.on_request(req, &mut outbox).await;
        assert_eq!(disposition, Disposition::Control { applied: true });
        match outbox.messages() {
            [Outbound::Response(r)] => assert_eq!(r.status, 200),
            other => panic!("unexpected messages: {other:?}"),
        }
        assert_eq!(
            scim.contexts()
                .get("bob@example.test")
                .unwrap()
                .get("status")
                .map(String::as_str),
            Some("busy")
        );
    }

    #[tokio::test]
    async fn unknown_control_content_type_changes_nothing() {
        let (scim, snapshots) = scim();
        let disposition = install(&scim, "application/octet-stream", "bob@example.test:status:busy").await;
        assert_eq!(disposition, Disposition::Control { applied: false });
        assert!(scim.contexts().is_empty());
        assert!(scim.chains().is_empty());
        assert!(snapshots.load_contexts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn descriptor_replay_is_idempotent() {
        let (scim, snapshots) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        let before = scim.chains().snapshot();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        assert_eq!(scim.chains().snapshot(), before);
        assert_eq!(snapshots.load_chains().unwrap(), before);
    }

    #[tokio::test]
    async fn state_is_restored_from_snapshots() {
        let (scim, snapshots) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy").await;
        drop(scim);

        let restored = Scim::new(&config(), snapshots);
        let req = request("INVITE", "sip:bob@example.test", "dlg-9");
        let mut outbox = Outbox::for_request(&req);
        restored.on_request(req, &mut outbox).await;
        assert_eq!(forwarded_targets(&outbox), vec!["sip:voicemail@example.test"]);
    }

    #[tokio::test]
    async fn dialog_keeps_graph_after_chain_replacement() {
        let (scim, _) = scim();
        install(
            &scim,
            CONTENT_TYPE_FLOW_DESCRIPTOR,
            &no_answer_descriptor("sip:voicemail@example.test"),
        )
        .await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;

        let resp = response(486, "dlg-1", "INVITE");
        let mut outbox = Outbox::for_response(&resp);
        assert_eq!(
            scim.on_response(resp, &mut outbox).await,
            Disposition::Continued {
                destination: "sip:voicemail@example.test".parse().unwrap()
            }
        );
    }

    /// Stalls the first write so a later update can overtake it.
    #[derive(Default)]
    struct SlowFirstWrite {
        inner: MemorySnapshots,
        writes: AtomicUsize,
    }

    impl SnapshotStore for SlowFirstWrite {
        fn read(&self, name: &str) -> Result<Option<String>, PersistError> {
            self.inner.read(name)
        }

        fn write(&self, name: &str, body: &str) -> Result<(), PersistError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
            self.inner.write(name, body)
        }
    }

    #[test]
    fn concurrent_updates_persist_latest_state() {
        let snapshots = Arc::new(SlowFirstWrite::default());
        let scim = Scim::new(&config(), snapshots.clone());
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(scim.apply_control(CONTENT_TYPE_ATTRIBUTES, "alice@example.test:status:busy"));
            });
            std::thread::sleep(Duration::from_millis(10));
            s.spawn(|| {
                assert!(scim.apply_control(CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:away"));
            });
        });

        let persisted = snapshots.load_contexts().unwrap();
        assert_eq!(persisted, scim.contexts().snapshot());
        assert!(persisted.contains_key("alice@example.test"));
        assert!(persisted.contains_key("bob@example.test"));
    }

    #[tokio::test]
    async fn unparseable_service_destination_is_not_installed() {
        let (scim, _) = scim();
        let descriptor = json!({
            "bob@example.test": [{
                "name": "broken-vm",
                "root": {"id": "start", "type": "start", "children": [
                    {"id": "s1", "name": "vm", "type": "service", "value": "sip:voicemail@"}
                ]}
            }]
        })
        .to_string();
        assert_eq!(
            install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &descriptor).await,
            Disposition::Control { applied: true }
        );
        assert_eq!(scim.stats().principals_with_chains, 0);

        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        assert_eq!(
            scim.on_request(req, &mut outbox).await,
            Disposition::Forwarded {
                destination: "sip:bob@example.test".parse().unwrap(),
                via_policy: false,
            }
        );
        assert!(scim.active_flow("dlg-1").await.is_none());
    }

    #[tokio::test]
    async fn idle_dialogs_are_swept() {
        let (scim, _) = scim();
        install(&scim, CONTENT_TYPE_FLOW_DESCRIPTOR, &status_descriptor()).await;
        install(&scim, CONTENT_TYPE_ATTRIBUTES, "bob@example.test:status:busy").await;
        let req = request("INVITE", "sip:bob@example.test", "dlg-1");
        let mut outbox = Outbox::for_request(&req);
        scim.on_request(req, &mut outbox).await;

        assert_eq!(scim.evict_idle(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scim.evict_idle(Duration::from_millis(1)), 1);
        assert_eq!(scim.stats().active_dialogs, 0);
    }
}
