use scim_contracts::{CSeq, Outbound, SipRequest, SipResponse, SipUri, UserAgent};

/// Collects everything the engine sends while handling one inbound message.
/// Responses it creates answer that message's transaction.
#[derive(Debug)]
pub struct Outbox {
    dialog_id: String,
    from: SipUri,
    to: SipUri,
    cseq: CSeq,
    sent: Vec<Outbound>,
}

impl Outbox {
    pub fn for_request(request: &SipRequest) -> Self {
        Self {
            dialog_id: request.dialog_id.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            cseq: request.cseq.clone(),
            sent: Vec::new(),
        }
    }

    pub fn for_response(response: &SipResponse) -> Self {
        Self {
            dialog_id: response.dialog_id.clone(),
            from: response.from.clone(),
            to: response.to.clone(),
            cseq: response.cseq.clone(),
            sent: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Outbound] {
        &self.sent
    }

    pub fn into_messages(self) -> Vec<Outbound> {
        self.sent
    }
}

impl UserAgent for Outbox {
    fn create_request(
        &mut self,
        method: &str,
        destination: &SipUri,
        basis: &SipRequest,
    ) -> SipRequest {
        SipRequest {
            method: method.to_string(),
            uri: destination.clone(),
            to: destination.clone(),
            ..basis.clone()
        }
    }

    fn send_request(&mut self, request: SipRequest) {
        self.sent.push(Outbound::Request(request));
    }

    fn create_response(&mut self, code: u16, reason: &str) -> SipResponse {
        SipResponse {
            status: code,
            reason: reason.to_string(),
            dialog_id: self.dialog_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            cseq: self.cseq.clone(),
        }
    }

    fn send_response(&mut self, response: SipResponse) {
        self.sent.push(Outbound::Response(response));
    }
}
