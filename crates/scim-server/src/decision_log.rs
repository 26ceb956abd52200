use chrono::Utc;
use scim_contracts::{Disposition, SipUri};
use scim_kernel::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only JSONL log of routing decisions. Each record carries the hash
/// of its predecessor.
pub struct DecisionLog {
    inner: Mutex<LogTail>,
}

struct LogTail {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DecisionRecord {
    pub record_id: String,
    pub dialog_id: String,
    pub principal: String,
    pub event: String,
    pub disposition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl DecisionRecord {
    pub fn new(dialog_id: &str, principal: &str, event: &str, disposition: &Disposition) -> Self {
        Self {
            record_id: format!("dec_{}", uuid::Uuid::new_v4().as_simple()),
            dialog_id: dialog_id.to_string(),
            principal: principal.to_string(),
            event: event.to_string(),
            disposition: disposition.name().to_string(),
            destination: disposition.destination().map(|d| d.to_string()),
            status: None,
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Links the record to `prev_hash` and computes its own hash.
    fn seal(&mut self, prev_hash: Option<String>) -> Result<String, serde_json::Error> {
        self.prev_hash = prev_hash;
        self.record_hash.clear();
        let seed = serde_json::to_string(self)?;
        self.record_hash = sha256_hex(seed.as_bytes());
        serde_json::to_string(self)
    }

    /// Checks that the fields describe a decision the router can make.
    fn check_consistency(&self) -> Result<(), String> {
        let (events, has_destination): (&[&str], bool) = match self.disposition.as_str() {
            "forwarded" => (&["request"], true),
            "rejected" => (&["request", "response"], true),
            "continued" => (&["response"], true),
            "relayed" | "advanced" => (&["response"], false),
            "control" => (&["control"], false),
            other => return Err(format!("unknown disposition `{other}`")),
        };
        if !events.contains(&self.event.as_str()) {
            return Err(format!(
                "disposition `{}` cannot follow a `{}` event",
                self.disposition, self.event
            ));
        }
        match (&self.destination, has_destination) {
            (Some(destination), true) => {
                destination
                    .parse::<SipUri>()
                    .map_err(|e| format!("destination `{destination}` unreadable: {e}"))?;
            }
            (None, false) => {}
            (Some(destination), false) => {
                return Err(format!(
                    "disposition `{}` carries destination `{destination}`",
                    self.disposition
                ))
            }
            (None, true) => {
                return Err(format!("disposition `{}` is missing its destination", self.disposition))
            }
        }
        if self.status.is_some() != (self.event == "response") {
            return Err(format!("status {:?} on a `{}` event", self.status, self.event));
        }
        Ok(())
    }
}

impl DecisionLog {
    pub async fn open(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<DecisionRecord>(line)
                    .ok()
                    .map(|rec| rec.record_hash)
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open decision log {path} failed: {e}"))?;

        Ok(Self {
            inner: Mutex::new(LogTail { file, last_hash }),
        })
    }

    pub async fn append(&self, mut rec: DecisionRecord) {
        let mut tail = self.inner.lock().await;
        let line = match rec.seal(tail.last_hash.clone()) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "decision record not serializable");
                return;
            }
        };

        let written = async {
            tail.file.write_all(format!("{line}\n").as_bytes()).await?;
            tail.file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "decision log write failed");
            return;
        }
        tail.last_hash = Some(rec.record_hash);
    }
}

pub fn verify_decision_log(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: DecisionRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = sha256_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        rec.check_consistency().map_err(|e| format!("line {} {e}", idx + 1))?;
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("decision log verified: {count} records"))
}
