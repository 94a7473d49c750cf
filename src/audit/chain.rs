use super::{AuditEvent, EventDraft, GENESIS_HASH, timestamps};
use crate::errors::AuditError;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// In-memory, append-only chain of one run's audit events.
///
/// `append` takes `&mut self`, so a chain has exactly one writer at a time.
#[derive(Debug, Clone)]
pub struct AuditChain {
    run_id: String,
    events: Vec<AuditEvent>,
}

/// Outcome of replaying a chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub events: usize,
    pub failed_index: Option<usize>,
    pub reason: Option<String>,
}

impl AuditChain {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Vec::new(),
        }
    }

    /// Rebuild a chain from persisted events so appending can continue.
    /// The events are verified first.
    pub fn resume(run_id: impl Into<String>, events: Vec<AuditEvent>) -> Result<Self, AuditError> {
        let run_id = run_id.into();
        verify_strict(&events)?;
        if let Some(index) = events.iter().position(|e| e.run_id != run_id) {
            return Err(AuditError::ChainIntegrity {
                index,
                reason: format!("event belongs to run {}", events[index].run_id),
            });
        }
        Ok(Self { run_id, events })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    /// Hash the next event will link to.
    pub fn last_hash(&self) -> &str {
        self.events
            .last()
            .map_or(GENESIS_HASH, |e| e.event_hash.as_str())
    }

    /// Append a new event stamped with the current time.
    pub fn append(&mut self, draft: EventDraft) -> AuditEvent {
        self.append_at(draft, Utc::now())
    }

    pub fn append_at(&mut self, draft: EventDraft, now: DateTime<Utc>) -> AuditEvent {
        let event = self.prepare(draft, now);
        self.events.push(event.clone());
        event
    }

    /// Build the fully hashed next event without committing it.
    pub(crate) fn prepare(&self, draft: EventDraft, now: DateTime<Utc>) -> AuditEvent {
        let (ts_iso, ts_ns) = timestamps(now);
        let mut event = AuditEvent {
            run_id: self.run_id.clone(),
            step: draft.step,
            status: draft.status,
            ts_iso,
            ts_ns,
            input_digest: draft.input_digest,
            output_digest: draft.output_digest,
            artifact_paths: draft.artifact_paths,
            details: draft.details,
            prev_event_hash: self.last_hash().to_string(),
            event_hash: String::new(),
        };
        event.event_hash = event.compute_hash();
        event
    }

    /// Commit an event produced by [`prepare`](Self::prepare). Rejects an
    /// event that does not link to the current head.
    pub(crate) fn commit(&mut self, event: AuditEvent) -> Result<(), AuditError> {
        if event.prev_event_hash != self.last_hash() || event.event_hash != event.compute_hash() {
            return Err(AuditError::ChainIntegrity {
                index: self.events.len(),
                reason: "event does not extend the chain head".to_string(),
            });
        }
        self.events.push(event);
        Ok(())
    }

    pub fn verify(&self) -> ChainVerification {
        verify(&self.events)
    }
}

/// Replay `events` from genesis and report the first index whose link or
/// hash disagrees with what is stored.
pub fn verify(events: &[AuditEvent]) -> ChainVerification {
    match verify_strict(events) {
        Ok(()) => ChainVerification {
            valid: true,
            events: events.len(),
            failed_index: None,
            reason: None,
        },
        Err(AuditError::ChainIntegrity { index, reason }) => ChainVerification {
            valid: false,
            events: events.len(),
            failed_index: Some(index),
            reason: Some(reason),
        },
        Err(other) => ChainVerification {
            valid: false,
            events: events.len(),
            failed_index: Some(0),
            reason: Some(other.to_string()),
        },
    }
}

/// Like [`verify`], but returns `AuditError::ChainIntegrity` on the first break.
pub fn verify_strict(events: &[AuditEvent]) -> Result<(), AuditError> {
    let mut expected_prev = GENESIS_HASH;
    let run_id = events.first().map(|e| e.run_id.as_str());

    for (index, event) in events.iter().enumerate() {
        if Some(event.run_id.as_str()) != run_id {
            return Err(AuditError::ChainIntegrity {
                index,
                reason: "run_id differs from the first event".to_string(),
            });
        }
        if event.prev_event_hash != expected_prev {
            return Err(AuditError::ChainIntegrity {
                index,
                reason: "prev_event_hash mismatch".to_string(),
            });
        }
        if event.compute_hash() != event.event_hash {
            return Err(AuditError::ChainIntegrity {
                index,
                reason: "event_hash mismatch".to_string(),
            });
        }
        expected_prev = event.event_hash.as_str();
    }
    Ok(())
}
