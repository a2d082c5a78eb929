//! Pipeline run state
//!
//! `PipelineState` is the record threaded through every stage. Fields are
//! written once by the stage that owns them and are read-only afterwards.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::stage::{Stage, StageOutcome, StageRecord};
use crate::error::StageError;

/// Private key material for the provisioned instance
///
/// Never printed: `Debug` is redacted and there is no `Display` impl.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pem: String,
}

impl Credential {
    pub fn new(pem: impl Into<String>) -> Self {
        Self { pem: pem.into() }
    }

    /// Returns the raw key material
    ///
    /// Callers must only hand this to the remote shell transport.
    pub fn expose(&self) -> &str {
        &self.pem
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Mutable record carried through a single pipeline run
#[derive(Debug)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    instance_address: Option<String>,
    address_confirmed: bool,
    credential: Option<Credential>,
    image_reference: Option<String>,
    stage_history: Vec<StageRecord>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            instance_address: None,
            address_confirmed: false,
            credential: None,
            image_reference: None,
            stage_history: Vec::new(),
        }
    }

    /// Records the provisioned instance; may only happen once per run
    pub fn set_instance(
        &mut self,
        address: impl Into<String>,
        credential: Credential,
    ) -> Result<(), StageError> {
        if self.instance_address.is_some() {
            return Err(StageError::Invariant(
                "instance address is already set for this run".to_string(),
            ));
        }

        let address = address.into();
        if address.trim().is_empty() {
            return Err(StageError::Invariant(
                "instance address cannot be empty".to_string(),
            ));
        }

        self.instance_address = Some(address);
        self.credential = Some(credential);
        Ok(())
    }

    /// Marks the instance address as reachable (confirmed by a poller)
    pub fn confirm_address(&mut self) -> Result<(), StageError> {
        if self.instance_address.is_none() {
            return Err(StageError::Invariant(
                "cannot confirm an address before provisioning".to_string(),
            ));
        }
        self.address_confirmed = true;
        Ok(())
    }

    pub fn instance_address(&self) -> Option<&str> {
        self.instance_address.as_deref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Address that remote operations may target
    ///
    /// Fails unless a poller has confirmed the instance is reachable.
    pub fn reachable_address(&self) -> Result<&str, StageError> {
        match (&self.instance_address, self.address_confirmed) {
            (Some(address), true) => Ok(address),
            (Some(address), false) => Err(StageError::Invariant(format!(
                "instance {} has not been confirmed reachable",
                address
            ))),
            (None, _) => Err(StageError::Invariant(
                "no instance has been provisioned".to_string(),
            )),
        }
    }

    pub fn set_image_reference(&mut self, reference: impl Into<String>) -> Result<(), StageError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(StageError::Invariant(
                "image reference cannot be empty".to_string(),
            ));
        }
        self.image_reference = Some(reference);
        Ok(())
    }

    /// Image reference for the rollout; must be set and non-empty
    pub fn image_reference(&self) -> Result<&str, StageError> {
        self.image_reference
            .as_deref()
            .ok_or_else(|| StageError::Invariant("no image has been published".to_string()))
    }

    pub fn record(&mut self, stage: Stage, outcome: StageOutcome, attempts: u32) {
        self.stage_history.push(StageRecord {
            stage,
            outcome,
            timestamp: Utc::now(),
            attempts,
        });
    }

    pub fn stage_history(&self) -> &[StageRecord] {
        &self.stage_history
    }

    /// Consumes the state, dropping the credential, and returns the history
    pub fn into_history(self) -> Vec<StageRecord> {
        self.stage_history
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
