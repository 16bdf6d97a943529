//! Type tag to decoder mapping.
//!
//! The host application registers every job type it expects to dequeue
//! before starting workers. Envelopes carrying an unregistered tag surface
//! as `QueueError::UnknownJobType` instead of crashing the caller.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;

use super::{Job, JobEnvelope};
use crate::error::QueueError;

type JobDecoder = Box<dyn Fn(&[u8]) -> anyhow::Result<Box<dyn Job>> + Send + Sync>;

/// Registry of job decoders keyed by job type.
#[derive(Default)]
pub struct JobRegistry {
    decoders: RwLock<HashMap<String, JobDecoder>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job type whose payload is its JSON representation.
    pub fn register<J>(&self, job_type: &str)
    where
        J: Job + DeserializeOwned + 'static,
    {
        self.register_decoder(job_type, |payload| {
            let job: J = serde_json::from_slice(payload)?;
            Ok(Box::new(job) as Box<dyn Job>)
        });
    }

    /// Registers a custom decoder (useful for jobs carrying injected dependencies).
    pub fn register_decoder<F>(&self, job_type: &str, decoder: F)
    where
        F: Fn(&[u8]) -> anyhow::Result<Box<dyn Job>> + Send + Sync + 'static,
    {
        self.write().insert(job_type.to_string(), Box::new(decoder));
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.read().contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Rebuilds the job carried by `envelope`.
    ///
    /// # Errors
    ///
    /// - `QueueError::UnknownJobType` if no decoder is registered for the tag
    /// - `QueueError::Decoding` if the decoder rejects the payload
    pub fn decode(&self, envelope: &JobEnvelope) -> Result<Box<dyn Job>, QueueError> {
        let decoders = self.read();
        let decoder = decoders
            .get(&envelope.job_type)
            .ok_or_else(|| QueueError::UnknownJobType(envelope.job_type.clone()))?;

        decoder(envelope.payload_bytes()).map_err(|e| QueueError::Decoding(e.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobDecoder>> {
        self.decoders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobDecoder>> {
        self.decoders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
