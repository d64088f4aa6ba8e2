//! Concurrent-writer convergence suite
//!
//! One owner publishes a unit; several writer peers mutate their mirrors of
//! it from their own threads. Afterwards every mirror must carry the owner's
//! revision and payload, and the owner's revision must account for every
//! accepted write without gaps.

use std::thread;

use thiserror::Error;
use tracing::debug;

use ipaaca_core::{DocumentMap, DocumentValue, IpaacaError, PayloadType};
use ipaaca_runtime::Unit;
use ipaaca_transport::LocalBus;

use crate::harness::{wait_until, Peer, EVENT_TIMEOUT};

const CATEGORY: &str = "convergence";

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("setup failed: {0}")]
    Setup(#[from] IpaacaError),

    #[error("peer {0} never saw the unit")]
    MissingMirror(String),

    #[error("writer thread panicked")]
    WriterPanicked,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    /// Number of writer peers besides the owner
    pub writers: usize,
    /// Writes issued by each writer
    pub updates_per_writer: usize,
    pub payload_type: PayloadType,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            writers: 3,
            updates_per_writer: 10,
            payload_type: PayloadType::Json,
        }
    }
}

impl ConvergenceConfig {
    pub fn minimal() -> Self {
        Self {
            writers: 1,
            updates_per_writer: 3,
            payload_type: PayloadType::Json,
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    pub fn stress() -> Self {
        Self {
            writers: 6,
            updates_per_writer: 40,
            payload_type: PayloadType::Json,
        }
    }

    pub fn with_payload_type(mut self, payload_type: PayloadType) -> Self {
        self.payload_type = payload_type;
        self
    }
}

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConvergenceResult {
    /// Owner revision after all writes
    pub owner_revision: u32,
    /// Final revision of each writer's mirror
    pub mirror_revisions: Vec<u32>,
    pub accepted_writes: usize,
    pub rejected_writes: usize,
    pub invariant_violations: Vec<String>,
}

impl ConvergenceResult {
    pub fn converged(&self) -> bool {
        self.mirror_revisions.iter().all(|r| *r == self.owner_revision)
    }

    pub fn passed(&self) -> bool {
        self.converged() && self.invariant_violations.is_empty()
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct ConvergenceHarness {
    config: ConvergenceConfig,
    bus: LocalBus,
}

impl ConvergenceHarness {
    pub fn new(config: ConvergenceConfig) -> Result<Self, HarnessError> {
        Ok(Self {
            config,
            bus: LocalBus::new()?,
        })
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn run(&self) -> Result<ConvergenceResult, HarnessError> {
        let owner = Peer::new(&self.bus, "owner", &[])?;
        let writers = (0..self.config.writers)
            .map(|i| Peer::new(&self.bus, &format!("writer{}", i), &[CATEGORY]))
            .collect::<Result<Vec<_>, _>>()?;

        let unit = Unit::builder(CATEGORY)
            .payload_type(self.config.payload_type)
            .build()?;
        owner.output.add(&unit)?;
        let uid = unit.uid();

        let mut mirrors = Vec::with_capacity(writers.len());
        for (i, writer) in writers.iter().enumerate() {
            let mirror = writer
                .mirror(&uid)
                .ok_or_else(|| HarnessError::MissingMirror(format!("writer{}", i)))?;
            mirrors.push(mirror);
        }

        let updates = self.config.updates_per_writer;
        let threads: Vec<_> = mirrors
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mirror)| {
                thread::spawn(move || {
                    let mut accepted = 0;
                    for j in 0..updates {
                        match mirror.payload().set(&format!("w{}", i), j as i64) {
                            Ok(()) => accepted += 1,
                            Err(e) => debug!("writer{} update {} rejected: {}", i, j, e),
                        }
                    }
                    accepted
                })
            })
            .collect();

        let mut accepted_writes = 0;
        for t in threads {
            accepted_writes += t.join().map_err(|_| HarnessError::WriterPanicked)?;
        }
        let rejected_writes = self.config.writers * updates - accepted_writes;

        let owner_revision = unit.revision();
        wait_until(EVENT_TIMEOUT, || {
            mirrors.iter().all(|m| m.revision() == owner_revision)
        });

        let mut violations = Vec::new();
        let expected = 1 + accepted_writes as u32;
        if owner_revision != expected {
            violations.push(format!(
                "owner revision {} after {} accepted writes",
                owner_revision, accepted_writes
            ));
        }
        let owner_payload = unit.payload().to_map();
        for (i, mirror) in mirrors.iter().enumerate() {
            if mirror.payload().to_map() != owner_payload {
                violations.push(format!("writer{} payload diverged", i));
            }
        }
        let expected_payload: DocumentMap = (0..self.config.writers)
            .filter(|_| updates > 0)
            .map(|i| {
                let last = DocumentValue::Integer(updates as i64 - 1);
                let last = match self.config.payload_type {
                    PayloadType::Json => last,
                    _ => DocumentValue::String(last.to_text()),
                };
                (format!("w{}", i), last)
            })
            .collect();
        if owner_payload != expected_payload {
            violations.push("owner payload is missing final writes".to_string());
        }

        let result = ConvergenceResult {
            owner_revision,
            mirror_revisions: mirrors.iter().map(|m| m.revision()).collect(),
            accepted_writes,
            rejected_writes,
            invariant_violations: violations,
        };

        for writer in &writers {
            writer.close();
        }
        owner.close();
        Ok(result)
    }
}
