//! Circuit tests
//!
//! A circuit test is a source-routed probe: a FIFO of hops, each naming up
//! to a breadth of next addresses, walked by CIRCUIT_TEST packets with
//! CIRCUIT_TEST_REPORT packets flowing back to the originator. The engine
//! holds only a registration keyed by test ID; tests themselves are owned by
//! the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use ethermesh_crypto::Address;

use crate::error::{CoreError, CoreResult};
use crate::protocol::{MAX_CIRCUIT_TEST_BREADTH, MAX_CIRCUIT_TEST_HOPS};

/// Serialized address budget of one test packet; keeps the sum of breadths
/// inside a single wire packet.
const MAX_TOTAL_BREADTH: usize = 256;

/// A source-routed connectivity probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTest {
    pub test_id: u64,
    pub timestamp: u64,
    /// Network whose controller must be owned by the originator
    pub credential_network_id: u64,
    /// FIFO of hops; each hop fans out to its listed addresses
    pub hops: Vec<Vec<Address>>,
    pub report_at_every_hop: bool,
}

impl CircuitTest {
    /// Structural validation plus the originator-owns-controller rule
    pub fn validate(&self, originator: Address) -> CoreResult<()> {
        if self.hops.is_empty() || self.hops.len() > MAX_CIRCUIT_TEST_HOPS {
            return Err(CoreError::BadParameter("hop count out of range".into()));
        }
        let mut total = 0usize;
        for hop in &self.hops {
            if hop.is_empty() || hop.len() > MAX_CIRCUIT_TEST_BREADTH {
                return Err(CoreError::BadParameter("hop breadth out of range".into()));
            }
            total += hop.len();
        }
        if total > MAX_TOTAL_BREADTH {
            return Err(CoreError::BadParameter(
                "total breadth exceeds wire budget".into(),
            ));
        }
        if Address::from_u64(self.credential_network_id >> 24) != originator {
            return Err(CoreError::BadParameter(
                "credential network not controlled by originator".into(),
            ));
        }
        Ok(())
    }
}

/// One hop's report back to the originator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTestReport {
    pub test_id: u64,
    pub reporter: Address,
    /// Peer the test packet arrived from
    pub upstream: Address,
    pub hop_index: u16,
    pub timestamp: u64,
}

/// Callback invoked for each report of a registered test
pub type CircuitTestCallback = Arc<dyn Fn(&CircuitTestReport) + Send + Sync>;

/// Registrations of locally originated tests
pub struct CircuitTestRegistry {
    tests: Mutex<HashMap<u64, CircuitTestCallback>>,
}

impl CircuitTestRegistry {
    pub fn new() -> Self {
        Self {
            tests: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, test_id: u64, callback: CircuitTestCallback) {
        self.tests.lock().unwrap().insert(test_id, callback);
    }

    pub fn unregister(&self, test_id: u64) {
        self.tests.lock().unwrap().remove(&test_id);
    }

    /// Deliver a report to its registered callback, if any
    pub fn deliver(&self, report: &CircuitTestReport) -> bool {
        let callback = self.tests.lock().unwrap().get(&report.test_id).cloned();
        match callback {
            Some(cb) => {
                cb(report);
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitTestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
