/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split into smaller, subsystem-specific
//! config structs before being passed to components.

use std::time::Duration;

use crate::crypto::{EcdsaKeypair, ThresholdKeypair};
use crate::router::DEFAULT_PORT;
use crate::types::basic::{Magic, NetAddress};

#[derive(Clone)]
pub struct Configuration {
    pub identity: IdentityConfig,
    pub pacemaker: PacemakerTimingConfig,
    pub networking: NetworkingConfig,
    /// Upper bound on committee membership; the actual committee is the min of this and the
    /// delegate set size.
    pub committee_size: usize,
    /// Install the default CSV logging handlers for every event.
    pub log_events: bool,
}

#[derive(Clone)]
pub struct IdentityConfig {
    pub keypair: EcdsaKeypair,
    pub threshold_keypair: ThresholdKeypair,
    pub my_addr: NetAddress,
}

#[derive(Clone)]
pub struct PacemakerTimingConfig {
    /// Timeout allotted to the first round after a commit; doubles on each consecutive view
    /// change. Matches the network call timeout, so one unreachable peer costs at most one round.
    pub base_timeout: Duration,
}

impl Default for PacemakerTimingConfig {
    fn default() -> Self {
        PacemakerTimingConfig {
            base_timeout: Duration::from_secs(4),
        }
    }
}

#[derive(Clone)]
pub struct NetworkingConfig {
    pub magic: Magic,
    pub listening_port: u16,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        NetworkingConfig {
            magic: Magic::V1,
            listening_port: DEFAULT_PORT,
        }
    }
}
