/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the consensus core.
//!
//! Other types, specific to single components, live in the "types" submodules of their
//! components, e.g. [`crate::pacemaker::types`].

pub mod basic;

pub mod block;

pub mod certificates;

pub mod committee;
