/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-chain HotStuff pacemaker: proposing, voting, locking, committing, and view changes.

pub mod messages;

pub mod protocol;

pub mod types;
