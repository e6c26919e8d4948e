/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the types that all of the protocol's components handle: basic newtypes, blocks,
//! certificates, collectors, keypairs, and the validator set.

pub mod basic;

pub mod block;

pub mod certificates;

pub(crate) mod collectors;

pub mod keypair;

pub mod validator_set;
