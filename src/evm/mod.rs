/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The deterministic state engine: a minimal EVM-style bytecode interpreter and the transaction
//! execution wrapper that produces receipts.
//!
//! Determinism is a protocol requirement, not a nicety: every honest replica executes committed
//! blocks in the same order, and the resulting state roots feed back into block headers. Nothing
//! in this module reads wall clocks, randomness, or unordered map iterations.

pub mod block;
pub mod executor;
pub mod interpreter;

pub use block::{EvmBlock, EvmBlockHeader};
pub use executor::{ExecutionConfig, Executor, Log, Receipt};
pub use interpreter::EvmError;
