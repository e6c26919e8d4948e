/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The bytecode interpreter: a U256 stack, byte-addressable memory, a program counter, and a
//! gas counter, over a fixed-cost opcode subset.

use ethereum_types::U256;

use crate::kv_store::KVStore;
use crate::state_db::{Address, StateDb};
use crate::trie::node::TrieError;
use crate::types::basic::CryptoHash;

/// Maximum stack depth.
const STACK_LIMIT: usize = 1024;

/// Maximum memory size a single execution may touch.
const MEMORY_LIMIT: usize = 1 << 22;

/// Fixed gas schedule.
pub(crate) mod gas {
    /// Intrinsic cost of any transaction.
    pub const TX: u64 = 21_000;

    /// Additional intrinsic cost of a contract creation.
    pub const CREATE: u64 = 32_000;

    /// Cost per byte of created contract code.
    pub const CODE_DEPOSIT: u64 = 200;

    /// Base cost of every executed opcode.
    pub const STEP: u64 = 3;

    /// Additional cost of SLOAD.
    pub const SLOAD: u64 = 800;

    /// Additional cost of SSTORE.
    pub const SSTORE: u64 = 20_000;
}

mod opcode {
    pub const STOP: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const MUL: u8 = 0x02;
    pub const SUB: u8 = 0x03;
    pub const MLOAD: u8 = 0x51;
    pub const MSTORE: u8 = 0x52;
    pub const SLOAD: u8 = 0x54;
    pub const SSTORE: u8 = 0x55;
    pub const PUSH1: u8 = 0x60;
    pub const PUSH2: u8 = 0x61;
    pub const DUP1: u8 = 0x80;
    pub const RETURN: u8 = 0xf3;
    pub const REVERT: u8 = 0xfd;
}

/// Enumerates the ways bytecode execution can fail. Any of these triggers the enclosing
/// snapshot revert; the block as a whole is unaffected.
#[derive(Debug, PartialEq, Eq)]
pub enum EvmError {
    StackUnderflow,
    StackOverflow,
    OutOfGas,
    MemoryOutOfBounds,
    IncompletePush,

    /// The contract executed REVERT, carrying its output.
    Reverted(Vec<u8>),

    /// The world state could not be read or written.
    State(TrieError),
}

impl std::fmt::Display for EvmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvmError::StackUnderflow => write!(f, "stack underflow"),
            EvmError::StackOverflow => write!(f, "stack overflow"),
            EvmError::OutOfGas => write!(f, "out of gas"),
            EvmError::MemoryOutOfBounds => write!(f, "memory out of bounds"),
            EvmError::IncompletePush => write!(f, "incomplete push"),
            EvmError::Reverted(_) => write!(f, "execution reverted"),
            EvmError::State(err) => write!(f, "state error: {}", err),
        }
    }
}

impl From<TrieError> for EvmError {
    fn from(err: TrieError) -> EvmError {
        EvmError::State(err)
    }
}

/// Execute `code` in the storage context of `contract`. Returns the gas consumed alongside the
/// outcome, so failed executions still account for what they burned.
pub(crate) fn execute_bytecode<K: KVStore>(
    state: &mut StateDb<K>,
    contract: &Address,
    code: &[u8],
    gas_limit: u64,
) -> (u64, Result<Vec<u8>, EvmError>) {
    let mut stack: Vec<U256> = Vec::new();
    let mut memory: Vec<u8> = Vec::new();
    let mut pc = 0usize;
    let mut gas_used = 0u64;

    macro_rules! pop {
        () => {
            match stack.pop() {
                Some(value) => value,
                None => return (gas_used, Err(EvmError::StackUnderflow)),
            }
        };
    }

    macro_rules! charge {
        ($amount:expr) => {
            gas_used += $amount;
            if gas_used > gas_limit {
                return (gas_limit, Err(EvmError::OutOfGas));
            }
        };
    }

    while pc < code.len() {
        let op = code[pc];
        charge!(gas::STEP);

        match op {
            opcode::STOP => return (gas_used, Ok(Vec::new())),

            opcode::ADD => {
                let a = pop!();
                let b = pop!();
                stack.push(a.overflowing_add(b).0);
            }

            opcode::MUL => {
                let a = pop!();
                let b = pop!();
                stack.push(a.overflowing_mul(b).0);
            }

            opcode::SUB => {
                let a = pop!();
                let b = pop!();
                stack.push(a.overflowing_sub(b).0);
            }

            opcode::MLOAD => {
                let offset = pop!().low_u64() as usize;
                match expand_memory(&mut memory, offset, 32) {
                    Ok(()) => {}
                    Err(err) => return (gas_used, Err(err)),
                }
                stack.push(U256::from_big_endian(&memory[offset..offset + 32]));
            }

            opcode::MSTORE => {
                let offset = pop!().low_u64() as usize;
                let value = pop!();
                match expand_memory(&mut memory, offset, 32) {
                    Ok(()) => {}
                    Err(err) => return (gas_used, Err(err)),
                }
                value.to_big_endian(&mut memory[offset..offset + 32]);
            }

            opcode::SLOAD => {
                charge!(gas::SLOAD);
                let key = pop!();
                let value = match state.get_state(contract, &hash_of(&key)) {
                    Ok(value) => value,
                    Err(err) => return (gas_used, Err(err.into())),
                };
                stack.push(U256::from_big_endian(&value.bytes()));
            }

            opcode::SSTORE => {
                charge!(gas::SSTORE);
                let key = pop!();
                let value = pop!();
                if let Err(err) = state.set_state(contract, &hash_of(&key), &hash_of(&value)) {
                    return (gas_used, Err(err.into()));
                }
            }

            opcode::PUSH1 => {
                if pc + 1 >= code.len() {
                    return (gas_used, Err(EvmError::IncompletePush));
                }
                stack.push(U256::from(code[pc + 1]));
                pc += 1;
            }

            opcode::PUSH2 => {
                if pc + 2 >= code.len() {
                    return (gas_used, Err(EvmError::IncompletePush));
                }
                stack.push(U256::from_big_endian(&code[pc + 1..pc + 3]));
                pc += 2;
            }

            opcode::DUP1 => {
                let top = match stack.last() {
                    Some(top) => *top,
                    None => return (gas_used, Err(EvmError::StackUnderflow)),
                };
                stack.push(top);
            }

            opcode::RETURN => {
                let offset = pop!().low_u64() as usize;
                let length = pop!().low_u64() as usize;
                if offset + length > memory.len() {
                    return (gas_used, Err(EvmError::MemoryOutOfBounds));
                }
                return (gas_used, Ok(memory[offset..offset + length].to_vec()));
            }

            opcode::REVERT => {
                let offset = pop!().low_u64() as usize;
                let length = pop!().low_u64() as usize;
                if offset + length > memory.len() {
                    return (gas_used, Err(EvmError::MemoryOutOfBounds));
                }
                return (
                    gas_used,
                    Err(EvmError::Reverted(memory[offset..offset + length].to_vec())),
                );
            }

            other => {
                log::debug!("Evm, unsupported opcode 0x{:02x} at pc {}", other, pc);
            }
        }

        pc += 1;

        if stack.len() > STACK_LIMIT {
            return (gas_used, Err(EvmError::StackOverflow));
        }
    }

    // Fell off the end of the code without RETURN: empty output.
    (gas_used, Ok(Vec::new()))
}

fn expand_memory(memory: &mut Vec<u8>, offset: usize, length: usize) -> Result<(), EvmError> {
    let needed = offset.checked_add(length).ok_or(EvmError::MemoryOutOfBounds)?;
    if needed > MEMORY_LIMIT {
        return Err(EvmError::MemoryOutOfBounds);
    }
    if memory.len() < needed {
        memory.resize(needed, 0);
    }
    Ok(())
}

/// A U256 as a 32-byte storage key/value.
fn hash_of(value: &U256) -> CryptoHash {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    CryptoHash::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::MemKVStore;
    use crate::trie::database::NodeStore;

    fn setup() -> (StateDb<MemKVStore>, Address) {
        let state = StateDb::new(NodeStore::new(MemKVStore::new()));
        (state, Address::repeat_byte(7))
    }

    #[test]
    fn add_and_return() {
        let (mut state, contract) = setup();
        // PUSH1 2, PUSH1 40, ADD, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        // (RETURN pops offset off the top, then length.)
        let code = [
            0x60, 0x02, 0x60, 0x28, 0x01, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
        ];
        let (gas_used, result) = execute_bytecode(&mut state, &contract, &code, 100_000);
        let ret = result.unwrap();
        assert_eq!(U256::from_big_endian(&ret), U256::from(42));
        assert!(gas_used > 0);
    }

    #[test]
    fn sstore_then_sload() {
        let (mut state, contract) = setup();
        // PUSH1 0x2a, PUSH1 0x01, SSTORE  (store 42 under key 1)
        let store = [0x60, 0x2a, 0x60, 0x01, 0x55];
        let (_, result) = execute_bytecode(&mut state, &contract, &store, 100_000);
        result.unwrap();

        // PUSH1 0x01, SLOAD, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let load = [0x60, 0x01, 0x54, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3];
        let (_, result) = execute_bytecode(&mut state, &contract, &load, 100_000);
        assert_eq!(U256::from_big_endian(&result.unwrap()), U256::from(42));
    }

    #[test]
    fn stack_underflow_is_an_error() {
        let (mut state, contract) = setup();
        let code = [0x01]; // ADD on an empty stack
        let (_, result) = execute_bytecode(&mut state, &contract, &code, 100_000);
        assert_eq!(result, Err(EvmError::StackUnderflow));
    }

    #[test]
    fn out_of_gas_consumes_the_limit() {
        let (mut state, contract) = setup();
        // SSTORE costs well over this budget.
        let code = [0x60, 0x01, 0x60, 0x01, 0x55];
        let (gas_used, result) = execute_bytecode(&mut state, &contract, &code, 100);
        assert_eq!(result, Err(EvmError::OutOfGas));
        assert_eq!(gas_used, 100);
    }

    #[test]
    fn revert_carries_output() {
        let (mut state, contract) = setup();
        // PUSH1 0x2a, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, REVERT
        let code = [0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xfd];
        let (_, result) = execute_bytecode(&mut state, &contract, &code, 100_000);
        match result {
            Err(EvmError::Reverted(data)) => {
                assert_eq!(U256::from_big_endian(&data), U256::from(42))
            }
            other => panic!("expected revert, got {:?}", other),
        }
    }
}
