/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The HotStuff consensus subprotocol: the view-independent [driver](driver) and the pluggable
//! per-variant [rules](rules).

pub(crate) mod driver;

pub mod rules;
