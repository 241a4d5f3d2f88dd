//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod config;
pub mod debug;
pub mod election;
pub mod error;
pub mod events;
pub mod instance;
pub mod path;
pub mod protect;
pub mod stats;
pub mod tasks;
pub mod te;
pub mod topology;
