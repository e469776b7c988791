// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool contract and registry for the pi agent.
//!
//! A tool is a name, a JSON-Schema parameter declaration, and an async
//! `execute` that observes a cancellation token and may stream progress
//! updates.  Parameters are validated against the declared schema before
//! execution; validation failures become error results the model can react
//! to.

pub mod builtin;
pub mod schema;

mod registry;
mod tool;

pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolResult, ToolResultPart, UpdateFn};
