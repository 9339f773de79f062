// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{OutputCategory, Tool, ToolCall, ToolKind, ToolOutput, ToolSchema};
