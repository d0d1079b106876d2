// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stateless text and JSON recovery utilities shared by every agent.
//!
//! Nothing in this crate suspends or holds state; the JSON fixer's optional
//! LLM-rebuild step is abstracted behind [`JsonRebuild`] so the crate stays
//! independent of the HTTP client.

pub mod json_fix;
pub mod sanitize;

pub use json_fix::{fix_and_parse, FixStage, JsonRebuild};
