// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::AgentConfig;

/// Load an [`AgentConfig`] from a YAML file, layering it over the defaults.
///
/// The executor is embedded in a host daemon, so there is no search-path
/// discovery here: the host resolves the path (per-task override file,
/// deployment default, or none) and passes it in.  `None` yields the default
/// config.
pub fn load(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let Some(p) = path else {
        return Ok(AgentConfig::default());
    };
    debug!(path = %p.display(), "loading agent config");
    let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
    let defaults = serde_yaml::to_value(AgentConfig::default()).context("serializing defaults")?;
    let mut merged = defaults;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
    merge_yaml(&mut merged, layer);
    serde_yaml::from_value(merged).with_context(|| format!("validating {}", p.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
