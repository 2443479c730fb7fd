// src/core/db/liveness.rs

//! Liveness-probe file control.
//!
//! The pod's liveness probe executes a shell script. During disruptive
//! transitions (demote, base backup) the database is legitimately down, so
//! the agent blanks the script to suppress probe kills and rewrites it once
//! the instance streams again.

use std::path::PathBuf;

use tracing::info;

use crate::core::errors::CmResult;

/// Default probe location inside the pod.
pub const DEFAULT_PROBE_PATH: &str = "/home/falconMeta/check_liveness.sh";

/// The restored probe checks the database and the presence of the agent.
const PROBE_SCRIPT: &str = r#"#!/bin/bash
pg_isready -d postgres -U falconMeta --timeout=5 --quiet
if [ $? != 0 ]; then
    exit 1;
fi
isMonitor=`ps aux | grep falcon-cm | grep -v grep | wc -l`
if [ "${isMonitor}" = "0" ]; then
    exit 1;
else
    exit 0;
fi
"#;

#[derive(Debug, Clone)]
pub struct LivenessProbe {
    path: PathBuf,
}

impl LivenessProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Blanks the probe script so the probe always passes.
    pub async fn clear(&self) -> CmResult<()> {
        info!("clear liveness file");
        tokio::fs::write(&self.path, b"").await?;
        Ok(())
    }

    /// Rewrites the real probe script.
    pub async fn restore(&self) -> CmResult<()> {
        tokio::fs::write(&self.path, PROBE_SCRIPT.as_bytes()).await?;
        info!("restore liveness file");
        Ok(())
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PATH)
    }
}
