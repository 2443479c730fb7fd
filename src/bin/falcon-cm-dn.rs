// src/bin/falcon-cm-dn.rs

//! Data-node agent entry point.

use anyhow::Result;
use falcon_cm::core::agent::run_agent;

#[tokio::main]
async fn main() -> Result<()> {
    run_agent(false).await
}
