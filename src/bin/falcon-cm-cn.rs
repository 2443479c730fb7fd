// src/bin/falcon-cm-cn.rs

//! Coordinator-node agent entry point.

use anyhow::Result;
use falcon_cm::core::agent::run_agent;

#[tokio::main]
async fn main() -> Result<()> {
    run_agent(true).await
}
