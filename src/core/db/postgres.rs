// src/core/db/postgres.rs

//! The production [`DbControl`] implementation: SQL over `tokio-postgres`
//! plus the `pg_ctl`/`pg_basebackup`/`pg_rewind` tooling.
//!
//! Every operation logs what it runs; callers decide retry policy. The base
//! backup rebuild loop is intentionally unbounded — the alternative is a
//! permanently unjoinable node — but each attempt is counted.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::db::liveness::LivenessProbe;
use crate::core::db::lsn::{lsn_to_num, slot_name};
use crate::core::db::{DbControl, ForeignServerRow, ReplicationRow};
use crate::core::errors::CmResult;
use crate::core::metrics;
use crate::core::types::Endpoint;

/// Poll interval while waiting for the WAL receiver to come up.
const WAL_RECEIVER_POLL: Duration = Duration::from_secs(10);

pub struct PgControl {
    user: String,
    pgdata: PathBuf,
    host_node_name: String,
    log_file: PathBuf,
    liveness: LivenessProbe,
}

impl PgControl {
    pub fn new(cfg: &Config) -> Self {
        Self {
            user: cfg.user_name.clone(),
            pgdata: cfg.pgdata_dir(),
            host_node_name: cfg.host_node_name.clone(),
            log_file: cfg.data_dir.join("logfile"),
            liveness: LivenessProbe::default(),
        }
    }

    /// Override the liveness-probe location (tests).
    pub fn with_liveness(mut self, liveness: LivenessProbe) -> Self {
        self.liveness = liveness;
        self
    }

    fn conninfo(&self, ep: &Endpoint) -> String {
        format!(
            "host={} port={} user={} dbname=postgres connect_timeout=10",
            ep.host, ep.port, self.user
        )
    }

    async fn connect(&self, ep: &Endpoint) -> CmResult<tokio_postgres::Client> {
        let (client, connection) = tokio_postgres::connect(&self.conninfo(ep), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("database connection closed: {}", e);
            }
        });
        Ok(client)
    }

    async fn execute(&self, ep: &Endpoint, sql: &str) -> CmResult<()> {
        let client = self.connect(ep).await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    /// Executes SQL and returns the first column of the first row, if any.
    async fn try_fetch_one(&self, ep: &Endpoint, sql: &str) -> CmResult<Option<String>> {
        let client = self.connect(ep).await?;
        let row = client.query_opt(sql, &[]).await?;
        match row {
            Some(row) => Ok(row.try_get::<_, Option<String>>(0)?),
            None => Ok(None),
        }
    }

    /// `ALTER SYSTEM SET <name>` followed by a config reload.
    async fn alter_system(&self, ep: &Endpoint, name: &str, value: &str) -> CmResult<()> {
        self.execute(ep, &format!("ALTER SYSTEM SET {name} TO '{value}'"))
            .await?;
        self.execute(ep, "SELECT pg_reload_conf()").await
    }

    async fn exec_cmd(program: &str, args: &[&str]) -> CmResult<String> {
        info!("execute command: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        info!("command result: {}", combined.trim());
        Ok(combined)
    }

    fn pgdata_str(&self) -> String {
        self.pgdata.display().to_string()
    }

    async fn pg_start(&self) -> CmResult<()> {
        let pid_file = self.pgdata.join("postmaster.pid");
        if tokio::fs::try_exists(&pid_file).await.unwrap_or(false) {
            tokio::fs::remove_file(&pid_file).await?;
        }
        let log = self.log_file.display().to_string();
        Self::exec_cmd("pg_ctl", &["start", "-D", &self.pgdata_str(), "-l", &log]).await?;
        info!("start postgres");
        Ok(())
    }

    async fn pg_stop(&self) -> CmResult<()> {
        Self::exec_cmd("pg_ctl", &["stop", "-D", &self.pgdata_str(), "-m", "immediate"]).await?;
        info!("stop postgres");
        Ok(())
    }

    async fn pg_reload(&self) -> CmResult<()> {
        Self::exec_cmd("pg_ctl", &["reload", "-D", &self.pgdata_str(), "-w"]).await?;
        Ok(())
    }

    /// Drops any stale slot of the same name, then recreates it on the
    /// leader. Failures are logged; the subsequent backup or rewind
    /// surfaces anything that actually matters.
    async fn create_replication_slot(&self, leader: &Endpoint, slot: &str) {
        if let Err(e) = self
            .execute(
                leader,
                &format!("SELECT * FROM pg_drop_replication_slot('{slot}')"),
            )
            .await
        {
            info!("dropping slot {} before recreate: {}", slot, e);
        }
        match self
            .execute(
                leader,
                &format!("SELECT * FROM pg_create_physical_replication_slot('{slot}')"),
            )
            .await
        {
            Ok(()) => info!("create physical replication slot: {}", slot),
            Err(e) => warn!("failed to create replication slot {}: {}", slot, e),
        }
    }

    async fn clear_inactive_slots(&self, local: &Endpoint) -> CmResult<()> {
        self.execute(
            local,
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE NOT active",
        )
        .await
    }

    async fn checkpoint(&self, local: &Endpoint) -> CmResult<()> {
        self.execute(local, "CHECKPOINT").await
    }

    /// Rewrites `postgresql.auto.conf` to stream from `leader`.
    async fn write_primary_pointer(&self, leader: &Endpoint, slot: &str) -> CmResult<()> {
        let conninfo = self.conninfo(leader);
        let content = format!("primary_conninfo = '{conninfo}'\nprimary_slot_name = '{slot}'\n");
        tokio::fs::write(self.pgdata.join("postgresql.auto.conf"), content).await?;
        Ok(())
    }

    async fn pg_rewind(&self, leader: &Endpoint) -> CmResult<()> {
        let source = format!("--source-server={}", self.conninfo(leader));
        Self::exec_cmd("pg_rewind", &["-D", &self.pgdata_str(), &source]).await?;
        tokio::fs::write(self.pgdata.join("standby.signal"), b"").await?;
        Ok(())
    }

    async fn pg_basebackup(&self, leader: &Endpoint, slot: &str) -> CmResult<()> {
        info!("start basebackup from {}", leader);
        let port = leader.port.to_string();
        let slot_arg = format!("--slot={slot}");
        Self::exec_cmd(
            "pg_basebackup",
            &[
                "-D",
                &self.pgdata_str(),
                "-Fp",
                "-Pv",
                "-Xs",
                "-c",
                "fast",
                "-R",
                "-h",
                &leader.host,
                "-p",
                &port,
                "-U",
                &self.user,
                &slot_arg,
            ],
        )
        .await?;
        Ok(())
    }

    async fn wipe_data_dir(&self) -> CmResult<()> {
        if tokio::fs::try_exists(&self.pgdata).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.pgdata).await?;
        }
        tokio::fs::create_dir_all(&self.pgdata).await?;
        Ok(())
    }

    /// `pg_stat_wal_receiver` reports `streaming`.
    async fn is_standby_ready(&self, local: &Endpoint) -> bool {
        matches!(
            self.try_fetch_one(local, "SELECT status FROM pg_stat_wal_receiver")
                .await,
            Ok(Some(status)) if status == "streaming"
        )
    }

    /// Streaming, or the flushed LSN still advancing across one poll
    /// window (catching up after a rewind).
    async fn is_wal_receiver_working(&self, local: &Endpoint) -> bool {
        if self.is_standby_ready(local).await {
            return true;
        }
        let sql = "SELECT flushed_lsn::text FROM pg_stat_wal_receiver";
        let lsn1 = self.try_fetch_one(local, sql).await.ok().flatten();
        tokio::time::sleep(WAL_RECEIVER_POLL).await;
        if self.is_standby_ready(local).await {
            return true;
        }
        let lsn2 = self.try_fetch_one(local, sql).await.ok().flatten();
        match (lsn1, lsn2) {
            (Some(a), Some(b)) => lsn_to_num(&b) > lsn_to_num(&a),
            _ => false,
        }
    }

    /// Tears the instance down and rebuilds it from a base backup until the
    /// WAL receiver streams. Unbounded by design; attempts are counted.
    async fn rebuild_from_basebackup(
        &self,
        leader: &Endpoint,
        local: &Endpoint,
        slot: &str,
    ) -> CmResult<()> {
        loop {
            metrics::BASEBACKUP_ATTEMPTS_TOTAL.inc();
            self.pg_stop().await?;
            self.wipe_data_dir().await?;
            self.pg_basebackup(leader, slot).await?;
            self.pg_start().await?;
            tokio::time::sleep(WAL_RECEIVER_POLL).await;
            if self.is_standby_ready(local).await {
                return Ok(());
            }
            warn!(
                "base backup from {} did not reach streaming, retrying",
                leader
            );
        }
    }
}

#[async_trait]
impl DbControl for PgControl {
    async fn is_standby(&self) -> bool {
        tokio::fs::try_exists(self.pgdata.join("standby.signal"))
            .await
            .unwrap_or(false)
    }

    async fn get_lsn(&self, local: &Endpoint) -> u64 {
        let mut max = 0u64;
        for sql in [
            "SELECT pg_last_wal_receive_lsn()::text",
            "SELECT pg_last_wal_receive_lsn_for_falcon()::text",
        ] {
            match self.try_fetch_one(local, sql).await {
                Ok(Some(lsn)) => max = max.max(lsn_to_num(&lsn)),
                Ok(None) => {}
                Err(e) => info!("lsn read failed ({}): {}", sql, e),
            }
        }
        info!("local receive lsn: {}", max);
        max
    }

    async fn promote(&self, local: &Endpoint) -> CmResult<()> {
        info!("promote the local instance to primary");
        Self::exec_cmd("pg_ctl", &["promote", "-D", &self.pgdata_str(), "-w"]).await?;
        tokio::fs::write(self.pgdata.join("postgresql.auto.conf"), b"").await?;
        self.alter_system(local, "synchronous_commit", "on").await?;
        self.alter_system(local, "synchronous_standby_names", "*")
            .await?;
        info!("promote finished");
        Ok(())
    }

    async fn demote(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()> {
        info!("demote the local instance to standby of {}", leader);
        if let Err(e) = self.liveness.clear().await {
            warn!("failed to clear liveness probe: {}", e);
        }
        if let Err(e) = self.clear_inactive_slots(local).await {
            info!("clearing inactive slots before demote: {}", e);
        }
        if let Err(e) = self.checkpoint(local).await {
            info!("checkpoint before demote: {}", e);
        }
        self.pg_stop().await?;
        let slot = slot_name(&self.host_node_name);
        self.create_replication_slot(leader, &slot).await;
        self.pg_rewind(leader).await?;
        self.write_primary_pointer(leader, &slot).await?;
        self.pg_start().await?;
        if self.is_wal_receiver_working(local).await {
            self.liveness.restore().await?;
            info!("demote via rewind finished");
            return Ok(());
        }
        warn!("rewind did not reach streaming, rebuilding from base backup");
        self.rebuild_from_basebackup(leader, local, &slot).await?;
        self.liveness.restore().await?;
        info!("demote via base backup finished");
        Ok(())
    }

    async fn demote_by_basebackup(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()> {
        info!("rebuild the local instance from a base backup of {}", leader);
        if let Err(e) = self.liveness.clear().await {
            warn!("failed to clear liveness probe: {}", e);
        }
        let slot = slot_name(&self.host_node_name);
        self.create_replication_slot(leader, &slot).await;
        self.rebuild_from_basebackup(leader, local, &slot).await?;
        self.liveness.restore().await?;
        info!("rebuild from base backup finished");
        Ok(())
    }

    async fn change_following_leader(&self, leader: &Endpoint, local: &Endpoint) -> CmResult<()> {
        info!("change following leader to {}", leader);
        let slot = slot_name(&self.host_node_name);
        self.create_replication_slot(leader, &slot).await;
        self.write_primary_pointer(leader, &slot).await?;
        self.pg_reload().await?;
        if self.is_wal_receiver_working(local).await {
            info!("now streaming from {}", leader);
            return Ok(());
        }
        warn!("cannot follow {} in place, rebuilding from base backup", leader);
        if let Err(e) = self.liveness.clear().await {
            warn!("failed to clear liveness probe: {}", e);
        }
        self.rebuild_from_basebackup(leader, local, &slot).await?;
        self.liveness.restore().await?;
        Ok(())
    }

    async fn stop_replication(&self, local: &Endpoint) -> CmResult<()> {
        info!("stop the replication");
        self.alter_system(local, "primary_conninfo", "").await?;
        self.alter_system(local, "primary_slot_name", "").await
    }

    async fn hard_stop(&self) {
        error!("hard-stopping the local database");
        let _ = Self::exec_cmd("pg_ctl", &["stop", "-D", &self.pgdata_str(), "-m", "immediate"])
            .await;
    }

    async fn update_foreign_server(
        &self,
        cn: &Endpoint,
        group_id: u32,
        primary: &Endpoint,
    ) -> CmResult<()> {
        info!(
            "update node table: group {} -> {} via {}",
            group_id, primary, cn
        );
        let client = self.connect(cn).await?;
        client
            .execute(
                "SELECT * FROM falcon_update_foreign_server($1, $2, $3)",
                &[
                    &(group_id as i32),
                    &primary.host,
                    &(primary.port as i32),
                ],
            )
            .await?;
        Ok(())
    }

    async fn reload_foreign_server_cache(&self, cn: &Endpoint) -> CmResult<()> {
        self.execute(cn, "SELECT * FROM falcon_reload_foreign_server_cache()")
            .await
    }

    async fn start_background_service(&self, ep: &Endpoint) -> CmResult<()> {
        info!("start background service on {}", ep);
        self.execute(ep, "SELECT * FROM falcon_start_background_service()")
            .await
    }

    async fn create_extension(&self, ep: &Endpoint) -> CmResult<()> {
        self.execute(ep, "CREATE EXTENSION falcon").await
    }

    async fn insert_foreign_server(
        &self,
        ep: &Endpoint,
        group_id: u32,
        group_name: &str,
        primary: &Endpoint,
        is_local: bool,
    ) -> CmResult<()> {
        let client = self.connect(ep).await?;
        client
            .execute(
                "SELECT falcon_insert_foreign_server($1, $2, $3, $4, $5, $6)",
                &[
                    &(group_id as i32),
                    &group_name,
                    &primary.host,
                    &(primary.port as i32),
                    &is_local,
                    &self.user,
                ],
            )
            .await?;
        Ok(())
    }

    async fn build_shard_table(&self, ep: &Endpoint, shard_count: u32) -> CmResult<()> {
        let client = self.connect(ep).await?;
        client
            .execute(
                "SELECT falcon_build_shard_table($1)",
                &[&(shard_count as i32)],
            )
            .await?;
        Ok(())
    }

    async fn create_distributed_data_table(&self, ep: &Endpoint) -> CmResult<()> {
        self.execute(ep, "SELECT falcon_create_distributed_data_table()")
            .await
    }

    async fn plain_mkdir_root(&self, cn: &Endpoint) -> CmResult<()> {
        self.execute(cn, "SELECT * FROM falcon_plain_mkdir('/')").await
    }

    async fn stat_replication(&self, ep: &Endpoint) -> CmResult<Vec<ReplicationRow>> {
        let client = self.connect(ep).await?;
        let rows = client
            .query(
                "SELECT client_addr::text, state, sync_state FROM pg_stat_replication",
                &[],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ReplicationRow {
                client_addr: row.try_get::<_, Option<String>>(0)?.unwrap_or_default(),
                state: row.try_get(1)?,
                sync_state: row.try_get(2)?,
            });
        }
        Ok(out)
    }

    async fn foreign_servers(&self, cn: &Endpoint) -> CmResult<Vec<ForeignServerRow>> {
        let client = self.connect(cn).await?;
        let rows = client
            .query(
                "SELECT server_name::text, host::text FROM falcon_foreign_server",
                &[],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ForeignServerRow {
                server_name: row.try_get(0)?,
                host: row.try_get(1)?,
            });
        }
        Ok(out)
    }
}
