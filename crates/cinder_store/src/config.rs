//! Node CLI and runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::slot::SlotId;
use crate::slot_migrate::{MigrationJob, DEFAULT_PIPELINE_SIZE, DEFAULT_SEQUENCE_GAP};

/// How slot data travels to the destination during migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MigrationType {
    /// Replay type-aware restore commands on the destination.
    CommandReplay,
    /// Ship opaque storage batches, one RESP acknowledgement per batch.
    RawKv,
}

/// CLI options for running a node.
#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    #[arg(long, default_value = "127.0.0.1:6379")]
    pub listen: SocketAddr,

    #[arg(long)]
    pub data_dir: PathBuf,

    /// Clients (and migration peers) must AUTH with this password when set.
    #[arg(long, env = "CINDER_REQUIREPASS")]
    pub requirepass: Option<String>,

    /// Migration speed cap in commands per second; 0 means unlimited.
    #[arg(long, env = "CINDER_MIGRATE_SPEED", default_value_t = 0)]
    pub migrate_speed: u64,

    /// Commands per migration pipeline.
    #[arg(long, env = "CINDER_MIGRATE_PIPELINE_SIZE", default_value_t = DEFAULT_PIPELINE_SIZE)]
    pub migrate_pipeline_size: u64,

    /// WAL sequence gap below which the catch-up phase stops looping.
    #[arg(long, env = "CINDER_MIGRATE_SEQUENCE_GAP", default_value_t = DEFAULT_SEQUENCE_GAP)]
    pub migrate_sequence_gap: u64,

    /// Raw-KV batch size cap in KiB.
    #[arg(long, env = "CINDER_MIGRATE_BATCH_SIZE_KB", default_value_t = 16 * 1024)]
    pub migrate_batch_size_kb: usize,

    /// Raw-KV outgoing byte rate cap in MiB/s; 0 means unlimited.
    #[arg(long, env = "CINDER_MIGRATE_BATCH_RATE_LIMIT_MB", default_value_t = 0)]
    pub migrate_batch_rate_limit_mb: u64,

    /// Migration transport.
    #[arg(long, env = "CINDER_MIGRATE_TYPE", value_enum, default_value = "command-replay")]
    pub migrate_type: MigrationType,
}

impl NodeArgs {
    /// Materialize an immutable migration job from the current settings.
    pub fn migration_job(&self, slot: SlotId, dst_ip: String, dst_port: u16) -> MigrationJob {
        MigrationJob {
            slot,
            dst_ip,
            dst_port,
            max_speed: self.migrate_speed,
            max_pipeline_size: if self.migrate_pipeline_size == 0 {
                DEFAULT_PIPELINE_SIZE
            } else {
                self.migrate_pipeline_size
            },
            seq_gap_limit: if self.migrate_sequence_gap == 0 {
                DEFAULT_SEQUENCE_GAP
            } else {
                self.migrate_sequence_gap
            },
            migration_type: self.migrate_type,
            batch_max_bytes: self.migrate_batch_size_kb.max(1) * 1024,
            batch_bytes_per_sec: self.migrate_batch_rate_limit_mb * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> NodeArgs {
        let mut argv = vec!["cinder-store", "--data-dir", "/tmp/x"];
        argv.extend_from_slice(extra);
        NodeArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = parse(&[]);
        assert_eq!(args.migrate_speed, 0);
        assert_eq!(args.migrate_pipeline_size, 16);
        assert_eq!(args.migrate_sequence_gap, 10_000);
        assert_eq!(args.migrate_type, MigrationType::CommandReplay);
    }

    #[test]
    fn zero_tunables_fall_back_to_defaults_in_jobs() {
        let args = parse(&["--migrate-pipeline-size", "0", "--migrate-sequence-gap", "0"]);
        let job = args.migration_job(7, "10.0.0.9".into(), 6380);
        assert_eq!(job.max_pipeline_size, DEFAULT_PIPELINE_SIZE);
        assert_eq!(job.seq_gap_limit, DEFAULT_SEQUENCE_GAP);
        assert_eq!(job.slot, 7);
    }

    #[test]
    fn migrate_type_parses_raw_kv() {
        let args = parse(&["--migrate-type", "raw-kv"]);
        assert_eq!(args.migrate_type, MigrationType::RawKv);
    }
}
