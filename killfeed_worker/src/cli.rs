use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "killfeed", version, about = "Tenant-isolated kill-feed ingestion worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the ingestion scheduler (default if no subcommand given).
    Run {
        /// JSON file listing server profiles.
        #[arg(long, env = "KILLFEED_PROFILES", default_value = "profiles.json")]
        profiles: PathBuf,

        /// Run a single batch, print its report and exit.
        #[arg(long)]
        once: bool,

        /// Write profiles (with advanced watermarks) back to this file after the run.
        /// Pair with `--records`, otherwise the restarted worker resumes from the
        /// saved watermarks over an empty record store.
        #[arg(long)]
        save_state: Option<PathBuf>,

        /// Player records file, loaded at startup when present and rewritten after the run.
        #[arg(long, env = "KILLFEED_RECORDS")]
        records: Option<PathBuf>,
    },

    /// Test remote connectivity for every profile. Restricted profiles are skipped.
    CheckConnection {
        #[arg(long, env = "KILLFEED_PROFILES", default_value = "profiles.json")]
        profiles: PathBuf,
    },

    /// Ingest one server once and print its leaderboard.
    Leaderboard {
        #[arg(long, env = "KILLFEED_PROFILES", default_value = "profiles.json")]
        profiles: PathBuf,

        #[arg(long)]
        tenant_id: i64,

        #[arg(long)]
        server_id: String,

        /// kills, deaths, kd, distance, streak or suicides.
        #[arg(long, default_value = "kills")]
        metric: String,

        /// Defaults to KILLFEED_LEADERBOARD_LIMIT.
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, env = "KILLFEED_RECORDS")]
        records: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}
