#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Command-line adapter for belief nests.
//!
//! `inspect` and `verify` work offline on the checkpoint files of a branch
//! directory; `demo` drives a small nest on an in-memory voxel world.

mod checkpoints;
mod demo;

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use belief_nest_hierarchy::WorldConfig;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Belief nest checkpoint tooling.
#[derive(Debug, Parser)]
#[command(name = "belief-nest", version, about)]
struct Cli {
    /// TOML world configuration; defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Summarize the records checkpointed in a branch directory.
    Inspect {
        /// Branch directory, e.g. `ckpt/world[default]`.
        branch_dir: PathBuf,
        /// Only inspect the subjective record of this agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Replay every history file onto the previous state and compare the
    /// result with the state written alongside it.
    Verify {
        /// Branch directory, e.g. `ckpt/world[default]`.
        branch_dir: PathBuf,
    },
    /// Run a nest on an in-memory world and dump it.
    Demo {
        /// Agents joining the root world.
        #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
        agents: Vec<String>,
        /// Ticks to observe before dumping.
        #[arg(long, default_value_t = 5)]
        ticks: u32,
        /// X offset of the child world of the first agent.
        #[arg(long, default_value_t = 100)]
        child_offset_x: i32,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WorldConfig> {
    let Some(path) = path else {
        return Ok(WorldConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Inspect { branch_dir, agent } => {
            let report = checkpoints::inspect(&branch_dir, agent.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Verify { branch_dir } => {
            let report = checkpoints::verify(&branch_dir, config.observation.position_memory)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            anyhow::ensure!(
                report.iter().all(|step| step.matches),
                "replayed history diverges from the stored state"
            );
        }
        Command::Demo {
            agents,
            ticks,
            child_offset_x,
        } => {
            let status = demo::run(config, &agents, ticks, child_offset_x).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "belief-nest",
            "verify",
            "ckpt/world[default]",
            "--config",
            "nest.toml",
            "--log-level",
            "debug",
        ])
        .expect("valid command line");
        assert_eq!(cli.config, Some(PathBuf::from("nest.toml")));
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Command::Verify { .. }));
    }

    #[test]
    fn demo_agents_are_comma_separated() {
        let cli = Cli::try_parse_from(["belief-nest", "demo", "--agents", "ann,ben,cy"])
            .expect("valid command line");
        match cli.command {
            Command::Demo { agents, ticks, .. } => {
                assert_eq!(agents, ["ann", "ben", "cy"]);
                assert_eq!(ticks, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_files_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nest.toml");
        fs::write(
            &path,
            "port = 25570\nckpt_dir = \"runs\"\n\n[observation]\nblock_obs_interval = 4\n",
        )
        .expect("config written");

        let config = load_config(Some(path.as_path())).expect("config loads");
        assert_eq!(config.port, 25570);
        assert_eq!(config.ckpt_dir, PathBuf::from("runs"));
        assert_eq!(config.observation.block_obs_interval, 4);
        assert_eq!(config.admin_agent_name, "admin");
        assert_eq!(load_config(None).expect("defaults"), WorldConfig::default());
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nest.toml");
        fs::write(&path, "port = \"high\"\n").expect("config written");
        let err = load_config(Some(path.as_path())).expect_err("port must be a number");
        assert!(err.to_string().contains("invalid config"));
    }
}
