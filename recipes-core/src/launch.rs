//! Launch environment for distributed runs.
//!
//! The launcher contract is a handful of environment variables. Missing ones
//! are filled with single-process defaults, then the whole set is parsed once
//! into a [`LaunchEnv`] that gets passed around instead of re-reading the
//! process environment.

use crate::error::EnvError;
use serde::Serialize;

pub const RANK: &str = "RANK";
pub const WORLD_SIZE: &str = "WORLD_SIZE";
pub const MASTER_PORT: &str = "MASTER_PORT";
pub const MASTER_ADDR: &str = "MASTER_ADDR";
pub const LOCAL_RANK: &str = "LOCAL_RANK";
pub const RUN_ID: &str = "TORCHELASTIC_RUN_ID";

const JOB_NAME_PREFIX: &str = "test-job-";

const VARIABLES: [&str; 6] = [RANK, WORLD_SIZE, MASTER_PORT, MASTER_ADDR, LOCAL_RANK, RUN_ID];

/// Defaults applied to absent launch variables, in application order.
pub fn default_values() -> [(&'static str, String); 6] {
    [
        (RANK, "0".to_string()),
        (WORLD_SIZE, "1".to_string()),
        (MASTER_PORT, "29830".to_string()),
        (MASTER_ADDR, "localhost".to_string()),
        (LOCAL_RANK, "0".to_string()),
        (RUN_ID, short_run_id(&uuid::Uuid::new_v4().to_string()).to_string()),
    ]
}

/// Compute which defaults would be applied given the current variables.
///
/// Variables that `lookup` already resolves are never part of the result.
pub fn missing_defaults<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    default_values()
        .into_iter()
        .filter(|(name, _)| lookup(name).is_none())
        .collect()
}

/// Fill absent launch variables in the process environment.
///
/// Must run before any other thread exists (in particular before the async
/// runtime is built). Returns the names that were defaulted.
pub fn set_env() -> Vec<&'static str> {
    // presence only; a value that is not UTF-8 still counts as supplied
    let missing = missing_defaults(|name| {
        std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
    });
    let mut applied = Vec::with_capacity(missing.len());
    for (name, value) in missing {
        // SAFETY: called once at process start, before the runtime spawns
        // threads, so nothing can observe the environment concurrently.
        unsafe { std::env::set_var(name, &value) };
        applied.push(name);
    }
    applied
}

/// First hyphen-delimited segment of a run id.
pub fn short_run_id(run_id: &str) -> &str {
    run_id.split('-').next().unwrap_or(run_id)
}

/// Parsed snapshot of the launch variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub run_id: String,
}

impl LaunchEnv {
    /// Parse the launch variables, treating absent ones as their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = default_values();
        let get = |name: &str| -> String {
            lookup(name).unwrap_or_else(|| {
                defaults
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
        };

        let rank = parse_int::<usize>(RANK, &get(RANK))?;
        let world_size = parse_int::<usize>(WORLD_SIZE, &get(WORLD_SIZE))?;
        let local_rank = parse_int::<usize>(LOCAL_RANK, &get(LOCAL_RANK))?;
        let master_port = parse_int::<u16>(MASTER_PORT, &get(MASTER_PORT))?;

        if world_size == 0 {
            return Err(EnvError::EmptyWorld);
        }
        if rank >= world_size {
            return Err(EnvError::RankOutOfRange { rank, world_size });
        }

        Ok(Self {
            rank,
            world_size,
            local_rank,
            master_addr: get(MASTER_ADDR),
            master_port,
            run_id: get(RUN_ID),
        })
    }

    /// Parse the launch variables from the process environment.
    ///
    /// A variable that is set but not valid UTF-8 is an error, never a
    /// reason to fall back to its default.
    pub fn from_process() -> Result<Self, EnvError> {
        let mut vars = Vec::with_capacity(VARIABLES.len());
        for name in VARIABLES {
            if let Some(value) = process_var(name)? {
                vars.push((name, value));
            }
        }
        Self::from_lookup(|name| {
            vars.iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
        })
    }

    /// Human-readable job name derived from the run id.
    pub fn job_name(&self) -> String {
        format!("{JOB_NAME_PREFIX}{}", short_run_id(&self.run_id))
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

fn process_var(name: &str) -> Result<Option<String>, EnvError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(EnvError::NotUnicode {
            name: name.to_string(),
        }),
    }
}

fn parse_int<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, EnvError> {
    value.trim().parse::<T>().map_err(|_| EnvError::NotAnInteger {
        name: name.to_string(),
        value: value.to_string(),
    })
}
