use std::collections::HashMap;
use std::time::Duration;

use crate::remote::Role;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP surface listens on
    pub port: u16,
    /// SQLite database for every hosted namespace
    pub database_url: String,
    /// Roles whose routes this process serves
    pub roles: Vec<Role>,
    /// Base URLs per remote role
    pub hosts: HashMap<Role, Vec<String>>,
    /// Aggregation units computed at the same time
    pub worker_concurrency: usize,
    /// Result deliveries attempted per unit
    pub worker_max_attempts: u32,
    /// Per-request timeout for remote actor calls
    pub remote_timeout: Duration,
    /// Host name recorded in execution metadata
    pub node_name: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let port = env_parse("CONDUCTOR_PORT", 8080)?;
        let local = format!("http://127.0.0.1:{port}");

        let roles = env_csv("CONDUCTOR_ROLES", &["conductor", "aggregator", "target"])
            .iter()
            .map(|name| {
                Role::parse(name)
                    .ok_or_else(|| anyhow::anyhow!("Invalid CONDUCTOR_ROLES entry '{name}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        // Roles hosted here default to this process; the rest must be configured.
        let mut hosts = HashMap::new();
        for (role, key) in [
            (Role::Concept, "CONCEPT_HOSTS"),
            (Role::Target, "TARGET_HOSTS"),
            (Role::Data, "DATA_HOSTS"),
            (Role::Aggregator, "AGGREGATOR_HOSTS"),
            (Role::Conductor, "CONDUCTOR_HOSTS"),
        ] {
            let default = if roles.contains(&role) {
                vec![local.as_str()]
            } else {
                Vec::new()
            };
            hosts.insert(role, env_csv(key, &default));
        }

        Ok(Self {
            port,
            database_url: env_str("CONDUCTOR_DATABASE_URL", "sqlite:./data/conductor.db"),
            roles,
            hosts,
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 4)?,
            worker_max_attempts: env_parse("WORKER_MAX_ATTEMPTS", 3)?,
            remote_timeout: Duration::from_secs(env_parse("REMOTE_TIMEOUT_SECS", 30)?),
            node_name: env_str("NODE_NAME", "conductor-0"),
        })
    }

    pub fn hosts_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
