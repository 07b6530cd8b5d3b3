//! Process identity records.
//!
//! Every long-running process registers itself in the store under a
//! structured id. Components are `~`-separated:
//!
//! - worker: `node~pool~code~pid` (`pool` is a queue or batch pool name,
//!   `code` distinguishes slots, e.g. `u3` for unit 3)
//! - allocator: `node~pool~pid`
//! - scheduler: `node~pid`

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::store::keys;

const SEPARATOR: char = '~';

fn validate_component(raw: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = value.is_empty()
        || value
            .chars()
            .any(|c| c == SEPARATOR || c.is_whitespace() || c.is_control());
    if invalid {
        return Err(ConfigError::InvalidIdentity(raw.to_string()));
    }
    Ok(())
}

fn split_exact<'a>(raw: &'a str, n: usize) -> Result<Vec<&'a str>, ConfigError> {
    let parts: Vec<&str> = raw.split(SEPARATOR).collect();
    if parts.len() != n {
        return Err(ConfigError::InvalidIdentity(raw.to_string()));
    }
    for part in &parts {
        validate_component(raw, part)?;
    }
    Ok(parts)
}

fn parse_pid(raw: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| ConfigError::InvalidIdentity(raw.to_string()))
}

/// Common view over process identities, used by the maintainer.
pub trait ProcessIdentity: fmt::Display + FromStr<Err = ConfigError> + Send + Sync {
    /// Store set listing live processes of this kind.
    const REGISTRY: &'static str;

    fn node(&self) -> &str;

    fn pid(&self) -> u32;
}

/// Identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerImage {
    node: String,
    pool: String,
    code: String,
    pid: u32,
}

impl WorkerImage {
    pub fn new(
        node: impl Into<String>,
        pool: impl Into<String>,
        code: impl Into<String>,
        pid: u32,
    ) -> Result<Self, ConfigError> {
        let image = Self {
            node: node.into(),
            pool: pool.into(),
            code: code.into(),
            pid,
        };
        let raw = image.to_string();
        for part in [&image.node, &image.pool, &image.code] {
            validate_component(&raw, part)?;
        }
        if pid == 0 {
            return Err(ConfigError::InvalidIdentity(raw));
        }
        Ok(image)
    }

    /// Identity of the current process.
    pub fn current(
        node: impl Into<String>,
        pool: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::new(node, pool, code, std::process::id())
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn buffer_key(&self) -> String {
        keys::worker_buffer(&self.to_string())
    }

    pub fn runtime_key(&self) -> String {
        keys::worker_runtime(&self.to_string())
    }
}

impl ProcessIdentity for WorkerImage {
    const REGISTRY: &'static str = keys::WORKER_REGISTRY;

    fn node(&self) -> &str {
        &self.node
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for WorkerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}~{}~{}~{}",
            self.node, self.pool, self.code, self.pid
        )
    }
}

impl FromStr for WorkerImage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_exact(s, 4)?;
        let pid = parse_pid(s, parts[3])?;
        Self::new(parts[0], parts[1], parts[2], pid)
    }
}

/// Identity of a batch allocator process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatorImage {
    node: String,
    pool: String,
    pid: u32,
}

impl AllocatorImage {
    pub fn new(
        node: impl Into<String>,
        pool: impl Into<String>,
        pid: u32,
    ) -> Result<Self, ConfigError> {
        let image = Self {
            node: node.into(),
            pool: pool.into(),
            pid,
        };
        let raw = image.to_string();
        validate_component(&raw, &image.node)?;
        validate_component(&raw, &image.pool)?;
        if pid == 0 {
            return Err(ConfigError::InvalidIdentity(raw));
        }
        Ok(image)
    }

    pub fn current(node: impl Into<String>, pool: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(node, pool, std::process::id())
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }
}

impl ProcessIdentity for AllocatorImage {
    const REGISTRY: &'static str = keys::ALLOCATOR_REGISTRY;

    fn node(&self) -> &str {
        &self.node
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for AllocatorImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}", self.node, self.pool, self.pid)
    }
}

impl FromStr for AllocatorImage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_exact(s, 3)?;
        let pid = parse_pid(s, parts[2])?;
        Self::new(parts[0], parts[1], pid)
    }
}

/// Identity of a scheduler process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulerImage {
    node: String,
    pid: u32,
}

impl SchedulerImage {
    pub fn new(node: impl Into<String>, pid: u32) -> Result<Self, ConfigError> {
        let image = Self {
            node: node.into(),
            pid,
        };
        let raw = image.to_string();
        validate_component(&raw, &image.node)?;
        if pid == 0 {
            return Err(ConfigError::InvalidIdentity(raw));
        }
        Ok(image)
    }

    pub fn current(node: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(node, std::process::id())
    }
}

impl ProcessIdentity for SchedulerImage {
    const REGISTRY: &'static str = keys::SCHEDULER_REGISTRY;

    fn node(&self) -> &str {
        &self.node
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for SchedulerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.node, self.pid)
    }
}

impl FromStr for SchedulerImage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_exact(s, 2)?;
        let pid = parse_pid(s, parts[1])?;
        Self::new(parts[0], pid)
    }
}
