//! The environment schema passed from master to slave.
//!
//! All values are validated when parsed. A missing slave marker means the
//! process acts as master; a present marker with malformed companions is an
//! error rather than a guess.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Error;

pub(crate) const ENV_IS_SLAVE: &str = "OVERSEER_IS_SLAVE";
pub(crate) const ENV_SLAVE_ID: &str = "OVERSEER_SLAVE_ID";
pub(crate) const ENV_NUM_FDS: &str = "OVERSEER_NUM_FDS";
pub(crate) const ENV_BIN_PATH: &str = "OVERSEER_BIN_PATH";
pub(crate) const ENV_BIN_ID: &str = "OVERSEER_BIN_ID";
pub(crate) const ENV_READY_FD: &str = "OVERSEER_READY_FD";
pub(crate) const ENV_RESTART_SIGNAL: &str = "OVERSEER_RESTART_SIGNAL";
pub(crate) const ENV_BIN_CHECK: &str = "OVERSEER_BIN_CHECK";
pub(crate) const ENV_BIN_CHECK_LEGACY: &str = "WADDLE_UPGRADE_BIN_CHECK";

/// Snapshot of the supervision-related environment variables.
#[derive(Debug, Clone, Default)]
pub(crate) struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter(|(k, _)| k.starts_with("OVERSEER_") || k == ENV_BIN_CHECK_LEGACY)
            .collect()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Token to echo when an upgrading master is probing this binary.
    pub fn sanity_token(&self) -> Option<&str> {
        [ENV_BIN_CHECK, ENV_BIN_CHECK_LEGACY]
            .into_iter()
            .filter_map(|key| self.get(key))
            .find(|token| !token.is_empty())
    }

    fn required(&self, key: &str) -> Result<&str, Error> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Environment(format!("{key} missing")))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T, Error> {
        let raw = self.required(key)?;
        raw.parse()
            .map_err(|_| Error::Environment(format!("{key}={raw:?} is not valid")))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Everything a slave learns from its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveEnv {
    pub id: String,
    pub num_fds: usize,
    pub bin_path: PathBuf,
    pub bin_id: String,
    pub ready_fd: Option<i32>,
    pub restart_signal: i32,
}

impl SlaveEnv {
    fn parse(env: &Environment) -> Result<Self, Error> {
        let ready_fd = match env.get(ENV_READY_FD) {
            Some(_) => Some(env.parsed::<i32>(ENV_READY_FD)?),
            None => None,
        };
        let restart_signal = env.parsed::<i32>(ENV_RESTART_SIGNAL)?;
        if restart_signal <= 0 {
            return Err(Error::Environment(format!(
                "{ENV_RESTART_SIGNAL}={restart_signal} is not a signal"
            )));
        }
        Ok(Self {
            id: env.required(ENV_SLAVE_ID)?.to_string(),
            num_fds: env.parsed(ENV_NUM_FDS)?,
            bin_path: PathBuf::from(env.required(ENV_BIN_PATH)?),
            bin_id: env.get(ENV_BIN_ID).unwrap_or_default().to_string(),
            ready_fd,
            restart_signal,
        })
    }
}

/// Which side of the supervision protocol this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave(SlaveEnv),
    /// Supervision unavailable; the program runs directly.
    Disabled,
}

impl Role {
    /// Resolve the role from the environment. `Disabled` when the platform
    /// cannot supervise, whatever the environment says.
    pub(crate) fn resolve(env: &Environment, supported: bool) -> Result<Role, Error> {
        if !supported {
            return Ok(Role::Disabled);
        }
        match env.get(ENV_IS_SLAVE) {
            Some("1") => SlaveEnv::parse(env).map(Role::Slave),
            _ => Ok(Role::Master),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_IS_SLAVE, "1"),
            (ENV_SLAVE_ID, "3"),
            (ENV_NUM_FDS, "2"),
            (ENV_BIN_PATH, "/usr/local/bin/app"),
            (ENV_BIN_ID, "abc123"),
            (ENV_READY_FD, "5"),
            (ENV_RESTART_SIGNAL, "12"),
        ]
    }

    #[test]
    fn test_absent_marker_is_master() {
        let env = Environment::default();
        assert_eq!(Role::resolve(&env, true).unwrap(), Role::Master);
    }

    #[test]
    fn test_marker_other_than_one_is_master() {
        let env: Environment = [(ENV_IS_SLAVE, "yes")].into_iter().collect();
        assert_eq!(Role::resolve(&env, true).unwrap(), Role::Master);
    }

    #[test]
    fn test_unsupported_platform_is_disabled() {
        let env: Environment = slave_env().into_iter().collect();
        assert_eq!(Role::resolve(&env, false).unwrap(), Role::Disabled);
    }

    #[test]
    fn test_slave_env_parsed() {
        let env: Environment = slave_env().into_iter().collect();
        let Role::Slave(slave) = Role::resolve(&env, true).unwrap() else {
            panic!("expected slave role");
        };
        assert_eq!(slave.id, "3");
        assert_eq!(slave.num_fds, 2);
        assert_eq!(slave.bin_path, PathBuf::from("/usr/local/bin/app"));
        assert_eq!(slave.bin_id, "abc123");
        assert_eq!(slave.ready_fd, Some(5));
        assert_eq!(slave.restart_signal, 12);
    }

    #[test]
    fn test_malformed_fd_count_fails_closed() {
        let env: Environment = slave_env()
            .into_iter()
            .map(|(k, v)| if k == ENV_NUM_FDS { (k, "two") } else { (k, v) })
            .collect();
        assert!(matches!(Role::resolve(&env, true), Err(Error::Environment(_))));
    }

    #[test]
    fn test_missing_slave_id_fails_closed() {
        let env: Environment = slave_env()
            .into_iter()
            .filter(|(k, _)| *k != ENV_SLAVE_ID)
            .collect();
        assert!(matches!(Role::resolve(&env, true), Err(Error::Environment(_))));
    }

    #[test]
    fn test_sanity_token_prefers_primary() {
        let env: Environment = [(ENV_BIN_CHECK, "primary"), (ENV_BIN_CHECK_LEGACY, "legacy")]
            .into_iter()
            .collect();
        assert_eq!(env.sanity_token(), Some("primary"));
    }

    #[test]
    fn test_sanity_token_legacy_alias() {
        let env: Environment = [(ENV_BIN_CHECK, ""), (ENV_BIN_CHECK_LEGACY, "legacy")]
            .into_iter()
            .collect();
        assert_eq!(env.sanity_token(), Some("legacy"));
        assert_eq!(Environment::default().sanity_token(), None);
    }
}
