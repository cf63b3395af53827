//! Environment-driven configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DELAY_VAR: &str = "MEMPROF_DELAY_STARTUP";
pub const PERIOD_VAR: &str = "MEMPROF_PERIOD_US";
pub const OUT_VAR: &str = "MEMPROF_OUT";
pub const VERBOSE_VAR: &str = "MEMPROF_VERBOSE";
pub const DUMP_VAR: &str = "MEMPROF_DUMP_SMAPS_AT_EXIT";
/// Older name for [`DUMP_VAR`]; being set at all turns the dump on.
pub const LEGACY_DUMP_VAR: &str = "LIBALLOCS_DUMP_SMAPS_AT_EXIT";
pub const CLEAR_REFS_VAR: &str = "MEMPROF_CLEAR_REFS";

const DEFAULT_PERIOD_US: u64 = 1000 * 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected an integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("MEMPROF_PERIOD_US must be greater than zero")]
    ZeroPeriod,
}

/// Where sample records go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Output {
    #[default]
    Stderr,
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Pause before the first sample, to give time to attach a debugger.
    pub startup_delay: Duration,
    /// CPU time between samples.
    pub period: Duration,
    pub output: Output,
    /// Print a record per mapping, not only the totals.
    pub verbose: bool,
    /// Copy the raw report to the output once at exit.
    pub dump_at_exit: bool,
    /// Clear referenced bits after each sample.
    pub clear_refs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            startup_delay: Duration::ZERO,
            period: Duration::from_micros(DEFAULT_PERIOD_US),
            output: Output::Stderr,
            verbose: false,
            dump_at_exit: false,
            clear_refs: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from any variable lookup; unset variables keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(secs) = number(&lookup, DELAY_VAR)? {
            config.startup_delay = Duration::from_secs(secs);
        }
        if let Some(us) = number(&lookup, PERIOD_VAR)? {
            if us == 0 {
                return Err(ConfigError::ZeroPeriod);
            }
            config.period = Duration::from_micros(us);
        }
        if let Some(path) = lookup(OUT_VAR).filter(|p| !p.is_empty()) {
            config.output = Output::Path(PathBuf::from(path));
        }
        if let Some(on) = flag(&lookup, VERBOSE_VAR) {
            config.verbose = on;
        }
        match flag(&lookup, DUMP_VAR) {
            Some(on) => config.dump_at_exit = on,
            None => config.dump_at_exit = lookup(LEGACY_DUMP_VAR).is_some(),
        }
        if let Some(on) = flag(&lookup, CLEAR_REFS_VAR) {
            config.clear_refs = on;
        }
        Ok(config)
    }
}

fn number<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}

/// On/off switches: any non-zero integer is on. Anything else is off, with a
/// warning, so a sloppy value never stops the host from starting.
fn flag<F>(lookup: &F, var: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(var)?;
    match value.trim().parse::<i64>() {
        Ok(n) => Some(n != 0),
        Err(_) => {
            warn!("{}: expected an integer, got {:?}; treating as 0", var, value);
            Some(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| env.get(var).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.period, Duration::from_secs(1));
        assert_eq!(c.output, Output::Stderr);
        assert!(c.clear_refs);
    }

    #[test]
    fn reads_every_option() {
        let c = config(&[
            (DELAY_VAR, "3"),
            (PERIOD_VAR, "250000"),
            (OUT_VAR, "/tmp/memprof.out"),
            (VERBOSE_VAR, "1"),
            (DUMP_VAR, "1"),
            (CLEAR_REFS_VAR, "0"),
        ])
        .unwrap();
        assert_eq!(c.startup_delay, Duration::from_secs(3));
        assert_eq!(c.period, Duration::from_millis(250));
        assert_eq!(c.output, Output::Path(PathBuf::from("/tmp/memprof.out")));
        assert!(c.verbose);
        assert!(c.dump_at_exit);
        assert!(!c.clear_refs);
    }

    #[test]
    fn zero_means_off() {
        let c = config(&[(VERBOSE_VAR, "0"), (DUMP_VAR, " 0 ")]).unwrap();
        assert!(!c.verbose);
        assert!(!c.dump_at_exit);
    }

    #[test]
    fn malformed_numbers_are_reported() {
        assert_eq!(
            config(&[(PERIOD_VAR, "fast")]),
            Err(ConfigError::InvalidNumber {
                var: PERIOD_VAR,
                value: "fast".to_string()
            })
        );
        assert!(config(&[(DELAY_VAR, "")]).is_err());
    }

    #[test]
    fn non_numeric_switches_are_off_not_errors() {
        for value in ["true", "yes", ""] {
            let c = config(&[(VERBOSE_VAR, value), (DUMP_VAR, value), (CLEAR_REFS_VAR, value)])
                .unwrap();
            assert!(!c.verbose, "{:?}", value);
            assert!(!c.dump_at_exit, "{:?}", value);
            assert!(!c.clear_refs, "{:?}", value);
        }
        assert!(config(&[(VERBOSE_VAR, "-1")]).unwrap().verbose);
    }

    #[test]
    fn legacy_dump_variable_is_honoured() {
        assert!(config(&[(LEGACY_DUMP_VAR, "1")]).unwrap().dump_at_exit);
        assert!(config(&[(LEGACY_DUMP_VAR, "")]).unwrap().dump_at_exit);
        assert!(!config(&[(LEGACY_DUMP_VAR, "1"), (DUMP_VAR, "0")])
            .unwrap()
            .dump_at_exit);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(config(&[(PERIOD_VAR, "0")]), Err(ConfigError::ZeroPeriod));
    }
}
