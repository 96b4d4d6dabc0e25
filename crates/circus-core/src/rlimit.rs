//! Resource limits applied to spawned processes.
//!
//! Limit names are parsed into [`Rlimit`] when a process is configured, so an
//! unknown name fails before anything is forked. The limits themselves are
//! set from inside the child, between fork and exec.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;

/// A resource limit the daemon knows how to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rlimit {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Memlock,
    Nofile,
    Nproc,
    Rss,
    Stack,
    #[cfg(target_os = "linux")]
    Locks,
    #[cfg(target_os = "linux")]
    Msgqueue,
    #[cfg(target_os = "linux")]
    Nice,
    #[cfg(target_os = "linux")]
    Rtprio,
    #[cfg(target_os = "linux")]
    Sigpending,
}

impl Rlimit {
    /// Configuration name of the limit.
    pub fn name(self) -> &'static str {
        match self {
            Self::As => "as",
            Self::Core => "core",
            Self::Cpu => "cpu",
            Self::Data => "data",
            Self::Fsize => "fsize",
            Self::Memlock => "memlock",
            Self::Nofile => "nofile",
            Self::Nproc => "nproc",
            Self::Rss => "rss",
            Self::Stack => "stack",
            #[cfg(target_os = "linux")]
            Self::Locks => "locks",
            #[cfg(target_os = "linux")]
            Self::Msgqueue => "msgqueue",
            #[cfg(target_os = "linux")]
            Self::Nice => "nice",
            #[cfg(target_os = "linux")]
            Self::Rtprio => "rtprio",
            #[cfg(target_os = "linux")]
            Self::Sigpending => "sigpending",
        }
    }

    /// Sets both the soft and the hard limit for the calling process.
    ///
    /// Only async-signal-safe calls are made, so this is usable from a
    /// `pre_exec` hook.
    pub fn apply(self, value: u64) -> io::Result<()> {
        use libc::{rlimit, setrlimit};

        let limit = rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };

        // SAFETY: setrlimit only reads `limit`, which outlives the call.
        let rc = unsafe {
            match self {
                Self::As => setrlimit(libc::RLIMIT_AS, &limit),
                Self::Core => setrlimit(libc::RLIMIT_CORE, &limit),
                Self::Cpu => setrlimit(libc::RLIMIT_CPU, &limit),
                Self::Data => setrlimit(libc::RLIMIT_DATA, &limit),
                Self::Fsize => setrlimit(libc::RLIMIT_FSIZE, &limit),
                Self::Memlock => setrlimit(libc::RLIMIT_MEMLOCK, &limit),
                Self::Nofile => setrlimit(libc::RLIMIT_NOFILE, &limit),
                Self::Nproc => setrlimit(libc::RLIMIT_NPROC, &limit),
                Self::Rss => setrlimit(libc::RLIMIT_RSS, &limit),
                Self::Stack => setrlimit(libc::RLIMIT_STACK, &limit),
                #[cfg(target_os = "linux")]
                Self::Locks => setrlimit(libc::RLIMIT_LOCKS, &limit),
                #[cfg(target_os = "linux")]
                Self::Msgqueue => setrlimit(libc::RLIMIT_MSGQUEUE, &limit),
                #[cfg(target_os = "linux")]
                Self::Nice => setrlimit(libc::RLIMIT_NICE, &limit),
                #[cfg(target_os = "linux")]
                Self::Rtprio => setrlimit(libc::RLIMIT_RTPRIO, &limit),
                #[cfg(target_os = "linux")]
                Self::Sigpending => setrlimit(libc::RLIMIT_SIGPENDING, &limit),
            }
        };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl FromStr for Rlimit {
    type Err = RlimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let limit = match s.to_ascii_lowercase().as_str() {
            "as" => Self::As,
            "core" => Self::Core,
            "cpu" => Self::Cpu,
            "data" => Self::Data,
            "fsize" => Self::Fsize,
            "memlock" => Self::Memlock,
            "nofile" => Self::Nofile,
            "nproc" => Self::Nproc,
            "rss" => Self::Rss,
            "stack" => Self::Stack,
            #[cfg(target_os = "linux")]
            "locks" => Self::Locks,
            #[cfg(target_os = "linux")]
            "msgqueue" => Self::Msgqueue,
            #[cfg(target_os = "linux")]
            "nice" => Self::Nice,
            #[cfg(target_os = "linux")]
            "rtprio" => Self::Rtprio,
            #[cfg(target_os = "linux")]
            "sigpending" => Self::Sigpending,
            _ => return Err(RlimitError::Unknown(s.to_string())),
        };
        Ok(limit)
    }
}

impl fmt::Display for Rlimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur while parsing rlimit configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RlimitError {
    #[error("unknown rlimit: {0}")]
    Unknown(String),
}

/// A validated set of limits, ready to apply in a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlimitSet {
    limits: Vec<(Rlimit, u64)>,
}

impl RlimitSet {
    /// Parses a name -> value mapping.
    pub fn parse(config: &BTreeMap<String, u64>) -> Result<Self, RlimitError> {
        let limits = config
            .iter()
            .map(|(name, value)| Ok((name.parse::<Rlimit>()?, *value)))
            .collect::<Result<Vec<_>, RlimitError>>()?;
        Ok(Self { limits })
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Rlimit, u64)> {
        self.limits.iter()
    }

    /// Applies every limit in order, stopping at the first failure.
    pub fn apply_all(&self) -> io::Result<()> {
        for (limit, value) in &self.limits {
            limit.apply(*value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("nofile".parse::<Rlimit>().unwrap(), Rlimit::Nofile);
        assert_eq!("NPROC".parse::<Rlimit>().unwrap(), Rlimit::Nproc);
        assert_eq!("as".parse::<Rlimit>().unwrap(), Rlimit::As);
        assert!(matches!(
            "bogus".parse::<Rlimit>(),
            Err(RlimitError::Unknown(name)) if name == "bogus"
        ));
    }

    #[test]
    fn test_name_roundtrip() {
        for name in ["as", "core", "cpu", "data", "fsize", "memlock", "nofile", "nproc", "rss", "stack"] {
            let limit: Rlimit = name.parse().unwrap();
            assert_eq!(limit.to_string(), name);
        }
    }

    #[test]
    fn test_set_rejects_unknown_name() {
        let mut config = BTreeMap::new();
        config.insert("nofile".to_string(), 20);
        config.insert("wat".to_string(), 1);
        assert_eq!(
            RlimitSet::parse(&config),
            Err(RlimitError::Unknown("wat".to_string()))
        );
    }

    #[test]
    fn test_set_keeps_values() {
        let mut config = BTreeMap::new();
        config.insert("nofile".to_string(), 20);
        config.insert("nproc".to_string(), 30);
        let set = RlimitSet::parse(&config).unwrap();
        let limits: Vec<_> = set.iter().copied().collect();
        assert_eq!(limits, vec![(Rlimit::Nofile, 20), (Rlimit::Nproc, 30)]);
        assert!(RlimitSet::default().is_empty());
    }
}
