use clap::ValueEnum;

/// What happens to the vault copy when the source file disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackupMode {
    /// Keep the vault copy.
    Basic,
    /// Delete the vault copy and forget the path.
    Mirror,
}

/// How aggressively mirror mode reconciles on a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MirrorReconcile {
    /// Walk every tracked path and delete vault orphans immediately.
    Strict,
    /// Only honour deletions observed from now on.
    FutureOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VaultKind {
    Local,
    S3,
}

/// When change handling runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Realtime,
    EveryMinutes(u64),
}

impl Schedule {
    /// Parses `realtime` or `every:<minutes>`.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.eq_ignore_ascii_case("realtime") {
            return Ok(Self::Realtime);
        }
        s.strip_prefix("every:")
            .and_then(|m| m.parse::<u64>().ok())
            .filter(|m| *m > 0)
            .map(Self::EveryMinutes)
            .ok_or_else(|| format!("Invalid schedule: {s} (expected `realtime` or `every:<minutes>`)"))
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::EveryMinutes(m) => write!(f, "every:{m}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parsing() {
        assert_eq!(Schedule::parse("realtime").unwrap(), Schedule::Realtime);
        assert_eq!(Schedule::parse("every:15").unwrap(), Schedule::EveryMinutes(15));
        assert!(Schedule::parse("every:0").is_err());
        assert!(Schedule::parse("hourly").is_err());
    }
}
