//! `/proc/<pid>/stat` parsing.

use std::path::Path;

/// The fields of `/proc/<pid>/stat` the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Scheduler state (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

impl ProcStat {
    /// Read the stat of `pid`. `None` if the process does not exist or the
    /// file is unparsable.
    #[must_use]
    pub fn read(pid: u32) -> Option<Self> {
        Self::read_from(&Path::new("/proc").join(pid.to_string()).join("stat"))
    }

    fn read_from(path: &Path) -> Option<Self> {
        std::fs::read_to_string(path).ok().as_deref().and_then(Self::parse)
    }

    /// Parse the content of a stat file.
    ///
    /// The command name is parenthesised and may itself contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let rest = &content[content.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();

        // Field 3 is the state; start time is field 22.
        let state = fields.next()?.chars().next()?;
        let start_time = fields.nth(18)?.parse().ok()?;
        Some(Self { state, start_time })
    }

    /// Not a zombie and not dead.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        !matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Start time of a live process.
#[must_use]
pub fn start_time(pid: u32) -> Option<u64> {
    ProcStat::read(pid)
        .filter(ProcStat::is_alive)
        .map(|stat| stat.start_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 101 0 0 0 \
                        2 1 0 0 20 0 1 0 987654 5000000 200 18446744073709551615";

    #[test]
    fn parse_with_parentheses_in_name() {
        let stat = ProcStat::parse(STAT).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.start_time, 987_654);
        assert!(stat.is_alive());
    }

    #[test]
    fn zombie_is_not_alive() {
        let stat = ProcStat::parse(&STAT.replace(") S ", ") Z ")).unwrap();
        assert!(!stat.is_alive());
    }

    #[test]
    fn truncated_stat_is_rejected() {
        assert_eq!(ProcStat::parse("1 (init) S 0 1"), None);
        assert_eq!(ProcStat::parse("garbage"), None);
    }

    #[test]
    fn own_process_is_readable() {
        let stat = ProcStat::read(std::process::id()).unwrap();
        assert!(stat.is_alive());
        assert_eq!(start_time(std::process::id()), Some(stat.start_time));
    }
}
