use pool_lib::format_unit_size;
use std::fmt;

pub const MAX_DEFAULT_GAP: u64 = 4 * pool_lib::GIB;

/// Space usage of the pool. The fields are read one after another from the
/// allocator and the sweeper, so they need not describe a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRecord {
    pub total: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    pub lru_seconds: u64,
    pub gap: u64,
}

impl SpaceRecord {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Gap used when none is configured: a quarter of the pool, at most 4 GiB.
pub fn default_gap(total: u64) -> u64 {
    (total / 4).min(MAX_DEFAULT_GAP)
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

impl fmt::Display for SpaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Disk space")?;
        writeln!(f, "    Total    : {}", format_unit_size(self.total))?;
        writeln!(
            f,
            "    Used     : {}    [{:.2}]",
            self.used(),
            percent(self.used(), self.total)
        )?;
        writeln!(
            f,
            "    Free     : {}    Gap : {}",
            self.free, self.gap
        )?;
        writeln!(
            f,
            "    Precious : {}    [{:.2}]",
            self.precious,
            percent(self.precious, self.total)
        )?;
        writeln!(
            f,
            "    Removable: {}    [{:.2}]",
            self.removable,
            percent(self.removable, self.total)
        )?;
        write!(f, "    LRU      : {} sec", self.lru_seconds)
    }
}
