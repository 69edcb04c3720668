use log::{info, warn};
use pool_lib::{
    format_unit_size, parse_unit_size, unix_millis, EntryState, PnfsId, PoolError, PoolResult,
};
use pool_p2p::CompanionRegistry;
use replica_store::{CacheEntry, FaultEvent, FaultListener, Repository};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const DEFAULT_STICKY_OWNER: &str = "system";

const HELP: &str = "info\n\
rep ls [-l=s|p|u|nc|e|c] [<pnfsid> ...]\n\
rep sticky ls <pnfsid>\n\
rep set sticky <pnfsid> on|off [-o=<owner>] [-l=<millis>]\n\
rep set precious|cached|broken <pnfsid>\n\
rep rm <pnfsid> [-force]\n\
set max diskspace <size>[k|m|g|t]|Infinity\n\
set gap <size>[k|m|g|t]\n\
p2p ls\n";

/// Remembers the last fault the repository reported, for `info`.
#[derive(Default)]
pub struct FaultStatus {
    last: Mutex<Option<FaultEvent>>,
}

impl FaultStatus {
    pub fn last_fault(&self) -> Option<FaultEvent> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl FaultListener for FaultStatus {
    fn fault_occurred(&self, event: &FaultEvent) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(event.clone());
    }
}

struct Args<'a> {
    positional: Vec<&'a str>,
    options: HashMap<&'a str, Option<&'a str>>,
}

impl<'a> Args<'a> {
    fn parse(tokens: &[&'a str]) -> Self {
        let mut positional = Vec::new();
        let mut options = HashMap::new();
        for &token in tokens {
            match token.strip_prefix('-') {
                Some(option) if !option.is_empty() => match option.split_once('=') {
                    Some((name, value)) => {
                        options.insert(name, Some(value));
                    }
                    None => {
                        options.insert(option, None);
                    }
                },
                _ => positional.push(token),
            }
        }
        Self {
            positional,
            options,
        }
    }

    fn value(&self, name: &str) -> Option<&'a str> {
        self.options.get(name).copied().flatten()
    }

    fn has(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }
}

fn parse_id(s: &str) -> PoolResult<PnfsId> {
    s.parse::<PnfsId>()
}

/// Renders a replica as `<id> <flags> <size> si={<storage class>}`.
pub fn format_entry(entry: &CacheEntry) -> String {
    let flag = |set: bool, c: char| if set { c } else { '-' };
    let state = entry.state;
    let flags: String = [
        flag(state == EntryState::Cached, 'C'),
        flag(state == EntryState::Precious, 'P'),
        flag(state == EntryState::FromClient, 'C'),
        flag(state == EntryState::FromStore, 'S'),
        '-',
        '-',
        flag(state == EntryState::Removed && entry.link_count > 0, 'R'),
        flag(state.is_gone(), 'D'),
        flag(entry.is_sticky(), 'X'),
        flag(state == EntryState::Broken, 'E'),
        '-',
    ]
    .iter()
    .collect();
    format!(
        "{} <{}L(0)[{}]> {} si={{{}}}",
        entry.pnfs_id,
        flags,
        entry.link_count,
        entry.size,
        entry.attributes.storage_info.storage_class
    )
}

/// Filter letters of `rep ls -l`.
fn matches_filter(entry: &CacheEntry, filter: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let not_cached = filter.contains("nc");
    let cached = filter.replace("nc", "").contains('c');
    (not_cached && entry.state != EntryState::Cached)
        || (filter.contains('p') && entry.state == EntryState::Precious)
        || (filter.contains('s') && entry.is_sticky())
        || (filter.contains('e') && entry.state == EntryState::Broken)
        || (cached && entry.state == EntryState::Cached)
        || (filter.contains('u') && entry.link_count > 0)
}

fn valid_stickies(entry: &CacheEntry) -> String {
    let now = unix_millis();
    entry
        .sticky_records
        .iter()
        .filter(|s| s.is_valid_at(now))
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Interprets the administrative commands of a pool.
pub struct AdminShell {
    repository: Arc<Repository>,
    registry: Arc<CompanionRegistry>,
    faults: Arc<FaultStatus>,
}

impl AdminShell {
    pub fn new(
        repository: Arc<Repository>,
        registry: Arc<CompanionRegistry>,
        faults: Arc<FaultStatus>,
    ) -> Self {
        Self {
            repository,
            registry,
            faults,
        }
    }

    pub async fn execute(&self, line: &str) -> PoolResult<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["help"] => Ok(HELP.to_string()),
            ["info"] => Ok(self.info().await),
            ["rep", "ls", rest @ ..] => self.rep_ls(Args::parse(rest)).await,
            ["rep", "sticky", "ls", id] => {
                let entry = self.repository.get_entry(&parse_id(id)?).await?;
                Ok(valid_stickies(&entry))
            }
            ["rep", "set", "sticky", rest @ ..] => self.rep_set_sticky(Args::parse(rest)).await,
            ["rep", "set", "precious", id] => self.rep_set_state(id, EntryState::Precious).await,
            ["rep", "set", "cached", id] => self.rep_set_state(id, EntryState::Cached).await,
            ["rep", "set", "broken", id] => self.rep_set_state(id, EntryState::Broken).await,
            ["rep", "rm", rest @ ..] => self.rep_rm(Args::parse(rest)).await,
            ["set", "max", "diskspace", size] => {
                let bytes = parse_unit_size(size)?;
                self.repository.set_runtime_max_disk_space(Some(bytes))?;
                info!("AdminShell: max disk space set to {}", format_unit_size(bytes));
                Ok(String::new())
            }
            ["set", "gap", size] => {
                self.repository.set_gap(Some(parse_unit_size(size)?));
                Ok(String::new())
            }
            ["p2p", "ls"] => Ok(self.registry.render()),
            [] => Ok(String::new()),
            _ => Err(PoolError::InvalidParam(format!("unknown command: {}", line.trim()))),
        }
    }

    async fn info(&self) -> String {
        let mut info = self.repository.get_info().await;
        if let Some(fault) = self.faults.last_fault() {
            info.push_str(&format!(
                "\nFault : {:?} by {}: {}",
                fault.action, fault.source, fault.message
            ));
        }
        info
    }

    async fn rep_ls(&self, args: Args<'_>) -> PoolResult<String> {
        let mut out = String::new();
        if !args.positional.is_empty() {
            let mut missing = String::new();
            for id in &args.positional {
                match self.repository.get_entry(&parse_id(id)?).await {
                    Ok(entry) => {
                        out.push_str(&format_entry(&entry));
                        out.push('\n');
                    }
                    Err(e) if e.is_not_found() => {
                        missing.push_str(&e.to_string());
                        missing.push('\n');
                    }
                    Err(e) => return Err(e),
                }
            }
            out.push_str(&missing);
            return Ok(out);
        }

        let filter = args.value("l").unwrap_or("");
        for id in self.repository.list().await {
            let entry = match self.repository.get_entry(&id).await {
                Ok(entry) => entry,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if matches_filter(&entry, filter) {
                out.push_str(&format_entry(&entry));
                out.push('\n');
            }
        }
        Ok(out)
    }

    async fn rep_set_sticky(&self, args: Args<'_>) -> PoolResult<String> {
        let [id, state] = args.positional.as_slice() else {
            return Err(PoolError::InvalidParam(
                "usage: rep set sticky <pnfsid> on|off [-o=<owner>] [-l=<millis>]".to_string(),
            ));
        };
        let pnfs_id = parse_id(id)?;
        let owner = args.value("o").unwrap_or(DEFAULT_STICKY_OWNER);
        let expire = match *state {
            "on" => match args.value("l") {
                None | Some("-1") => -1,
                Some(lifetime) => {
                    let lifetime: i64 = lifetime.parse().map_err(|_| {
                        PoolError::InvalidParam(format!("invalid lifetime: {}", lifetime))
                    })?;
                    unix_millis().saturating_add(lifetime).max(0)
                }
            },
            "off" => 0,
            other => {
                return Err(PoolError::InvalidParam(format!(
                    "invalid sticky state: {}",
                    other
                )))
            }
        };

        self.repository
            .set_sticky(&pnfs_id, owner, expire, true)
            .await?;
        let entry = self.repository.get_entry(&pnfs_id).await?;
        Ok(valid_stickies(&entry))
    }

    async fn rep_set_state(&self, id: &str, state: EntryState) -> PoolResult<String> {
        self.repository.set_state(&parse_id(id)?, state).await?;
        Ok(String::new())
    }

    async fn rep_rm(&self, args: Args<'_>) -> PoolResult<String> {
        let [id] = args.positional.as_slice() else {
            return Err(PoolError::InvalidParam(
                "usage: rep rm <pnfsid> [-force]".to_string(),
            ));
        };
        let pnfs_id = parse_id(id)?;
        let entry = self.repository.get_entry(&pnfs_id).await?;
        if args.has("force") || (entry.state == EntryState::Cached && !entry.is_sticky()) {
            warn!("AdminShell: removing {}", pnfs_id);
            self.repository.set_state(&pnfs_id, EntryState::Removed).await?;
            Ok(format!("Removed {}", pnfs_id))
        } else {
            Ok("File is not removable; use -force to override".to_string())
        }
    }
}
