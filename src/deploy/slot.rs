//! Deployment slots: request validation, slot-key derivation and the
//! process-wide slot lock table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use tracing::debug;

use hostdeck_common::{DeployRequest, Rejection, RunId};

use crate::config::DeploySection;

/// Longest accepted slot key.
pub const MAX_SLOT_LEN: usize = 64;

pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;

static SLOT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());

static BRANCH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/][A-Za-z0-9._/-]*$").unwrap());

static REPO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/:@~-]+$").unwrap());

/// State of the slot's working copy when the request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    /// No working copy: clone it and register a new supervised process.
    Fresh,
    /// A directory without git metadata, left behind by an interrupted
    /// clone. Removed, then handled like `Fresh`.
    Stale,
    /// Git working copy present: update it in place and restart the process.
    Existing,
}

impl Checkout {
    /// Whether the run starts from a new clone.
    pub fn needs_clone(self) -> bool {
        matches!(self, Self::Fresh | Self::Stale)
    }
}

/// What the resolver learned about the project's dependency manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifest {
    /// Not known before the source is fetched.
    Unknown,
    Present,
    Absent,
}

/// Everything a run needs, decided once before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub slot: String,
    pub repo: String,
    pub repo_name: String,
    pub clone_url: String,
    pub branch: String,
    pub port: u16,
    pub working_dir: PathBuf,
    pub checkout: Checkout,
    pub manifest: Manifest,
}

/// Turns a raw process name into a slot key, or explains why it can't.
pub fn normalize_slot_name(raw: &str) -> Result<String, Rejection> {
    let normalized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '_' | '.' | ' ' => '-',
            other => other,
        })
        .collect();

    let invalid = |reason: &str| Rejection::InvalidName {
        name: raw.to_string(),
        reason: reason.to_string(),
    };

    if normalized.is_empty() {
        return Err(invalid("name is empty"));
    }
    if normalized.len() > MAX_SLOT_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if !SLOT_REGEX.is_match(&normalized) {
        return Err(invalid(
            "only lowercase letters, digits and '-' are allowed, and it must not start with '-'",
        ));
    }
    Ok(normalized)
}

pub fn validate_port(port: i64) -> Result<u16, Rejection> {
    if (MIN_PORT..=MAX_PORT).contains(&port) {
        u16::try_from(port).map_err(|_| Rejection::InvalidPort { port })
    } else {
        Err(Rejection::InvalidPort { port })
    }
}

pub fn validate_branch(branch: &str) -> Result<String, Rejection> {
    let trimmed = branch.trim();
    if BRANCH_REGEX.is_match(trimmed) && !trimmed.contains("..") {
        Ok(trimmed.to_string())
    } else {
        Err(Rejection::InvalidBranch {
            branch: branch.to_string(),
        })
    }
}

/// Resolve a repository reference into `(repo_name, clone_url)`.
///
/// Accepts `owner/name`, a bare `name` when a default owner is configured,
/// or a full `https://`, `ssh://` or `git@host:owner/name` URL.
pub fn resolve_repo(
    repo: &str,
    git_base_url: &str,
    default_owner: Option<&str>,
) -> Result<(String, String), Rejection> {
    let unresolvable = |reason: &str| Rejection::RepoUnresolvable {
        repo: repo.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = repo.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(unresolvable("repository reference is empty"));
    }
    if !REPO_REGEX.is_match(trimmed) || trimmed.starts_with('-') {
        return Err(unresolvable("contains unsupported characters"));
    }

    let is_url = trimmed.starts_with("https://")
        || trimmed.starts_with("ssh://")
        || trimmed.starts_with("git@");

    if is_url {
        let name = trimmed
            .rsplit(|c: char| c == '/' || c == ':')
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git");
        if name.is_empty() {
            return Err(unresolvable("URL has no repository name"));
        }
        return Ok((name.to_string(), trimmed.to_string()));
    }

    let parts: Vec<&str> = trimmed.split('/').collect();
    let (owner, name) = match parts.as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => (owner.to_string(), *name),
        [name] => match default_owner {
            Some(owner) if !owner.trim().is_empty() => (owner.trim().to_string(), *name),
            _ => return Err(unresolvable("bare name given and no default owner configured")),
        },
        _ => return Err(unresolvable("expected 'owner/name' or a clone URL")),
    };
    let name = name.trim_end_matches(".git");
    if name.is_empty() || name == "." || name == ".." || owner == "." || owner == ".." {
        return Err(unresolvable("invalid owner or repository name"));
    }

    let clone_url = format!(
        "{}/{}/{}.git",
        git_base_url.trim_end_matches('/'),
        owner,
        name
    );
    Ok((name.to_string(), clone_url))
}

/// Derives a `RunSpec` from an operator request.
///
/// Apart from probing the working copy it has no side effects; in particular
/// it never talks to the process supervisor.
#[derive(Debug, Clone)]
pub struct SlotResolver {
    apps_root: PathBuf,
    git_base_url: String,
    default_owner: Option<String>,
}

impl SlotResolver {
    pub fn new(config: &DeploySection) -> Self {
        Self {
            apps_root: config.apps_root.clone(),
            git_base_url: config.git_base_url.clone(),
            default_owner: config.default_owner.clone(),
        }
    }

    pub fn resolve(
        &self,
        request: &DeployRequest,
        slots: &SlotTable,
    ) -> Result<RunSpec, Rejection> {
        let (repo_name, clone_url) = resolve_repo(
            &request.repo,
            &self.git_base_url,
            self.default_owner.as_deref(),
        )?;

        let raw_name = request
            .pm2_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&repo_name);
        let slot = normalize_slot_name(raw_name)?;
        let port = validate_port(request.port)?;
        let branch = validate_branch(&request.branch)?;

        if let Some(run_id) = slots.holder(&slot) {
            return Err(Rejection::SlotOccupied { slot, run_id });
        }

        let working_dir = self.apps_root.join(&slot);
        let (checkout, manifest) = inspect_working_copy(&working_dir);
        debug!(slot = %slot, dir = %working_dir.display(), ?checkout, ?manifest, "resolved deploy slot");

        Ok(RunSpec {
            slot,
            repo: request.repo.trim().to_string(),
            repo_name,
            clone_url,
            branch,
            port,
            working_dir,
            checkout,
            manifest,
        })
    }
}

fn inspect_working_copy(dir: &Path) -> (Checkout, Manifest) {
    if !dir.is_dir() {
        return (Checkout::Fresh, Manifest::Unknown);
    }
    if !dir.join(".git").exists() {
        return (Checkout::Stale, Manifest::Unknown);
    }
    let manifest = if dir.join("package.json").is_file() {
        Manifest::Present
    } else {
        Manifest::Absent
    };
    (Checkout::Existing, manifest)
}

/// Process-wide map from slot key to the run currently holding it.
///
/// Mutated only by [`SlotTable::acquire`] and by dropping the returned
/// [`SlotGuard`], so a slot is released exactly once on every exit path.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    inner: Arc<Mutex<HashMap<String, RunId>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `slot` for `run_id`.
    pub fn acquire(&self, slot: &str, run_id: RunId) -> Result<SlotGuard, Rejection> {
        let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = slots.get(slot) {
            return Err(Rejection::SlotOccupied {
                slot: slot.to_string(),
                run_id: *holder,
            });
        }
        slots.insert(slot.to_string(), run_id);
        Ok(SlotGuard {
            table: self.clone(),
            slot: slot.to_string(),
            run_id,
        })
    }

    pub fn holder(&self, slot: &str) -> Option<RunId> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
            .copied()
    }

    /// Currently held slots, sorted by key.
    pub fn active(&self) -> Vec<(String, RunId)> {
        let slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<_> = slots.iter().map(|(k, v)| (k.clone(), *v)).collect();
        active.sort();
        active
    }
}

/// Holds a slot until dropped.
#[derive(Debug)]
pub struct SlotGuard {
    table: SlotTable,
    slot: String,
    run_id: RunId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.table.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&self.slot) == Some(&self.run_id) {
            slots.remove(&self.slot);
            debug!(slot = %self.slot, run_id = %self.run_id, "released deploy slot");
        }
    }
}
