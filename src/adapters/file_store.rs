//! YAML Rule Store Adapter
//!
//! One `<provider>.yaml` (or `.yml`) document per provider in a rules
//! directory:
//!
//! ```yaml
//! version: 7          # optional, defaults to the file's mtime in millis
//! market: US
//! rules:
//!   - source: "*"
//!     target: "*.US"
//!   - source: BRK.B
//!     target: BRK-B.US
//!     market: US
//! ```
//!
//! The change feed polls the directory and diffs file modification times.
//! Its resume token is the poll timestamp in unix millis. The store keeps
//! the last directory listing a subscriber consumed in full; a resumed
//! subscription diffs against it, so inserts, updates and deletes made
//! while disconnected are all reported. Without that listing (a token from
//! another process) every file modified after the token is reported as an
//! update, and deletions cannot be detected.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::{
    ChangeEvent, ChangeFeed, ChangeOperation, MappingRule, MappingRuleSet, ProviderId,
    ResumeToken, RuleStore, RuleVersion, Subscription,
};
use crate::error::{Error, Result};

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// On-disk rule document
#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    market: String,
    #[serde(default)]
    rules: Vec<MappingRule>,
}

/// Provider → modification time of its rule document
type Listing = HashMap<ProviderId, SystemTime>;

/// Directory of YAML rule documents
#[derive(Debug, Clone)]
pub struct YamlRuleStore {
    dir: PathBuf,
    poll_interval: Duration,
    /// Last listing whose changes were all handed to a subscriber
    delivered: Arc<Mutex<Option<Listing>>>,
}

impl YamlRuleStore {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            delivered: Arc::new(Mutex::new(None)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn locate(&self, provider: &ProviderId) -> Result<Option<PathBuf>> {
        for ext in EXTENSIONS {
            let path = self.dir.join(format!("{}.{}", provider, ext));
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => return Ok(Some(path)),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RuleStore for YamlRuleStore {
    async fn load_rule_set(&self, provider: &ProviderId) -> Result<MappingRuleSet> {
        // Provider ids become file names
        provider.validate()?;

        let path = self
            .locate(provider)
            .await?
            .ok_or_else(|| Error::ProviderNotFound(provider.to_string()))?;

        let raw = tokio::fs::read_to_string(&path).await?;
        let modified = tokio::fs::metadata(&path).await?.modified()?;
        let doc: RuleDocument = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;

        if let Some(declared) = doc.provider.as_deref() {
            if declared != provider.as_str() {
                return Err(Error::InvalidRuleSet {
                    provider: provider.to_string(),
                    reason: format!("document declares provider '{}'", declared),
                });
            }
        }

        let version = doc.version.unwrap_or_else(|| unix_millis(modified));
        let mut rule_set =
            MappingRuleSet::new(provider.clone(), RuleVersion(version), doc.market, doc.rules);
        rule_set.loaded_at = Utc::now();

        debug!(
            provider = %provider,
            path = %path.display(),
            version = version,
            rules = rule_set.rules.len(),
            "Read rule document"
        );
        Ok(rule_set)
    }
}

// =============================================================================
// Polling Change Feed
// =============================================================================

struct PollState {
    dir: PathBuf,
    interval: Duration,
    known: Listing,
    delivered: Arc<Mutex<Option<Listing>>>,
    pending: VecDeque<Result<ChangeEvent>>,
    broken: bool,
}

impl PollState {
    /// Seed the state from the first scan of a subscription
    fn prime(&mut self, current: Listing, resume_after: Option<SystemTime>) {
        let previous = self.delivered.lock().clone();
        match (resume_after, previous) {
            (Some(_), Some(previous)) => {
                self.known = previous;
                self.absorb(current);
            }
            (Some(after), None) => {
                let token = unix_millis(SystemTime::now()).to_string();
                for (provider, modified) in &current {
                    if *modified > after {
                        self.pending.push_back(Ok(ChangeEvent::new(
                            provider.clone(),
                            ChangeOperation::Update,
                        )
                        .with_resume_token(token.clone())));
                    }
                }
                self.known = current;
            }
            (None, _) => self.known = current,
        }
    }

    fn absorb(&mut self, current: Listing) {
        let token = unix_millis(SystemTime::now()).to_string();
        let event = |provider: &ProviderId, op| {
            Ok(ChangeEvent::new(provider.clone(), op).with_resume_token(token.clone()))
        };

        for (provider, modified) in &current {
            match self.known.get(provider) {
                None => self.pending.push_back(event(provider, ChangeOperation::Insert)),
                Some(previous) if previous != modified => {
                    self.pending.push_back(event(provider, ChangeOperation::Update))
                }
                Some(_) => {}
            }
        }
        for provider in self.known.keys() {
            if !current.contains_key(provider) {
                self.pending.push_back(event(provider, ChangeOperation::Delete));
            }
        }
        self.known = current;
    }

    /// Every change up to `known` has been handed out
    fn commit(&self) {
        *self.delivered.lock() = Some(self.known.clone());
    }
}

async fn scan_dir(dir: &Path) -> Result<Listing> {
    let mut found = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_rule_doc = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| EXTENSIONS.contains(&e));
        if !is_rule_doc {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let provider = ProviderId::from(stem);
        if provider.validate().is_err() {
            warn!(path = %path.display(), "Skipping rule document with invalid provider name");
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        found.insert(provider, modified);
    }
    Ok(found)
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_token(token: &ResumeToken) -> Option<SystemTime> {
    token
        .0
        .parse::<u64>()
        .ok()
        .map(|millis| UNIX_EPOCH + Duration::from_millis(millis))
}

#[async_trait]
impl ChangeFeed for YamlRuleStore {
    async fn subscribe(&self, resume: Option<ResumeToken>) -> Result<Subscription> {
        let resume_after = match resume.as_ref() {
            Some(token) => match parse_token(token) {
                Some(at) => Some(at),
                None => {
                    warn!(token = %token, "Unparseable resume token, reporting all documents");
                    Some(UNIX_EPOCH)
                }
            },
            None => None,
        };

        // Taken before the scan so a file written during it is newer than the head
        let head = ResumeToken(unix_millis(SystemTime::now()).to_string());

        // Fail the subscription itself when the directory is unreadable
        let baseline = scan_dir(&self.dir)
            .await
            .map_err(|e| Error::unavailable(format!("{}: {}", self.dir.display(), e)))?;

        let mut state = PollState {
            dir: self.dir.clone(),
            interval: self.poll_interval,
            known: HashMap::new(),
            delivered: Arc::clone(&self.delivered),
            pending: VecDeque::new(),
            broken: false,
        };
        state.prime(baseline, resume_after);
        debug!(
            dir = %self.dir.display(),
            head = %head,
            replayed = state.pending.len(),
            "Rule directory feed subscribed"
        );

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if state.broken {
                    return None;
                }
                if let Some(item) = state.pending.pop_front() {
                    state.broken = item.is_err();
                    return Some((item, state));
                }
                state.commit();
                tokio::time::sleep(state.interval).await;
                match scan_dir(&state.dir).await {
                    Ok(current) => state.absorb(current),
                    Err(e) => state.pending.push_back(Err(Error::unavailable(format!(
                        "{}: {}",
                        state.dir.display(),
                        e
                    )))),
                }
            }
        });
        Ok(Subscription::new(Some(head), Box::pin(stream)))
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

// =============================================================================
// Tests
// =============================================================================
