//! Credential pool: rotation, failover, and cooldown for provider API
//! keys.
//!
//! Holds every configured credential together with its mutable health
//! status, and hands them out round-robin per provider so load spreads
//! evenly across rate-limited keys. A credential that keeps failing
//! enters a time-bounded cooldown and rejoins the rotation once the
//! cooldown expires, with its failure counter reset.
//!
//! The pool is the only shared mutable state in the system; it guards
//! itself with an internal mutex so concurrent document workers can
//! share one instance. All time arithmetic goes through `*_at`
//! variants taking an explicit `now`, so tests drive a simulated clock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};

/// One API key/provider/model triple usable to invoke a completion
/// service. Immutable; health lives in [`CredentialStatus`].
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub name: String,
    pub priority: u32,
}

/// Mutable health record, owned exclusively by the pool.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl Default for CredentialStatus {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            total_calls: 0,
            success_calls: 0,
            failed_calls: 0,
            last_success: None,
            last_failure: None,
            cooldown_until: None,
            enabled: true,
        }
    }
}

/// Cooldown policy. Defaults match the shipped configuration; both
/// knobs are plain policy, nothing depends on the specific numbers.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    /// Consecutive failures before a credential enters cooldown.
    pub failure_threshold: u32,
    /// Minutes a credential sits out after tripping the threshold.
    pub cooldown_minutes: i64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_minutes: 5,
        }
    }
}

#[derive(Debug)]
struct Entry {
    credential: Credential,
    status: CredentialStatus,
}

#[derive(Debug)]
struct Inner {
    entries: Vec<Entry>,
    /// Entry indices per provider, in priority order.
    by_provider: HashMap<String, Vec<usize>>,
    /// Round-robin cursor per provider: index (into the provider list)
    /// to try first on the next acquire.
    cursor: HashMap<String, usize>,
}

/// Thread-safe pool of provider credentials.
#[derive(Debug)]
pub struct CredentialPool {
    policy: PoolPolicy,
    inner: Mutex<Inner>,
}

impl CredentialPool {
    pub fn new(mut credentials: Vec<Credential>, policy: PoolPolicy) -> Self {
        credentials.sort_by(|a, b| {
            (a.provider.as_str(), a.priority).cmp(&(b.provider.as_str(), b.priority))
        });
        let mut by_provider: HashMap<String, Vec<usize>> = HashMap::new();
        let entries: Vec<Entry> = credentials
            .into_iter()
            .map(|credential| Entry {
                credential,
                status: CredentialStatus::default(),
            })
            .collect();
        for (i, entry) in entries.iter().enumerate() {
            by_provider
                .entry(entry.credential.provider.clone())
                .or_default()
                .push(i);
        }
        Self {
            policy,
            inner: Mutex::new(Inner {
                entries,
                by_provider,
                cursor: HashMap::new(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Number of configured credentials for `provider`.
    pub fn provider_len(&self, provider: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.by_provider.get(provider).map_or(0, |v| v.len())
    }

    /// Acquire the next available credential for `provider`, rotating
    /// round-robin from the slot after the last one issued. Returns
    /// `None` when every credential is cooling down or disabled — the
    /// caller fails its unit of work rather than crashing the process.
    pub fn acquire(&self, provider: &str) -> Option<Credential> {
        self.acquire_at(provider, Utc::now())
    }

    pub fn acquire_at(&self, provider: &str, now: DateTime<Utc>) -> Option<Credential> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.by_provider.get(provider)?.clone();
        if list.is_empty() {
            return None;
        }
        let start = *inner.cursor.get(provider).unwrap_or(&0) % list.len();
        for step in 0..list.len() {
            let slot = (start + step) % list.len();
            let entry_idx = list[slot];
            if entry_available(&mut inner.entries[entry_idx].status, now) {
                inner
                    .cursor
                    .insert(provider.to_string(), (slot + 1) % list.len());
                return Some(inner.entries[entry_idx].credential.clone());
            }
        }
        None
    }

    /// Record a successful call: failure streak resets.
    pub fn report_success(&self, id: &str) {
        self.report_success_at(id, Utc::now());
    }

    pub fn report_success_at(&self, id: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = status_mut(&mut inner, id) {
            status.total_calls += 1;
            status.success_calls += 1;
            status.consecutive_failures = 0;
            status.last_success = Some(now);
        }
    }

    /// Record a failed call; at the failure threshold the credential
    /// enters cooldown.
    pub fn report_failure(&self, id: &str, reason: &str) {
        self.report_failure_at(id, reason, Utc::now());
    }

    pub fn report_failure_at(&self, id: &str, _reason: &str, now: DateTime<Utc>) {
        let threshold = self.policy.failure_threshold;
        let cooldown = Duration::minutes(self.policy.cooldown_minutes);
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = status_mut(&mut inner, id) {
            status.total_calls += 1;
            status.failed_calls += 1;
            status.consecutive_failures += 1;
            status.last_failure = Some(now);
            if status.consecutive_failures >= threshold {
                status.cooldown_until = Some(now + cooldown);
            }
        }
    }

    /// A provider told us this credential is out of quota: cool it down
    /// immediately, regardless of the failure streak.
    pub fn mark_exhausted(&self, id: &str) {
        self.mark_exhausted_at(id, Utc::now());
    }

    pub fn mark_exhausted_at(&self, id: &str, now: DateTime<Utc>) {
        let cooldown = Duration::minutes(self.policy.cooldown_minutes);
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = status_mut(&mut inner, id) {
            status.total_calls += 1;
            status.failed_calls += 1;
            status.last_failure = Some(now);
            status.cooldown_until = Some(now + cooldown);
        }
    }

    /// Aggregate usage report for the `dst credentials` command.
    pub fn stats(&self) -> PoolStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let credentials: Vec<CredentialReport> = inner
            .entries
            .iter()
            .map(|e| {
                let s = &e.status;
                CredentialReport {
                    id: e.credential.id.clone(),
                    name: e.credential.name.clone(),
                    provider: e.credential.provider.clone(),
                    model: e.credential.model.clone(),
                    total_calls: s.total_calls,
                    success_calls: s.success_calls,
                    failed_calls: s.failed_calls,
                    success_rate: if s.total_calls > 0 {
                        s.success_calls as f64 / s.total_calls as f64 * 100.0
                    } else {
                        0.0
                    },
                    consecutive_failures: s.consecutive_failures,
                    in_cooldown: s.cooldown_until.is_some_and(|t| now < t),
                    enabled: s.enabled,
                }
            })
            .collect();
        PoolStats {
            total_calls: credentials.iter().map(|c| c.total_calls).sum(),
            total_success: credentials.iter().map(|c| c.success_calls).sum(),
            total_failed: credentials.iter().map(|c| c.failed_calls).sum(),
            credentials,
        }
    }
}

/// Availability check; leaving cooldown resets the failure counter.
fn entry_available(status: &mut CredentialStatus, now: DateTime<Utc>) -> bool {
    if !status.enabled {
        return false;
    }
    if let Some(until) = status.cooldown_until {
        if now < until {
            return false;
        }
        status.cooldown_until = None;
        status.consecutive_failures = 0;
    }
    true
}

fn status_mut<'a>(inner: &'a mut Inner, id: &str) -> Option<&'a mut CredentialStatus> {
    inner
        .entries
        .iter_mut()
        .find(|e| e.credential.id == id)
        .map(|e| &mut e.status)
}

/// Per-credential usage row.
#[derive(Debug, Clone)]
pub struct CredentialReport {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub in_cooldown: bool,
    pub enabled: bool,
}

/// Aggregate usage report.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_calls: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub credentials: Vec<CredentialReport>,
}

// ============ Loading ============

#[derive(Debug, serde::Deserialize)]
struct FileEntry {
    api_key: String,
    model: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_priority")]
    priority: u32,
}

fn default_priority() -> u32 {
    1
}

/// Load credentials from a JSON document keyed by provider name, each
/// value an ordered array of `{api_key, model, name, priority}`.
pub fn load_file(path: &Path) -> Result<Vec<Credential>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credential file {}", path.display()))?;
    let parsed: HashMap<String, Vec<FileEntry>> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse credential file {}", path.display()))?;

    let mut credentials = Vec::new();
    let mut providers: Vec<&String> = parsed.keys().collect();
    providers.sort();
    for provider in providers {
        for (i, entry) in parsed[provider].iter().enumerate() {
            credentials.push(Credential {
                id: format!("{provider}-{i}"),
                provider: provider.clone(),
                api_key: entry.api_key.clone(),
                model: entry.model.clone(),
                name: entry
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{provider}-{i}")),
                priority: entry.priority,
            });
        }
    }
    Ok(credentials)
}

/// Load credentials for `providers` from environment variables.
///
/// Recognized forms, per provider (uppercased name):
/// - `<P>_API_KEY` — a single key;
/// - `<P>_API_KEY_1` .. `<P>_API_KEY_N` — numbered keys;
/// - `<P>_API_KEYS` — comma-joined keys;
/// - `<P>_MODEL` — model override for all of the provider's keys.
pub fn load_env(providers: &[String]) -> Vec<Credential> {
    let mut credentials = Vec::new();
    for provider in providers {
        let prefix = provider.to_uppercase();
        let mut keys: Vec<String> = Vec::new();

        if let Ok(key) = std::env::var(format!("{prefix}_API_KEY")) {
            if !key.is_empty() {
                keys.push(key);
            }
        }
        let mut i = 1;
        while let Ok(key) = std::env::var(format!("{prefix}_API_KEY_{i}")) {
            if !key.is_empty() {
                keys.push(key);
            }
            i += 1;
        }
        if let Ok(joined) = std::env::var(format!("{prefix}_API_KEYS")) {
            keys.extend(
                joined
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from),
            );
        }

        let model = std::env::var(format!("{prefix}_MODEL"))
            .ok()
            .or_else(|| default_model(provider).map(String::from));
        let Some(model) = model else {
            if !keys.is_empty() {
                eprintln!(
                    "warning: {} key(s) for provider '{}' ignored: set {}_MODEL",
                    keys.len(),
                    provider,
                    prefix
                );
            }
            continue;
        };

        for (i, key) in keys.into_iter().enumerate() {
            credentials.push(Credential {
                id: format!("{provider}-{i}"),
                provider: provider.clone(),
                api_key: key,
                model: model.clone(),
                name: format!("{provider}-env-{}", i + 1),
                priority: 1,
            });
        }
    }
    credentials
}

/// Default model per known provider; other providers must set
/// `<PROVIDER>_MODEL`.
fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "gemini" => Some("gemini-1.5-flash"),
        "deepseek" => Some("deepseek-chat"),
        "openai" => Some("gpt-4o-mini"),
        "zhipu" => Some("glm-4-flash"),
        _ => None,
    }
}

/// Build the pool per the configured loading order: explicit JSON file
/// when set, else environment variables. An empty pool is a hard
/// configuration error — the pipeline must not silently produce zero
/// data.
pub fn load_pool(
    file: Option<&Path>,
    providers: &[String],
    policy: PoolPolicy,
) -> Result<CredentialPool> {
    let credentials = match file {
        Some(path) => load_file(path)?,
        None => load_env(providers),
    };
    if credentials.is_empty() {
        bail!(
            "no credentials configured: provide a credential file or set \
             <PROVIDER>_API_KEY / <PROVIDER>_API_KEY_1..N / <PROVIDER>_API_KEYS \
             for one of: {}",
            providers.join(", ")
        );
    }
    Ok(CredentialPool::new(credentials, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(provider: &str, n: usize) -> Credential {
        Credential {
            id: format!("{provider}-{n}"),
            provider: provider.to_string(),
            api_key: format!("key-{n}"),
            model: "test-model".to_string(),
            name: format!("{provider}-{n}"),
            priority: 1,
        }
    }

    fn pool(k: usize) -> CredentialPool {
        let creds = (0..k).map(|i| cred("providerX", i)).collect();
        CredentialPool::new(creds, PoolPolicy::default())
    }

    #[test]
    fn round_robin_fairness() {
        let pool = pool(4);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let c = pool.acquire("providerX").unwrap();
            pool.report_success(&c.id);
            seen.push(c.id);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec!["providerX-0", "providerX-1", "providerX-2", "providerX-3"]
        );
    }

    #[test]
    fn unknown_provider_yields_none() {
        let pool = pool(2);
        assert!(pool.acquire("other").is_none());
    }

    #[test]
    fn threshold_failures_trigger_cooldown_and_failover() {
        let pool = pool(2);
        let now = Utc::now();

        // Credential A fails three times in a row.
        for _ in 0..3 {
            pool.report_failure_at("providerX-0", "boom", now);
        }

        // Afterward only B is ever issued, until the cooldown expires.
        for _ in 0..5 {
            let c = pool.acquire_at("providerX", now).unwrap();
            assert_eq!(c.id, "providerX-1");
        }

        // Past cooldown_until, A is available again with a clean slate.
        let later = now + Duration::minutes(6);
        let mut ids: Vec<String> = (0..2)
            .map(|_| pool.acquire_at("providerX", later).unwrap().id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["providerX-0", "providerX-1"]);
        let stats = pool.stats_at(later);
        let a = stats
            .credentials
            .iter()
            .find(|c| c.id == "providerX-0")
            .unwrap();
        assert_eq!(a.consecutive_failures, 0);
        assert!(!a.in_cooldown);
    }

    #[test]
    fn quota_exhaustion_cools_down_immediately() {
        let pool = pool(2);
        let now = Utc::now();
        pool.mark_exhausted_at("providerX-0", now);
        for _ in 0..3 {
            assert_eq!(pool.acquire_at("providerX", now).unwrap().id, "providerX-1");
        }
    }

    #[test]
    fn all_unavailable_yields_none() {
        let pool = pool(2);
        let now = Utc::now();
        pool.mark_exhausted_at("providerX-0", now);
        pool.mark_exhausted_at("providerX-1", now);
        assert!(pool.acquire_at("providerX", now).is_none());
    }

    #[test]
    fn success_resets_failure_streak() {
        let pool = pool(1);
        let now = Utc::now();
        pool.report_failure_at("providerX-0", "x", now);
        pool.report_failure_at("providerX-0", "x", now);
        pool.report_success_at("providerX-0", now);
        pool.report_failure_at("providerX-0", "x", now);
        // Streak restarted: still available.
        assert!(pool.acquire_at("providerX", now).is_some());
    }

    #[test]
    fn env_loading_forms() {
        // Unique provider name so parallel tests cannot collide.
        std::env::set_var("ENVPOOLTEST_API_KEY", "k0");
        std::env::set_var("ENVPOOLTEST_API_KEY_1", "k1");
        std::env::set_var("ENVPOOLTEST_API_KEY_2", "k2");
        std::env::set_var("ENVPOOLTEST_API_KEYS", "k3, k4");
        std::env::set_var("ENVPOOLTEST_MODEL", "m");
        let creds = load_env(&["envpooltest".to_string()]);
        assert_eq!(creds.len(), 5);
        assert!(creds.iter().all(|c| c.model == "m"));
        let keys: Vec<&str> = creds.iter().map(|c| c.api_key.as_str()).collect();
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
    }

    #[test]
    fn env_loading_unknown_provider_without_model_is_skipped() {
        std::env::set_var("NOMODELTEST_API_KEY", "k");
        let creds = load_env(&["nomodeltest".to_string()]);
        assert!(creds.is_empty());
    }

    #[test]
    fn file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{
                "gemini": [
                    {"api_key": "g1", "model": "gemini-1.5-flash", "name": "primary"},
                    {"api_key": "g2", "model": "gemini-1.5-flash", "priority": 2}
                ],
                "deepseek": [
                    {"api_key": "d1", "model": "deepseek-chat"}
                ]
            }"#,
        )
        .unwrap();
        let creds = load_file(&path).unwrap();
        assert_eq!(creds.len(), 3);
        let g0 = creds.iter().find(|c| c.id == "gemini-0").unwrap();
        assert_eq!(g0.name, "primary");
        assert_eq!(g0.priority, 1);
    }

    #[test]
    fn empty_pool_is_a_configuration_error() {
        let err = load_pool(None, &["nosuchproviderenv".to_string()], PoolPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("no credentials configured"));
    }
}
