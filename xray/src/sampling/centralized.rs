//! Centralized sampling.
//!
//! The control plane owns the rule set. Two pollers keep a local snapshot
//! current: one refreshes the rules themselves, the other trades per-rule
//! statistics for reservoir quota allocations. Sampling decisions read the
//! snapshot without blocking anything but the matched rule's reservoir lock.
//!
//! Until a rule has an allocation, it borrows: at most one trace per second,
//! reported to the control plane so the next quota round can account for it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{select, Receiver, Sender};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::error::XrayError;
use crate::id::random_hex96;
use crate::sampling::api::{
    DaemonApi, GetSamplingRulesInput, GetSamplingTargetsInput, SamplingApi, SamplingRule,
    SamplingStatisticsDocument, SamplingTargetDocument,
};
use crate::sampling::local::{LocalStrategy, Manifest};
use crate::sampling::pattern::wildcard_match;
use crate::sampling::{SamplingDecision, SamplingRequest, SamplingStrategy};

const RULE_INTERVAL: Duration = Duration::from_secs(300);
const RULE_JITTER_MILLIS: u64 = 1_000;
const DEFAULT_QUOTA_INTERVAL_SECS: u64 = 10;
const QUOTA_JITTER_MILLIS: u64 = 100;
/// A manifest older than this no longer decides anything.
const MANIFEST_TTL: Duration = Duration::from_secs(3600);
/// GetSamplingTargets accepts at most this many statistics documents.
const MAX_TARGETS_PER_CALL: usize = 25;

/// Samples against the control plane's rule set, falling back to local rules
/// while the remote state is unavailable or stale.
pub struct CentralizedStrategy {
    inner: Arc<Inner>,
}

struct Inner {
    fallback: LocalStrategy,
    api: Box<dyn SamplingApi>,
    /// Identifies this process in statistics documents.
    client_id: String,
    manifest: RwLock<Arc<CentralizedManifest>>,
    /// Serializes rule and quota refreshes.
    refresh_lock: Mutex<()>,
    started: Once,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    /// Reporting interval, updatable by target documents.
    quota_interval_secs: AtomicU64,
}

pub(crate) struct CentralizedManifest {
    pub(crate) rules: Vec<Arc<CentralizedRule>>,
    pub(crate) quotas: HashMap<String, Arc<CentralizedQuota>>,
    pub(crate) refreshed_at: SystemTime,
}

impl CentralizedManifest {
    fn empty() -> CentralizedManifest {
        CentralizedManifest {
            rules: Vec::new(),
            quotas: HashMap::new(),
            refreshed_at: UNIX_EPOCH,
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.rules.is_empty() || now >= self.refreshed_at + MANIFEST_TTL
    }
}

pub(crate) struct CentralizedRule {
    pub(crate) quota: Arc<CentralizedQuota>,
    pub(crate) name: String,
    pub(crate) priority: i64,
    pub(crate) host: String,
    pub(crate) url_path: String,
    pub(crate) http_method: String,
    pub(crate) service_name: String,
    pub(crate) service_type: String,
    pub(crate) attributes: HashMap<String, String>,
}

impl CentralizedRule {
    fn build(rule: &SamplingRule, quota: Arc<CentralizedQuota>) -> CentralizedRule {
        // the service encodes "match anything" as "*"; normalize missing
        // fields the same way
        let glob = |s: &str| {
            if s.is_empty() {
                "*".to_string()
            } else {
                s.to_string()
            }
        };
        CentralizedRule {
            quota,
            name: rule.rule_name.clone(),
            priority: rule.priority,
            host: glob(&rule.host),
            url_path: glob(&rule.url_path),
            http_method: glob(&rule.http_method),
            service_name: glob(&rule.service_name),
            service_type: glob(&rule.service_type),
            attributes: rule.attributes.clone(),
        }
    }

    pub(crate) fn matches(&self, request: &SamplingRequest) -> bool {
        wildcard_match(&self.host, &request.host, true)
            && wildcard_match(&self.http_method, &request.method, true)
            && wildcard_match(&self.url_path, &request.url_path, false)
            && wildcard_match(&self.service_name, &request.service_name, true)
            && wildcard_match(&self.service_type, &request.service_type, true)
            && self.attributes.iter().all(|(key, pattern)| {
                request
                    .attributes
                    .get(key)
                    .is_some_and(|value| wildcard_match(pattern, value, true))
            })
    }

    pub(crate) fn sample(&self, now_sec: u64) -> SamplingDecision {
        SamplingDecision::new(self.quota.sample_at(now_sec), Some(self.name.clone()))
    }
}

/// A rule's reservoir: the quota allocation, its expiry, and the statistics
/// counters for the current reporting interval.
pub(crate) struct CentralizedQuota {
    state: Mutex<QuotaState>,
}

#[derive(Default)]
struct QuotaState {
    /// Allocated samples per second; zero until the control plane grants one.
    quota: i64,
    /// Epoch seconds at which the allocation expires.
    ttl: f64,
    fixed_rate: f64,
    current_sec: u64,
    taken: i64,
    borrow_sec: Option<u64>,
    requests: i64,
    sampled: i64,
    borrowed: i64,
}

impl QuotaState {
    fn reservoir_state(&self, now_sec: u64) -> ReservoirState {
        if self.quota <= 0 {
            ReservoirState::Borrowing
        } else if (now_sec as f64) < self.ttl {
            ReservoirState::Allocated
        } else {
            ReservoirState::Expired
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct QuotaStats {
    pub(crate) requests: i64,
    pub(crate) sampled: i64,
    pub(crate) borrowed: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ReservoirState {
    /// No live allocation; take one per second and report it as borrowed.
    Borrowing,
    /// A granted quota is in force.
    Allocated,
    /// The grant lapsed; back to borrowing until the next refresh.
    Expired,
}

impl CentralizedQuota {
    /// A reservoir for a rule with no allocation yet.
    pub(crate) fn borrowed(fixed_rate: f64) -> CentralizedQuota {
        CentralizedQuota {
            state: Mutex::new(QuotaState {
                fixed_rate,
                ..QuotaState::default()
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_stats(requests: i64, sampled: i64, borrowed: i64) -> CentralizedQuota {
        CentralizedQuota {
            state: Mutex::new(QuotaState {
                requests,
                sampled,
                borrowed,
                ..QuotaState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, doc: &SamplingTargetDocument) {
        let mut state = self.lock();
        state.fixed_rate = doc.fixed_rate;
        if let Some(quota) = doc.reservoir_quota {
            state.quota = quota;
        }
        if let Some(ttl) = doc.reservoir_quota_ttl {
            state.ttl = ttl;
        }
    }

    /// Copies out and resets the interval counters.
    pub(crate) fn snapshot(&self) -> QuotaStats {
        let mut state = self.lock();
        let stats = QuotaStats {
            requests: state.requests,
            sampled: state.sampled,
            borrowed: state.borrowed,
        };
        state.requests = 0;
        state.sampled = 0;
        state.borrowed = 0;
        stats
    }

    #[cfg(test)]
    pub(crate) fn state_at(&self, now_sec: u64) -> ReservoirState {
        self.lock().reservoir_state(now_sec)
    }

    /// One sampling decision. Quota tokens first; one borrow per second when
    /// there is no live allocation; the fixed rate picks up the overflow.
    pub(crate) fn sample_at(&self, now_sec: u64) -> bool {
        let mut state = self.lock();
        state.requests += 1;
        if state.current_sec != now_sec {
            state.current_sec = now_sec;
            state.taken = 0;
        }
        match state.reservoir_state(now_sec) {
            ReservoirState::Allocated => {
                if state.taken < state.quota {
                    state.taken += 1;
                    state.sampled += 1;
                    return true;
                }
                // quota exhausted this second, the fixed rate decides
            }
            ReservoirState::Borrowing | ReservoirState::Expired => {
                if state.borrow_sec != Some(now_sec) {
                    state.borrow_sec = Some(now_sec);
                    state.borrowed += 1;
                    state.sampled += 1;
                    return true;
                }
            }
        }
        if rand::thread_rng().gen::<f64>() < state.fixed_rate {
            state.sampled += 1;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed_rate(&self) -> f64 {
        self.lock().fixed_rate
    }

    #[cfg(test)]
    pub(crate) fn quota(&self) -> i64 {
        self.lock().quota
    }

    #[cfg(test)]
    pub(crate) fn ttl(&self) -> f64 {
        self.lock().ttl
    }
}

impl CentralizedStrategy {
    /// Builds a strategy that talks to the control plane through the daemon
    /// proxy at `daemon`. `manifest` seeds the local fallback; `None` uses
    /// the built-in default manifest.
    pub fn new(daemon: SocketAddr, manifest: Option<Manifest>) -> Result<CentralizedStrategy, XrayError> {
        let api = DaemonApi::new(daemon)?;
        CentralizedStrategy::with_api(Box::new(api), manifest)
    }

    pub(crate) fn with_api(
        api: Box<dyn SamplingApi>,
        manifest: Option<Manifest>,
    ) -> Result<CentralizedStrategy, XrayError> {
        let fallback = LocalStrategy::new(manifest)?;
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        Ok(CentralizedStrategy {
            inner: Arc::new(Inner {
                fallback,
                api,
                client_id: random_hex96(),
                manifest: RwLock::new(Arc::new(CentralizedManifest::empty())),
                refresh_lock: Mutex::new(()),
                started: Once::new(),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                quota_interval_secs: AtomicU64::new(DEFAULT_QUOTA_INTERVAL_SECS),
            }),
        })
    }

    /// Stops both pollers. In-flight control-plane calls are left to fail on
    /// their own deadline.
    pub fn close(&self) {
        let sender = self
            .inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
    }

    fn ensure_started(&self) {
        let inner = &self.inner;
        inner.started.call_once(|| {
            let rule_inner = Arc::clone(inner);
            let _ = thread::Builder::new()
                .name("xray-rule-poller".to_string())
                .spawn(move || rule_poller(rule_inner));
            let quota_inner = Arc::clone(inner);
            let _ = thread::Builder::new()
                .name("xray-quota-poller".to_string())
                .spawn(move || quota_poller(quota_inner));
        });
    }
}

impl SamplingStrategy for CentralizedStrategy {
    fn should_trace(&self, request: &SamplingRequest) -> SamplingDecision {
        self.ensure_started();
        let now = SystemTime::now();
        let now_sec = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match self.inner.evaluate(request, now, now_sec) {
            Some(decision) => decision,
            None => self.inner.fallback.should_trace(request),
        }
    }

    fn close(&self) {
        CentralizedStrategy::close(self)
    }
}

impl fmt::Debug for CentralizedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralizedStrategy")
            .field("client_id", &self.inner.client_id)
            .finish()
    }
}

impl Inner {
    fn manifest(&self) -> Arc<CentralizedManifest> {
        self.manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_manifest(&self, manifest: CentralizedManifest) {
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(manifest);
    }

    /// Walks the snapshot in priority order. `None` means the caller must
    /// fall back to the local strategy.
    fn evaluate(
        &self,
        request: &SamplingRequest,
        now: SystemTime,
        now_sec: u64,
    ) -> Option<SamplingDecision> {
        let manifest = self.manifest();
        if manifest.is_expired(now) {
            return None;
        }
        for rule in &manifest.rules {
            if rule.matches(request) {
                debug!(rule = %rule.name, "sampling rule matched");
                return Some(rule.sample(now_sec));
            }
        }
        // the default rule matches everything, so an exhausted walk means
        // the manifest is damaged
        None
    }

    fn refresh_rules(&self) {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.refresh_rules_locked())) {
            error!(panic = panic_message(panic.as_ref()), "rule refresh panicked");
        }
    }

    fn refresh_rules_locked(&self) {
        debug!("refreshing sampling rules");
        let previous = self.manifest();
        let mut records = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let input = GetSamplingRulesInput {
                next_token: next_token.clone(),
            };
            let output = match self.api.get_sampling_rules(&input) {
                Ok(output) => output,
                Err(err) => {
                    error!(%err, "failed to get sampling rules");
                    return;
                }
            };
            records.extend(output.sampling_rule_records);
            match output.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        let mut rules = Vec::with_capacity(records.len());
        let mut quotas = HashMap::with_capacity(records.len());
        for record in &records {
            let rule = &record.sampling_rule;
            if rule.rule_name.is_empty() {
                warn!("skipping sampling rule without a name");
                continue;
            }
            // keep the reservoir if we already track this rule, so counters
            // and allocations survive the refresh
            let quota = previous
                .quotas
                .get(&rule.rule_name)
                .cloned()
                .unwrap_or_else(|| Arc::new(CentralizedQuota::borrowed(rule.fixed_rate)));
            quotas.insert(rule.rule_name.clone(), Arc::clone(&quota));
            rules.push(Arc::new(CentralizedRule::build(rule, quota)));
            debug!(
                rule = %rule.rule_name,
                priority = rule.priority,
                fixed_rate = rule.fixed_rate,
                host = %rule.host,
                method = %rule.http_method,
                service_name = %rule.service_name,
                service_type = %rule.service_type,
                "refreshed sampling rule"
            );
        }
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        self.set_manifest(CentralizedManifest {
            rules,
            quotas,
            refreshed_at: SystemTime::now(),
        });
        debug!("sampling rules refreshed");
    }

    fn refresh_quotas(&self) {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.refresh_quotas_locked())) {
            error!(panic = panic_message(panic.as_ref()), "quota refresh panicked");
        }
    }

    fn refresh_quotas_locked(&self) {
        let manifest = self.manifest();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let stats: Vec<SamplingStatisticsDocument> = manifest
            .rules
            .iter()
            .map(|rule| {
                let snapshot = rule.quota.snapshot();
                debug!(
                    rule = %rule.name,
                    requests = snapshot.requests,
                    borrowed = snapshot.borrowed,
                    sampled = snapshot.sampled,
                    "reporting sampling statistics"
                );
                SamplingStatisticsDocument {
                    client_id: self.client_id.clone(),
                    rule_name: rule.name.clone(),
                    request_count: snapshot.requests,
                    sampled_count: snapshot.sampled,
                    borrow_count: snapshot.borrowed,
                    timestamp: now,
                }
            })
            .collect();

        let refreshed_at = manifest
            .refreshed_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut needs_rule_refresh = false;
        for chunk in stats.chunks(MAX_TARGETS_PER_CALL) {
            let input = GetSamplingTargetsInput {
                sampling_statistics_documents: chunk.to_vec(),
            };
            let output = match self.api.get_sampling_targets(&input) {
                Ok(output) => output,
                Err(err) => {
                    error!(%err, "failed to refresh sampling targets");
                    continue;
                }
            };
            for doc in &output.sampling_target_documents {
                match manifest.quotas.get(&doc.rule_name) {
                    Some(quota) => {
                        quota.update(doc);
                        if let Some(interval) = doc.interval {
                            if interval > 0 {
                                self.quota_interval_secs
                                    .store(interval as u64, Ordering::Relaxed);
                            }
                        }
                        debug!(
                            rule = %doc.rule_name,
                            quota = ?doc.reservoir_quota,
                            ttl = ?doc.reservoir_quota_ttl,
                            interval = ?doc.interval,
                            "refreshed reservoir quota"
                        );
                    }
                    // the control plane knows a rule we do not: fetch rules
                    None => needs_rule_refresh = true,
                }
            }
            for unprocessed in &output.unprocessed_statistics {
                warn!(
                    rule = %unprocessed.rule_name,
                    code = %unprocessed.error_code,
                    message = %unprocessed.message,
                    "control plane rejected statistics"
                );
            }
            needs_rule_refresh = needs_rule_refresh || output.last_rule_modification > refreshed_at;
        }
        debug!("sampling targets refreshed");

        if needs_rule_refresh {
            debug!("sampling rule change detected, refreshing rules");
            self.refresh_rules_locked();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

fn rule_poller(inner: Arc<Inner>) {
    let mut rng = SmallRng::from_entropy();
    loop {
        inner.refresh_rules();
        let jitter = Duration::from_millis(rng.gen_range(0..RULE_JITTER_MILLIS));
        select! {
            recv(inner.shutdown_rx) -> _ => return,
            default(RULE_INTERVAL + jitter) => {}
        }
    }
}

fn quota_poller(inner: Arc<Inner>) {
    let mut rng = SmallRng::from_entropy();
    loop {
        inner.refresh_quotas();
        let interval = Duration::from_secs(inner.quota_interval_secs.load(Ordering::Relaxed));
        let jitter = Duration::from_millis(rng.gen_range(0..QUOTA_JITTER_MILLIS));
        select! {
            recv(inner.shutdown_rx) -> _ => return,
            default(interval + jitter) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlPlaneError;
    use crate::sampling::api::{GetSamplingRulesOutput, GetSamplingTargetsOutput, SamplingRuleRecord};
    use std::sync::atomic::AtomicUsize;

    type RulesFn = Box<
        dyn Fn(&GetSamplingRulesInput) -> Result<GetSamplingRulesOutput, ControlPlaneError>
            + Send
            + Sync,
    >;
    type TargetsFn = Box<
        dyn Fn(&GetSamplingTargetsInput) -> Result<GetSamplingTargetsOutput, ControlPlaneError>
            + Send
            + Sync,
    >;

    #[derive(Default)]
    struct MockApi {
        rules: Option<RulesFn>,
        targets: Option<TargetsFn>,
    }

    impl SamplingApi for MockApi {
        fn get_sampling_rules(
            &self,
            input: &GetSamplingRulesInput,
        ) -> Result<GetSamplingRulesOutput, ControlPlaneError> {
            match &self.rules {
                Some(f) => f(input),
                None => Ok(GetSamplingRulesOutput::default()),
            }
        }

        fn get_sampling_targets(
            &self,
            input: &GetSamplingTargetsInput,
        ) -> Result<GetSamplingTargetsOutput, ControlPlaneError> {
            match &self.targets {
                Some(f) => f(input),
                None => Ok(GetSamplingTargetsOutput::default()),
            }
        }
    }

    fn rule(name: &str, priority: i64, fixed_rate: f64) -> SamplingRule {
        SamplingRule {
            rule_name: name.to_string(),
            priority,
            fixed_rate,
            reservoir_size: 10,
            host: "*".to_string(),
            http_method: "*".to_string(),
            url_path: "*".to_string(),
            service_name: "*".to_string(),
            service_type: "*".to_string(),
            version: 1,
            ..SamplingRule::default()
        }
    }

    fn rules_response(rules: Vec<SamplingRule>) -> GetSamplingRulesOutput {
        GetSamplingRulesOutput {
            next_token: None,
            sampling_rule_records: rules
                .into_iter()
                .map(|sampling_rule| SamplingRuleRecord { sampling_rule })
                .collect(),
        }
    }

    #[test]
    fn refresh_rules_builds_manifest() {
        let responses = Mutex::new(vec![
            // second refresh: same name, wildcarded
            rules_response(vec![rule("Test", 1, 1.0)]),
            // first refresh
            rules_response(vec![SamplingRule {
                host: "example.com".to_string(),
                http_method: "GET".to_string(),
                service_name: "FooBar".to_string(),
                service_type: "AWS::EC2::Instance".to_string(),
                ..rule("Test", 1, 0.5)
            }]),
        ]);
        let api = MockApi {
            rules: Some(Box::new(move |_input| {
                Ok(responses.lock().unwrap().pop().expect("no more responses"))
            })),
            targets: None,
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();

        strategy.inner.refresh_rules_locked();
        let manifest = strategy.inner.manifest();
        assert_eq!(manifest.rules.len(), 1);
        let r = &manifest.rules[0];
        assert_eq!(r.name, "Test");
        assert_eq!(r.quota.fixed_rate(), 0.5);
        assert_eq!(r.quota.quota(), 0);
        assert_eq!(r.http_method, "GET");
        assert_eq!(r.host, "example.com");
        assert_eq!(r.service_name, "FooBar");
        assert_eq!(r.service_type, "AWS::EC2::Instance");
        let quota = manifest.quotas.get("Test").cloned().expect("quota exists");

        // a refresh with the same rule name keeps the reservoir object
        strategy.inner.refresh_rules_locked();
        let manifest = strategy.inner.manifest();
        assert_eq!(manifest.rules.len(), 1);
        assert!(Arc::ptr_eq(
            manifest.quotas.get("Test").expect("quota exists"),
            &quota
        ));
    }

    #[test]
    fn refresh_rules_keeps_manifest_on_error() {
        let api = MockApi {
            rules: Some(Box::new(|_input| {
                Err(ControlPlaneError::Status(500))
            })),
            targets: None,
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        seed_manifest(&strategy, "FooBar", CentralizedQuota::borrowed(0.5));

        strategy.inner.refresh_rules_locked();
        assert_eq!(strategy.inner.manifest().rules.len(), 1);
    }

    #[test]
    fn refresh_rules_follows_pagination() {
        let calls = AtomicUsize::new(0);
        let api = MockApi {
            rules: Some(Box::new(move |input| {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => {
                        assert!(input.next_token.is_none());
                        Ok(GetSamplingRulesOutput {
                            next_token: Some("more".to_string()),
                            ..rules_response(vec![rule("A", 1, 0.5)])
                        })
                    }
                    1 => {
                        assert_eq!(input.next_token.as_deref(), Some("more"));
                        Ok(rules_response(vec![rule("B", 2, 0.5)]))
                    }
                    _ => panic!("unexpected extra page request"),
                }
            })),
            targets: None,
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        strategy.inner.refresh_rules_locked();
        let manifest = strategy.inner.manifest();
        assert_eq!(manifest.rules.len(), 2);
        assert_eq!(manifest.rules[0].name, "A");
        assert_eq!(manifest.rules[1].name, "B");
    }

    #[test]
    fn rules_sort_by_priority_then_name() {
        let api = MockApi {
            rules: Some(Box::new(|_input| {
                Ok(rules_response(vec![
                    rule("Zeta", 5, 0.5),
                    rule("Beta", 1, 0.5),
                    rule("Alpha", 5, 0.5),
                ]))
            })),
            targets: None,
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        strategy.inner.refresh_rules_locked();
        let names: Vec<String> = strategy
            .inner
            .manifest()
            .rules
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, ["Beta", "Alpha", "Zeta"]);
    }

    fn seed_manifest(strategy: &CentralizedStrategy, name: &str, quota: CentralizedQuota) {
        let quota = Arc::new(quota);
        let rule = Arc::new(CentralizedRule::build(&rule_named(name), Arc::clone(&quota)));
        let mut quotas = HashMap::new();
        quotas.insert(name.to_string(), quota);
        strategy.inner.set_manifest(CentralizedManifest {
            rules: vec![rule],
            quotas,
            refreshed_at: SystemTime::now(),
        });
    }

    fn rule_named(name: &str) -> SamplingRule {
        rule(name, 1, 0.0)
    }

    #[test]
    fn refresh_quota_reports_stats_and_applies_targets() {
        let api = MockApi {
            rules: None,
            targets: Some(Box::new(|input| {
                assert_eq!(input.sampling_statistics_documents.len(), 1);
                let stat = &input.sampling_statistics_documents[0];
                assert_eq!(stat.rule_name, "FooBar");
                assert_eq!(stat.request_count, 30);
                assert_eq!(stat.borrow_count, 10);
                assert_eq!(stat.sampled_count, 20);
                assert_eq!(stat.client_id.len(), 24);
                Ok(GetSamplingTargetsOutput {
                    last_rule_modification: 0.0,
                    sampling_target_documents: vec![SamplingTargetDocument {
                        rule_name: "FooBar".to_string(),
                        fixed_rate: 0.5,
                        reservoir_quota: Some(13),
                        reservoir_quota_ttl: Some(1_000_000_000.0),
                        interval: Some(15),
                    }],
                    unprocessed_statistics: Vec::new(),
                })
            })),
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        seed_manifest(&strategy, "FooBar", CentralizedQuota::with_stats(30, 20, 10));

        strategy.inner.refresh_quotas_locked();

        let manifest = strategy.inner.manifest();
        let quota = manifest.quotas.get("FooBar").expect("quota exists");
        assert_eq!(quota.fixed_rate(), 0.5);
        assert_eq!(quota.quota(), 13);
        assert_eq!(quota.ttl(), 1_000_000_000.0);
        assert_eq!(
            strategy.inner.quota_interval_secs.load(Ordering::Relaxed),
            15
        );
        // counters were snapshotted away
        assert_eq!(quota.snapshot(), QuotaStats::default());
    }

    #[test]
    fn unknown_target_rule_triggers_rule_refresh() {
        let rules_called = Arc::new(AtomicUsize::new(0));
        let rules_called_probe = Arc::clone(&rules_called);
        let api = MockApi {
            rules: Some(Box::new(move |_input| {
                rules_called_probe.fetch_add(1, Ordering::SeqCst);
                Ok(rules_response(vec![rule("Fresh", 1, 0.5)]))
            })),
            targets: Some(Box::new(|_input| {
                Ok(GetSamplingTargetsOutput {
                    last_rule_modification: 0.0,
                    sampling_target_documents: vec![SamplingTargetDocument {
                        rule_name: "SomebodyElse".to_string(),
                        fixed_rate: 0.5,
                        ..SamplingTargetDocument::default()
                    }],
                    unprocessed_statistics: Vec::new(),
                })
            })),
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        seed_manifest(&strategy, "FooBar", CentralizedQuota::borrowed(0.0));

        strategy.inner.refresh_quotas_locked();
        assert_eq!(rules_called.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.inner.manifest().rules[0].name, "Fresh");
    }

    #[test]
    fn newer_rule_modification_triggers_rule_refresh() {
        let rules_called = Arc::new(AtomicUsize::new(0));
        let rules_called_probe = Arc::clone(&rules_called);
        let api = MockApi {
            rules: Some(Box::new(move |_input| {
                rules_called_probe.fetch_add(1, Ordering::SeqCst);
                Ok(rules_response(vec![rule("Fresh", 1, 0.5)]))
            })),
            targets: Some(Box::new(|_input| {
                Ok(GetSamplingTargetsOutput {
                    // far future: newer than any refreshed_at
                    last_rule_modification: 32_503_680_000.0,
                    sampling_target_documents: Vec::new(),
                    unprocessed_statistics: Vec::new(),
                })
            })),
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        seed_manifest(&strategy, "FooBar", CentralizedQuota::borrowed(0.0));

        strategy.inner.refresh_quotas_locked();
        assert_eq!(rules_called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn borrow_takes_one_per_second() {
        let quota = CentralizedQuota::borrowed(0.0);
        assert_eq!(quota.state_at(100), ReservoirState::Borrowing);
        assert!(quota.sample_at(100));
        assert!(!quota.sample_at(100));
        assert!(!quota.sample_at(100));
        assert!(quota.sample_at(101));

        let stats = quota.snapshot();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.borrowed, 2);
        assert_eq!(stats.sampled, 2);
    }

    #[test]
    fn allocated_quota_bounds_samples_per_second() {
        let quota = CentralizedQuota::borrowed(0.0);
        quota.update(&SamplingTargetDocument {
            rule_name: "Test".to_string(),
            fixed_rate: 0.0,
            reservoir_quota: Some(5),
            reservoir_quota_ttl: Some(f64::MAX),
            interval: None,
        });
        assert_eq!(quota.state_at(200), ReservoirState::Allocated);

        let sampled = (0..20).filter(|_| quota.sample_at(200)).count();
        assert_eq!(sampled, 5);
        // the next second refills the bucket
        assert!(quota.sample_at(201));

        let stats = quota.snapshot();
        assert_eq!(stats.requests, 21);
        assert_eq!(stats.sampled, 6);
        assert_eq!(stats.borrowed, 0);
    }

    #[test]
    fn expired_quota_borrows_again() {
        let quota = CentralizedQuota::borrowed(0.0);
        quota.update(&SamplingTargetDocument {
            rule_name: "Test".to_string(),
            fixed_rate: 0.0,
            reservoir_quota: Some(5),
            reservoir_quota_ttl: Some(150.0),
            interval: None,
        });
        assert_eq!(quota.state_at(100), ReservoirState::Allocated);
        assert_eq!(quota.state_at(150), ReservoirState::Expired);

        assert!(quota.sample_at(150));
        assert!(!quota.sample_at(150));
        let stats = quota.snapshot();
        assert_eq!(stats.borrowed, 1);
    }

    #[test]
    fn fixed_rate_handles_quota_overflow() {
        let quota = CentralizedQuota::borrowed(0.0);
        quota.update(&SamplingTargetDocument {
            rule_name: "Test".to_string(),
            fixed_rate: 1.0,
            reservoir_quota: Some(1),
            reservoir_quota_ttl: Some(f64::MAX),
            interval: None,
        });
        // quota grants one, rate 1.0 picks up the rest
        assert!(quota.sample_at(100));
        assert!(quota.sample_at(100));
        assert!(quota.sample_at(100));
    }

    #[test]
    fn evaluate_prefers_lowest_priority_number() {
        let api = MockApi {
            rules: Some(Box::new(|_input| {
                Ok(rules_response(vec![
                    SamplingRule {
                        fixed_rate: 1.0,
                        ..rule("Loose", 2, 1.0)
                    },
                    SamplingRule {
                        host: "example.com".to_string(),
                        ..rule("Tight", 1, 0.0)
                    },
                ]))
            })),
            targets: None,
        };
        let strategy = CentralizedStrategy::with_api(Box::new(api), None).unwrap();
        strategy.inner.refresh_rules_locked();

        let request = SamplingRequest {
            host: "example.com".to_string(),
            ..SamplingRequest::default()
        };
        let decision = strategy
            .inner
            .evaluate(&request, SystemTime::now(), 100)
            .expect("manifest is fresh");
        assert_eq!(decision.rule.as_deref(), Some("Tight"));

        let other = SamplingRequest {
            host: "other.example.org".to_string(),
            ..SamplingRequest::default()
        };
        let decision = strategy
            .inner
            .evaluate(&other, SystemTime::now(), 100)
            .expect("manifest is fresh");
        assert_eq!(decision.rule.as_deref(), Some("Loose"));
    }

    #[test]
    fn stale_manifest_falls_back() {
        let strategy = CentralizedStrategy::with_api(Box::new(MockApi::default()), None).unwrap();
        // empty manifest
        assert!(strategy
            .inner
            .evaluate(&SamplingRequest::default(), SystemTime::now(), 0)
            .is_none());

        // non-empty but old manifest
        let quota = Arc::new(CentralizedQuota::borrowed(1.0));
        let rule = Arc::new(CentralizedRule::build(&rule_named("Old"), Arc::clone(&quota)));
        let mut quotas = HashMap::new();
        quotas.insert("Old".to_string(), quota);
        strategy.inner.set_manifest(CentralizedManifest {
            rules: vec![rule],
            quotas,
            refreshed_at: SystemTime::now() - Duration::from_secs(3601),
        });
        assert!(strategy
            .inner
            .evaluate(&SamplingRequest::default(), SystemTime::now(), 0)
            .is_none());

        // should_trace still answers through the local fallback
        let decision = strategy.should_trace(&SamplingRequest::default());
        assert_eq!(decision.rule.as_deref(), Some("default"));
        strategy.close();
    }

    #[test]
    fn attribute_globs_must_all_match() {
        let mut sampling_rule = rule("Attr", 1, 1.0);
        sampling_rule
            .attributes
            .insert("stage".to_string(), "prod*".to_string());
        let built = CentralizedRule::build(&sampling_rule, Arc::new(CentralizedQuota::borrowed(1.0)));

        let mut matching = SamplingRequest::default();
        matching
            .attributes
            .insert("stage".to_string(), "production".to_string());
        assert!(built.matches(&matching));

        let mut wrong = SamplingRequest::default();
        wrong
            .attributes
            .insert("stage".to_string(), "staging".to_string());
        assert!(!built.matches(&wrong));

        // request without the attribute cannot match
        assert!(!built.matches(&SamplingRequest::default()));
    }

    #[test]
    fn close_stops_pollers() {
        let strategy = CentralizedStrategy::with_api(Box::new(MockApi::default()), None).unwrap();
        let _ = strategy.should_trace(&SamplingRequest::default());
        strategy.close();
        // closing twice is harmless
        strategy.close();
    }
}
