//! Ownership of the decision engine and the per-session selection cache.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use mart_policy::{
    BatchingConfig, Decision, DecisionService, DecisionServiceConfig, EpsilonGreedyExplorer,
    EventObserver, FixedActionPolicy, MartContext, UploadRetryPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::SettingsStore;
use crate::control::ControlClient;
use crate::error::{MartError, Result};
use crate::observer::Watermark;
use crate::trace::{TraceComponent, TraceLog};

const REWARD_CHOSEN: f32 = 1.0;
const REWARD_IGNORED: f32 = -1.0;

/// Marker stored on a session once its rewards have gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TraceType {
    ClientToServerReward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PresentedProduct {
    pub image_url: String,
    /// Position of the join key this product was chosen under, if any.
    pub join_key_index: Option<usize>,
}

/// Sessions kept before the least recently active one is dropped.
pub const MAX_CACHED_SESSIONS: usize = 10_000;

#[derive(Debug, Clone, Default)]
struct CachedSelection {
    join_keys: Vec<String>,
    products: Vec<PresentedProduct>,
    trace_type: Option<TraceType>,
    last_seen: u64,
}

/// One reward round taken out of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedRound {
    pub join_keys: Vec<String>,
    pub products: Vec<PresentedProduct>,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<String, CachedSelection>,
    clock: u64,
}

impl Sessions {
    fn touch(&mut self, session: &str, capacity: usize) -> &mut CachedSelection {
        self.clock += 1;
        if !self.entries.contains_key(session) && self.entries.len() >= capacity {
            self.evict_oldest();
        }
        let clock = self.clock;
        let entry = self.entries.entry(session.to_string()).or_default();
        entry.last_seen = clock;
        entry
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, s)| s.last_seen)
            .map(|(k, _)| k.clone());
        if let Some(oldest) = oldest {
            debug!(session = %oldest, "selection cache full, dropping oldest session");
            self.entries.remove(&oldest);
        }
    }
}

/// Join keys and presented products per session, bounded by session count.
#[derive(Clone)]
pub struct SelectionCache {
    sessions: Arc<RwLock<Sessions>>,
    capacity: usize,
}

impl Default for SelectionCache {
    fn default() -> Self {
        Self::with_capacity(MAX_CACHED_SESSIONS)
    }
}

impl SelectionCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Records a choice; returns the index of the new join key.
    pub fn record_choice(&self, session: &str, join_key: String, image_url: String) -> usize {
        let mut sessions = self.write();
        let entry = sessions.touch(session, self.capacity);
        entry.join_keys.push(join_key);
        let index = entry.join_keys.len() - 1;
        entry.products.push(PresentedProduct {
            image_url,
            join_key_index: Some(index),
        });
        index
    }

    pub fn join_keys(&self, session: &str) -> Vec<String> {
        self.read()
            .entries
            .get(session)
            .map(|s| s.join_keys.clone())
            .unwrap_or_default()
    }

    pub fn products(&self, session: &str) -> Vec<PresentedProduct> {
        self.read()
            .entries
            .get(session)
            .map(|s| s.products.clone())
            .unwrap_or_default()
    }

    pub fn trace_type(&self, session: &str) -> Option<TraceType> {
        self.read().entries.get(session).and_then(|s| s.trace_type)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the session's keys and products in one step and marks it rewarded.
    ///
    /// Choices recorded afterwards start a new round.
    pub fn take_round(&self, session: &str) -> Option<CachedRound> {
        let mut sessions = self.write();
        let entry = sessions.entries.get_mut(session)?;
        if entry.join_keys.is_empty() {
            return None;
        }
        entry.trace_type = Some(TraceType::ClientToServerReward);
        Some(CachedRound {
            join_keys: std::mem::take(&mut entry.join_keys),
            products: std::mem::take(&mut entry.products),
        })
    }

    pub fn clear(&self) {
        self.write().entries.clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, Sessions> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            warn!(error = "lock poisoned", "selection cache recovering lock (read)");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sessions> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            warn!(error = "lock poisoned", "selection cache recovering lock (write)");
            poisoned.into_inner()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct KeyReward {
    pub join_key: String,
    pub reward: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RewardReport {
    pub rewards: Vec<KeyReward>,
    pub trace_type: TraceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChooseOutcome {
    /// Index into the presented candidates.
    pub index: usize,
    pub action: u32,
    pub probability: f32,
    pub join_key: String,
}

type Engine = DecisionService<FixedActionPolicy>;

/// Lazily created decision engine plus everything reset has to touch.
#[derive(Clone)]
pub struct ServiceLifecycle(Arc<LifecycleInner>);

struct LifecycleInner {
    engine: tokio::sync::RwLock<Option<Arc<Engine>>>,
    settings: SettingsStore,
    trace: TraceLog,
    control: ControlClient,
    watermark: Watermark,
    app_token: String,
}

impl ServiceLifecycle {
    pub fn new(
        app_token: impl Into<String>,
        settings: SettingsStore,
        trace: TraceLog,
        control: ControlClient,
        watermark: Watermark,
    ) -> Self {
        Self(Arc::new(LifecycleInner {
            engine: tokio::sync::RwLock::new(None),
            settings,
            trace,
            control,
            watermark,
            app_token: app_token.into(),
        }))
    }

    pub async fn is_created(&self) -> bool {
        self.0.engine.read().await.is_some()
    }

    /// Starts the decision engine unless one is already running.
    ///
    /// Returns `true` when a new engine was started.
    pub async fn create(&self, action_count: u32, output_dir: &Path, fixed_action: u32) -> bool {
        let mut engine = self.0.engine.write().await;
        if engine.is_some() {
            return false;
        }

        if let Err(err) = self.0.settings.ensure_exists() {
            warn!(path = %self.0.settings.path().display(), error = %err, "could not seed settings file");
        }
        let settings = self.0.settings.load();

        let explorer = EpsilonGreedyExplorer::new(
            FixedActionPolicy::new(fixed_action),
            settings.epsilon,
            action_count,
        );
        let trace = self.0.trace.clone();
        let observer: EventObserver = Arc::new(move |message: &str| {
            trace.append(message);
        });
        let config = DecisionServiceConfig::new(self.0.app_token.clone(), explorer, output_dir)
            .with_batching(engine_batching())
            .with_observer(observer);

        *engine = Some(Arc::new(DecisionService::new(config)));
        info!(action_count, fixed_action, epsilon = settings.epsilon, "decision engine created");
        true
    }

    async fn engine(&self) -> Option<Arc<Engine>> {
        self.0.engine.read().await.clone()
    }

    /// Picks one of `candidates` for the session and remembers the choice.
    pub async fn choose(
        &self,
        cache: &SelectionCache,
        session: &str,
        context: &MartContext,
        candidates: &[String],
    ) -> Result<ChooseOutcome> {
        let engine = self
            .engine()
            .await
            .ok_or_else(|| MartError::Engine("decision engine not created".into()))?;
        if candidates.is_empty() {
            return Err(MartError::Engine("no candidates to choose from".into()));
        }

        let join_key = ulid::Ulid::new().to_string();
        let Decision {
            action,
            probability,
        } = engine.choose_action(&join_key, context);
        let index = (action.saturating_sub(1) as usize).min(candidates.len() - 1);
        cache.record_choice(session, join_key.clone(), candidates[index].clone());

        Ok(ChooseOutcome {
            index,
            action,
            probability,
            join_key,
        })
    }

    /// Credits the chosen product with `+1` and every other presented one with `-1`.
    pub async fn report_reward_for_cached_selections(
        &self,
        cache: &SelectionCache,
        session: &str,
        chosen_index: Option<usize>,
    ) -> Option<RewardReport> {
        let engine = self.engine().await?;
        let CachedRound {
            join_keys,
            products,
        } = cache.take_round(session)?;

        let rewards: Vec<KeyReward> = join_keys
            .into_iter()
            .enumerate()
            .map(|(i, join_key)| {
                let reward = if Some(i) == chosen_index {
                    REWARD_CHOSEN
                } else {
                    REWARD_IGNORED
                };
                engine.report_reward(reward, &join_key);
                KeyReward { join_key, reward }
            })
            .collect();

        let strip = render_product_strip(&products, chosen_index);
        self.0.trace.append_from(
            TraceComponent::Client,
            &format!("Reported rewards for presented products{strip}"),
        );

        Some(RewardReport {
            rewards,
            trace_type: TraceType::ClientToServerReward,
        })
    }

    /// Wipes local and remote state so the next session starts from scratch.
    pub async fn reset(&self) {
        self.0.trace.clear();
        self.stop_engine().await;
        self.0.watermark.reset();
        self.0.control.reset_remote().await;
        info!("application state reset");
    }

    /// Flushes and stops the engine without touching remote state.
    pub async fn shutdown(&self) {
        self.stop_engine().await;
    }

    async fn stop_engine(&self) {
        let engine = self.0.engine.write().await.take();
        if let Some(engine) = engine {
            engine.flush().await;
            engine.dispose().await;
        }
    }
}

fn engine_batching() -> BatchingConfig {
    BatchingConfig {
        max_duration: Duration::from_millis(2000),
        max_buffer_bytes: 1024,
        max_event_count: 100,
        max_upload_queue_capacity: 4,
        upload_retry_policy: UploadRetryPolicy::Retry,
    }
}

fn render_product_strip(products: &[PresentedProduct], chosen_index: Option<usize>) -> String {
    let images: String = products
        .iter()
        .filter_map(|p| {
            let key_index = p.join_key_index?;
            let class = if Some(key_index) == chosen_index {
                "mwt-rewarded"
            } else {
                ""
            };
            Some(format!(
                "<img class=\"{class}\" src=\"{}\" />",
                escape_html(&p.image_url)
            ))
        })
        .collect();
    if images.is_empty() {
        images
    } else {
        format!(" <br /> <br /> {images}")
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockControl;
    use axum::http::StatusCode;
    use chrono::{TimeZone, Utc};
    use mart_policy::EngineEvent;

    struct Fixture {
        lifecycle: ServiceLifecycle,
        trace: TraceLog,
        watermark: Watermark,
        mock: MockControl,
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let mock = MockControl::start(StatusCode::OK, None).await;
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::new(dir.path().join("settings.json"));
        let trace = TraceLog::new(100);
        let watermark = Watermark::default();
        let control = ControlClient::new(
            reqwest::Client::new(),
            mock.base_url.clone(),
            "token",
            settings.clone(),
            trace.clone(),
        );
        let lifecycle =
            ServiceLifecycle::new("token", settings, trace.clone(), control, watermark.clone());
        Fixture {
            lifecycle,
            trace,
            watermark,
            mock,
            dir,
        }
    }

    fn read_events(dir: &Path) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return events;
        };
        let mut paths: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
        paths.sort();
        for path in paths {
            for line in std::fs::read_to_string(path).unwrap().lines() {
                events.push(serde_json::from_str(line).unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn create_is_idempotent_and_seeds_settings() {
        let f = fixture().await;
        let out = f.dir.path().join("out");
        assert!(f.lifecycle.create(3, &out, 1).await);
        assert!(!f.lifecycle.create(3, &out, 1).await);
        assert!(f.lifecycle.is_created().await);
        assert!(f.dir.path().join("settings.json").exists());
        f.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn rewards_credit_only_the_chosen_key() {
        let f = fixture().await;
        let out = f.dir.path().join("out");
        f.lifecycle.create(3, &out, 1).await;

        let cache = SelectionCache::default();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.record_choice("s1", key.to_string(), format!("http://img/{i}.png"));
        }

        let report = f
            .lifecycle
            .report_reward_for_cached_selections(&cache, "s1", Some(1))
            .await
            .unwrap();
        let rewards: Vec<f32> = report.rewards.iter().map(|r| r.reward).collect();
        assert_eq!(rewards, vec![-1.0, 1.0, -1.0]);
        assert!(cache.join_keys("s1").is_empty());
        assert_eq!(cache.trace_type("s1"), Some(TraceType::ClientToServerReward));

        let message = f.trace.snapshot().last().unwrap().message.clone();
        assert!(message.starts_with("Client: Reported rewards"));
        assert!(message.contains("<img class=\"mwt-rewarded\" src=\"http://img/1.png\" />"));
        assert!(message.contains("<img class=\"\" src=\"http://img/0.png\" />"));

        f.lifecycle.shutdown().await;
        let written: Vec<(String, f32)> = read_events(&out)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Reward { key, reward, .. } => Some((key, reward)),
                _ => None,
            })
            .collect();
        assert_eq!(
            written,
            vec![("a".into(), -1.0), ("b".into(), 1.0), ("c".into(), -1.0)]
        );
    }

    #[tokio::test]
    async fn second_round_shows_only_its_own_products() {
        let f = fixture().await;
        f.lifecycle.create(2, &f.dir.path().join("out"), 1).await;
        let cache = SelectionCache::default();
        cache.record_choice("s", "a0".into(), "old0".into());
        cache.record_choice("s", "a1".into(), "old1".into());
        f.lifecycle
            .report_reward_for_cached_selections(&cache, "s", Some(1))
            .await
            .unwrap();
        assert!(cache.products("s").is_empty());

        cache.record_choice("s", "b0".into(), "new0".into());
        cache.record_choice("s", "b1".into(), "new1".into());
        let report = f
            .lifecycle
            .report_reward_for_cached_selections(&cache, "s", Some(1))
            .await
            .unwrap();
        let keys: Vec<&str> = report.rewards.iter().map(|r| r.join_key.as_str()).collect();
        assert_eq!(keys, vec!["b0", "b1"]);

        let message = f.trace.snapshot().last().unwrap().message.clone();
        assert!(!message.contains("old"));
        assert_eq!(message.matches("mwt-rewarded").count(), 1);
        assert!(message.contains("<img class=\"mwt-rewarded\" src=\"new1\" />"));
        f.lifecycle.shutdown().await;
    }

    #[test]
    fn take_round_leaves_later_choices_for_the_next_round() {
        let cache = SelectionCache::default();
        cache.record_choice("s", "k1".into(), "u1".into());
        let round = cache.take_round("s").unwrap();
        assert_eq!(round.join_keys, vec!["k1".to_string()]);
        assert_eq!(round.products.len(), 1);

        assert_eq!(cache.record_choice("s", "k2".into(), "u2".into()), 0);
        assert_eq!(cache.join_keys("s"), vec!["k2".to_string()]);
        assert_eq!(cache.trace_type("s"), Some(TraceType::ClientToServerReward));
        assert_eq!(cache.take_round("s").unwrap().join_keys, vec!["k2".to_string()]);
        assert!(cache.take_round("s").is_none());
    }

    #[test]
    fn full_cache_drops_least_recent_session() {
        let cache = SelectionCache::with_capacity(2);
        cache.record_choice("a", "ka".into(), "u".into());
        cache.record_choice("b", "kb".into(), "u".into());
        cache.record_choice("a", "ka2".into(), "u".into());
        cache.record_choice("c", "kc".into(), "u".into());

        assert_eq!(cache.len(), 2);
        assert!(cache.join_keys("b").is_empty());
        assert_eq!(cache.join_keys("a").len(), 2);
        assert_eq!(cache.join_keys("c"), vec!["kc".to_string()]);
    }

    #[tokio::test]
    async fn no_choice_penalizes_every_key() {
        let f = fixture().await;
        f.lifecycle.create(2, &f.dir.path().join("out"), 1).await;
        let cache = SelectionCache::default();
        cache.record_choice("s", "k1".into(), "u1".into());
        cache.record_choice("s", "k2".into(), "u2".into());

        let report = f
            .lifecycle
            .report_reward_for_cached_selections(&cache, "s", None)
            .await
            .unwrap();
        assert!(report.rewards.iter().all(|r| r.reward == -1.0));
        assert!(!f.trace.snapshot()[0].message.contains("mwt-rewarded"));
        f.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn nothing_to_report_without_keys_or_engine() {
        let f = fixture().await;
        let cache = SelectionCache::default();
        cache.record_choice("s", "k".into(), "u".into());
        assert!(f
            .lifecycle
            .report_reward_for_cached_selections(&cache, "s", Some(0))
            .await
            .is_none());

        f.lifecycle.create(2, &f.dir.path().join("out"), 1).await;
        assert!(f
            .lifecycle
            .report_reward_for_cached_selections(&cache, "unknown", Some(0))
            .await
            .is_none());
        assert!(f.trace.is_empty());
        f.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn choose_records_join_keys_and_interactions() {
        let f = fixture().await;
        let out = f.dir.path().join("out");
        f.lifecycle.create(3, &out, 2).await;
        let cache = SelectionCache::default();
        let candidates: Vec<String> = vec!["p0".into(), "p1".into(), "p2".into()];

        let first = f
            .lifecycle
            .choose(&cache, "s", &MartContext::new("user=1"), &candidates)
            .await
            .unwrap();
        let second = f
            .lifecycle
            .choose(&cache, "s", &MartContext::new("user=1"), &candidates)
            .await
            .unwrap();
        assert!(first.index < 3);
        assert_ne!(first.join_key, second.join_key);
        assert_eq!(cache.join_keys("s"), vec![first.join_key.clone(), second.join_key]);
        assert_eq!(cache.products("s")[0].image_url, candidates[first.index]);

        f.lifecycle.shutdown().await;
        let interactions = read_events(&out)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Interaction { context, .. } if context == "user=1"))
            .count();
        assert_eq!(interactions, 2);
    }

    #[tokio::test]
    async fn choose_without_engine_or_candidates_fails() {
        let f = fixture().await;
        let cache = SelectionCache::default();
        let ctx = MartContext::new("");
        assert!(f.lifecycle.choose(&cache, "s", &ctx, &["p".into()]).await.is_err());
        f.lifecycle.create(2, &f.dir.path().join("out"), 1).await;
        assert!(f.lifecycle.choose(&cache, "s", &ctx, &[]).await.is_err());
        f.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn reset_clears_local_and_remote_state() {
        let f = fixture().await;
        f.lifecycle.create(2, &f.dir.path().join("out"), 1).await;
        f.trace.append("hello");
        f.watermark
            .advance(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        f.lifecycle.reset().await;

        assert!(f.trace.is_empty());
        assert!(!f.lifecycle.is_created().await);
        assert_eq!(f.watermark.get(), chrono::DateTime::<Utc>::default());
        assert_eq!(f.mock.calls_to("/Application/Reset"), 1);

        assert!(f.lifecycle.create(2, &f.dir.path().join("out"), 1).await);
        f.lifecycle.shutdown().await;
    }

    #[test]
    fn product_strip_escapes_urls() {
        let strip = render_product_strip(
            &[PresentedProduct {
                image_url: "http://x/?a=1&b=\"2\"".into(),
                join_key_index: Some(0),
            }],
            Some(0),
        );
        assert_eq!(
            strip,
            " <br /> <br /> <img class=\"mwt-rewarded\" src=\"http://x/?a=1&amp;b=&quot;2&quot;\" />"
        );
        assert_eq!(render_product_strip(&[], None), "");
    }
}
