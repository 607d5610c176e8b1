//! Strata Integration Tests
//!
//! End-to-end behavior of the cache manager:
//! - Tiered reads, promotion and persistence
//! - Single-flight loading, timeouts and invalidation races
//! - Index tier loading through the dependency graph
//! - Predictive preloading

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tempfile::TempDir;

use strata::cache::{CacheConfig, CacheKey, CacheManager, L1Config, L2Config};
use strata::index::{DependencyGraph, FragmentDecl, FragmentSource, InMemoryFragmentSource};
use strata::preload::PreloadConfig;

fn test_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        l1: L1Config {
            capacity: 64 * 1024,
            default_ttl: None,
            shard_count: 8,
        },
        l2: L2Config {
            dir: dir.path().join("l2"),
            capacity: 1024 * 1024,
            ..Default::default()
        },
        // Prediction off unless a test asks for it, so warming never races
        // the assertions
        preload: PreloadConfig {
            window_size: 100,
            top_k: 0,
        },
        ..Default::default()
    }
}

fn curriculum_graph() -> DependencyGraph {
    DependencyGraph::new(vec![
        FragmentDecl::new("ucdm_comprehensive_index")
            .with_priority(10)
            .with_required_keys(["metadata", "lesson_details", "concept_index", "date_mapping"]),
        FragmentDecl::new("lesson_mapper")
            .depends_on(["ucdm_comprehensive_index"])
            .with_priority(8),
        FragmentDecl::new("lesson_date_mapper")
            .depends_on(["lesson_mapper"])
            .with_priority(8),
        FragmentDecl::new("concepts_index")
            .depends_on(["ucdm_comprehensive_index"])
            .with_priority(7),
        FragmentDecl::new("concept_to_lessons_index")
            .depends_on(["concepts_index"])
            .with_priority(7),
        FragmentDecl::new("365_lessons_indexed")
            .depends_on(["lesson_mapper"])
            .with_priority(5),
        FragmentDecl::new("365_lessons_advanced")
            .depends_on(["365_lessons_indexed"])
            .with_priority(3),
    ])
    .unwrap()
}

fn curriculum_source() -> Arc<InMemoryFragmentSource> {
    Arc::new(
        InMemoryFragmentSource::new()
            .with_fragment(
                "ucdm_comprehensive_index",
                json!({
                    "metadata": {"version": 2},
                    "lesson_details": {"1": {"title": "Nothing I see means anything"}},
                    "concept_index": {"forgiveness": [121, 122], "love": [127]},
                    "date_mapping": {"01-01": 1},
                }),
            )
            .with_fragment("lesson_mapper", json!({"1": "lesson_1"}))
            .with_fragment("lesson_date_mapper", json!({"01-01": "lesson_1"}))
            .with_fragment(
                "concepts_index",
                json!({"concepts": {"forgiveness": {"lessons": 2}, "love": {"lessons": 1}}}),
            )
            .with_fragment(
                "concept_to_lessons_index",
                json!({"forgiveness": [121, 122], "love": [127]}),
            )
            .with_fragment("365_lessons_indexed", json!({"count": 365}))
            .with_fragment("365_lessons_advanced", json!({"count": 365, "advanced": true})),
    )
}

async fn open_manager(config: CacheConfig) -> CacheManager {
    let source: Arc<dyn FragmentSource> = curriculum_source();
    CacheManager::open(config, curriculum_graph(), source).await.unwrap()
}

/// Poll `check` until it holds or two seconds pass
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Tiered reads
// =============================================================================

mod tier_tests {
    use super::*;

    #[tokio::test]
    async fn test_l1_lru_scenario_through_manager() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.l1.capacity = 300;
        let cache = open_manager(config).await;

        let key = |id: &str| CacheKey::new("lesson", id).unwrap();
        for id in ["1", "2", "3"] {
            cache
                .get_or_load(&key(id), |_| async { Ok(Bytes::from(vec![7u8; 100])) })
                .await
                .unwrap();
        }
        cache.get_or_load(&key("1"), |_| async { Err(anyhow::anyhow!("unexpected load")) }).await.unwrap();
        cache
            .get_or_load(&key("4"), |_| async { Ok(Bytes::from(vec![7u8; 100])) })
            .await
            .unwrap();

        assert!(!cache.l1().contains(&key("2")));
        for id in ["1", "3", "4"] {
            assert!(cache.l1().contains(&key(id)), "key {} should remain in L1", id);
        }

        // The evicted key is still on disk
        let data = cache.get(&key("2")).await.unwrap();
        assert_eq!(data.len(), 100);
        let snapshot = cache.metrics_snapshot();
        assert_eq!(snapshot.hits_l2, 1);
        assert!(snapshot.evictions_l1 >= 1);
    }

    #[tokio::test]
    async fn test_every_request_counted_once() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let key = CacheKey::new("lesson", "42").unwrap();

        // Miss, then L1 hit
        cache
            .get_or_load(&key, |_| async { Ok(Bytes::from_static(b"lesson 42")) })
            .await
            .unwrap();
        cache.get_or_load(&key, |_| async { Err(anyhow::anyhow!("unexpected load")) }).await.unwrap();

        // L2 hit once L1 has lost it
        cache.l1().invalidate(&key);
        cache.get_or_load(&key, |_| async { Err(anyhow::anyhow!("unexpected load")) }).await.unwrap();

        // Plain lookup miss
        assert!(cache.get(&CacheKey::new("lesson", "absent").unwrap()).await.is_none());

        let snapshot = cache.metrics_snapshot();
        assert_eq!(snapshot.hits_l1, 1);
        assert_eq!(snapshot.hits_l2, 1);
        assert_eq!(snapshot.misses, 2);
        assert_eq!(snapshot.loader_invocations, 1);
        assert_eq!(
            snapshot.hits_l1 + snapshot.hits_l2 + snapshot.hits_index + snapshot.misses,
            4
        );
    }

    #[tokio::test]
    async fn test_l2_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::new("lesson", "7").unwrap();
        let payload = Bytes::from("forgiveness ".repeat(500));

        {
            let cache = open_manager(test_config(&dir)).await;
            cache.put(key.clone(), payload.clone(), None).await.unwrap();
            cache.shutdown().await.unwrap();
        }

        let cache = open_manager(test_config(&dir)).await;
        assert!(!cache.l1().contains(&key));
        assert_eq!(cache.get(&key).await.unwrap(), payload);
        assert_eq!(cache.metrics_snapshot().hits_l2, 1);
        assert!(cache.l1().contains(&key));
    }

    #[tokio::test]
    async fn test_corrupt_payload_dropped_on_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::new("lesson", "8").unwrap();

        let path = {
            let cache = open_manager(test_config(&dir)).await;
            cache
                .put(key.clone(), Bytes::from_static(b"a short lesson body"), None)
                .await
                .unwrap();
            cache.shutdown().await.unwrap();
            cache.l2().payload_path(&key).unwrap()
        };

        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let cache = open_manager(test_config(&dir)).await;
        assert!(!cache.l2().contains(&key));
        assert!(cache.get(&key).await.is_none());
    }
}

// =============================================================================
// Loading
// =============================================================================

mod loading_tests {
    use super::*;
    use assert_matches::assert_matches;
    use strata::Error;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let key = CacheKey::new("concept", "love").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(&key, move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Bytes::from_static(b"lessons 127"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().as_ref(), b"lessons 127");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snapshot = cache.metrics_snapshot();
        assert_eq!(snapshot.loader_invocations, 1);
        assert_eq!(snapshot.hits_l1 + snapshot.hits_l2 + snapshot.misses, 32);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_reaches_every_waiter_and_is_retried() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let key = CacheKey::new("concept", "fear").unwrap();

        let a = cache.get_or_load(&key, |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow::anyhow!("source offline"))
        });
        let b = cache.get_or_load(&key, |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow::anyhow!("source offline"))
        });
        let (a, b) = tokio::join!(a, b);
        assert_matches!(a, Err(Error::LoadFailed { .. }));
        assert_matches!(b, Err(Error::LoadFailed { .. }));

        let value = cache
            .get_or_load(&key, |_| async { Ok(Bytes::from_static(b"recovered")) })
            .await
            .unwrap();
        assert_eq!(value.as_ref(), b"recovered");
        assert_eq!(cache.metrics_snapshot().load_failures, 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_load_running() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let key = CacheKey::new("lesson", "slow").unwrap();

        let result = cache
            .get_or_load_with_timeout(&key, Duration::from_millis(20), |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Bytes::from_static(b"worth the wait"))
            })
            .await;
        assert_matches!(result, Err(Error::Timeout { .. }));

        assert!(eventually(|| cache.l1().contains(&key)).await);
        assert_eq!(cache.get(&key).await.unwrap().as_ref(), b"worth the wait");

        let snapshot = cache.metrics_snapshot();
        assert_eq!(snapshot.loader_invocations, 1);
        assert_eq!(snapshot.load_timeouts, 1);
    }

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.load_timeout = Some(Duration::from_millis(10));
        let cache = open_manager(config).await;

        let result = cache
            .get_or_load(&CacheKey::new("lesson", "slow").unwrap(), |_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Bytes::new())
            })
            .await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_during_load_never_serves_stale_value() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let key = CacheKey::new("lesson", "365").unwrap();
        let (release, gate) = oneshot::channel::<()>();

        let old = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load(&key, move |_| async move {
                        let _ = gate.await;
                        Ok(Bytes::from_static(b"old"))
                    })
                    .await
            })
        };
        assert!(eventually(|| cache.in_flight() == 1).await);

        cache.invalidate(&key).await.unwrap();

        // Issued after invalidation, while the old load is still running
        let fresh = cache
            .get_or_load(&key, |_| async { Ok(Bytes::from_static(b"new")) })
            .await
            .unwrap();
        assert_eq!(fresh.as_ref(), b"new");

        release.send(()).unwrap();
        // The old caller may see its own result; the tiers must not
        assert!(old.await.unwrap().is_ok());
        assert_eq!(cache.get(&key).await.unwrap().as_ref(), b"new");
        assert_eq!(cache.l1().get(&key).unwrap().as_ref(), b"new");
        assert!(cache.metrics_snapshot().fenced_writes >= 1);
    }

    #[tokio::test]
    async fn test_invalidate_matching_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        for id in ["1", "2", "3"] {
            cache
                .put(CacheKey::new("lesson", id).unwrap(), Bytes::from_static(b"body"), None)
                .await
                .unwrap();
        }
        cache
            .put(CacheKey::new("concept", "love").unwrap(), Bytes::from_static(b"body"), None)
            .await
            .unwrap();

        let removed = cache
            .invalidate_matching(|key| key.namespace() == "lesson")
            .await
            .unwrap();
        assert_eq!(removed, 6);
        assert!(cache.get(&CacheKey::new("lesson", "1").unwrap()).await.is_none());
        assert!(cache.get(&CacheKey::new("concept", "love").unwrap()).await.is_some());
    }
}

// =============================================================================
// Index tier
// =============================================================================

mod index_tests {
    use super::*;
    use assert_matches::assert_matches;
    use strata::index::{FragmentState, JsonDirSource, StructuredQuery};
    use strata::Error;

    #[tokio::test]
    async fn test_ensure_loaded_loads_closure_in_order() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;

        let loaded = cache.ensure_loaded(&["concept_to_lessons_index"]).await.unwrap();
        assert_eq!(
            loaded,
            vec!["ucdm_comprehensive_index", "concepts_index", "concept_to_lessons_index"]
        );
        assert_eq!(cache.index().state("lesson_mapper"), Some(FragmentState::Unloaded));

        let love = cache
            .lookup(&StructuredQuery::pointer("concept_to_lessons_index", "/love"))
            .unwrap();
        assert_eq!(love, json!([127]));
    }

    #[tokio::test]
    async fn test_lookup_never_waits_for_unloaded_fragment() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;

        assert!(cache.lookup(&StructuredQuery::fragment("lesson_mapper")).is_none());
        assert_eq!(cache.index().state("lesson_mapper"), Some(FragmentState::Unloaded));

        // Probing an index key requests the fragment in the background
        let key = CacheKey::index("lesson_mapper#/1");
        assert!(cache.get(&key).await.is_none());
        assert!(eventually(|| cache.index().is_loaded("lesson_mapper")).await);

        let value = cache.get(&key).await.unwrap();
        assert_eq!(value.as_ref(), br#""lesson_1""#);
        assert_eq!(cache.metrics_snapshot().hits_index, 1);
    }

    #[tokio::test]
    async fn test_fragment_invalidation_cascades_to_dependents() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        cache.ensure_loaded(&["365_lessons_advanced"]).await.unwrap();

        let key = CacheKey::index("365_lessons_indexed#/count");
        assert_eq!(cache.get(&key).await.unwrap().as_ref(), b"365");

        let affected = cache.invalidate_fragment("lesson_mapper").await.unwrap();
        for id in ["lesson_mapper", "365_lessons_indexed", "365_lessons_advanced"] {
            assert!(affected.iter().any(|a| a == id), "{} should be affected", id);
            assert_ne!(cache.index().state(id), Some(FragmentState::Loaded));
        }
        assert!(cache.index().is_loaded("ucdm_comprehensive_index"));
        assert!(!cache.l1().contains(&key));
    }

    #[tokio::test]
    async fn test_failed_fragment_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let source = curriculum_source();
        source.fail("concepts_index", "disk unavailable");
        let cache = CacheManager::open(test_config(&dir), curriculum_graph(), source.clone())
            .await
            .unwrap();

        let result = cache.ensure_loaded(&["concept_to_lessons_index"]).await;
        assert_matches!(result, Err(Error::FragmentLoadFailed { .. }));
        assert_eq!(cache.index().state("concepts_index"), Some(FragmentState::Failed));
        assert!(cache.index().is_loaded("ucdm_comprehensive_index"));

        source.clear_failure("concepts_index");
        cache.ensure_loaded(&["concept_to_lessons_index"]).await.unwrap();
        assert!(cache.index().is_loaded("concept_to_lessons_index"));
    }

    #[tokio::test]
    async fn test_json_dir_source() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(
            data.join("concepts_index.json"),
            r#"{"concepts": {"atonement": {"lessons": 4}}}"#,
        )
        .unwrap();

        let graph = DependencyGraph::new(vec![FragmentDecl::new("concepts_index")]).unwrap();
        let cache = CacheManager::open(test_config(&dir), graph, Arc::new(JsonDirSource::new(&data)))
            .await
            .unwrap();

        cache.ensure_loaded(&["concepts_index"]).await.unwrap();
        let lessons = cache
            .lookup(&StructuredQuery::pointer("concepts_index", "/concepts/atonement/lessons"))
            .unwrap();
        assert_eq!(lessons, json!(4));
    }

    #[test]
    fn test_cyclic_graph_rejected() {
        let result = DependencyGraph::new(vec![
            FragmentDecl::new("a").depends_on(["c"]),
            FragmentDecl::new("b").depends_on(["a"]),
            FragmentDecl::new("c").depends_on(["b"]),
        ]);
        assert_matches!(result, Err(Error::CycleDetected { .. }));
    }
}

// =============================================================================
// Predictive preloading
// =============================================================================

mod preload_tests {
    use super::*;

    #[tokio::test]
    async fn test_prediction_prefers_frequent_successor() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let (a, b, c) = (
            CacheKey::new("lesson", "a").unwrap(),
            CacheKey::new("lesson", "b").unwrap(),
            CacheKey::new("lesson", "c").unwrap(),
        );

        for _ in 0..5 {
            cache.observe(&a);
            cache.observe(&b);
        }
        for _ in 0..2 {
            cache.observe(&a);
            cache.observe(&c);
        }

        let predicted: Vec<CacheKey> = cache
            .preloader()
            .predict_next(&a)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(predicted, vec![b, c]);
    }

    #[tokio::test]
    async fn test_predicted_index_key_is_warmed() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.preload = PreloadConfig {
            window_size: 50,
            top_k: 1,
        };
        let cache = open_manager(config).await;

        let forgiveness = CacheKey::index("concept_to_lessons_index#/forgiveness");
        let love = CacheKey::index("concept_to_lessons_index#/love");
        for _ in 0..3 {
            cache.observe(&forgiveness);
            cache.observe(&love);
        }
        assert!(eventually(|| cache.preloader().in_flight() == 0).await);
        cache.invalidate_fragment("concept_to_lessons_index").await.unwrap();
        assert!(!cache.l1().contains(&love));

        // Seeing `forgiveness` again predicts `love` and warms it
        cache.observe(&forgiveness);
        assert!(eventually(|| cache.l1().contains(&love)).await);
        assert!(cache.index().is_loaded("concept_to_lessons_index"));
        assert!(cache.metrics_snapshot().preloads_issued >= 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let cache = open_manager(test_config(&dir)).await;
        let (a, b) = (CacheKey::new("lesson", "a").unwrap(), CacheKey::new("lesson", "b").unwrap());

        cache.observe_in("reader-1", &a);
        cache.observe_in("reader-1", &b);
        cache.observe_in("reader-2", &b);
        cache.observe_in("reader-2", &a);

        assert_eq!(cache.preloader().predict_next_in("reader-1", &a)[0].0, b);
        assert_eq!(cache.preloader().predict_next_in("reader-2", &b)[0].0, a);
        assert!(cache.preloader().predict_next(&a).is_empty());
    }
}
