use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use cdcache::{
    CacheError, CacheService, ContentCache, ContentKind, ContentResolver, EventType, Region,
    ServiceConfig, async_trait,
};

const IN_PROCESS: &str = r#"
default_cache_expiry = 5
reconnect_delay_secs = 1

[transport]
type = "in-process"
[transport.settings]
pollIntervalMs = "20"
"#;

#[derive(Default)]
struct Store {
    lookups: AtomicUsize,
}

struct SharedStore(Arc<Store>);

#[async_trait]
impl ContentResolver<String> for SharedStore {
    async fn resolve(
        &self,
        kind: ContentKind,
        item: &str,
        _args: &[String],
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        self.0.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("{} {}", kind, item)))
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn configured_nodes_share_invalidations() {
    let config = ServiceConfig::from_toml(IN_PROCESS).unwrap();
    let publisher: CacheService<String> = CacheService::start(&config).await.unwrap();
    let node: CacheService<String> = CacheService::start(&config).await.unwrap();

    let store = Arc::new(Store::default());
    let content = ContentCache::new(node.cache().clone(), SharedStore(Arc::clone(&store)));
    let cp = "tcm:233-685281";
    let template = "tcm:233-100-32";

    content
        .get(ContentKind::ComponentPresentation, cp, &[template])
        .await
        .unwrap();
    content
        .get(ContentKind::ComponentPresentation, cp, &[template])
        .await
        .unwrap();
    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

    publisher.broadcast_event(Region::COMPONENT_PRESENTATION, "233", EventType::Invalidate);
    let key = "ComponentPresentation-tcm:233-685281-tcm:233-100-32";
    assert!(eventually(|| !node.cache().contains(key)).await);

    content
        .get(ContentKind::ComponentPresentation, cp, &[template])
        .await
        .unwrap();
    assert_eq!(store.lookups.load(Ordering::SeqCst), 2);

    publisher.shutdown().await;
    node.shutdown().await;
}

#[tokio::test]
async fn disabled_expiry_always_resolves() {
    let config = ServiceConfig::from_toml("default_cache_expiry = -1").unwrap();
    let service: CacheService<String> = CacheService::start(&config).await.unwrap();

    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
        let value = service
            .cache()
            .get("Page-tcm:4-20-64", Region::PAGE_META, "4:20", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Some("page".to_owned()))
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref().map(String::as_str), Some("page"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(service.cache().entry_count(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn missing_relay_settings_fail_at_start() {
    let config = ServiceConfig::from_toml(
        r#"
        [transport]
        type = "relay-leaf"
        [transport.settings]
        subscriptionUri = "tcp://localhost:5556"
        "#,
    )
    .unwrap();
    let result = CacheService::<String>::start(&config).await;
    assert!(matches!(result, Err(CacheError::Configuration(_))));
}

#[test]
fn malformed_config_is_rejected() {
    let result = ServiceConfig::from_toml("[transport]\ntype = \"carrier-pigeon\"");
    assert!(matches!(result, Err(CacheError::Config(_))));
}

#[tokio::test]
async fn oversized_expiry_fails_at_start() {
    let config = ServiceConfig::from_toml("default_cache_expiry = 600000000").unwrap();
    let result = CacheService::<String>::start(&config).await;
    assert!(matches!(result, Err(CacheError::Configuration(_))));
}
