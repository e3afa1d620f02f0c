//! Content lookups through the local cache
//!
//! Ties an external content resolver to a [`LocalCache`]: each kind of
//! lookup is cached under `"{Kind}-{item}-{args...}"`, classified by the
//! regions whose changes make it stale, and depends on the item's
//! `"{publication}:{item}"` key.

use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::debug;

use crate::{CacheError, ItemUri, Region, local_cache::LocalCache};

/// Kinds of content lookups and the regions they depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    ComponentLink,
    BinaryLink,
    PageLink,
    ComponentMeta,
    Page,
    Binary,
    ComponentPresentation,
    ComponentPresentationWithHighestPriority,
    AssembleComponentPresentation,
    /// Not tied to any item; cached entries only expire
    Taxonomies,
    Keyword,
    Keywords,
}

impl ContentKind {
    pub fn name(self) -> &'static str {
        match self {
            ContentKind::ComponentLink => "ComponentLink",
            ContentKind::BinaryLink => "BinaryLink",
            ContentKind::PageLink => "PageLink",
            ContentKind::ComponentMeta => "ComponentMeta",
            ContentKind::Page => "Page",
            ContentKind::Binary => "Binary",
            ContentKind::ComponentPresentation => "ComponentPresentation",
            ContentKind::ComponentPresentationWithHighestPriority => {
                "ComponentPresentationWithHighestPriority"
            }
            ContentKind::AssembleComponentPresentation => "AssembleComponentPresentation",
            ContentKind::Taxonomies => "Taxonomies",
            ContentKind::Keyword => "Keyword",
            ContentKind::Keywords => "Keywords",
        }
    }

    /// Regions whose invalidation evicts results of this kind.
    pub fn region(self) -> Region {
        match self {
            ContentKind::ComponentLink => Region::ITEM_META | Region::COMPONENT_LINK,
            ContentKind::BinaryLink => Region::ITEM_META | Region::BINARY_META,
            ContentKind::PageLink => {
                Region::ITEM_META | Region::PAGE_LINK | Region::PAGE_LINK_INFO
            }
            ContentKind::ComponentMeta => {
                Region::ITEM_META | Region::COMPONENT_META | Region::COMPONENT_PRESENTATION_META
            }
            ContentKind::Page => Region::ITEM_META | Region::PAGE_META,
            ContentKind::Binary => {
                Region::ITEM_META | Region::BINARY_CONTENT | Region::BINARY_META
            }
            ContentKind::ComponentPresentation
            | ContentKind::ComponentPresentationWithHighestPriority
            | ContentKind::AssembleComponentPresentation => {
                Region::ITEM_META
                    | Region::COMPONENT_PRESENTATION
                    | Region::COMPONENT_PRESENTATION_META
            }
            ContentKind::Taxonomies => Region::UNKNOWN,
            ContentKind::Keyword | ContentKind::Keywords => {
                Region::TAXONOMY | Region::TAXONOMY_KEYWORD_COUNT | Region::TAXONOMY_KEYWORD_RELATIONS
            }
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves content from the external content store
#[async_trait]
pub trait ContentResolver<V>: Send + Sync + 'static {
    /// Look up `item` (an item URI) with the kind-specific `args`.
    async fn resolve(
        &self,
        kind: ContentKind,
        item: &str,
        args: &[String],
    ) -> Result<Option<V>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Cached content lookups
pub struct ContentCache<V, R> {
    cache: LocalCache<V>,
    resolver: Arc<R>,
}

impl<V, R> Clone for ContentCache<V, R> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<V, R> ContentCache<V, R>
where
    V: Send + Sync + 'static,
    R: ContentResolver<V>,
{
    pub fn new(cache: LocalCache<V>, resolver: R) -> Self {
        Self {
            cache,
            resolver: Arc::new(resolver),
        }
    }

    pub fn cache(&self) -> &LocalCache<V> {
        &self.cache
    }

    /// Cached lookup of `kind` for `item`.
    pub async fn get(
        &self,
        kind: ContentKind,
        item: &str,
        args: &[&str],
    ) -> Result<Option<Arc<V>>, CacheError> {
        let key = cache_key(kind, item, args);
        let dependency_key = ItemUri::parse(item).cache_key();
        debug!("{}: item \"{}\" (dependency {})", kind, item, dependency_key);

        let args: Vec<String> = args.iter().map(|a| (*a).to_owned()).collect();
        let resolver = Arc::clone(&self.resolver);
        let item = item.to_owned();
        self.cache
            .get(&key, kind.region(), &dependency_key, move || async move {
                resolver.resolve(kind, &item, &args).await
            })
            .await
    }
}

/// `"{Kind}-{item}-{arg}..."`
pub fn cache_key(kind: ContentKind, item: &str, args: &[&str]) -> String {
    let mut key = format!("{}-{}", kind, item);
    for arg in args {
        key.push('-');
        key.push_str(arg);
    }
    key
}
