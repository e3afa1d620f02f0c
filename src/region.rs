//! Region catalog
//!
//! Every cacheable artifact belongs to one or more regions. A region is one bit
//! of a 64-bit mask so a single cache entry (or event) can span several of them,
//! and every known region also has a stable string path used on the wire.

use std::{
    collections::HashMap,
    fmt,
    ops::{BitOr, BitOrAssign},
    sync::OnceLock,
};

use tracing::warn;

/// Bitmask of content regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Region(u64);

impl Region {
    /// Sentinel for unrecognized regions. Entries cached under it are never
    /// dependency-tracked.
    pub const UNKNOWN: Region = Region(0);
    pub const BINARY_META: Region = Region(1 << 0);
    pub const TAXONOMY: Region = Region(1 << 1);
    pub const TAXONOMY_META: Region = Region(1 << 2);
    pub const TAXONOMY_KEYWORD_COUNT: Region = Region(1 << 3);
    pub const TAXONOMY_KEYWORD_RELATIONS: Region = Region(1 << 4);
    pub const CATEGORY: Region = Region(1 << 5);
    pub const COMPONENT_LINK: Region = Region(1 << 6);
    pub const COMPONENT_META: Region = Region(1 << 7);
    pub const ITEM_META: Region = Region(1 << 8);
    pub const COMPONENT_PRESENTATION: Region = Region(1 << 9);
    pub const SCHEMA: Region = Region(1 << 10);
    pub const REFERENCE_ENTRY: Region = Region(1 << 11);
    pub const COMPONENT_PRESENTATION_META: Region = Region(1 << 12);
    pub const CUSTOMER_CHARACTERISTIC: Region = Region(1 << 13);
    pub const PAGE_LINK: Region = Region(1 << 14);
    pub const PAGE_META: Region = Region(1 << 15);
    pub const TIME_FRAME: Region = Region(1 << 16);
    pub const TRACKED_COMPONENT: Region = Region(1 << 17);
    pub const TRACKED_COMPONENT_LINK: Region = Region(1 << 18);
    pub const TRACKED_PAGE: Region = Region(1 << 19);
    pub const TRACKING_KEY: Region = Region(1 << 20);
    pub const USER: Region = Region(1 << 21);
    pub const XSLT: Region = Region(1 << 22);
    pub const QUERY_PLAN: Region = Region(1 << 23);
    pub const QUERY_RESULT: Region = Region(1 << 24);
    pub const BINARY_CONTENT: Region = Region(1 << 25);
    pub const COMPONENT_LINK_CLICK: Region = Region(1 << 26);
    pub const COMPONENT_VISIT: Region = Region(1 << 27);
    pub const PAGE_LINK_INFO: Region = Region(1 << 28);
    pub const COMPONENT_LINK_INFO: Region = Region(1 << 29);
    pub const TRANSFORMER: Region = Region(1 << 30);
    pub const TRANSFORMER_RESULTS: Region = Region(1 << 31);
    pub const COMPONENT_META_QUERY: Region = Region(1 << 32);
    pub const PUBLICATION: Region = Region(1 << 33);

    pub const fn from_bits(bits: u64) -> Self {
        Region(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// True when the two masks share at least one region.
    pub const fn intersects(self, other: Region) -> bool {
        self.0 & other.0 != 0
    }

    /// True when every bit of `other` is also set in `self`.
    pub const fn contains(self, other: Region) -> bool {
        self.0 & other.0 == other.0
    }

    /// Resolve a region path. Unrecognized paths map to [`Region::UNKNOWN`]
    /// and log a warning; this never fails.
    pub fn from_path(path: &str) -> Region {
        match path_index().get(&path.to_ascii_lowercase()) {
            Some(region) => *region,
            None => {
                warn!("Unknown cache region \"{}\" encountered.", path);
                Region::UNKNOWN
            }
        }
    }

    /// The canonical path of a single known region, or `None` for composite,
    /// empty or unmapped masks.
    pub fn path(self) -> Option<&'static str> {
        if self.0.count_ones() != 1 {
            return None;
        }
        CATALOG
            .iter()
            .find(|(region, _)| *region == self)
            .map(|(_, path)| *path)
    }

    /// The single-bit regions that make up this mask, lowest bit first.
    pub fn iter(self) -> impl Iterator<Item = Region> {
        (0..u64::BITS)
            .map(|bit| Region(1u64 << bit))
            .filter(move |r| self.intersects(*r))
    }
}

impl BitOr for Region {
    type Output = Region;

    fn bitor(self, rhs: Region) -> Region {
        Region(self.0 | rhs.0)
    }
}

impl BitOrAssign for Region {
    fn bitor_assign(&mut self, rhs: Region) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("Unknown");
        }
        let mut first = true;
        for part in self.iter() {
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            match part.path() {
                Some(path) => f.write_str(path)?,
                None => write!(f, "0x{:x}", part.0)?,
            }
        }
        Ok(())
    }
}

/// Known regions and their wire paths
static CATALOG: &[(Region, &str)] = &[
    (Region::BINARY_META, "/com.tridion.broker.binaries.meta.BinaryMeta"),
    (Region::TAXONOMY, "/com.tridion.broker.Taxonomies.Taxonomy"),
    (Region::TAXONOMY_META, "/com.tridion.broker.Taxonomies.Meta"),
    (Region::TAXONOMY_KEYWORD_COUNT, "/com.tridion.broker.Taxonomy.KeywordCount"),
    (
        Region::TAXONOMY_KEYWORD_RELATIONS,
        "/com.tridion.broker.Taxonomy.KeywordRelations",
    ),
    (Region::CATEGORY, "/com.tridion.broker.meta.categorization.Category"),
    (Region::COMPONENT_LINK, "/com.tridion.linking.ComponentLink"),
    (Region::COMPONENT_META, "/com.tridion.broker.components.meta.ComponentMeta"),
    (Region::ITEM_META, "/com.tridion.storage.ItemMeta"),
    (Region::COMPONENT_PRESENTATION, "/com.tridion.storage.ComponentPresentation"),
    (Region::SCHEMA, "/com.tridion.storage.Schema"),
    (Region::REFERENCE_ENTRY, "/com.tridion.storage.ReferenceEntry"),
    (
        Region::COMPONENT_PRESENTATION_META,
        "/com.tridion.broker.componentpresentations.meta.ComponentPresentationMeta",
    ),
    (
        Region::CUSTOMER_CHARACTERISTIC,
        "/com.tridion.personalization.CustomerCharacteristic",
    ),
    (Region::PAGE_LINK, "/com.tridion.linking.PageLink"),
    (Region::PAGE_META, "/com.tridion.broker.pages.meta.PageMeta"),
    (Region::TIME_FRAME, "/com.tridion.timeframes.Timeframe"),
    (Region::TRACKED_COMPONENT, "/com.tridion.tracking.components.TrackedComponent"),
    (
        Region::TRACKED_COMPONENT_LINK,
        "/com.tridion.tracking.componentlinks.TrackedComponentLink",
    ),
    (Region::TRACKED_PAGE, "/com.tridion.tracking.pages.TrackedPage"),
    (Region::TRACKING_KEY, "/com.tridion.personalization.TrackingKey"),
    (Region::USER, "/com.tridion.user.User"),
    (Region::XSLT, "/com.tridion.storage.XSLT"),
    (Region::QUERY_PLAN, "/com.tridion.storage.QueryPlan"),
    (Region::QUERY_RESULT, "/com.tridion.storage.QueryResult"),
    (Region::BINARY_CONTENT, "/com.tridion.storage.BinaryContent"),
    (Region::COMPONENT_LINK_CLICK, "/com.tridion.storage.ComponentLinkClick"),
    (Region::COMPONENT_VISIT, "/com.tridion.storage.ComponentVisit"),
    (Region::PAGE_LINK_INFO, "/com_tridion_linking_PageLinkInfo"),
    (Region::COMPONENT_LINK_INFO, "/com_tridion_linking_ComponentLinkInfo"),
    (Region::TRANSFORMER, "/com_tridion_Transformer"),
    (Region::TRANSFORMER_RESULTS, "/com_tridion_TransformerResults"),
    (
        Region::COMPONENT_META_QUERY,
        "/com_tridion_broker_components_meta_componentmeta_QueryResults",
    ),
    (Region::PUBLICATION, "/com.tridion.storage.publication"),
];

/// Lowercased path -> region, built once and read-only afterwards.
fn path_index() -> &'static HashMap<String, Region> {
    static INDEX: OnceLock<HashMap<String, Region>> = OnceLock::new();
    INDEX.get_or_init(|| {
        CATALOG
            .iter()
            .map(|(region, path)| (path.to_ascii_lowercase(), *region))
            .collect()
    })
}

/// All known regions in bit order.
pub fn known_regions() -> impl Iterator<Item = (Region, &'static str)> {
    CATALOG.iter().copied()
}
