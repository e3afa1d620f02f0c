//! Item URIs (`tcm:{publication}-{item}[-{type}][-v{version}]`) and the
//! dependency keys derived from them.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;

/// Item type assumed when a URI omits it
const DEFAULT_ITEM_TYPE: u32 = 16;

// A constant pattern cannot fail at runtime once it compiles in the tests.
static URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^tcm:(\d+)-(\d+)(?:-(\d+))?(?:-v(\d+))?$").expect("item uri pattern is valid")
});

/// A parsed content item identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemUri {
    pub publication_id: u32,
    pub item_id: u32,
    pub item_type: u32,
    pub version: u32,
}

impl ItemUri {
    pub const NULL: ItemUri = ItemUri {
        publication_id: 0,
        item_id: 0,
        item_type: 0,
        version: 0,
    };

    pub fn new(publication_id: u32, item_id: u32) -> Self {
        Self {
            publication_id,
            item_id,
            item_type: DEFAULT_ITEM_TYPE,
            version: 0,
        }
    }

    pub fn with_type(mut self, item_type: u32) -> Self {
        self.item_type = item_type;
        self
    }

    /// Parse leniently: anything that is not a valid item URI becomes [`ItemUri::NULL`].
    pub fn parse(uri: &str) -> Self {
        uri.parse().unwrap_or(ItemUri::NULL)
    }

    pub fn is_null(&self) -> bool {
        self.publication_id == 0 && self.item_id == 0 && self.item_type == 0
    }

    /// Move this item into the publication identified by `publication`'s item id.
    pub fn map_publication(&mut self, publication: &ItemUri) {
        if self.is_null() || publication.is_null() {
            return;
        }
        self.publication_id = publication.item_id;
    }

    /// Dependency key used to tie cache entries to invalidation events:
    /// `"{publication}:{item}"`, or `"0"` for items outside any publication.
    pub fn cache_key(&self) -> String {
        if self.publication_id == 0 {
            "0".to_owned()
        } else {
            format!("{}:{}", self.publication_id, self.item_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidItemUri(String);

impl fmt::Display for InvalidItemUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid item uri \"{}\"", self.0)
    }
}

impl std::error::Error for InvalidItemUri {}

impl FromStr for ItemUri {
    type Err = InvalidItemUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidItemUri(s.to_owned());
        let caps = URI_PATTERN.captures(s.trim()).ok_or_else(invalid)?;
        let number = |idx: usize| -> Result<Option<u32>, InvalidItemUri> {
            match caps.get(idx) {
                Some(m) => m.as_str().parse::<u32>().map(Some).map_err(|_| invalid()),
                None => Ok(None),
            }
        };

        Ok(ItemUri {
            publication_id: number(1)?.unwrap_or(0),
            item_id: number(2)?.unwrap_or(0),
            item_type: number(3)?.unwrap_or(DEFAULT_ITEM_TYPE),
            version: number(4)?.unwrap_or(0),
        })
    }
}

impl fmt::Display for ItemUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version > 0 {
            write!(
                f,
                "tcm:{}-{}-{}-v{}",
                self.publication_id, self.item_id, self.item_type, self.version
            )
        } else if self.item_type == DEFAULT_ITEM_TYPE {
            write!(f, "tcm:{}-{}", self.publication_id, self.item_id)
        } else {
            write!(f, "tcm:{}-{}-{}", self.publication_id, self.item_id, self.item_type)
        }
    }
}
