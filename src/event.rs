//! Invalidation events and their wire envelope
//!
//! The envelope is a single attribute-only XML element:
//!
//! ```text
//! <cacheEvent regionPath="/com.tridion.storage.ComponentPresentation" key="233:685281" type="1"/>
//! ```
//!
//! `key` is omitted when empty. Decoding never fails loudly: malformed or
//! foreign payloads are logged and yield `None`.

use std::{fmt, str::FromStr};

use quick_xml::{
    Reader, Writer,
    events::{BytesStart, Event},
};
use tracing::warn;

use crate::{CacheError, Region};

const ELEMENT: &str = "cacheEvent";
const ATTR_REGION_PATH: &str = "regionPath";
const ATTR_KEY: &str = "key";
const ATTR_TYPE: &str = "type";

/// What a receiver should do with the matching entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Discard every entry of the region
    Flush,
    /// Discard entries of the region whose dependency key starts with the event key
    Invalidate,
}

impl EventType {
    pub fn code(self) -> u8 {
        match self {
            EventType::Flush => 0,
            EventType::Invalidate => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventType::Flush),
            1 => Some(EventType::Invalidate),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Flush => f.write_str("Flush"),
            EventType::Invalidate => f.write_str("Invalidate"),
        }
    }
}

/// One invalidation instruction as carried between nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationEvent {
    region_path: String,
    key: String,
    event_type: EventType,
}

impl InvalidationEvent {
    /// Build an event for a raw region path. Numeric keys are stored in their
    /// string form.
    pub fn new(region_path: impl Into<String>, key: impl fmt::Display, event_type: EventType) -> Self {
        Self {
            region_path: region_path.into(),
            key: key.to_string(),
            event_type,
        }
    }

    /// Build one event per known region bit in `region`. Bits without a path
    /// are skipped with a warning, so an unknown mask yields nothing.
    pub fn for_region(region: Region, key: impl fmt::Display, event_type: EventType) -> Vec<Self> {
        let key = key.to_string();
        let events: Vec<Self> = region
            .iter()
            .filter_map(|bit| match bit.path() {
                Some(path) => Some(Self::new(path, &key, event_type)),
                None => {
                    warn!("No region path for mask 0x{:x}; not broadcasting it.", bit.bits());
                    None
                }
            })
            .collect();
        if events.is_empty() {
            warn!(
                "Nothing to broadcast for region {} (key \"{}\", type {}).",
                region, key, event_type
            );
        }
        events
    }

    pub fn region_path(&self) -> &str {
        &self.region_path
    }

    /// The region mask for this event's path; unknown paths give [`Region::UNKNOWN`].
    pub fn region(&self) -> Region {
        Region::from_path(&self.region_path)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Serialize to the wire envelope.
    pub fn encode(&self) -> Result<String, CacheError> {
        let mut element = BytesStart::new(ELEMENT);
        element.push_attribute((ATTR_REGION_PATH, self.region_path.as_str()));
        if !self.key.is_empty() {
            element.push_attribute((ATTR_KEY, self.key.as_str()));
        }
        let code = self.event_type.code().to_string();
        element.push_attribute((ATTR_TYPE, code.as_str()));

        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Empty(element))
            .map_err(|e| CacheError::Codec(e.to_string()))?;
        String::from_utf8(writer.into_inner()).map_err(|e| CacheError::Codec(e.to_string()))
    }

    /// Parse a wire envelope. Returns `None` (and logs) for anything that is
    /// not a well-formed `cacheEvent` element.
    pub fn decode(payload: &str) -> Option<Self> {
        match parse_envelope(payload) {
            Ok(event) => Some(event),
            Err(reason) => {
                warn!("Failed to decode cache event from \"{}\": {}", payload, reason);
                None
            }
        }
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} region \"{}\" key \"{}\"",
            self.event_type, self.region_path, self.key
        )
    }
}

impl FromStr for InvalidationEvent {
    type Err = CacheError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        parse_envelope(payload).map_err(CacheError::Codec)
    }
}

fn parse_envelope(payload: &str) -> Result<InvalidationEvent, String> {
    if payload.trim().is_empty() {
        return Err("empty payload".to_owned());
    }

    let mut reader = Reader::from_str(payload);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                if e.name().as_ref() != ELEMENT.as_bytes() {
                    return Err(format!(
                        "unexpected element <{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    ));
                }
                return read_attributes(&e);
            }
            Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => return Err("no cacheEvent element".to_owned()),
            Ok(_) => return Err("unexpected content before cacheEvent".to_owned()),
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn read_attributes(element: &BytesStart) -> Result<InvalidationEvent, String> {
    let mut region_path: Option<String> = None;
    let mut key = String::new();
    let mut event_type: Option<EventType> = None;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        match attr.key.as_ref() {
            b"regionPath" => region_path = Some(value.into_owned()),
            b"key" => key = value.into_owned(),
            b"type" => {
                let code = value
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| format!("invalid event type \"{}\"", value))?;
                event_type = Some(
                    EventType::from_code(code).ok_or_else(|| format!("unknown event type {}", code))?,
                );
            }
            _ => {}
        }
    }

    let region_path = region_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "missing regionPath".to_owned())?;
    let event_type = event_type.ok_or_else(|| "missing type".to_owned())?;

    Ok(InvalidationEvent {
        region_path,
        key,
        event_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CP: &str = "/com.tridion.storage.ComponentPresentation";

    #[test]
    fn encode_produces_attribute_envelope() {
        let event = InvalidationEvent::new(CP, "233:685281", EventType::Invalidate);
        assert_eq!(
            event.encode().unwrap(),
            r#"<cacheEvent regionPath="/com.tridion.storage.ComponentPresentation" key="233:685281" type="1"/>"#
        );
    }

    #[test]
    fn empty_key_is_omitted() {
        let event = InvalidationEvent::new(CP, "", EventType::Flush);
        let xml = event.encode().unwrap();
        assert!(!xml.contains("key="));
        assert_eq!(InvalidationEvent::decode(&xml), Some(event));
    }

    #[test]
    fn round_trip_with_escaped_characters() {
        let event = InvalidationEvent::new(CP, "a<b>&\"c\"'d", EventType::Invalidate);
        let decoded = InvalidationEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn numeric_keys_use_their_string_form() {
        let event = InvalidationEvent::new(CP, 233, EventType::Invalidate);
        assert_eq!(event.key(), "233");
    }

    #[test]
    fn decode_accepts_declaration_and_attribute_order() {
        let xml = r#"<?xml version="1.0"?><cacheEvent type="0" key="5" regionPath="/com.tridion.storage.ItemMeta"></cacheEvent>"#;
        let event = InvalidationEvent::decode(xml).unwrap();
        assert_eq!(event.region(), Region::ITEM_META);
        assert_eq!(event.key(), "5");
        assert_eq!(event.event_type(), EventType::Flush);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        for payload in [
            "",
            "   ",
            "not xml at all",
            "<other regionPath=\"x\" type=\"1\"/>",
            "<cacheEvent key=\"1\" type=\"1\"/>",
            "<cacheEvent regionPath=\"/x\" key=\"1\"/>",
            "<cacheEvent regionPath=\"/x\" type=\"7\"/>",
            "<cacheEvent regionPath=\"/x\" type=\"one\"/>",
            "<cacheEvent regionPath=\"/x type=\"1\"/>",
        ] {
            assert_eq!(InvalidationEvent::decode(payload), None, "payload {:?}", payload);
        }
    }

    #[test]
    fn unknown_region_path_still_decodes() {
        let event = InvalidationEvent::decode(r#"<cacheEvent regionPath="/com.example.X" type="0"/>"#)
            .unwrap();
        assert_eq!(event.region(), Region::UNKNOWN);
    }

    #[test]
    fn for_region_splits_multi_bit_masks() {
        let events = InvalidationEvent::for_region(
            Region::ITEM_META | Region::COMPONENT_PRESENTATION,
            "233:685281",
            EventType::Invalidate,
        );
        let paths: Vec<&str> = events.iter().map(|e| e.region_path()).collect();
        assert_eq!(paths, vec!["/com.tridion.storage.ItemMeta", CP]);
        assert!(events.iter().all(|e| e.key() == "233:685281"));
    }

    #[test]
    fn for_region_unknown_yields_nothing() {
        assert!(InvalidationEvent::for_region(Region::UNKNOWN, "1", EventType::Flush).is_empty());
        assert!(
            InvalidationEvent::for_region(Region::from_bits(1 << 50), "1", EventType::Flush)
                .is_empty()
        );
    }

    #[test]
    fn from_str_reports_reason() {
        let err = "<cacheEvent/>".parse::<InvalidationEvent>().unwrap_err();
        assert!(matches!(err, CacheError::Codec(msg) if msg.contains("regionPath")));
    }
}
