//! Standard names: `YYYY-MM-DD-HHMMSS-SSS.ext`.
//!
//! The timestamp is the capture date; `SSS` is a serial starting at 1 that
//! tells apart files captured in the same second within one namespace (a
//! section). Names sort chronologically as plain strings.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month, PrimitiveDateTime, Time};

const STAMP_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]-[hour][minute][second]");
const STAMP_LEN: usize = "YYYY-MM-DD-HHMMSS".len();

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StandardName {
    /// Capture date, truncated to the second.
    pub at: PrimitiveDateTime,
    pub serial: u32,
    /// Lowercase, without the dot.
    pub extension: String,
}
impl StandardName {
    /// The fixed-width timestamp part shared by all names captured in the
    /// same second.
    pub fn stamp(&self) -> String {
        stamp(self.at)
    }

    /// `YYYY/MM` partition used in object keys.
    pub fn partition(&self) -> String {
        format!("{:04}/{:02}", self.at.year(), u8::from(self.at.month()))
    }

    pub fn parse(name: &str) -> Option<Self> {
        let (stem, extension) = name.rsplit_once('.')?;
        let (stamp, serial) = stem.rsplit_once('-')?;
        if stamp.len() != STAMP_LEN || serial.len() < 3 || extension.is_empty() {
            return None;
        }
        let number = |range: std::ops::Range<usize>| stamp.get(range)?.parse::<u16>().ok();
        let date = Date::from_calendar_date(
            i32::from(number(0..4)?),
            Month::try_from(u8::try_from(number(5..7)?).ok()?).ok()?,
            u8::try_from(number(8..10)?).ok()?,
        )
        .ok()?;
        let time = Time::from_hms(
            u8::try_from(number(11..13)?).ok()?,
            u8::try_from(number(13..15)?).ok()?,
            u8::try_from(number(15..17)?).ok()?,
        )
        .ok()?;
        let parsed = Self {
            at: PrimitiveDateTime::new(date, time),
            serial: serial.parse().ok()?,
            extension: extension.to_string(),
        };
        // Reject anything that doesn't format back to the same string.
        (parsed.to_string() == name).then_some(parsed)
    }
}
impl fmt::Display for StandardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}.{}", self.stamp(), self.serial, self.extension)
    }
}

fn stamp(at: PrimitiveDateTime) -> String {
    // Formatting only fails for years the description can't represent.
    at.format(STAMP_FORMAT).unwrap_or_else(|_| {
        format!(
            "{:04}-{:02}-{:02}-{:02}{:02}{:02}",
            at.year(),
            u8::from(at.month()),
            at.day(),
            at.hour(),
            at.minute(),
            at.second()
        )
    })
}

/// Hands out unique standard names per namespace.
///
/// Allocation scans the names already handed out in the namespace for the
/// same timestamp and takes the highest serial plus one. The scan and the
/// insert happen under one lock, so concurrent callers never receive the same
/// name.
#[derive(Default)]
pub struct NameAllocator {
    namespaces: Mutex<HashMap<String, BTreeSet<String>>>,
}
impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, namespace: &str, at: PrimitiveDateTime, extension: &str) -> StandardName {
        let at = at.replace_nanosecond(0).unwrap_or(at);
        let mut namespaces = self.namespaces.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let names = namespaces.entry(namespace.to_string()).or_default();
        let stamp = stamp(at);
        let highest = names
            .range(stamp.clone()..)
            .take_while(|name| name.starts_with(&stamp))
            .filter_map(|name| StandardName::parse(name))
            .filter(|name| name.at == at)
            .map(|name| name.serial)
            .max()
            .unwrap_or(0);
        let name = StandardName {
            at,
            serial: highest + 1,
            extension: extension.to_ascii_lowercase(),
        };
        names.insert(name.to_string());
        name
    }
}
