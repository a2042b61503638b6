use dashmap::DashMap;

use crate::mirror::event_store::StoredEvent;
use crate::types::RawEvent;

/// Lazily populated `contact_id -> display_name` cache.
///
/// Only names actually seen on events are cached; misses fall back to a formatted
/// phone number that is recomputed on every lookup so a later event carrying a
/// real name still wins.
#[derive(Debug, Default)]
pub struct NameDirectory {
    names: DashMap<String, String>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the names carried by an event.
    pub fn observe(&self, event: &RawEvent) {
        for participant in [&event.sender, &event.chat] {
            if participant.id.is_empty() {
                continue;
            }
            if let Some(name) = participant.name() {
                self.names.insert(participant.id.clone(), name.to_string());
            }
        }
    }

    pub fn lookup(&self, contact_id: &str) -> Option<String> {
        self.names.get(contact_id).map(|name| name.value().clone())
    }

    /// Resolves a name, scanning `events` on a cache miss.
    pub fn resolve(&self, contact_id: &str, events: &[StoredEvent]) -> String {
        if let Some(name) = self.lookup(contact_id) {
            return name;
        }

        if let Some(name) = find_name(contact_id, events.iter().map(|stored| &stored.event)) {
            self.names.insert(contact_id.to_string(), name.clone());
            return name;
        }

        format_phone_number(contact_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&self) {
        self.names.clear();
    }
}

fn find_name<'a>(contact_id: &str, events: impl Iterator<Item = &'a RawEvent>) -> Option<String> {
    events
        .flat_map(|event| [&event.sender, &event.chat])
        .find(|participant| participant.id == contact_id && participant.name().is_some())
        .and_then(|participant| participant.name().map(str::to_string))
}

/// Formats a contact id as a phone number.
///
/// Provider suffixes such as `@c.us` are ignored. 12 and 13 digit numbers are
/// grouped as `+CC AA NNNN-NNNN` / `+CC AA NNNNN-NNNN`; other digit strings get a
/// leading `+`. Ids without digits are returned unchanged.
pub fn format_phone_number(contact_id: &str) -> String {
    let local_part = contact_id.split('@').next().unwrap_or(contact_id);
    let digits: String = local_part.chars().filter(char::is_ascii_digit).collect();

    match digits.len() {
        0 => contact_id.to_string(),
        12 | 13 => {
            let (country, rest) = digits.split_at(2);
            let (area, number) = rest.split_at(2);
            let (head, tail) = number.split_at(number.len() - 4);
            format!("+{country} {area} {head}-{tail}")
        }
        _ => format!("+{digits}"),
    }
}
