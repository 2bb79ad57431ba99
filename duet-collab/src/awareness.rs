//! Presence ("awareness") of the peers in a room.
//!
//! Soft state kept apart from document history: one record per peer, each
//! carrying its owner's clock. A record is only ever replaced wholesale by a
//! newer clock from the same peer (last writer wins, no merging).
//!
//! ```text
//! set_local_state ──► AwarenessUpdate { peer, clock+1, state } ──► broadcast
//!                                                                   │
//!              remote AwarenessStore::apply_remote ◄────────────────┘
//!                 clock <= last seen  →  StaleAwarenessUpdate
//!                 state == None       →  record removed, clock kept
//! ```
//!
//! Records that are not refreshed within the timeout are dropped by
//! [`AwarenessStore::expire`]; the owner keeps them alive by re-broadcasting
//! once [`AwarenessStore::needs_renewal`] says so.

use duet_core::RelativePosition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Records not refreshed for this long are considered gone.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A selection in the shared document, anchored to items so it survives
/// concurrent edits. A caret is a range whose ends are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: RelativePosition,
    pub head: RelativePosition,
}

impl CursorRange {
    pub fn caret(at: RelativePosition) -> Self {
        Self { anchor: at, head: at }
    }
}

/// What a peer publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub name: String,
    /// Rendering hint; any string is accepted.
    pub color: String,
    pub cursor: Option<CursorRange>,
    /// Fields this version does not know about, carried untouched.
    pub extra: BTreeMap<String, Vec<u8>>,
}

impl Presence {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            ..Self::default()
        }
    }

    /// Presence with a color derived from the peer id.
    pub fn for_peer(name: impl Into<String>, peer: Uuid) -> Self {
        Self::new(name, peer_color(peer))
    }

    fn set(&mut self, field: PresenceField) {
        match field {
            PresenceField::Name(name) => self.name = name,
            PresenceField::Color(color) => self.color = color,
            PresenceField::Cursor(cursor) => self.cursor = cursor,
            PresenceField::Extra(key, value) => {
                self.extra.insert(key, value);
            }
        }
    }
}

/// A single field of the local presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceField {
    Name(String),
    Color(String),
    Cursor(Option<CursorRange>),
    Extra(String, Vec<u8>),
}

/// One peer's full awareness state at one clock. `state: None` means the
/// peer went offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub peer: Uuid,
    pub clock: u64,
    pub state: Option<Presence>,
}

/// Peers whose visible presence changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

/// Returned when an update is not newer than what is already known.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stale awareness update from {peer}: clock {clock} <= {last_seen}")]
pub struct StaleAwarenessUpdate {
    pub peer: Uuid,
    pub clock: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone)]
struct Record {
    clock: u64,
    state: Option<Presence>,
    /// When the record was last written (for the local peer: broadcast).
    last_seen: Instant,
}

/// Awareness records of every peer in a room, the local one included.
#[derive(Debug, Clone)]
pub struct AwarenessStore {
    local: Uuid,
    records: HashMap<Uuid, Record>,
    timeout: Duration,
}

impl AwarenessStore {
    pub fn new(local: Uuid) -> Self {
        Self::with_timeout(local, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(local: Uuid, timeout: Duration) -> Self {
        Self {
            local,
            records: HashMap::new(),
            timeout,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn local_state(&self) -> Option<&Presence> {
        self.get(&self.local)
    }

    /// Current presence of `peer`, if it has one.
    pub fn get(&self, peer: &Uuid) -> Option<&Presence> {
        self.records.get(peer).and_then(|r| r.state.as_ref())
    }

    /// Last clock seen from `peer` (0 if never heard of).
    pub fn clock(&self, peer: &Uuid) -> u64 {
        self.records.get(peer).map_or(0, |r| r.clock)
    }

    /// Replace the local state and bump the local clock.
    pub fn set_local_state(&mut self, state: Option<Presence>, now: Instant) -> AwarenessUpdate {
        let clock = self.clock(&self.local) + 1;
        self.records.insert(
            self.local,
            Record {
                clock,
                state: state.clone(),
                last_seen: now,
            },
        );
        AwarenessUpdate {
            peer: self.local,
            clock,
            state,
        }
    }

    /// Change one field of the local state, creating it if needed.
    pub fn set_local_field(&mut self, field: PresenceField, now: Instant) -> AwarenessUpdate {
        let mut state = self
            .local_state()
            .cloned()
            .unwrap_or_else(|| Presence::for_peer("", self.local));
        state.set(field);
        self.set_local_state(Some(state), now)
    }

    /// The local state as last published, without bumping the clock.
    pub fn local_update(&self) -> Option<AwarenessUpdate> {
        let record = self.records.get(&self.local)?;
        Some(AwarenessUpdate {
            peer: self.local,
            clock: record.clock,
            state: record.state.clone(),
        })
    }

    /// Whether the local state should be re-broadcast to stay alive.
    pub fn needs_renewal(&self, now: Instant) -> bool {
        self.records.get(&self.local).is_some_and(|r| {
            r.state.is_some() && now.saturating_duration_since(r.last_seen) >= self.timeout / 2
        })
    }

    /// Re-publish the local state under a new clock.
    pub fn renew(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let state = self.local_state().cloned()?;
        Some(self.set_local_state(Some(state), now))
    }

    /// Apply a remote peer's update if it is newer than what we hold.
    pub fn apply_remote(
        &mut self,
        update: &AwarenessUpdate,
        now: Instant,
    ) -> Result<AwarenessChange, StaleAwarenessUpdate> {
        let mut change = AwarenessChange::default();
        if update.peer == self.local {
            // Our own state is only ever written locally.
            return Ok(change);
        }

        let previous = self.records.get(&update.peer);
        let last_seen = previous.map_or(0, |r| r.clock);
        if previous.is_some() && update.clock <= last_seen {
            return Err(StaleAwarenessUpdate {
                peer: update.peer,
                clock: update.clock,
                last_seen,
            });
        }

        let before = previous.and_then(|r| r.state.as_ref());
        match (before, &update.state) {
            (None, Some(_)) => change.added.push(update.peer),
            (Some(old), Some(new)) if old != new => change.updated.push(update.peer),
            (Some(_), None) => change.removed.push(update.peer),
            _ => {}
        }

        self.records.insert(
            update.peer,
            Record {
                clock: update.clock,
                state: update.state.clone(),
                last_seen: now,
            },
        );
        Ok(change)
    }

    /// Drop remote records not refreshed within the timeout. Clocks are kept
    /// so that late duplicates stay rejected.
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for (peer, record) in &mut self.records {
            if *peer == self.local || record.state.is_none() {
                continue;
            }
            if record.last_seen + self.timeout < now {
                record.state = None;
                expired.push(*peer);
            }
        }
        expired.sort();
        if !expired.is_empty() {
            log::debug!("Awareness expired for {} peers", expired.len());
        }
        expired
    }

    /// Forget a peer's presence (it left the room). Returns whether it had one.
    pub fn remove_peer(&mut self, peer: &Uuid) -> bool {
        if *peer == self.local {
            return false;
        }
        self.records
            .get_mut(peer)
            .and_then(|r| r.state.take())
            .is_some()
    }

    /// Every live presence, the local one included.
    pub fn states(&self) -> BTreeMap<Uuid, &Presence> {
        self.records
            .iter()
            .filter_map(|(peer, r)| r.state.as_ref().map(|s| (*peer, s)))
            .collect()
    }
}

/// Stable, vivid `#rrggbb` color derived from a peer id.
pub fn peer_color(peer: Uuid) -> String {
    let hue = (peer.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", byte(r), byte(g), byte(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
