//! Channels, channel maps and substitutions.
//!
//! A [`Channel`] is the resolved wire for one named flow: a key-sorted list of
//! [`DataSlot`]s. A [`ChannelMap`] caches channels per name and per
//! substitution key, and merges new sources into them copy-on-write.

use crate::config::SEQUENCE_EPSILON;
use crate::data::{DataEntry, DataType, EntryId};
use crate::invariant_ppt::{assert_invariant, CHANNEL_MERGE_IDENTITY, SEQUENCE_ORDERED};
use crate::operator::SequenceAccess;
use crate::process::ProcessNodeId;
use crate::request::RequestNodeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stable channel identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

/// Identity of a channel map, used for copy-on-write ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapId(pub u64);

/// One keyed value inside a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSlot {
    /// Entry holding the value.
    pub entry: EntryId,
    /// Sequence key.
    pub key: f32,
    /// Process node that writes the entry, if any.
    pub creator: Option<ProcessNodeId>,
}

impl DataSlot {
    /// Slot for an authored value.
    pub fn new(entry: EntryId, key: f32) -> Self {
        Self {
            entry,
            key,
            creator: None,
        }
    }
}

/// Who is told when a channel's data changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    /// A process node reading the channel.
    Process(ProcessNodeId),
    /// A request node exposing the channel.
    Request(RequestNodeId),
}

/// Result of a sequence lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequenceValue {
    /// A stored entry.
    Entry(EntryId),
    /// Synthetic interpolation weight in `[0, 1]`.
    Weight(f32),
}

/// Resolved wire: key-sorted slots plus listeners.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    owner: MapId,
    slots: Vec<DataSlot>,
    listeners: Vec<Listener>,
}

impl Channel {
    /// Identity.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Slots in ascending key order.
    pub fn slots(&self) -> &[DataSlot] {
        &self.slots
    }

    /// Listeners.
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Map that created this channel.
    pub fn owner(&self) -> MapId {
        self.owner
    }

    /// Process nodes writing any of the slots.
    pub fn creators(&self) -> impl Iterator<Item = ProcessNodeId> + '_ {
        self.slots.iter().filter_map(|s| s.creator)
    }
}

pub(crate) struct EntryRecord {
    pub(crate) entry: DataEntry,
    pub(crate) channels: Vec<ChannelId>,
}

/// Arena for data entries and channels.
pub(crate) struct DataStore {
    entries: Vec<Option<EntryRecord>>,
    channels: HashMap<ChannelId, Channel>,
    next_channel: u64,
    next_map: u64,
    epsilon: f32,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new(SEQUENCE_EPSILON)
    }
}

impl DataStore {
    pub(crate) fn new(epsilon: f32) -> Self {
        Self {
            entries: Vec::new(),
            channels: HashMap::new(),
            next_channel: 0,
            next_map: 0,
            epsilon,
        }
    }

    pub(crate) fn insert_entry(&mut self, entry: DataEntry) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(Some(EntryRecord {
            entry,
            channels: Vec::new(),
        }));
        id
    }

    pub(crate) fn entry(&self, id: EntryId) -> Option<&DataEntry> {
        self.entries.get(id.0)?.as_ref().map(|r| &r.entry)
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Option<&mut DataEntry> {
        self.entries.get_mut(id.0)?.as_mut().map(|r| &mut r.entry)
    }

    /// Channels currently holding the entry.
    pub(crate) fn entry_channels(&self, id: EntryId) -> Vec<ChannelId> {
        self.entries
            .get(id.0)
            .and_then(|r| r.as_ref())
            .map(|r| r.channels.clone())
            .unwrap_or_default()
    }

    /// Temporarily move an entry out so it can be written while others are read.
    pub(crate) fn take_entry(&mut self, id: EntryId) -> Option<EntryRecord> {
        self.entries.get_mut(id.0)?.take()
    }

    pub(crate) fn restore_entry(&mut self, id: EntryId, record: EntryRecord) {
        if let Some(slot) = self.entries.get_mut(id.0) {
            *slot = Some(record);
        }
    }

    pub(crate) fn free_entry(&mut self, id: EntryId) {
        if let Some(slot) = self.entries.get_mut(id.0) {
            *slot = None;
        }
    }

    pub(crate) fn new_map(&mut self) -> ChannelMap {
        self.next_map += 1;
        ChannelMap::new(MapId(self.next_map))
    }

    pub(crate) fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn watch_entry(&mut self, entry: EntryId, channel: ChannelId) {
        if let Some(Some(record)) = self.entries.get_mut(entry.0) {
            record.channels.push(channel);
        }
    }

    fn unwatch_entry(&mut self, entry: EntryId, channel: ChannelId) {
        if let Some(Some(record)) = self.entries.get_mut(entry.0) {
            if let Some(pos) = record.channels.iter().position(|c| *c == channel) {
                record.channels.swap_remove(pos);
            }
        }
    }

    pub(crate) fn create_channel(&mut self, owner: MapId, slots: Vec<DataSlot>) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        self.channels.insert(
            id,
            Channel {
                id,
                owner,
                slots: Vec::new(),
                listeners: Vec::new(),
            },
        );
        for slot in slots {
            self.add_slot(id, slot);
        }
        id
    }

    /// Shallow copy owned by `owner`. Listeners are not copied.
    pub(crate) fn copy_channel(&mut self, id: ChannelId, owner: MapId) -> ChannelId {
        let slots = self
            .channels
            .get(&id)
            .map(|c| c.slots.clone())
            .unwrap_or_default();
        self.create_channel(owner, slots)
    }

    pub(crate) fn free_channel(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.remove(&id) {
            for slot in channel.slots {
                self.unwatch_entry(slot.entry, id);
            }
        }
    }

    pub(crate) fn add_listener(&mut self, id: ChannelId, listener: Listener) {
        if let Some(channel) = self.channels.get_mut(&id) {
            if !channel.listeners.contains(&listener) {
                channel.listeners.push(listener);
            }
        }
    }

    pub(crate) fn remove_listener(&mut self, id: ChannelId, listener: Listener) {
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.listeners.retain(|l| *l != listener);
        }
    }

    /// Type of the channel's first entry.
    pub(crate) fn channel_type(&self, id: ChannelId) -> Option<DataType> {
        let first = self.channels.get(&id)?.slots.first()?;
        self.entry(first.entry).map(DataEntry::data_type)
    }

    fn same_key(&self, a: f32, b: f32) -> bool {
        (a - b).abs() <= self.epsilon
    }

    /// Insert a slot keeping keys ascending; a slot at an equal key replaces the entry.
    pub(crate) fn add_slot(&mut self, id: ChannelId, slot: DataSlot) {
        let epsilon = self.epsilon;
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let mut replaced = None;
        match channel
            .slots
            .iter()
            .position(|s| (s.key - slot.key).abs() <= epsilon || s.key > slot.key)
        {
            Some(pos) if (channel.slots[pos].key - slot.key).abs() <= epsilon => {
                replaced = Some(channel.slots[pos].entry);
                channel.slots[pos].entry = slot.entry;
                channel.slots[pos].creator = slot.creator;
            }
            Some(pos) => channel.slots.insert(pos, slot),
            None => channel.slots.push(slot),
        }
        assert_invariant(
            SEQUENCE_ORDERED,
            channel.slots.windows(2).all(|w| w[0].key < w[1].key),
            "channel slots stay sorted by key",
            Some("add_slot"),
        );
        if let Some(old) = replaced {
            self.unwatch_entry(old, id);
        }
        self.watch_entry(slot.entry, id);
    }

    /// Union the slots of `other` into `target`.
    pub(crate) fn merge_channel_into(&mut self, target: ChannelId, other: ChannelId) {
        let slots = match self.channels.get(&other) {
            Some(c) => c.slots.clone(),
            None => return,
        };
        for slot in slots {
            self.add_slot(target, slot);
        }
    }

    /// Whether `other` is unioned into `current` rather than replacing it.
    ///
    /// Channels with different entry counts union. Different types replace.
    /// Single-entry channels union only when their keys differ; multi-entry
    /// channels always union without comparing keys.
    pub(crate) fn will_merge_with_channel(&self, current: ChannelId, other: ChannelId) -> bool {
        let (Some(a), Some(b)) = (self.channels.get(&current), self.channels.get(&other)) else {
            return false;
        };
        if a.slots.len() != b.slots.len() {
            return true;
        }
        if self.channel_type(current) != self.channel_type(other) {
            return false;
        }
        if a.slots.len() == 1 {
            return !self.same_key(a.slots[0].key, b.slots[0].key);
        }
        true
    }

    /// Whether `slot` is added to `current` rather than replacing it.
    pub(crate) fn will_merge_with_slot(&self, current: ChannelId, slot: &DataSlot) -> bool {
        let Some(a) = self.channels.get(&current) else {
            return false;
        };
        if a.slots.len() != 1 {
            return true;
        }
        if self.channel_type(current) != self.entry(slot.entry).map(DataEntry::data_type) {
            return false;
        }
        !self.same_key(a.slots[0].key, slot.key)
    }

    /// Sequence lookup.
    pub(crate) fn get_data_entry(
        &self,
        id: ChannelId,
        access: SequenceAccess,
        key: f32,
    ) -> Option<SequenceValue> {
        let slots = &self.channels.get(&id)?.slots;
        if slots.is_empty() {
            return None;
        }
        if access == SequenceAccess::NoAccess {
            return Some(SequenceValue::Entry(slots[0].entry));
        }
        let max = slots.len();
        let i = slots
            .iter()
            .position(|s| s.key >= key - self.epsilon)
            .unwrap_or(max);
        Some(match access {
            SequenceAccess::PrevBuffer => SequenceValue::Entry(slots[i.saturating_sub(1)].entry),
            SequenceAccess::NextBuffer => SequenceValue::Entry(slots[i.min(max - 1)].entry),
            SequenceAccess::LinearWeight => {
                if i == 0 || i == max {
                    SequenceValue::Weight(0.0)
                } else {
                    let (k0, k1) = (slots[i - 1].key, slots[i].key);
                    SequenceValue::Weight(((key - k0) / (k1 - k0)).clamp(0.0, 1.0))
                }
            }
            SequenceAccess::NoAccess => SequenceValue::Entry(slots[0].entry),
        })
    }

    /// Drop `channel` if `map` owns it.
    fn release(&mut self, channel: ChannelId, map: MapId) {
        if self.channels.get(&channel).is_some_and(|c| c.owner == map) {
            self.free_channel(channel);
        }
    }
}

/// Cached channel for one `(name, substitution key)` pair.
#[derive(Debug, Clone, Default)]
pub struct ChannelEntry {
    channel: Option<ChannelId>,
    use_count: usize,
}

impl ChannelEntry {
    /// Cached channel.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Number of substitution nodes built on this entry.
    pub fn use_count(&self) -> usize {
        self.use_count
    }
}

/// Per-name record: which proto names flow through it, and its cached channels.
#[derive(Debug, Clone, Default)]
pub struct MapEntry {
    proto_names: BTreeSet<String>,
    channels: HashMap<String, ChannelEntry>,
}

impl MapEntry {
    /// Proto names the channel depends on.
    pub fn proto_names(&self) -> &BTreeSet<String> {
        &self.proto_names
    }
}

/// Named channels of one graph point.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    id: MapId,
    entries: BTreeMap<String, MapEntry>,
}

impl ChannelMap {
    pub(crate) fn new(id: MapId) -> Self {
        Self {
            id,
            entries: BTreeMap::new(),
        }
    }

    /// Identity.
    pub fn id(&self) -> MapId {
        self.id
    }

    /// Names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Whether the name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry for a name.
    pub fn entry(&self, name: &str) -> Option<&MapEntry> {
        self.entries.get(name)
    }

    /// Proto names the channel `name` depends on.
    pub fn proto_names(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(name).map(|e| &e.proto_names)
    }

    /// Name → proto-name sets, for comparisons.
    pub fn proto_name_table(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.entries
            .iter()
            .map(|(n, e)| (n.clone(), e.proto_names.clone()))
            .collect()
    }

    /// Union of every proto name in the map.
    pub fn all_proto_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|e| e.proto_names.iter().cloned())
            .collect()
    }

    /// Register `name`, adding `proto_names` to its set.
    pub(crate) fn add_proto_names<I>(&mut self, name: &str, proto_names: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.entries
            .entry(name.to_string())
            .or_default()
            .proto_names
            .extend(proto_names);
    }

    /// Union every name and its proto names from `other`.
    pub(crate) fn merge_proto_names(&mut self, other: &ChannelMap) {
        for (name, entry) in &other.entries {
            self.add_proto_names(name, entry.proto_names.iter().cloned());
        }
    }

    /// Substitution key for `name`, restricted to its proto names.
    pub fn entry_key(&self, name: &str, sub: &Substitution) -> String {
        match self.entries.get(name) {
            Some(entry) => sub.key(&entry.proto_names),
            None => String::new(),
        }
    }

    /// Channel bound to `name` under `sub`.
    pub fn get_channel(&self, name: &str, sub: &Substitution) -> Option<ChannelId> {
        let entry = self.entries.get(name)?;
        entry.channels.get(&sub.key(&entry.proto_names))?.channel
    }

    /// Use count of the `(name, sub)` entry.
    pub fn use_count(&self, name: &str, sub: &Substitution) -> Option<usize> {
        let entry = self.entries.get(name)?;
        entry
            .channels
            .get(&sub.key(&entry.proto_names))
            .map(|c| c.use_count)
    }

    /// Every name with its channel under `sub`.
    pub fn resolve_all(&self, sub: &Substitution) -> Vec<(String, Option<ChannelId>)> {
        self.entries
            .keys()
            .map(|name| (name.clone(), self.get_channel(name, sub)))
            .collect()
    }

    /// Channel entry for `(name, sub)`, or `None` when it is already built.
    fn pending_entry(&mut self, name: &str, sub: &Substitution) -> Option<&mut ChannelEntry> {
        let entry = self.entries.entry(name.to_string()).or_default();
        let key = sub.key(&entry.proto_names);
        let channel_entry = entry.channels.entry(key).or_default();
        (channel_entry.use_count == 0).then_some(channel_entry)
    }

    /// Merge an existing channel under `name`.
    pub(crate) fn add_channel(
        &mut self,
        store: &mut DataStore,
        name: &str,
        channel: ChannelId,
        sub: &Substitution,
    ) {
        let map = self.id;
        let Some(slot) = self.pending_entry(name, sub) else {
            return;
        };
        match slot.channel {
            None => slot.channel = Some(channel),
            Some(current) if current == channel => {
                assert_invariant(
                    CHANNEL_MERGE_IDENTITY,
                    slot.channel == Some(channel),
                    "merging a channel into itself is a no-op",
                    Some("add_channel"),
                );
            }
            Some(current) => {
                if store.will_merge_with_channel(current, channel) {
                    let owned = own_channel(store, slot, current, map);
                    store.merge_channel_into(owned, channel);
                } else {
                    store.release(current, map);
                    slot.channel = Some(channel);
                }
            }
        }
    }

    /// Merge an authored value under `name`.
    pub(crate) fn add_data_entry(
        &mut self,
        store: &mut DataStore,
        name: &str,
        entry: EntryId,
        key: f32,
        sub: &Substitution,
    ) {
        self.add_output_data_slot(store, name, DataSlot::new(entry, key), sub);
    }

    /// Merge a single slot under `name`.
    pub(crate) fn add_output_data_slot(
        &mut self,
        store: &mut DataStore,
        name: &str,
        data_slot: DataSlot,
        sub: &Substitution,
    ) {
        let map = self.id;
        let Some(slot) = self.pending_entry(name, sub) else {
            return;
        };
        match slot.channel {
            None => slot.channel = Some(store.create_channel(map, vec![data_slot])),
            Some(current) => {
                if store.will_merge_with_slot(current, &data_slot) {
                    let owned = own_channel(store, slot, current, map);
                    store.add_slot(owned, data_slot);
                } else {
                    store.release(current, map);
                    slot.channel = Some(store.create_channel(map, vec![data_slot]));
                }
            }
        }
    }

    /// Count one more user of every entry built for `sub`.
    pub(crate) fn mark_done(&mut self, sub: &Substitution) {
        for entry in self.entries.values_mut() {
            let key = sub.key(&entry.proto_names);
            if let Some(channel_entry) = entry.channels.get_mut(&key) {
                channel_entry.use_count += 1;
            }
        }
    }

    /// Undo one [`mark_done`](Self::mark_done), dropping entries nobody uses.
    pub(crate) fn clear_substitution(&mut self, store: &mut DataStore, sub: &Substitution) {
        for entry in self.entries.values_mut() {
            let key = sub.key(&entry.proto_names);
            let Some(channel_entry) = entry.channels.get_mut(&key) else {
                continue;
            };
            channel_entry.use_count = channel_entry.use_count.saturating_sub(1);
            if channel_entry.use_count == 0 {
                if let Some(channel) = channel_entry.channel {
                    store.release(channel, self.id);
                }
                entry.channels.remove(&key);
            }
        }
    }

    /// Drop every cached channel and every name.
    pub(crate) fn clear_all(&mut self, store: &mut DataStore) {
        for entry in self.entries.values() {
            for channel_entry in entry.channels.values() {
                if let Some(channel) = channel_entry.channel {
                    store.release(channel, self.id);
                }
            }
        }
        self.entries.clear();
    }
}

/// Replace a borrowed channel in `slot` with an owned copy, returning the owned id.
fn own_channel(store: &mut DataStore, slot: &mut ChannelEntry, current: ChannelId, map: MapId) -> ChannelId {
    if store.channel(current).is_some_and(|c| c.owner == map) {
        current
    } else {
        let copy = store.copy_channel(current, map);
        slot.channel = Some(copy);
        copy
    }
}

/// Immutable binding of proto names to channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitution {
    map: BTreeMap<String, ChannelId>,
}

impl Substitution {
    /// Binds nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(name, channel)` bindings.
    pub fn from_bindings<I, S>(bindings: I) -> Self
    where
        I: IntoIterator<Item = (S, ChannelId)>,
        S: Into<String>,
    {
        Self {
            map: bindings.into_iter().map(|(n, c)| (n.into(), c)).collect(),
        }
    }

    /// Bind every channel `map` resolves under `sub`.
    pub(crate) fn from_channel_map(map: &ChannelMap, sub: &Substitution) -> Self {
        Self {
            map: map
                .resolve_all(sub)
                .into_iter()
                .filter_map(|(name, channel)| channel.map(|c| (name, c)))
                .collect(),
        }
    }

    /// Channel bound to `name`.
    pub fn get(&self, name: &str) -> Option<ChannelId> {
        self.map.get(name).copied()
    }

    /// Binds nothing.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Cache key over the bindings of `names`. Unbound names do not
    /// contribute, so a substitution binding none of them keys as `""`.
    pub fn key<'a, I>(&self, names: I) -> String
    where
        I: IntoIterator<Item = &'a String>,
    {
        let parts: Vec<String> = names
            .into_iter()
            .filter_map(|name| {
                self.map
                    .get(name)
                    .map(|channel| format!("{name}>{}", channel.0))
            })
            .collect();
        parts.join(";")
    }

    /// Only the bindings of `names`.
    pub fn restrict(&self, names: &BTreeSet<String>) -> Self {
        Self {
            map: self
                .map
                .iter()
                .filter(|(name, _)| names.contains(*name))
                .map(|(name, channel)| (name.clone(), *channel))
                .collect(),
        }
    }

    /// Cache key over every binding.
    pub fn full_key(&self) -> String {
        self.key(self.map.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn float3(store: &mut DataStore, values: [f32; 3]) -> EntryId {
        store.insert_entry(DataEntry::floats(DataType::Float3, values.to_vec()).unwrap())
    }

    #[test]
    fn sequence_access_modes() {
        let mut store = DataStore::default();
        let a = float3(&mut store, [0.0, 0.0, 0.0]);
        let b = float3(&mut store, [10.0, 0.0, 0.0]);
        let ch = store.create_channel(MapId(0), vec![DataSlot::new(b, 1.0), DataSlot::new(a, 0.0)]);

        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::LinearWeight, 0.25),
            Some(SequenceValue::Weight(0.25))
        );
        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::PrevBuffer, 0.25),
            Some(SequenceValue::Entry(a))
        );
        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::NextBuffer, 0.25),
            Some(SequenceValue::Entry(b))
        );
        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::NoAccess, 0.75),
            Some(SequenceValue::Entry(a))
        );
        // Past the ends both neighbours collapse onto the boundary slot.
        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::NextBuffer, 5.0),
            Some(SequenceValue::Entry(b))
        );
        assert_eq!(
            store.get_data_entry(ch, SequenceAccess::PrevBuffer, -1.0),
            Some(SequenceValue::Entry(a))
        );
    }

    #[test]
    fn equal_keys_replace_entry() {
        let mut store = DataStore::default();
        let a = float3(&mut store, [1.0, 0.0, 0.0]);
        let b = float3(&mut store, [2.0, 0.0, 0.0]);
        let ch = store.create_channel(MapId(0), vec![DataSlot::new(a, 0.5)]);
        store.add_slot(ch, DataSlot::new(b, 0.5 + 1e-8));
        let channel = store.channel(ch).unwrap();
        assert_eq!(channel.slots().len(), 1);
        assert_eq!(channel.slots()[0].entry, b);
        assert!(store.entry_channels(a).is_empty());
        assert_eq!(store.entry_channels(b), vec![ch]);
    }

    #[test]
    fn merging_identical_channel_is_noop() {
        let mut store = DataStore::default();
        let mut map = store.new_map();
        let a = float3(&mut store, [1.0, 2.0, 3.0]);
        let foreign = store.create_channel(MapId(999), vec![DataSlot::new(a, 0.0)]);
        let sub = Substitution::empty();

        map.add_channel(&mut store, "position", foreign, &sub);
        map.mark_done(&sub);
        let channels_before = store.channel_count();
        map.add_channel(&mut store, "position", foreign, &sub);
        assert_eq!(map.get_channel("position", &sub), Some(foreign));
        assert_eq!(map.use_count("position", &sub), Some(1));
        assert_eq!(store.channel_count(), channels_before);

        // Same while still under construction.
        let mut fresh = store.new_map();
        fresh.add_channel(&mut store, "position", foreign, &sub);
        fresh.add_channel(&mut store, "position", foreign, &sub);
        assert_eq!(fresh.get_channel("position", &sub), Some(foreign));
        assert_eq!(fresh.use_count("position", &sub), Some(0));
        assert_eq!(store.channel_count(), channels_before);
    }

    #[test]
    fn keyed_values_merge_copy_on_write() {
        let mut store = DataStore::default();
        let a = float3(&mut store, [0.0; 3]);
        let b = float3(&mut store, [1.0; 3]);
        let ch_a = store.create_channel(MapId(100), vec![DataSlot::new(a, 0.0)]);
        let ch_b = store.create_channel(MapId(101), vec![DataSlot::new(b, 1.0)]);

        let mut map = store.new_map();
        let sub = Substitution::empty();
        map.add_channel(&mut store, "seq", ch_a, &sub);
        map.add_channel(&mut store, "seq", ch_b, &sub);

        let merged = map.get_channel("seq", &sub).unwrap();
        assert_ne!(merged, ch_a);
        assert_eq!(store.channel(merged).unwrap().owner(), map.id());
        assert_eq!(store.channel(merged).unwrap().slots().len(), 2);
        // The borrowed source channel is untouched.
        assert_eq!(store.channel(ch_a).unwrap().slots().len(), 1);
    }

    #[test]
    fn same_key_replaces_instead_of_merging() {
        let mut store = DataStore::default();
        let a = float3(&mut store, [0.0; 3]);
        let b = float3(&mut store, [1.0; 3]);
        let mut map = store.new_map();
        let sub = Substitution::empty();
        map.add_data_entry(&mut store, "v", a, 0.0, &sub);
        let first = map.get_channel("v", &sub).unwrap();
        map.add_data_entry(&mut store, "v", b, 0.0, &sub);
        let second = map.get_channel("v", &sub).unwrap();
        assert_ne!(first, second);
        assert!(store.channel(first).is_none(), "owned channel released on replace");
        assert_eq!(store.channel(second).unwrap().slots()[0].entry, b);
    }

    #[test]
    fn clear_substitution_releases_owned_channels() {
        let mut store = DataStore::default();
        let a = float3(&mut store, [0.0; 3]);
        let mut map = store.new_map();
        let sub = Substitution::empty();
        map.add_data_entry(&mut store, "v", a, 0.0, &sub);
        map.mark_done(&sub);
        map.mark_done(&sub);
        let ch = map.get_channel("v", &sub).unwrap();

        map.clear_substitution(&mut store, &sub);
        assert!(store.channel(ch).is_some());
        map.clear_substitution(&mut store, &sub);
        assert!(store.channel(ch).is_none());
        assert_eq!(map.get_channel("v", &sub), None);
    }

    #[test]
    fn substitution_keys_only_see_relevant_names() {
        let sub = Substitution::from_bindings([("pos", ChannelId(3)), ("dir", ChannelId(8))]);
        let names: BTreeSet<String> = ["pos".to_string()].into_iter().collect();
        assert_eq!(sub.key(&names), "pos>3");
        assert_eq!(sub.key(&BTreeSet::new()), "");
        assert_eq!(sub.full_key(), "dir>8;pos>3");
        let missing: BTreeSet<String> = ["weight".to_string()].into_iter().collect();
        assert_eq!(sub.key(&missing), "");
        assert_eq!(sub.restrict(&names).full_key(), "pos>3");
    }

    proptest! {
        #[test]
        fn slots_stay_sorted(keys in proptest::collection::vec(-100.0f32..100.0, 1..24)) {
            let mut store = DataStore::default();
            let entry = store.insert_entry(DataEntry::floats(DataType::Float, vec![0.0]).unwrap());
            let ch = store.create_channel(MapId(0), Vec::new());
            for key in &keys {
                store.add_slot(ch, DataSlot::new(entry, *key));
            }
            let slots = store.channel(ch).unwrap().slots();
            prop_assert!(slots.windows(2).all(|w| w[0].key < w[1].key));
            prop_assert!(slots.len() <= keys.len());
        }
    }
}
