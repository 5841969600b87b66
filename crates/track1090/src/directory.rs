/**
 * The aircraft directory: a fixed-size bucket table with per-bucket chains,
 * fronted by a small open-addressed quick-lookup cache.
 *
 * Records live in a slab and are referenced by slot index everywhere (bucket
 * heads, chain links, cache entries), which keeps the cache a plain
 * `(addr, slot)` pair. The cache is purely advisory: a probe window full of
 * collisions degrades to the chain walk, and a resize throws every entry
 * away. The bucket table is authoritative at all times.
 */
use crate::aircraft::Aircraft;

pub const AIRCRAFT_HASH_BITS: u32 = 16;
pub const AIRCRAFT_BUCKETS: usize = 1 << AIRCRAFT_HASH_BITS;

/// Empty marker for quick cache slots.
const EMPTY: u32 = 0xFFFF_FFFF;
/// Chain / slab sentinel.
const NONE: u32 = u32::MAX;

const QUICK_MIN_BITS: u32 = 8;
const QUICK_MAX_BITS: u32 = 16;
const QUICK_STRIDE: usize = 8;

/// Address hash, Murmur3 finalizer truncated to `bits`.
pub fn addr_hash(addr: u32, bits: u32) -> u32 {
    let mut h = addr;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h >> (32 - bits)
}

#[derive(Debug, Clone, Copy)]
struct QuickSlot {
    addr: u32,
    slot: u32,
}

const EMPTY_SLOT: QuickSlot = QuickSlot {
    addr: EMPTY,
    slot: NONE,
};

#[derive(Debug)]
struct QuickCache {
    bits: u32,
    slots: Vec<QuickSlot>,
}

impl QuickCache {
    fn with_bits(bits: u32) -> Self {
        let buckets = (1usize << bits) + QUICK_STRIDE;
        if buckets > 256_000 {
            tracing::info!(buckets, "quick lookup: changing size");
        }
        QuickCache {
            bits,
            slots: vec![EMPTY_SLOT; buckets],
        }
    }

    fn buckets(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, addr: u32) -> Option<u32> {
        let hash = addr_hash(addr, self.bits) as usize;
        self.slots[hash..hash + QUICK_STRIDE]
            .iter()
            .find(|q| q.addr == addr)
            .map(|q| q.slot)
    }

    /// Insert into the first empty slot of the probe window; a full window
    /// is a silent no-op.
    fn add(&mut self, addr: u32, slot: u32) {
        if self.get(addr).is_some() {
            return;
        }
        let hash = addr_hash(addr, self.bits) as usize;
        for q in &mut self.slots[hash..hash + QUICK_STRIDE] {
            if q.addr == EMPTY {
                *q = QuickSlot { addr, slot };
                return;
            }
        }
    }

    fn remove(&mut self, addr: u32) {
        let hash = addr_hash(addr, self.bits) as usize;
        for q in &mut self.slots[hash..hash + QUICK_STRIDE] {
            if q.addr == addr {
                *q = EMPTY_SLOT;
                return;
            }
        }
    }
}

#[derive(Debug)]
pub struct AircraftTable {
    buckets: Vec<u32>,
    slab: Vec<Option<Box<Aircraft>>>,
    free: Vec<u32>,
    len: usize,
    quick: QuickCache,
}

impl Default for AircraftTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AircraftTable {
    pub fn new() -> Self {
        AircraftTable {
            buckets: vec![NONE; AIRCRAFT_BUCKETS],
            slab: Vec::new(),
            free: Vec::new(),
            len: 0,
            quick: QuickCache::with_bits(QUICK_MIN_BITS),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_of(addr: u32) -> usize {
        addr_hash(addr, AIRCRAFT_HASH_BITS) as usize
    }

    fn slot_ref(&self, slot: u32) -> &Aircraft {
        self.slab[slot as usize]
            .as_deref()
            .expect("directory invariant: indexed slot is live")
    }

    fn slot_mut(&mut self, slot: u32) -> &mut Aircraft {
        self.slab[slot as usize]
            .as_deref_mut()
            .expect("directory invariant: indexed slot is live")
    }

    /// Chain walk, no cache involvement.
    fn find(&self, addr: u32) -> Option<u32> {
        let mut slot = self.buckets[Self::bucket_of(addr)];
        while slot != NONE {
            let a = self.slot_ref(slot);
            if a.addr == addr {
                return Some(slot);
            }
            slot = a.next;
        }
        None
    }

    fn lookup(&mut self, addr: u32) -> Option<u32> {
        if let Some(slot) = self.quick.get(addr) {
            return Some(slot);
        }
        let slot = self.find(addr)?;
        self.quick.add(addr, slot);
        Some(slot)
    }

    /// Cache-assisted lookup; promotes chain hits into the quick cache.
    pub fn get(&mut self, addr: u32) -> Option<&mut Aircraft> {
        let slot = self.lookup(addr)?;
        Some(self.slot_mut(slot))
    }

    /// Shared lookup for readers; never touches the cache.
    pub fn peek(&self, addr: u32) -> Option<&Aircraft> {
        self.find(addr).map(|slot| self.slot_ref(slot))
    }

    pub fn get_or_create(&mut self, addr: u32) -> &mut Aircraft {
        let slot = match self.lookup(addr) {
            Some(slot) => slot,
            None => self.insert(Box::new(Aircraft::new(addr))),
        };
        self.slot_mut(slot)
    }

    fn insert(&mut self, mut a: Box<Aircraft>) -> u32 {
        let bucket = Self::bucket_of(a.addr);
        a.next = self.buckets[bucket];
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot as usize] = Some(a);
                slot
            }
            None => {
                self.slab.push(Some(a));
                (self.slab.len() - 1) as u32
            }
        };
        self.buckets[bucket] = slot;
        self.len += 1;
        slot
    }

    /// Remove an aircraft: cache invalidation first, then chain unlink, then
    /// the slot is freed. Returns the record for final cleanup.
    pub fn remove(&mut self, addr: u32) -> Option<Box<Aircraft>> {
        self.quick.remove(addr);
        let bucket = Self::bucket_of(addr);
        let mut prev = NONE;
        let mut slot = self.buckets[bucket];
        while slot != NONE {
            let next = {
                let a = self.slot_ref(slot);
                if a.addr == addr {
                    break;
                }
                a.next
            };
            prev = slot;
            slot = next;
        }
        if slot == NONE {
            return None;
        }
        let a = self.slab[slot as usize].take()?;
        if prev == NONE {
            self.buckets[bucket] = a.next;
        } else {
            self.slot_mut(prev).next = a.next;
        }
        self.free.push(slot);
        self.len -= 1;
        Some(a)
    }

    /**
     * Resize decision for the quick cache, meant to run from the periodic
     * sweep: one bit up when the table holds more than a third of the cache
     * buckets, one bit down below a ninth, clamped to [2^8, 2^16]. A resize
     * starts from an empty cache.
     */
    pub fn quick_init(&mut self) {
        let bits = self.quick.bits;
        let buckets = self.quick.buckets();
        if bits > QUICK_MIN_BITS && self.len < buckets / 9 {
            self.quick = QuickCache::with_bits(bits - 1);
        } else if bits < QUICK_MIN_BITS {
            self.quick = QuickCache::with_bits(QUICK_MIN_BITS);
        } else if bits < QUICK_MAX_BITS && self.len > buckets / 3 {
            self.quick = QuickCache::with_bits(bits + 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Aircraft> {
        self.slab.iter().filter_map(|s| s.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Aircraft> {
        self.slab.iter_mut().filter_map(|s| s.as_deref_mut())
    }

    /// Number of buckets, for partitioned sweeps.
    pub fn buckets_len(&self) -> usize {
        self.buckets.len()
    }

    /// Addresses chained under one bucket, head first.
    pub fn bucket_addrs(&self, bucket: usize) -> Vec<u32> {
        let mut addrs = Vec::new();
        let mut slot = self.buckets[bucket];
        while slot != NONE {
            let a = self.slot_ref(slot);
            addrs.push(a.addr);
            slot = a.next;
        }
        addrs
    }

    #[cfg(test)]
    fn quick_entries(&self) -> Vec<(u32, u32)> {
        self.quick
            .slots
            .iter()
            .filter(|q| q.addr != EMPTY)
            .map(|q| (q.addr, q.slot))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get() {
        let mut table = AircraftTable::new();
        let addr = 0xabcdef;
        table.get_or_create(addr);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(addr).map(|a| a.addr), Some(addr));
        assert!(table.get(0xabcdee).is_none());
        assert!(table.peek(0xabcdee).is_none());
    }

    #[test]
    fn create_is_idempotent() {
        let mut table = AircraftTable::new();
        table.get_or_create(0x400000).messages = 7;
        let a = table.get_or_create(0x400000);
        assert_eq!(a.messages, 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_unlinks_and_invalidates() {
        let mut table = AircraftTable::new();
        table.get_or_create(0x400001);
        table.get_or_create(0x400002);
        // populate the cache
        assert!(table.get(0x400001).is_some());
        let removed = table.remove(0x400001);
        assert_eq!(removed.map(|a| a.addr), Some(0x400001));
        assert!(table.get(0x400001).is_none());
        assert!(table.get(0x400002).is_some());
        assert_eq!(table.len(), 1);
        assert!(table.remove(0x400001).is_none());
    }

    /// Every cache entry must resolve, through the authoritative chain walk,
    /// to the record it points at.
    fn check_cache_soundness(table: &AircraftTable) {
        for (addr, slot) in table.quick_entries() {
            let found = table.find(addr);
            assert_eq!(found, Some(slot), "cache entry {addr:06x} unsound");
            assert_eq!(table.slot_ref(slot).addr, addr);
        }
    }

    #[test]
    fn cache_soundness_across_operations() {
        let mut table = AircraftTable::new();
        for i in 0..500u32 {
            table.get_or_create(0x100000 + i);
        }
        for i in 0..500u32 {
            assert!(table.get(0x100000 + i).is_some());
        }
        check_cache_soundness(&table);
        for i in (0..500u32).step_by(3) {
            table.remove(0x100000 + i);
        }
        check_cache_soundness(&table);
        // slots are reused: recreate some, lookups must stay coherent
        for i in (0..500u32).step_by(3) {
            table.get_or_create(0x100000 + i);
            assert!(table.get(0x100000 + i).is_some());
        }
        check_cache_soundness(&table);
    }

    #[test]
    fn quick_cache_grows_and_shrinks() {
        let mut table = AircraftTable::new();
        assert_eq!(table.quick.bits, QUICK_MIN_BITS);
        let grow_threshold = table.quick.buckets() / 3;
        for i in 0..=(grow_threshold as u32) {
            table.get_or_create(i + 1);
        }
        table.quick_init();
        assert_eq!(table.quick.bits, QUICK_MIN_BITS + 1);
        // entries were discarded, lookups still resolve through the chains
        assert!(table.get(1).is_some());
        check_cache_soundness(&table);

        for i in 0..=(grow_threshold as u32) {
            table.remove(i + 1);
        }
        table.quick_init();
        assert_eq!(table.quick.bits, QUICK_MIN_BITS);
    }

    #[test]
    fn full_probe_window_degrades_to_chain_walk() {
        let mut table = AircraftTable::new();
        // enough colliding lookups to exhaust any 8-slot window somewhere
        for i in 0..20_000u32 {
            table.get_or_create(i + 1);
            assert_eq!(table.get(i + 1).map(|a| a.addr), Some(i + 1));
        }
        check_cache_soundness(&table);
    }
}
