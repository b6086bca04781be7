// Generation-tagged handle table.
//
// A handle packs `valid(1) | namespace(7) | chunk(10) | state-index(10) |
// generation(4)` into one `u32`, represented as a value type with explicit
// pack/unpack methods; the bare integer only crosses an external boundary.
// Each chunk holds a dense array of live handles and a sparse `state` array
// addressed by state-index, both committed lazily from this module's own
// `vm::HostAllocationPool`, the way `concurrent/hazard.rs` and
// `concurrent/epoch.rs` amortize reclamation bookkeeping per slot.
//
// The dense/state bookkeeping arrays are plain `Vec`s rather than raw bytes in
// the chunk's VM-backed region: they are implementation-internal and never
// cross the handle/view boundary the external API actually exposes. The
// per-chunk application payload (the `MemoryLayout` streams) lives in the
// VM-backed region and is handed out only as a `View`.

use crate::error::{HandleInvalidReason, PalError, Result};
use crate::layout::{MemoryLayout, View};
use crate::vm::{AccessFlags, HostAllocationPool, VirtualMemory};

pub const CHUNKS_PER_TABLE: usize = 1024;
pub const SLOTS_PER_CHUNK: usize = 1024;

const GENERATION_BITS: u32 = 4;
const STATE_INDEX_BITS: u32 = 10;
const CHUNK_BITS: u32 = 10;
const NAMESPACE_BITS: u32 = 7;

const GENERATION_SHIFT: u32 = 0;
const STATE_INDEX_SHIFT: u32 = GENERATION_SHIFT + GENERATION_BITS;
const CHUNK_SHIFT: u32 = STATE_INDEX_SHIFT + STATE_INDEX_BITS;
const NAMESPACE_SHIFT: u32 = CHUNK_SHIFT + CHUNK_BITS;
const VALID_SHIFT: u32 = NAMESPACE_SHIFT + NAMESPACE_BITS;

const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const STATE_INDEX_MASK: u32 = (1 << STATE_INDEX_BITS) - 1;
const CHUNK_MASK: u32 = (1 << CHUNK_BITS) - 1;
const NAMESPACE_MASK: u32 = (1 << NAMESPACE_BITS) - 1;

/// External identifier. The sort order of `raw()` values groups by namespace,
/// then chunk, then state-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    fn pack(namespace: u8, chunk: u16, state_index: u16, generation: u8) -> Self {
        let bits = (1u32 << VALID_SHIFT)
            | ((namespace as u32 & NAMESPACE_MASK) << NAMESPACE_SHIFT)
            | ((chunk as u32 & CHUNK_MASK) << CHUNK_SHIFT)
            | ((state_index as u32 & STATE_INDEX_MASK) << STATE_INDEX_SHIFT)
            | ((generation as u32 & GENERATION_MASK) << GENERATION_SHIFT);
        Handle(bits)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn is_valid(self) -> bool {
        (self.0 >> VALID_SHIFT) & 1 != 0
    }

    pub fn namespace(self) -> u8 {
        ((self.0 >> NAMESPACE_SHIFT) & NAMESPACE_MASK) as u8
    }

    pub fn chunk(self) -> u16 {
        ((self.0 >> CHUNK_SHIFT) & CHUNK_MASK) as u16
    }

    pub fn state_index(self) -> u16 {
        ((self.0 >> STATE_INDEX_SHIFT) & STATE_INDEX_MASK) as u16
    }

    pub fn generation(self) -> u8 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u8
    }
}

/// Packed sparse-array entry: `valid(1) | unused(17) | dense-index(10) | generation(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateWord(u32);

impl StateWord {
    fn pack(valid: bool, dense_index: u16, generation: u8) -> Self {
        let bits = ((valid as u32) << VALID_SHIFT)
            | ((dense_index as u32 & STATE_INDEX_MASK) << STATE_INDEX_SHIFT)
            | ((generation as u32 & GENERATION_MASK) << GENERATION_SHIFT);
        StateWord(bits)
    }

    fn valid(self) -> bool {
        (self.0 >> VALID_SHIFT) & 1 != 0
    }

    fn dense_index(self) -> u16 {
        ((self.0 >> STATE_INDEX_SHIFT) & STATE_INDEX_MASK) as u16
    }

    fn generation(self) -> u8 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableFlags(pub u8);

impl TableFlags {
    pub const IDENTITY: TableFlags = TableFlags(0b01);
    pub const STORAGE: TableFlags = TableFlags(0b10);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TableFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        TableFlags(self.0 | rhs.0)
    }
}

struct Chunk {
    pool_slot: usize,
    view: View,
    dense: Vec<u32>,
    state: Vec<StateWord>,
    count: usize,
}

/// Metadata returned by `get_chunk_for_index`/`get_chunk_for_handle`.
pub struct ChunkInfo<'a> {
    pub chunk: u16,
    pub count: usize,
    pub dense: &'a [u32],
    pub view: View,
    /// Set only by `get_chunk_for_handle`.
    pub dense_index: Option<u16>,
}

/// Iterator over a table's committed, non-empty chunks, yielded by
/// [`HandleTable::iter_chunks`].
pub struct ChunkIter<'a, V: VirtualMemory> {
    table: &'a HandleTable<V>,
    next: usize,
}

impl<'a, V: VirtualMemory> Iterator for ChunkIter<'a, V> {
    type Item = ChunkInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < CHUNKS_PER_TABLE {
            let c = self.next;
            self.next += 1;
            if let Some(chunk) = &self.table.chunks[c] {
                if chunk.count == 0 {
                    continue;
                }
                return Some(ChunkInfo {
                    chunk: c as u16,
                    count: chunk.count,
                    dense: &chunk.dense[..chunk.count],
                    view: chunk.view,
                    dense_index: None,
                });
            }
        }
        None
    }
}

pub struct HandleTable<V: VirtualMemory> {
    namespace: u8,
    flags: TableFlags,
    layout: MemoryLayout,
    pool: HostAllocationPool<V>,
    chunk_commit: Vec<bool>,
    chunk_status: Vec<bool>,
    chunks: Vec<Option<Chunk>>,
}

impl<V: VirtualMemory> HandleTable<V> {
    /// Reserves space for up to 1024 chunks and optionally pre-commits
    /// `initial_commit` of them.
    pub fn new(
        vm: V,
        namespace: u8,
        flags: TableFlags,
        layout: MemoryLayout,
        initial_commit: usize,
    ) -> Result<Self> {
        if namespace as u32 > NAMESPACE_MASK {
            return Err(PalError::InvalidArgument("namespace exceeds 7 bits".into()));
        }
        let chunk_bytes = layout.compute_size(SLOTS_PER_CHUNK);
        let pool = HostAllocationPool::new(vm, CHUNKS_PER_TABLE, u64::MAX, chunk_bytes);
        let mut table = Self {
            namespace,
            flags,
            layout,
            pool,
            chunk_commit: vec![false; CHUNKS_PER_TABLE],
            chunk_status: vec![false; CHUNKS_PER_TABLE],
            chunks: (0..CHUNKS_PER_TABLE).map(|_| None).collect(),
        };
        for c in 0..initial_commit.min(CHUNKS_PER_TABLE) {
            table.commit_chunk(c)?;
        }
        Ok(table)
    }

    fn commit_chunk(&mut self, c: usize) -> Result<()> {
        if self.chunk_commit[c] {
            return Ok(());
        }
        let chunk_bytes = self.layout.compute_size(SLOTS_PER_CHUNK);
        let slot = self.pool.allocate(chunk_bytes, chunk_bytes, AccessFlags::READ | AccessFlags::WRITE)?;
        let base = self
            .pool
            .with_allocation(slot, |a| a.base_address())
            .expect("slot just allocated");
        let view = self.layout.view_init(base, SLOTS_PER_CHUNK);
        let dense: Vec<u32> = (0..SLOTS_PER_CHUNK as u32).collect();
        let state = vec![StateWord::pack(false, 0, 0); SLOTS_PER_CHUNK];
        self.chunks[c] = Some(Chunk {
            pool_slot: slot,
            view,
            dense,
            state,
            count: 0,
        });
        self.chunk_commit[c] = true;
        self.chunk_status[c] = true;
        Ok(())
    }

    fn find_chunk_with_room(&mut self) -> Result<usize> {
        for c in 0..CHUNKS_PER_TABLE {
            if self.chunk_status[c] {
                return Ok(c);
            }
        }
        for c in 0..CHUNKS_PER_TABLE {
            if !self.chunk_commit[c] {
                self.commit_chunk(c)?;
                return Ok(c);
            }
        }
        Err(PalError::HandleSpaceExhausted { namespace: self.namespace })
    }

    /// Allocate `n` fresh handles (table must carry `IDENTITY`).
    pub fn create_ids(&mut self, n: usize) -> Result<Vec<Handle>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let c = self.find_chunk_with_room()?;
            let chunk = self.chunks[c].as_mut().unwrap();
            let j = chunk.count;
            let s = chunk.dense[j];
            let g = chunk.state[s as usize].generation();
            let handle = Handle::pack(self.namespace, c as u16, s as u16, g);
            chunk.state[s as usize] = StateWord::pack(true, j as u16, g);
            chunk.dense[j] = handle.raw();
            chunk.count += 1;
            if chunk.count == SLOTS_PER_CHUNK {
                self.chunk_status[c] = false;
            }
            out.push(handle);
        }
        Ok(out)
    }

    fn validated(&self, id: Handle) -> Result<(usize, usize)> {
        if id.namespace() != self.namespace {
            return Err(PalError::HandleInvalid(HandleInvalidReason::NamespaceMismatch));
        }
        let c = id.chunk() as usize;
        if c >= CHUNKS_PER_TABLE || !self.chunk_commit[c] {
            return Err(PalError::HandleInvalid(HandleInvalidReason::BadStateIndex));
        }
        let s = id.state_index() as usize;
        if s >= SLOTS_PER_CHUNK {
            return Err(PalError::HandleInvalid(HandleInvalidReason::BadStateIndex));
        }
        let chunk = self.chunks[c].as_ref().unwrap();
        let word = chunk.state[s];
        if !word.valid() {
            return Err(PalError::HandleInvalid(HandleInvalidReason::BadStateIndex));
        }
        if word.generation() != id.generation() {
            return Err(PalError::HandleInvalid(HandleInvalidReason::Expired));
        }
        Ok((c, s))
    }

    /// Returns `Ok(())` iff every id is live and its generation matches.
    pub fn validate_ids(&self, ids: &[Handle]) -> Result<()> {
        for &id in ids {
            self.validated(id)?;
        }
        Ok(())
    }

    /// Free `ids` (table must carry `IDENTITY`); each freed state-index's
    /// generation advances mod 16.
    pub fn delete_ids(&mut self, ids: &[Handle]) -> Result<()> {
        for &id in ids {
            let (c, s) = self.validated(id)?;
            let chunk = self.chunks[c].as_mut().unwrap();
            let j = chunk.state[s].dense_index() as usize;
            let last = chunk.count - 1;
            let last_raw = chunk.dense[last];
            chunk.dense[j] = last_raw;
            if j != last {
                let last_state_index = Handle::from_raw(last_raw).state_index() as usize;
                let moved = chunk.state[last_state_index];
                chunk.state[last_state_index] = StateWord::pack(true, j as u16, moved.generation());
            }
            let next_gen = (chunk.state[s].generation() + 1) % 16;
            chunk.dense[last] = s as u32;
            chunk.state[s] = StateWord::pack(false, 0, next_gen);
            chunk.count -= 1;
            self.chunk_status[c] = true;
        }
        Ok(())
    }

    /// Insert ids generated by another table (this table must carry `STORAGE`
    /// without `IDENTITY`); the id's own generation is preserved, not minted.
    pub fn insert_ids(&mut self, ids: &[Handle]) -> Result<()> {
        if !self.flags.contains(TableFlags::STORAGE) {
            return Err(PalError::InvalidArgument(
                "insert_ids requires the STORAGE flag".into(),
            ));
        }
        for &id in ids {
            let c = id.chunk() as usize;
            if !self.chunk_commit[c] {
                self.commit_chunk(c)?;
            }
            let chunk = self.chunks[c].as_mut().unwrap();
            let j = chunk.count;
            let s = id.state_index() as usize;
            chunk.dense[j] = id.raw();
            chunk.state[s] = StateWord::pack(true, j as u16, id.generation());
            chunk.count += 1;
            self.chunk_status[c] = chunk.count < SLOTS_PER_CHUNK;
        }
        Ok(())
    }

    /// Remove ids inserted via `insert_ids` without burning a generation; the
    /// id remains valid in whatever table originally issued it.
    pub fn remove_ids(&mut self, ids: &[Handle]) -> Result<()> {
        for &id in ids {
            let (c, s) = self.validated(id)?;
            let chunk = self.chunks[c].as_mut().unwrap();
            let j = chunk.state[s].dense_index() as usize;
            let last = chunk.count - 1;
            let last_raw = chunk.dense[last];
            chunk.dense[j] = last_raw;
            if j != last {
                let last_state_index = Handle::from_raw(last_raw).state_index() as usize;
                let moved = chunk.state[last_state_index];
                chunk.state[last_state_index] = StateWord::pack(true, j as u16, moved.generation());
            }
            chunk.state[s] = StateWord::pack(false, 0, chunk.state[s].generation());
            chunk.count -= 1;
            self.chunk_status[c] = true;
        }
        Ok(())
    }

    /// Invoke `visitor` with a view over every committed, non-empty chunk.
    /// `visitor` returns `true` to continue, `false` to stop; returns
    /// `Ok(false)` if the enumeration was aborted early.
    pub fn visit(&self, mut visitor: impl FnMut(ChunkInfo<'_>) -> bool) -> Result<bool> {
        for c in 0..CHUNKS_PER_TABLE {
            if let Some(chunk) = &self.chunks[c] {
                if chunk.count == 0 {
                    continue;
                }
                let keep_going = visitor(ChunkInfo {
                    chunk: c as u16,
                    count: chunk.count,
                    dense: &chunk.dense[..chunk.count],
                    view: chunk.view,
                    dense_index: None,
                });
                if !keep_going {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Iterator form of [`HandleTable::visit`] for callers that want to
    /// `for`-loop or chain adapters instead of passing a closure.
    pub fn iter_chunks(&self) -> ChunkIter<'_, V> {
        ChunkIter { table: self, next: 0 }
    }

    pub fn get_chunk_for_index(&self, chunk: u16) -> Result<ChunkInfo<'_>> {
        let c = chunk as usize;
        let chunk_ref = self.chunks.get(c).and_then(|x| x.as_ref()).ok_or_else(|| {
            PalError::InvalidArgument(format!("chunk {chunk} is not committed"))
        })?;
        Ok(ChunkInfo {
            chunk,
            count: chunk_ref.count,
            dense: &chunk_ref.dense[..chunk_ref.count],
            view: chunk_ref.view,
            dense_index: None,
        })
    }

    pub fn get_chunk_for_handle(&self, id: Handle) -> Result<ChunkInfo<'_>> {
        let (c, s) = self.validated(id)?;
        let chunk_ref = self.chunks[c].as_ref().unwrap();
        Ok(ChunkInfo {
            chunk: c as u16,
            count: chunk_ref.count,
            dense: &chunk_ref.dense[..chunk_ref.count],
            view: chunk_ref.view,
            dense_index: Some(chunk_ref.state[s].dense_index()),
        })
    }

    pub fn namespace(&self) -> u8 {
        self.namespace
    }

    /// Total live handles across every chunk.
    pub fn live_count(&self) -> usize {
        self.chunks.iter().flatten().map(|c| c.count).sum()
    }
}
