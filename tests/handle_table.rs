// Cross-module handle table scenarios: single-chunk saturation and
// stale-handle detection across a delete/recreate cycle.

use pal::{default_virtual_memory, HandleTable, MemoryLayout, TableFlags};

fn fresh_table(namespace: u8) -> HandleTable<impl pal::VirtualMemory> {
    let mut layout = MemoryLayout::new();
    layout.add_stream(16, 8).unwrap();
    HandleTable::new(default_virtual_memory(), namespace, TableFlags::IDENTITY, layout, 1).unwrap()
}

#[test]
fn single_chunk_fill_assigns_unique_slots_in_namespace() {
    let mut table = fresh_table(3);
    let ids = table.create_ids(1024).unwrap();

    assert_eq!(ids.len(), 1024);
    for id in &ids {
        assert!(id.is_valid());
        assert_eq!(id.namespace(), 3);
        assert_eq!(id.chunk(), 0);
    }

    let mut state_indices: Vec<u16> = ids.iter().map(|h| h.state_index()).collect();
    state_indices.sort_unstable();
    state_indices.dedup();
    assert_eq!(state_indices.len(), 1024, "state indices must be unique within the chunk");

    assert_eq!(table.live_count(), 1024);
}

#[test]
fn delete_then_recreate_into_same_slot_invalidates_the_old_handle() {
    let mut table = fresh_table(1);
    let ids = table.create_ids(1).unwrap();
    let stale = ids[0];

    table.delete_ids(&ids).unwrap();
    let recreated = table.create_ids(1).unwrap();

    // With nothing else live in the chunk, the freed slot is the only one
    // `create_ids` can hand out next.
    assert_eq!(recreated[0].chunk(), stale.chunk());
    assert_eq!(recreated[0].state_index(), stale.state_index());
    assert_ne!(recreated[0].generation(), stale.generation());

    assert!(table.validate_ids(&recreated).is_ok());
    assert!(table.validate_ids(&[stale]).is_err());
}

#[test]
fn generation_wraps_after_sixteen_delete_create_cycles() {
    let mut table = fresh_table(2);
    let mut generations = Vec::with_capacity(17);

    for _ in 0..17 {
        let ids = table.create_ids(1).unwrap();
        generations.push(ids[0].generation());
        table.delete_ids(&ids).unwrap();
    }

    assert_eq!(generations[0], generations[16], "generation must wrap mod 16");
    for k in 0..16 {
        assert_eq!(generations[k], k as u8);
    }
}
