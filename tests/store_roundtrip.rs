
//! End-to-end image store behavior: write, purge through every storage
//! tier, and read everything back bit for bit.

use std::sync::Arc;

use ripstore::fs::MemoryFileSystem;
use ripstore::store::{
    Bbox, ImShared, ImageStore, StoreAction, StoreDescriptor, StoreFlags,
};


fn shared() -> Arc<ImShared> {
    ImShared::new(Arc::new(MemoryFileSystem::new()), None)
}

fn descriptor_128x64() -> StoreDescriptor {
    StoreDescriptor {
        block_width: 64,
        block_height: 32,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 127, y2: 63 }, 8, 1)
    }
}

fn ramp(x: usize, y: usize) -> u8 { (x / 4 + 2 * y) as u8 }


#[test]
fn purge_reload_roundtrip(){
    let shared = shared();
    let store = ImageStore::create(&shared, &descriptor_128x64()).unwrap();

    for y in 0 .. 64 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    store.set_action(StoreAction::Compression);
    assert!(store.purge().unwrap() > 0);

    // every block must have left plain memory
    let report = store.plane_report(0);
    for state in report.chars().filter(|&state| state != '\n') {
        assert!(
            matches!(state, 'v' | 'l' | 'f' | '3' | 'y' | 'd'),
            "block still plain after purge: {:?}\n{}", state, report,
        );
    }

    for y in 0 .. 64 {
        for x in 0 .. 128 {
            let row = store.read(0, x, y).unwrap();
            assert_eq!(row[0], ramp(x, y), "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn reads_span_to_the_block_edge(){
    let shared = shared();
    let store = ImageStore::create(&shared, &descriptor_128x64()).unwrap();

    for y in 0 .. 64 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    let row = store.read(0, 10, 5).unwrap();
    assert_eq!(row.remaining_pixels(), 54); // to the end of the first block
    assert_eq!(row.len(), 54);
    for (offset, &value) in row.iter().enumerate() {
        assert_eq!(value, ramp(10 + offset, 5));
    }

    let row = store.read(0, 64, 5).unwrap();
    assert_eq!(row.remaining_pixels(), 64); // the second block is full width
}

#[test]
fn disk_spill_roundtrip(){
    let shared = shared();

    // large enough to be allowed on disk
    let descriptor = StoreDescriptor {
        block_width: 512,
        block_height: 32,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 1023, y2: 127 }, 8, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    for y in 0 .. 128 {
        let row: Vec<u8> = (0 .. 1024).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    store.set_action(StoreAction::Disk);
    assert!(store.purge().unwrap() > 0);
    assert!(store.plane_report(0).contains('d'), "{}", store.plane_report(0));

    for y in (0 .. 128).step_by(7) {
        for x in (0 .. 1024).step_by(13) {
            let row = store.read(0, x, y).unwrap();
            assert_eq!(row[0], ramp(x, y), "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn uniform_planes_collapse_to_color(){
    let shared = shared();
    let store = ImageStore::create(&shared, &descriptor_128x64()).unwrap();

    for y in 0 .. 64 {
        store.write_line(0, y, &[0xc3_u8; 128]).unwrap();
    }

    store.set_action(StoreAction::Compression);
    store.purge().unwrap();

    assert_eq!(store.plane_report(0), "vv\nvv\n");

    for &(x, y) in &[(0, 0), (127, 63), (70, 10)] {
        let row = store.read(0, x, y).unwrap();
        assert_eq!(row[0], 0xc3);
    }
}

#[test]
fn transposed_store_roundtrip(){
    let shared = shared();

    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 32,
        flags: StoreFlags::XYSWAP,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 8, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    // lines arrive as columns: line x carries pixels (x, 0..32)
    for x in 0 .. 64 {
        let column: Vec<u8> = (0 .. 32).map(|y| ramp(x, y)).collect();
        store.write_line(0, x, &column).unwrap();
    }

    for y in 0 .. 32 {
        for x in 0 .. 64 {
            let row = store.read(0, x, y).unwrap();
            assert_eq!(row[0], ramp(x, y), "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn one_bit_transposed_store_roundtrip(){
    let shared = shared();

    // 40 columns of 24 rows at 1 bpp; the transposed minor dimension
    // rounds up to whole bytes
    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 32,
        flags: StoreFlags::XYSWAP,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 39, y2: 23 }, 1, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    let bit = |x: usize, y: usize| (x * 5 + y * 3) % 7 < 3;

    for x in 0 .. 40 {
        let mut column = vec![0_u8; 3]; // 24 rows = 3 bytes
        for y in 0 .. 24 {
            if bit(x, y) { column[y / 8] |= 0x80 >> (y % 8); }
        }
        store.write_line(0, x, &column).unwrap();
    }

    for y in 0 .. 24 {
        let row = store.read(0, 0, y).unwrap();
        for x in 0 .. 40 {
            let actual = row[x / 8] & (0x80 >> (x % 8)) != 0;
            assert_eq!(actual, bit(x, y), "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn memory_pressure_purges_while_writing(){
    let fs = Arc::new(MemoryFileSystem::new());

    // room for roughly two of the four blocks
    let shared = ImShared::new(fs, Some(5 * 1024));

    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 32,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 127, y2: 63 }, 8, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();
    store.set_action(StoreAction::Compression);

    for y in 0 .. 64 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    assert!(shared.memory_in_use() <= 5 * 1024);

    for y in 0 .. 64 {
        for x in (0 .. 128).step_by(11) {
            let row = store.read(0, x, y).unwrap();
            assert_eq!(row[0], ramp(x, y), "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn trimmed_blocks_are_gone(){
    let shared = shared();
    let store = ImageStore::create(&shared, &descriptor_128x64()).unwrap();

    for y in 0 .. 64 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    store.trim_column(0);

    assert!(store.read(0, 0, 0).is_err());
    assert!(store.read(0, 10, 40).is_err());

    // the right column survives
    let row = store.read(0, 64, 0).unwrap();
    assert_eq!(row[0], ramp(64, 0));

    store.trim_row(0);
    assert!(store.read(0, 64, 0).is_err());
    let row = store.read(0, 64, 32).unwrap();
    assert_eq!(row[0], ramp(64, 32));
}

#[test]
fn close_plane_completes_partial_blocks(){
    let shared = shared();
    let store = ImageStore::create(&shared, &descriptor_128x64()).unwrap();

    // only the top half of the image is written
    for y in 0 .. 16 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    let incomplete = store.close_plane(0).unwrap();
    assert!(incomplete);

    // written rows read back, unwritten rows read zero
    assert_eq!(store.read(0, 5, 5).unwrap()[0], ramp(5, 5));
    assert_eq!(store.read(0, 5, 20).unwrap()[0], 0);
}

#[test]
fn row_repeat_tracking(){
    let shared = shared();

    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 32,
        track_row_repeats: true,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 8, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    for y in 0 .. 32 {
        let row = if y < 10 || y >= 20 { vec![1_u8; 64] } else { vec![y as u8; 64] };
        store.write_line(0, y, &row).unwrap();
    }

    // rows 1..10 repeat row 0; rows 10..21 all differ from their
    // predecessors; 21..32 repeat again
    assert!(!store.row_is_repeat(0));
    assert!(store.row_is_repeat(5));
    assert!(!store.row_is_repeat(10));
    assert!(!store.row_is_repeat(15));
    assert!(!store.row_is_repeat(20));
    assert!(store.row_is_repeat(25));
}

#[test]
fn sixteen_bit_store_roundtrip(){
    let shared = shared();

    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 16,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 16, 1)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    let sample = |x: usize, y: usize| -> u16 { (x * 301 + y * 7) as u16 };

    for y in 0 .. 32 {
        let mut row = Vec::with_capacity(128);
        for x in 0 .. 64 { row.extend_from_slice(&sample(x, y).to_le_bytes()); }
        store.write_line(0, y, &row).unwrap();
    }

    store.set_action(StoreAction::Compression);
    store.purge().unwrap();

    for y in (0 .. 32).step_by(3) {
        for x in (0 .. 64).step_by(5) {
            let row = store.read(0, x, y).unwrap();
            let value = u16::from_le_bytes([row[0], row[1]]);
            assert_eq!(value, sample(x, y), "sample ({}, {})", x, y);
        }
    }
}

#[test]
fn concurrent_readers_share_loads(){
    let shared = shared();
    let store = Arc::new(ImageStore::create(&shared, &descriptor_128x64()).unwrap());

    for y in 0 .. 64 {
        let row: Vec<u8> = (0 .. 128).map(|x| ramp(x, y)).collect();
        store.write_line(0, y, &row).unwrap();
    }

    store.set_action(StoreAction::Compression);
    store.purge().unwrap();

    let workers: Vec<_> = (0 .. 4).map(|worker| {
        let store = store.clone();

        std::thread::spawn(move || {
            for y in 0 .. 64 {
                for x in ((worker % 4) .. 128).step_by(4) {
                    let row = store.read(0, x, y).unwrap();
                    assert_eq!(row[0], ramp(x, y));
                }
            }
        })
    }).collect();

    for worker in workers { worker.join().unwrap(); }
}

#[test]
fn multiple_planes_are_independent(){
    let shared = shared();

    let descriptor = StoreDescriptor {
        block_width: 64,
        block_height: 32,
        ..StoreDescriptor::new(Bbox { x1: 0, y1: 0, x2: 63, y2: 31 }, 8, 3)
    };

    let store = ImageStore::create(&shared, &descriptor).unwrap();

    for plane in 0 .. 3 {
        for y in 0 .. 32 {
            let row: Vec<u8> = (0 .. 64).map(|x| (x + y + plane * 100) as u8).collect();
            store.write_line(plane, y, &row).unwrap();
        }
    }

    store.set_action(StoreAction::Compression);
    store.purge().unwrap();

    for plane in 0 .. 3 {
        let row = store.read(plane, 10, 10).unwrap();
        assert_eq!(row[0], (20 + plane * 100) as u8);
    }
}
