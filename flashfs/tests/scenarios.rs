//! Concrete scenario and boundary tests (SPEC_FULL §8, S1-S6/B1-B3), all
//! configured with the spec's canonical `page_size=256, block_size=65536,
//! total=1 MiB` geometry unless a test needs something smaller to exercise
//! garbage collection within a reasonable number of operations.

use flashfs::{Config, Error, Filesystem, OpenFlags};
use nor_flash::test::{FaultInjectingFlash, VirtualFlash};

fn mount_default() -> Filesystem<VirtualFlash> {
    let config = Config {
        phys_addr: 0,
        phys_size: 1024 * 1024,
        phys_erase_block: 65536,
        log_page_size: 256,
        log_block_size: 65536,
    };
    let flash = VirtualFlash::new(config.phys_size, config.phys_erase_block);
    Filesystem::mount(config, flash, 4).unwrap()
}

/// S1: create, append 100 bytes, read them back, size matches.
#[test_log::test]
fn s1_create_append_read_small() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"a", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();

    let data: Vec<u8> = (0u8..100).collect();
    fs.append(handle, &data).unwrap();

    let mut buf = [0u8; 100];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[..]);
}

/// S2: append 300 bytes, crossing the data-page boundary (data_page_size is
/// 256 - header_size, well under 300). Two data pages must now be reachable
/// and size must read back as exactly 300.
#[test_log::test]
fn s2_append_crosses_data_page_boundary() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"big", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();

    let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    fs.append(handle, &data).unwrap();

    let mut buf = vec![0u8; 300];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(buf, data);
}

/// S4: modify a single byte in the middle of a 1000-byte object; everything
/// else must read back unchanged and the changed byte must read back new.
#[test_log::test]
fn s4_modify_single_byte() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"m", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();

    let mut data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    fs.append(handle, &data).unwrap();

    fs.modify(handle, 50, &[0xAB]).unwrap();
    data[50] = 0xAB;

    let mut buf = vec![0u8; 1000];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(buf, data);
}

/// S6: two fds on the same object; an append through one is visible (via
/// `size`) through the other once re-read, thanks to the event broadcast.
#[test_log::test]
fn s6_fd_coherence_on_append() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"shared", 0).unwrap();
    let h1 = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
    let h2 = fs.open_by_id(obj_id, OpenFlags::RDONLY).unwrap();

    fs.append(h1, b"hello").unwrap();

    let mut buf = [0u8; 5];
    fs.read(h2, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

/// B1: reading past the end of an object returns `EndOfObject`.
#[test_log::test]
fn b1_read_past_end() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"short", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
    fs.append(handle, b"abc").unwrap();

    let mut buf = [0u8; 10];
    let err = fs.read(handle, 0, &mut buf).unwrap_err();
    assert!(matches!(err, Error::EndOfObject));
}

/// B3: the first pass through a fresh index-page span reuses/loads the
/// already-existing page; crossing into a span that was never visited
/// before on this object allocates a new one. Exercised indirectly by an
/// append long enough to require a non-header index page, followed by a
/// second append continuing into the same span.
#[test_log::test]
fn b3_span_reuse_on_second_pass() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"spans", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();

    // Large enough to spill into at least one non-header index page given
    // page_size=256 (data_page_size ~251, n_hdr well under 64 entries).
    let first: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
    fs.append(handle, &first).unwrap();

    let second: Vec<u8> = (0..1000u32).map(|i| ((i + 7) % 256) as u8).collect();
    fs.append(handle, &second).unwrap();

    let mut expected = first;
    expected.extend_from_slice(&second);

    let mut buf = vec![0u8; expected.len()];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(buf, expected);
}

/// R3: truncating to the current size twice is a no-op after the first.
#[test_log::test]
fn r3_truncate_idempotent() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"trunc", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
    fs.append(handle, b"0123456789").unwrap();

    fs.truncate(handle, 4, false).unwrap();
    let mut buf = [0u8; 4];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"0123");

    fs.truncate(handle, 4, false).unwrap();
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"0123");
}

/// Truncate-to-zero-with-remove deletes the object outright: reopening by
/// the same id must fail.
#[test_log::test]
fn truncate_to_zero_with_remove_deletes_object() {
    let mut fs = mount_default();
    let (obj_id, _hdr_pix) = fs.create(b"gone", 0).unwrap();
    let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
    fs.append(handle, b"payload").unwrap();

    fs.truncate(handle, 0, true).unwrap();

    let err = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap_err();
    assert!(matches!(err, Error::NotFound));
}

/// S3: force a non-header index page, then kill power at every possible
/// physical-write boundary of a second append that crosses into it. Since
/// the object already had data before this call (`offset > 0`), the span
/// transition persists the header page through [`Filesystem::update_index_hdr`]
/// / `move_page`'s two-phase body-then-finalize write — exactly the window
/// the scenario calls out. Exhaustively trying every budget covers the exact
/// crash point as a special case without needing to hard-code which write
/// count it falls on.
#[test_log::test]
fn s3_crash_crossing_into_nonheader_index_page() {
    let config = Config {
        phys_addr: 0,
        phys_size: 256 * 1024,
        phys_erase_block: 65536,
        log_page_size: 256,
        log_block_size: 65536,
    };
    let initial = vec![0xAAu8; 50];
    let big: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();

    for budget in 0..200u32 {
        let flash = VirtualFlash::new(config.phys_size, config.phys_erase_block);
        let mut fs = Filesystem::mount(config, FaultInjectingFlash::new(flash), 4).unwrap();
        let (obj_id, _) = fs.create(b"s3", 0).unwrap();
        let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
        fs.append(handle, &initial).unwrap();

        fs.flash_mut().arm(budget);
        let _ = fs.append(handle, &big);

        let inner = fs.into_flash().into_inner();
        let mut fs2 = Filesystem::mount(config, inner, 4).unwrap();

        let mut size_after = None;
        fs2.list_objects(|id, _obj_type, size, _name| {
            if id == obj_id {
                size_after = Some(size);
            }
        })
        .unwrap();
        let size_after = size_after.expect("header page must survive any crash point");

        // Atomic: the crash either fully loses the append (pre-crash size) or
        // it fully lands (pre- plus post-append size); nothing in between is
        // observable on remount.
        assert!(
            size_after == initial.len() as u32 || size_after == (initial.len() + big.len()) as u32,
            "budget {budget}: size {size_after} is neither the pre- nor post-append size"
        );

        let handle2 = fs2.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
        let mut buf = vec![0u8; size_after as usize];
        fs2.read(handle2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..initial.len()], &initial[..]);
        if size_after as usize > initial.len() {
            assert_eq!(&buf[initial.len()..], &big[..]);
        }
    }
}

/// S5: fill a small device to `Error::Full`, truncate-delete the oldest half
/// of its objects, and confirm a further write succeeds once gc reclaims the
/// blocks they occupied. The free-page cursor fills blocks in allocation
/// order (`lookup::find_free_entry`), so deleting the oldest objects empties
/// the earliest blocks outright, giving gc a candidate with nothing left to
/// move before it can erase.
#[test_log::test]
fn s5_full_then_gc_after_truncating_half() {
    let config = Config {
        phys_addr: 0,
        phys_size: 4 * 4096,
        phys_erase_block: 4096,
        log_page_size: 256,
        log_block_size: 4096,
    };
    let flash = VirtualFlash::new(config.phys_size, config.phys_erase_block);
    let mut fs = Filesystem::mount(config, flash, 64).unwrap();

    let mut created = Vec::new();
    loop {
        let name = (created.len() as u32).to_le_bytes();
        let (obj_id, _) = match fs.create(&name, 0) {
            Ok(v) => v,
            Err(Error::Full) => break,
            Err(e) => panic!("unexpected error while filling device: {e:?}"),
        };
        let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
        match fs.append(handle, &[0xABu8; 32]) {
            Ok(()) => {
                fs.close_fd(handle).unwrap();
                created.push(obj_id);
            }
            Err(_) => {
                // Header allocated but no room left for its data; undo and stop.
                let _ = fs.truncate(handle, 0, true);
                fs.close_fd(handle).unwrap();
                break;
            }
        }
        if created.len() > 200 {
            panic!("device never reported Full");
        }
    }
    assert!(created.len() >= 4, "test needs enough objects to span multiple blocks");

    let half = created.len() / 2;
    for &obj_id in &created[..half] {
        let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
        fs.truncate(handle, 0, true).unwrap();
        fs.close_fd(handle).unwrap();
    }

    let (new_id, _) = fs.create(b"after-gc", 0).expect("gc must reclaim space once half the objects are gone");
    let handle = fs.open_by_id(new_id, OpenFlags::RDWR).unwrap();
    fs.append(handle, b"space reclaimed").unwrap();
    let mut buf = [0u8; 16];
    fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"space reclaimed");
}

/// B2: once `free_blocks` drops to the gc threshold, a small device still
/// reclaims space for further writes instead of going permanently full.
#[test_log::test]
fn b2_gc_reclaims_space_under_pressure() {
    let config = Config {
        phys_addr: 0,
        phys_size: 3 * 4096,
        phys_erase_block: 4096,
        log_page_size: 256,
        log_block_size: 4096,
    };
    let flash = VirtualFlash::new(config.phys_size, config.phys_erase_block);
    let mut fs = Filesystem::mount(config, flash, 4).unwrap();

    // Create and delete several small objects to build up ERASED lookup
    // entries, forcing gc to run on later allocations.
    for i in 0..40u32 {
        let name = i.to_le_bytes();
        let (obj_id, _) = fs.create(&name, 0).unwrap();
        let handle = fs.open_by_id(obj_id, OpenFlags::RDWR).unwrap();
        fs.append(handle, &[i as u8; 16]).unwrap();
        if i % 2 == 0 {
            fs.truncate(handle, 0, true).unwrap();
        }
        fs.close_fd(handle).unwrap();
    }

    // The device must still be usable: either the final write succeeds or
    // the filesystem reports Full, never silently corrupting state.
    let result = fs.create(b"final", 0);
    assert!(matches!(result, Ok(_) | Err(Error::Full)));
}
