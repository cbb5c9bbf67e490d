// Memory-bus contract tests: width lanes, sign-extended aliasing, the
// legacy-64 policies and the fault variants.

use intuition_engine::memory::{Bus, LegacyMmio64};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn word_round_trip_through_sub_word_lanes() {
    let bus = Bus::new();
    bus.write32(0x1000, 0xDEAD_BEEF);
    assert_eq!(bus.read16(0x1000), 0xBEEF);
    assert_eq!(bus.read16(0x1002), 0xDEAD);
    assert_eq!(bus.read32(0x1000), 0xDEAD_BEEF);
}

#[test]
fn sign_extended_alias_reaches_low_memory() {
    let bus = Bus::new();
    bus.write32(0x9000, 0xCAFE_BABE);
    assert_eq!(bus.read32(0xFFFF_9000), 0xCAFE_BABE);
    // And the alias works for writes too.
    bus.write16(0xFFFF_0042, 0x1234);
    assert_eq!(bus.read16(0x0042), 0x1234);
}

#[test]
fn out_of_bounds_reads_zero_and_writes_vanish() {
    let bus = Bus::new();
    for addr in [0x0200_0000u32, 0x7000_0000, 0xFFFE_0000] {
        assert_eq!(bus.read8(addr), 0);
        assert_eq!(bus.read16(addr), 0);
        assert_eq!(bus.read32(addr), 0);
        assert_eq!(bus.read64(addr), 0);
        bus.write64(addr, u64::MAX);
        assert_eq!(bus.read64(addr), 0);
    }
}

#[test]
fn legacy_region_faults_64_bit_access_by_default() {
    let bus = Bus::new();
    let reads = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&reads);
    bus.map_io(
        0xE0000,
        0xE00FF,
        Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            0x1234_5678
        })),
        None,
    );
    let (value, ok) = bus.read64_with_fault(0xE0000);
    assert_eq!(value, 0);
    assert!(!ok);
    assert_eq!(reads.load(Ordering::SeqCst), 0, "no handler may run under Fault");
    // 32-bit access still works normally.
    assert_eq!(bus.read32(0xE0000), 0x1234_5678);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn split_policy_decomposes_in_low_then_high_order() {
    let bus = Bus::new();
    let writes: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&writes);
    bus.map_io(
        0xE0000,
        0xE00FF,
        None,
        Some(Arc::new(move |addr, value| {
            log.lock().unwrap().push((addr, value));
        })),
    );
    bus.set_legacy_mmio64_policy(LegacyMmio64::Split);
    bus.write64(0xE0000, 0xBBBB_BBBB_AAAA_AAAA);
    let seen = writes.lock().unwrap();
    assert_eq!(
        *seen,
        vec![(0xE0000, 0xAAAA_AAAA), (0xE0004, 0xBBBB_BBBB)],
        "low half first, then high"
    );
}

#[test]
fn native_64_region_takes_64_bit_traffic() {
    let bus = Bus::new();
    let cell = Arc::new(AtomicU64::new(0));
    let rd = Arc::clone(&cell);
    let wr = Arc::clone(&cell);
    bus.map_io64(
        0xE2000,
        0xE20FF,
        Some(Arc::new(move |_| rd.load(Ordering::SeqCst))),
        Some(Arc::new(move |_, value| wr.store(value, Ordering::SeqCst))),
    );
    bus.write64(0xE2000, 0x0102_0304_0506_0708);
    assert_eq!(bus.read64(0xE2000), 0x0102_0304_0506_0708);
}

#[test]
fn video_status_fast_path_reads_without_region() {
    let bus = Bus::new();
    let status = Arc::new(AtomicU32::new(0));
    bus.set_video_status_reader(0x01F3_0004, Arc::clone(&status));
    assert_eq!(bus.read32(0x01F3_0004) & 0x2, 0);
    status.store(0x2, Ordering::Release);
    assert_eq!(bus.read32(0x01F3_0004) & 0x2, 0x2);
}

#[test]
fn ram_round_trip_survives_reset_of_registrations() {
    let bus = Bus::new();
    bus.map_io(0xE0000, 0xE00FF, Some(Arc::new(|_| 7)), None);
    bus.write32(0x4000, 0x5555_AAAA);
    bus.reset();
    assert_eq!(bus.read32(0x4000), 0, "reset zeroes RAM");
    assert_eq!(bus.read32(0xE0000), 7, "registrations survive reset");
}

#[test]
fn bulk_image_load_is_visible_through_typed_reads() {
    let bus = Bus::new();
    bus.load_image(0x2000, &[0x11, 0x22, 0x33, 0x44, 0x55]);
    assert_eq!(bus.read32(0x2000), 0x4433_2211);
    assert_eq!(bus.read8(0x2004), 0x55);
    assert_eq!(&bus.memory()[0x2000..0x2005], &[0x11, 0x22, 0x33, 0x44, 0x55]);
}
