//! End-to-end scenarios against the simulated lower device.

use std::sync::Arc;

use blockdev_sim::{CompletionMode, RamDevice};
use common::{BlockDevice, IntegrityProfile, KeyKind, MemoryKeyring, SECTOR_SIZE};
use crypt_core::{BlockStatus, MapOptions, Mapping, TableArgs};

fn keyring() -> Arc<MemoryKeyring> {
    Arc::new(MemoryKeyring::new())
}

fn mapping(table: &str, dev: &Arc<RamDevice>) -> Mapping {
    Mapping::from_table(table, dev.clone() as Arc<dyn BlockDevice>, keyring())
        .expect("mapping constructs")
}

fn zero_key(bytes: usize) -> String {
    "00".repeat(bytes)
}

#[test]
fn zero_sector_round_trips_and_is_encrypted_at_rest() {
    // aes-cbc, plain64, 32-byte zero key, 512-byte sectors.
    let dev = RamDevice::new("ram0", 2048);
    let table = format!("aes-cbc-plain64 {} 0 ram0 0", zero_key(32));
    let map = mapping(&table, &dev);

    map.write_at(0, &[0u8; SECTOR_SIZE]).unwrap();

    let plain = map.read_at(0, SECTOR_SIZE).unwrap();
    assert_eq!(plain, vec![0u8; SECTOR_SIZE]);

    // The device holds ciphertext, not the zeros.
    let raw = dev.raw_read(0, SECTOR_SIZE);
    assert!(raw.iter().any(|&b| b != 0));
}

#[test]
fn start_offset_rebases_the_device_area() {
    let dev = RamDevice::new("ram0", 4096);
    let table = format!("aes-cbc-plain64 {} 0 ram0 128", zero_key(32));
    let map = mapping(&table, &dev);

    map.write_at(0, &[7u8; SECTOR_SIZE]).unwrap();

    // Logical sector 0 landed at device sector 128.
    assert!(dev.raw_read(0, SECTOR_SIZE).iter().all(|&b| b == 0));
    assert!(dev.raw_read(128, SECTOR_SIZE).iter().any(|&b| b != 0));
    assert_eq!(map.read_at(0, SECTOR_SIZE).unwrap(), vec![7u8; SECTOR_SIZE]);
}

#[test]
fn back_to_back_writes_complete_with_sequencer() {
    let dev = RamDevice::with_profile("ram0", 4096, None, CompletionMode::Threaded);
    let table = format!("aes-cbc-plain64 {} 0 ram0 0", zero_key(32));
    let map = mapping(&table, &dev);

    map.write_at(17, &[17u8; SECTOR_SIZE]).unwrap();
    map.write_at(2, &[2u8; SECTOR_SIZE]).unwrap();

    assert_eq!(map.read_at(17, SECTOR_SIZE).unwrap(), vec![17u8; SECTOR_SIZE]);
    assert_eq!(map.read_at(2, SECTOR_SIZE).unwrap(), vec![2u8; SECTOR_SIZE]);

    // Both writes went through batched sequencer drains.
    let writes: Vec<_> = dev
        .submissions()
        .into_iter()
        .filter(|s| s.dir == crypt_core::Direction::Write)
        .collect();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|s| s.batch > 0));
}

#[test]
fn aead_tag_corruption_is_protection_and_stays_local() {
    let profile = IntegrityProfile { tag_size: 16, interval: SECTOR_SIZE };
    let dev = RamDevice::with_profile("ram0", 2048, Some(profile), CompletionMode::Inline);
    let table = format!(
        "capi:gcm(aes)-plain64 {} 0 ram0 0 1 integrity:16:aead",
        zero_key(32)
    );
    let map = mapping(&table, &dev);

    map.write_at(0, &[0xA1; SECTOR_SIZE]).unwrap();
    map.write_at(1, &[0xB2; SECTOR_SIZE]).unwrap();

    dev.corrupt_tag(0, 5);

    assert_eq!(map.read_at(0, SECTOR_SIZE), Err(BlockStatus::Protection));
    // The neighbouring sector is unaffected.
    assert_eq!(map.read_at(1, SECTOR_SIZE).unwrap(), vec![0xB2; SECTOR_SIZE]);
}

#[test]
fn aead_data_corruption_is_protection() {
    let profile = IntegrityProfile { tag_size: 16, interval: SECTOR_SIZE };
    let dev = RamDevice::with_profile("ram0", 2048, Some(profile), CompletionMode::Inline);
    let table = format!(
        "capi:gcm(aes)-plain64 {} 0 ram0 0 1 integrity:16:aead",
        zero_key(32)
    );
    let map = mapping(&table, &dev);

    map.write_at(4, &[0x55; SECTOR_SIZE]).unwrap();
    dev.corrupt_data(4, 100);
    assert_eq!(map.read_at(4, SECTOR_SIZE), Err(BlockStatus::Protection));
}

#[test]
fn authenc_hmac_round_trips_with_truncated_tag() {
    let profile = IntegrityProfile { tag_size: 28, interval: SECTOR_SIZE };
    let dev = RamDevice::with_profile("ram0", 2048, Some(profile), CompletionMode::Inline);
    // 64-byte key: 32 bytes cbc(aes) + 32 bytes hmac(sha256).
    let table = format!(
        "capi:authenc(hmac(sha256),cbc(aes))-plain64 {} 0 ram0 0 1 integrity:28:aead",
        zero_key(64)
    );
    let map = mapping(&table, &dev);

    map.write_at(3, &[0x3C; SECTOR_SIZE]).unwrap();
    assert_eq!(map.read_at(3, SECTOR_SIZE).unwrap(), vec![0x3C; SECTOR_SIZE]);

    dev.corrupt_tag(3, 0);
    assert_eq!(map.read_at(3, SECTOR_SIZE), Err(BlockStatus::Protection));
}

#[test]
fn random_iv_differs_per_write_and_round_trips() {
    let profile = IntegrityProfile { tag_size: 16, interval: SECTOR_SIZE };
    let dev = RamDevice::with_profile("ram0", 2048, Some(profile), CompletionMode::Inline);
    let table = format!("aes-cbc-random {} 0 ram0 0 1 integrity:16:none", zero_key(32));
    let map = mapping(&table, &dev);

    let payload = [0x42u8; SECTOR_SIZE];

    map.write_at(9, &payload).unwrap();
    let cipher_a = dev.raw_read(9, SECTOR_SIZE);
    assert_eq!(map.read_at(9, SECTOR_SIZE).unwrap(), payload.to_vec());

    map.write_at(9, &payload).unwrap();
    let cipher_b = dev.raw_read(9, SECTOR_SIZE);
    assert_eq!(map.read_at(9, SECTOR_SIZE).unwrap(), payload.to_vec());

    // Same plaintext, same sector, fresh IV: different ciphertext.
    assert_ne!(cipher_a, cipher_b);
}

#[test]
fn engine_selection_follows_sector_low_bits() {
    // A 2-engine mapping must encrypt sector n with sub-key n & 1; compare
    // against single-key mappings holding each half.
    let key_a = "11".repeat(32);
    let key_b = "22".repeat(32);

    let multi_dev = RamDevice::new("multi", 2048);
    let multi = mapping(
        &format!("aes:2-cbc-plain64 {}{} 0 multi 0", key_a, key_b),
        &multi_dev,
    );
    let payload = [0x5Au8; SECTOR_SIZE];
    for sector in 0..4 {
        multi.write_at(sector, &payload).unwrap();
    }

    let single_a_dev = RamDevice::new("single-a", 2048);
    let single_a = mapping(&format!("aes-cbc-plain64 {} 0 single-a 0", key_a), &single_a_dev);
    let single_b_dev = RamDevice::new("single-b", 2048);
    let single_b = mapping(&format!("aes-cbc-plain64 {} 0 single-b 0", key_b), &single_b_dev);
    for sector in 0..4 {
        single_a.write_at(sector, &payload).unwrap();
        single_b.write_at(sector, &payload).unwrap();
    }

    // Even sectors use the first sub-key, odd sectors the second, wrapping
    // as 0,1,0,1.
    for sector in [0u64, 2] {
        assert_eq!(
            multi_dev.raw_read(sector, SECTOR_SIZE),
            single_a_dev.raw_read(sector, SECTOR_SIZE),
            "sector {sector} should use sub-key 0"
        );
    }
    for sector in [1u64, 3] {
        assert_eq!(
            multi_dev.raw_read(sector, SECTOR_SIZE),
            single_b_dev.raw_read(sector, SECTOR_SIZE),
            "sector {sector} should use sub-key 1"
        );
    }
}

#[test]
fn page_pool_pressure_two_large_writes() {
    let dev = RamDevice::with_profile("ram0", 1 << 16, None, CompletionMode::Threaded);
    let table = format!("aes-xts-plain64 {} 0 ram0 0", zero_key(64));
    let map = Arc::new(mapping(&table, &dev));
    // 128-page budget, two concurrent 1 MiB writes (256 pages each).
    map.set_page_pool_limit(128);

    let mut handles = Vec::new();
    for i in 0..2u8 {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let payload = vec![i + 1; 1 << 20];
            map.write_at(u64::from(i) * 2048, &payload).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let stats = map.pool_stats();
    assert_eq!(stats.pages_allocated, 0, "pages return to the pool");
    assert!(stats.page_slow_hits >= 1, "slow path must have been taken");

    assert_eq!(map.read_at(0, 1 << 20).unwrap(), vec![1u8; 1 << 20]);
    assert_eq!(map.read_at(2048, 1 << 20).unwrap(), vec![2u8; 1 << 20]);
}

#[test]
fn essiv_round_trip_and_key_dependence() {
    let dev = RamDevice::new("ram0", 2048);
    let table = format!("aes-cbc-essiv:sha256 {} 0 ram0 0", "ab".repeat(32));
    let map = mapping(&table, &dev);

    let payload: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
    map.write_at(5, &payload).unwrap();
    assert_eq!(map.read_at(5, SECTOR_SIZE).unwrap(), payload);

    // A different key yields different ciphertext for the same data.
    let dev2 = RamDevice::new("ram1", 2048);
    let map2 = mapping(&format!("aes-cbc-essiv:sha256 {} 0 ram1 0", "cd".repeat(32)), &dev2);
    map2.write_at(5, &payload).unwrap();
    assert_ne!(dev.raw_read(5, SECTOR_SIZE), dev2.raw_read(5, SECTOR_SIZE));
}

#[test]
fn benbi_xts_round_trip() {
    let dev = RamDevice::new("ram0", 2048);
    let table = format!("aes-xts-benbi {} 0 ram0 0", zero_key(64));
    let map = mapping(&table, &dev);

    let payload = [0x99u8; 2 * SECTOR_SIZE];
    map.write_at(10, &payload).unwrap();
    assert_eq!(map.read_at(10, 2 * SECTOR_SIZE).unwrap(), payload.to_vec());

    // Adjacent sectors differ even with identical plaintext.
    assert_ne!(dev.raw_read(10, SECTOR_SIZE), dev.raw_read(11, SECTOR_SIZE));
}

#[test]
fn lmk_round_trips_on_512_byte_sectors() {
    let dev = RamDevice::new("ram0", 2048);
    let table = format!("aes-cbc-lmk {} 0 ram0 0", zero_key(32));
    let map = mapping(&table, &dev);

    let payload: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i * 7 % 256) as u8).collect();
    map.write_at(6, &payload).unwrap();
    map.write_at(7, &payload).unwrap();
    assert_eq!(map.read_at(6, SECTOR_SIZE).unwrap(), payload);
    assert_eq!(map.read_at(7, SECTOR_SIZE).unwrap(), payload);

    assert_ne!(dev.raw_read(6, SECTOR_SIZE), dev.raw_read(7, SECTOR_SIZE));
}

#[test]
fn tcw_round_trips_and_whitens_per_sector() {
    let dev = RamDevice::new("ram0", 2048);
    // 64-byte key: 32 for aes-256, 16 IV seed, 16 whitening.
    let table = format!("aes-cbc-tcw {} 0 ram0 0", "5a".repeat(64));
    let map = mapping(&table, &dev);

    let payload = [0xE7u8; SECTOR_SIZE];
    map.write_at(20, &payload).unwrap();
    map.write_at(21, &payload).unwrap();
    assert_eq!(map.read_at(20, SECTOR_SIZE).unwrap(), payload.to_vec());
    assert_eq!(map.read_at(21, SECTOR_SIZE).unwrap(), payload.to_vec());

    assert_ne!(dev.raw_read(20, SECTOR_SIZE), dev.raw_read(21, SECTOR_SIZE));
}

#[test]
fn large_sectors_with_iv_large_sectors_flag() {
    let dev = RamDevice::new("ram0", 1 << 14);
    let table = format!(
        "aes-xts-plain64 {} 0 ram0 0 2 sector_size:4096 iv_large_sectors",
        zero_key(64)
    );
    let map = mapping(&table, &dev);

    let payload = vec![0x31u8; 8192];
    map.write_at(8, &payload).unwrap();
    assert_eq!(map.read_at(8, 8192).unwrap(), payload);

    // Unaligned submissions are rejected outright.
    assert_eq!(map.write_at(1, &payload), Err(BlockStatus::IoErr));
    assert_eq!(map.write_at(8, &payload[..1000]), Err(BlockStatus::IoErr));
}

#[test]
fn iv_offset_shifts_the_iv_space() {
    let payload = [0xC4u8; SECTOR_SIZE];

    let dev_a = RamDevice::new("a", 2048);
    let map_a = mapping(&format!("aes-cbc-plain64 {} 0 a 0", zero_key(32)), &dev_a);
    map_a.write_at(0, &payload).unwrap();

    let dev_b = RamDevice::new("b", 2048);
    let map_b = mapping(&format!("aes-cbc-plain64 {} 16 b 0", zero_key(32)), &dev_b);
    map_b.write_at(0, &payload).unwrap();

    // Same key, same sector, shifted IV: different ciphertext, and each
    // mapping still reads itself back.
    assert_ne!(dev_a.raw_read(0, SECTOR_SIZE), dev_b.raw_read(0, SECTOR_SIZE));
    assert_eq!(map_b.read_at(0, SECTOR_SIZE).unwrap(), payload.to_vec());
}

#[test]
fn offload_pipeline_bypasses_host_crypto() {
    let dev = RamDevice::new("ram0", 4096);
    let table = format!("aes-xts-disk {} 0 ram0 0", zero_key(64));
    let map = mapping(&table, &dev);

    let payload = vec![0x77u8; 4 * SECTOR_SIZE];
    map.write_at(40, &payload).unwrap();
    assert_eq!(map.read_at(40, 4 * SECTOR_SIZE).unwrap(), payload);

    // Ciphertext at rest, but the host page pool never engaged.
    assert!(dev.raw_read(40, SECTOR_SIZE).iter().any(|&b| b != 0x77));
    let stats = map.pool_stats();
    assert_eq!(stats.pages_allocated, 0);
    assert_eq!(stats.page_slow_hits, 0);
}

#[test]
fn async_engine_queue_backlogs_and_completes() {
    let dev = RamDevice::with_profile("ram0", 1 << 14, None, CompletionMode::Threaded);
    let args = TableArgs::parse(&format!("aes-xts-plain64 {} 0 ram0 0", zero_key(64))).unwrap();
    let map = Mapping::with_options(
        &args,
        dev.clone() as Arc<dyn BlockDevice>,
        keyring(),
        MapOptions { engine_queue_depth: Some(2) },
    )
    .unwrap();

    // 64 sectors per write forces the converter through the backlog path
    // repeatedly; completions arrive on the engine worker.
    let payload: Vec<u8> = (0..64 * SECTOR_SIZE).map(|i| (i % 255) as u8).collect();
    map.write_at(0, &payload).unwrap();
    map.write_at(256, &payload).unwrap();

    assert_eq!(map.read_at(0, payload.len()).unwrap(), payload);
    assert_eq!(map.read_at(256, payload.len()).unwrap(), payload);
}

#[test]
fn oversize_write_splits_and_reassembles() {
    let dev = RamDevice::new("ram0", 1 << 16);
    let table = format!("aes-xts-plain64 {} 0 ram0 0", zero_key(64));
    let map = mapping(&table, &dev);

    // 3 MiB exceeds the 1 MiB page-run limit; the write is delivered as
    // three children and the completion aggregates.
    let payload: Vec<u8> = (0..3 << 20).map(|i| (i % 253) as u8).collect();
    map.write_at(64, &payload).unwrap();
    assert_eq!(map.read_at(64, payload.len()).unwrap(), payload);

    let writes = dev
        .submissions()
        .iter()
        .filter(|s| s.dir == crypt_core::Direction::Write)
        .count();
    assert_eq!(writes, 3);
    assert_eq!(map.pool_stats().pages_allocated, 0);
}

#[test]
fn huge_tag_area_falls_back_to_the_tag_pool() {
    let profile = IntegrityProfile { tag_size: 16, interval: SECTOR_SIZE };
    let dev = RamDevice::with_profile("ram0", 1 << 15, Some(profile), CompletionMode::Inline);
    let table = format!(
        "capi:gcm(aes)-plain64 {} 0 ram0 0 1 integrity:16:aead",
        zero_key(32)
    );
    let map = mapping(&table, &dev);

    // 4.5 MiB of sectors needs more tag bytes than the heap threshold
    // allows, so the I/O shrinks to pooled tag-buffer chunks.
    let payload: Vec<u8> = (0..9 << 19).map(|i| (i % 249) as u8).collect();
    map.write_at(0, &payload).unwrap();
    assert_eq!(map.read_at(0, payload.len()).unwrap(), payload);

    // Still tamper-evident at that size.
    dev.corrupt_tag(100, 2);
    assert_eq!(map.read_at(0, payload.len()), Err(BlockStatus::Protection));
}

#[test]
fn submit_from_crypt_cpus_bypasses_the_sequencer() {
    let dev = RamDevice::new("ram0", 4096);
    let table = format!(
        "aes-cbc-plain64 {} 0 ram0 0 1 submit_from_crypt_cpus",
        zero_key(32)
    );
    let map = mapping(&table, &dev);

    map.write_at(7, &[0xD0; SECTOR_SIZE]).unwrap();
    assert_eq!(map.read_at(7, SECTOR_SIZE).unwrap(), vec![0xD0; SECTOR_SIZE]);

    // Inline crypt completion submitted directly: no batch region.
    let write = dev
        .submissions()
        .into_iter()
        .find(|s| s.dir == crypt_core::Direction::Write)
        .unwrap();
    assert_eq!(write.batch, 0);
}

#[test]
fn same_cpu_crypt_serialises_the_crypt_stage() {
    let dev = RamDevice::new("ram0", 1 << 14);
    let table = format!("aes-xts-plain64 {} 0 ram0 0 1 same_cpu_crypt", zero_key(64));
    let map = Arc::new(mapping(&table, &dev));

    let mut handles = Vec::new();
    for i in 0..4u8 {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let payload = vec![i; 16 * SECTOR_SIZE];
            map.write_at(u64::from(i) * 64, &payload).unwrap();
            assert_eq!(map.read_at(u64::from(i) * 64, payload.len()).unwrap(), payload);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn keyring_sourced_key_round_trips() {
    let dev = RamDevice::new("ram0", 2048);
    let ring = Arc::new(MemoryKeyring::new());
    ring.insert(KeyKind::User, "disk0", vec![0x11u8; 32]);

    let map = Mapping::from_table(
        "aes-cbc-plain64 :32:user:disk0 0 ram0 0",
        dev.clone() as Arc<dyn BlockDevice>,
        ring,
    )
    .unwrap();

    map.write_at(0, &[1u8; SECTOR_SIZE]).unwrap();
    assert_eq!(map.read_at(0, SECTOR_SIZE).unwrap(), vec![1u8; SECTOR_SIZE]);

    // Identical to the same key supplied as hex.
    let dev2 = RamDevice::new("ram1", 2048);
    let map2 = mapping(&format!("aes-cbc-plain64 {} 0 ram1 0", "11".repeat(32)), &dev2);
    map2.write_at(0, &[1u8; SECTOR_SIZE]).unwrap();
    assert_eq!(dev.raw_read(0, SECTOR_SIZE), dev2.raw_read(0, SECTOR_SIZE));
}

#[test]
fn missing_keyring_entry_fails_construction() {
    let dev = RamDevice::new("ram0", 2048);
    let err = Mapping::from_table(
        "aes-cbc-plain64 :32:user:absent 0 ram0 0",
        dev as Arc<dyn BlockDevice>,
        keyring(),
    );
    assert!(err.is_err());
}

#[test]
fn device_error_propagates_as_ioerr() {
    let dev = RamDevice::new("ram0", 2048);
    let table = format!("aes-cbc-plain64 {} 0 ram0 0", zero_key(32));
    let map = mapping(&table, &dev);

    map.write_at(0, &[9u8; SECTOR_SIZE]).unwrap();
    dev.fail_next(1);
    assert_eq!(map.read_at(0, SECTOR_SIZE), Err(BlockStatus::IoErr));
    // Subsequent I/O is unaffected.
    assert_eq!(map.read_at(0, SECTOR_SIZE).unwrap(), vec![9u8; SECTOR_SIZE]);
}
