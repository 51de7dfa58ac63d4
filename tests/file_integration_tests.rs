//! Integration tests for the file layer.
//!
//! These run the memory-resident file against real backing files: dirty
//! region tracking and merging, flush and persistence, truncate-on-close,
//! and the diagnostic stack on I/O failure.

use std::path::Path;
use strata::file::{CoreConfig, CoreFile, CoreOpenOptions, SysFile, SysOptions};
use strata::sync::registry;

fn tracked_config(increment: u64, page_size: u64) -> CoreConfig {
    CoreConfig {
        increment,
        backing_store: true,
        write_tracking: true,
        page_size,
        ..CoreConfig::default()
    }
}

fn create_tracked(path: &Path, increment: u64, page_size: u64) -> CoreFile {
    CoreFile::open(
        Some(path),
        CoreOpenOptions {
            read_write: true,
            create: true,
            truncate: true,
            config: tracked_config(increment, page_size),
            ..CoreOpenOptions::default()
        },
    )
    .unwrap()
}

// ============================================================================
// Dirty-Region Merging
// ============================================================================

/// Three overlapping/adjacent writes at page size 4096 collapse into the
/// single region [0, 8191].
#[test]
fn test_writes_merge_to_single_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merge.dat");
    let mut file = create_tracked(&path, 8192, 4096);

    file.write(100, &[1u8; 10]).unwrap();
    file.write(5000, &[2u8; 10]).unwrap();
    file.write(4090, &[3u8; 20]).unwrap();

    assert_eq!(file.dirty_regions(), vec![(0, 8191)]);
    file.close().unwrap();
}

/// After an arbitrary write sequence the regions are sorted, disjoint, and
/// cover exactly the page-expanded union of the writes.
#[test]
fn test_region_set_matches_page_expanded_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.dat");
    let page = 256u64;
    let mut file = create_tracked(&path, 4096, page);

    // Establish the eof high first so later expansions never clamp.
    let writes: &[(u64, u64)] = &[
        (8000, 100),
        (0, 10),
        (700, 40),
        (512, 200),
        (3000, 1),
        (2990, 30),
        (100, 500),
    ];

    let mut model = vec![false; 8192];
    for &(addr, len) in writes {
        file.write(addr, &vec![0xA5u8; len as usize]).unwrap();

        // Model the same write with page-expanded endpoints.
        let lo = (addr / page) * page;
        let hi = ((addr + len - 1) / page + 1) * page - 1;
        let hi_idx = (hi as usize).min(model.len() - 1);
        for slot in &mut model[lo as usize..=hi_idx] {
            *slot = true;
        }
    }

    let regions = file.dirty_regions();
    // Sorted and pairwise disjoint.
    for pair in regions.windows(2) {
        assert!(pair[0].1 < pair[1].0);
    }
    // Union equals the model's coverage.
    let mut covered = vec![false; 8192];
    for &(start, end) in &regions {
        for slot in &mut covered[start as usize..=(end as usize).min(8191)] {
            *slot = true;
        }
    }
    assert_eq!(covered, model);
    file.close().unwrap();
}

// ============================================================================
// Flush and Persistence
// ============================================================================

/// Flush consumes the dirty regions, writes them to the backing file, and
/// clears the dirty flag.
#[test]
fn test_flush_writes_dirty_pages_to_backing_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flush.dat");
    let mut file = create_tracked(&path, 8192, 4096);

    file.write(100, b"sediment layer").unwrap();
    assert!(file.is_dirty());
    assert_eq!(file.dirty_regions(), vec![(0, 4095)]);

    file.flush().unwrap();
    assert!(!file.is_dirty());
    assert!(file.dirty_regions().is_empty());

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[100..114], b"sediment layer");
    file.close().unwrap();
}

/// Written content survives a close/reopen cycle through the backing file.
#[test]
fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persist.dat");

    let payload: Vec<u8> = (0..2048u32).map(|v| (v % 251) as u8).collect();
    {
        let mut file = create_tracked(&path, 4096, 4096);
        file.write(512, &payload).unwrap();
        assert!(file.is_dirty());
        file.flush().unwrap();
        assert!(!file.is_dirty());
        assert!(file.dirty_regions().is_empty());
        file.close().unwrap();
    }

    let file = CoreFile::open(
        Some(path.as_path()),
        CoreOpenOptions {
            read_write: true,
            create: false,
            config: tracked_config(4096, 4096),
            ..CoreOpenOptions::default()
        },
    )
    .unwrap();

    let mut read_back = vec![0u8; payload.len()];
    file.read(512, &mut read_back).unwrap();
    assert_eq!(read_back, payload);
    file.close().unwrap();
}

/// Without tracking, flush writes the whole image up to eof.
#[test]
fn test_untracked_flush_writes_whole_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whole.dat");

    let mut file = CoreFile::open(
        Some(path.as_path()),
        CoreOpenOptions {
            read_write: true,
            create: true,
            truncate: true,
            config: CoreConfig {
                increment: 1024,
                backing_store: true,
                ..CoreConfig::default()
            },
            ..CoreOpenOptions::default()
        },
    )
    .unwrap();

    file.write(10, &[0xC3u8; 100]).unwrap();
    assert!(file.dirty_regions().is_empty()); // tracking off
    file.flush().unwrap();
    file.close().unwrap();

    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), 1024);
    assert_eq!(&on_disk[10..110], &[0xC3u8; 100]);
}

// ============================================================================
// Truncate
// ============================================================================

/// Closing with a backing store trims both the image and the backing file
/// to the eoa.
#[test]
fn test_truncate_on_close_matches_eoa() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trim.dat");
    let mut file = create_tracked(&path, 8192, 4096);

    file.write(0, &[9u8; 10_000]).unwrap();
    assert_eq!(file.eof(), 16_384);
    file.flush().unwrap();

    file.set_eoa(10_000).unwrap();
    file.truncate(true).unwrap();
    assert_eq!(file.eof(), 10_000);
    file.close().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 10_000);
}

/// Truncating twice to the same eoa is the same as truncating once.
#[test]
fn test_truncate_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idem.dat");
    let mut file = create_tracked(&path, 4096, 4096);

    file.write(0, &[1u8; 100]).unwrap();
    file.set_eoa(100).unwrap();

    file.truncate(false).unwrap();
    let eof_once = file.eof();
    file.truncate(false).unwrap();
    assert_eq!(file.eof(), eof_once);
    assert_eq!(eof_once, 4096);
    file.close().unwrap();
}

// ============================================================================
// Round Trip
// ============================================================================

/// Write-then-read returns the written bytes for any prefix length, with
/// no intervening writes to the range.
#[test]
fn test_write_read_roundtrip_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round.dat");
    let mut file = create_tracked(&path, 4096, 4096);

    let payload: Vec<u8> = (0u16..512).map(|v| (v ^ (v >> 3)) as u8).collect();
    file.write(64, &payload).unwrap();

    for take in [1usize, 7, 128, 511, 512] {
        let mut buf = vec![0u8; take];
        file.read(64, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..take]);
    }
    file.close().unwrap();
}

// ============================================================================
// Locking and Diagnostics
// ============================================================================

/// Advisory locks pass through to the backing file.
#[test]
fn test_core_file_lock_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock.dat");
    let file = create_tracked(&path, 4096, 4096);

    file.lock(true).unwrap();
    file.unlock().unwrap();
    file.close().unwrap();
}

/// A failing shim write surfaces an error and leaves a diagnostic on the
/// calling thread's error stack.
#[test]
fn test_failed_write_pushes_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diag.dat");
    std::fs::write(&path, b"read-only content").unwrap();

    let options = SysOptions {
        read_write: false,
        ..SysOptions::default()
    };
    let mut file = SysFile::open(&path, &options, None).unwrap();

    registry::take_diagnostics();
    let result = file.write(0, b"not allowed", None);
    assert!(result.is_err());

    let diagnostics = registry::take_diagnostics();
    assert!(!diagnostics.is_empty());
    assert_eq!(diagnostics[0].operation, "write");
    file.close(None).unwrap();
}
