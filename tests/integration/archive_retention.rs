#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use arclog::log::{PullRequest, WriterMode, WriterStatus};
use arclog::types::{ArchiveNumber, Result};
use arclog::{Collaborators, LogConfig, LogEngine, LogError, LogRecord, Lsa};
use tempfile::tempdir;

const RECORDS: usize = 160;

fn config(dir: &Path, max_archives: usize) -> LogConfig {
    let mut config = LogConfig {
        prefix: "orders".to_string(),
        page_size: 1024,
        active_pages: 8,
        buffer_pages: 4,
        max_buffer_pages: 8,
        group_commit: false,
        max_archives,
        ..LogConfig::new(dir)
    };
    config.writer.async_poll_ms = 50;
    config
}

fn fill(engine: &LogEngine, records: usize) -> Result<()> {
    let trid = engine.begin_transaction();
    for i in 0..records {
        engine.append(LogRecord::redo(trid, vec![(i % 256) as u8; 200]))?;
    }
    engine.commit(trid)?;
    Ok(())
}

#[test]
fn wrapping_the_ring_creates_archives_readable_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let entries = {
        let engine = LogEngine::open(config(dir.path(), 0), Collaborators::default())?;
        fill(&engine, RECORDS)?;
        let entries = engine.archives()?;
        assert!(entries.len() >= 2, "expected several archives, got {entries:?}");
        for pair in entries.windows(2) {
            assert_eq!(pair[0].last_page_id + 1, pair[1].first_page_id);
        }
        for entry in &entries {
            assert!(dir.path().join(&entry.file).exists());
            assert_eq!(
                engine.get_archive_number_for(entry.first_page_id)?,
                ArchiveNumber(entry.number)
            );
        }
        engine.shutdown()?;
        entries
    };

    let info = fs::read_to_string(dir.path().join("orders_lginf"))?;
    assert_eq!(info.lines().filter(|l| l.contains(" ARCHIVE ")).count(), entries.len());

    let engine = LogEngine::open(config(dir.path(), 0), Collaborators::default())?;
    for entry in &entries {
        assert_eq!(
            engine.get_archive_number_for(entry.last_page_id)?,
            ArchiveNumber(entry.number)
        );
    }
    let beyond = engine.header().next_archive_page_id;
    assert!(matches!(
        engine.get_archive_number_for(beyond),
        Err(LogError::NotFound)
    ));

    let scanned = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(scanned.len(), RECORDS + 1);
    assert_eq!(scanned[0].data, vec![0u8; 200]);
    Ok(())
}

#[test]
fn live_consumer_defers_archive_removal() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(config(dir.path(), 1), Collaborators::default())?;
    fill(&engine, 4)?;

    let consumer = engine.writers().register();
    let response = engine.pull(
        consumer,
        PullRequest {
            first_page_id: 0,
            mode: WriterMode::Async,
            compressed: false,
        },
    )?;
    assert_eq!(response.status, WriterStatus::Done);

    fill(&engine, RECORDS)?;
    engine.checkpoint()?;
    let kept = engine.archives()?;
    assert!(kept.len() > 1, "consumer at page 0 must pin every archive");
    assert!(engine.stats().archive_removals_deferred > 0);
    assert!(engine.purge_archives()?.is_empty());

    engine.writers().disconnect(consumer);
    let removed = engine.purge_archives()?;
    assert_eq!(removed.len(), kept.len() - 1);
    assert_eq!(engine.archives()?.len(), 1);
    assert!(!dir.path().join(&kept[0].file).exists());
    assert!(matches!(
        engine.get_archive_number_for(0),
        Err(LogError::ArchiveUnavailable(ArchiveNumber(0)))
    ));

    let info = fs::read_to_string(dir.path().join("orders_lginf"))?;
    assert_eq!(info.lines().filter(|l| l.contains(" REMOVE ")).count(), removed.len());
    Ok(())
}

#[test]
fn archive_now_rolls_completed_pages() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(
        LogConfig {
            active_pages: 64,
            ..config(dir.path(), 0)
        },
        Collaborators::default(),
    )?;
    assert!(engine.archive_now()?.is_none());
    fill(&engine, 20)?;
    let entry = engine.archive_now()?.expect("completed pages to archive");
    assert_eq!(entry.first_page_id, 0);
    assert_eq!(entry.last_page_id, engine.next_lsa().page_id - 1);
    assert_eq!(engine.header().next_archive_page_id, entry.last_page_id + 1);
    assert!(engine.archive_now()?.is_none());
    let page = engine.reader().read_page(0)?;
    assert!(page.checksum_ok());
    Ok(())
}

#[test]
fn background_archiving_keeps_a_trailing_volume() -> Result<()> {
    let dir = tempdir()?;
    let trailing = dir.path().join("orders_lgar_t");
    let background = |dir: &Path| LogConfig {
        background_archiving: true,
        archive_io_pages: 2,
        ..config(dir, 0)
    };
    let entries = {
        let engine = LogEngine::open(background(dir.path()), Collaborators::default())?;
        assert!(trailing.exists());
        fill(&engine, RECORDS)?;
        let entries = engine.archives()?;
        assert!(entries.len() >= 2, "expected several archives, got {entries:?}");
        for entry in &entries {
            assert!(dir.path().join(&entry.file).exists());
        }
        assert!(trailing.exists());
        engine.shutdown()?;
        entries
    };

    let engine = LogEngine::open(background(dir.path()), Collaborators::default())?;
    assert!(trailing.exists());
    for entry in &entries {
        assert_eq!(
            engine.get_archive_number_for(entry.first_page_id)?,
            ArchiveNumber(entry.number)
        );
    }
    let scanned = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(scanned.len(), RECORDS + 1);
    assert_eq!(scanned[RECORDS - 1].data, vec![((RECORDS - 1) % 256) as u8; 200]);
    Ok(())
}
