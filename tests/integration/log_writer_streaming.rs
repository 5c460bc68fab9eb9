#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arclog::log::record::{LogRecordHeader, LOG_RECORD_HDR_LEN};
use arclog::log::{
    LogRecordType, PullRequest, PullResponse, ServerState, WriterMode, WriterStatus,
};
use arclog::types::Result;
use arclog::{Collaborators, LogConfig, LogEngine, LogRecord};
use tempfile::tempdir;

const PAGE_SIZE: usize = 1024;

fn open(dir: &std::path::Path) -> Result<Arc<LogEngine>> {
    let mut config = LogConfig {
        page_size: PAGE_SIZE as u32,
        active_pages: 64,
        buffer_pages: 4,
        max_buffer_pages: 8,
        group_commit: false,
        ..LogConfig::new(dir)
    };
    config.writer.async_poll_ms = 50;
    config.writer.semi_sync_wait_ms = 50;
    config.writer.sync_wait_ms = 500;
    config.writer.max_batch_pages = 4;
    LogEngine::open(config, Collaborators::default())
}

fn request(first_page_id: i64, mode: WriterMode, compressed: bool) -> PullRequest {
    PullRequest {
        first_page_id,
        mode,
        compressed,
    }
}

fn wait_for_entry(engine: &LogEngine, id: u64) {
    for _ in 0..500 {
        if engine.writers().entry(id).is_some() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("consumer {id} never registered a pull");
}

fn wait_for_park(engine: &LogEngine, id: u64, page_id: i64) {
    for _ in 0..500 {
        let parked = engine.writers().entry(id).is_some_and(|entry| {
            entry.requested_first_page_id == page_id && entry.status == WriterStatus::Waiting
        });
        if parked {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("consumer {id} never parked on page {page_id}");
}

#[test]
fn consumer_catches_up_in_batches() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let trid = engine.begin_transaction();
    for i in 0..40u8 {
        engine.append(LogRecord::redo(trid, vec![i; 180]))?;
    }
    engine.commit(trid)?;
    let durable = engine.durable_lsa();
    assert!(durable.page_id >= 6);

    let consumer = engine.writers().register();
    let mut next_page = 0;
    let mut received = Vec::new();
    loop {
        let response = engine.pull(consumer, request(next_page, WriterMode::Async, true))?;
        let wire = PullResponse::decode(&response.encode())?;
        assert_eq!(wire, response);
        assert!(response.page_count <= 4);
        assert_eq!(response.eof_lsa, durable);
        let status = response.status;
        let pages = response.into_pages(PAGE_SIZE)?;
        for page in &pages {
            assert_eq!(page.page_id(), next_page);
            assert!(page.checksum_ok());
            next_page += 1;
        }
        received.extend(pages);
        match status {
            WriterStatus::Delayed => continue,
            WriterStatus::Done => break,
            other => panic!("unexpected status {other:?}"),
        }
    }
    if durable.offset == 0 {
        assert_eq!(next_page, durable.page_id);
    } else {
        assert_eq!(next_page, durable.page_id + 1);
        let tail = received.last().expect("tail page");
        let offset = durable.offset as usize;
        let sentinel =
            LogRecordHeader::decode(&tail.body()[offset..offset + LOG_RECORD_HDR_LEN])?;
        assert_eq!(sentinel.rectype, LogRecordType::EndOfLog);
        assert!(tail.body()[offset + LOG_RECORD_HDR_LEN..].iter().all(|&b| b == 0));
    }
    assert!(engine.stats().writer_pages_sent >= received.len() as u64);
    Ok(())
}

#[test]
fn async_pull_past_the_end_is_delayed() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.commit(engine.begin_transaction())?;
    let consumer = engine.writers().register();
    let response = engine.pull(consumer, request(5, WriterMode::Async, false))?;
    assert_eq!(response.status, WriterStatus::Delayed);
    assert_eq!(response.page_count, 0);
    assert_eq!(response.eof_lsa, engine.durable_lsa());
    Ok(())
}

#[test]
fn sync_consumer_wakes_when_pages_become_durable() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.commit(engine.begin_transaction())?;
    let wanted = engine.durable_lsa().page_id + 1;

    let consumer = engine.writers().register();
    let puller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.pull(consumer, request(wanted, WriterMode::Sync, false)))
    };
    wait_for_entry(&engine, consumer);

    let trid = engine.begin_transaction();
    for _ in 0..8 {
        engine.append(LogRecord::redo(trid, vec![0xC3; 200]))?;
    }
    engine.commit(trid)?;

    let response = puller.join().expect("puller panicked")?;
    assert!(response.page_count >= 1);
    assert_eq!(response.first_page_id, wanted);
    assert_eq!(response.server_state, ServerState::Active);
    Ok(())
}

#[test]
fn interrupt_and_shutdown_fail_waiting_consumers() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;

    let interrupted = engine.writers().register();
    let puller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.pull(interrupted, request(100, WriterMode::Sync, false)))
    };
    wait_for_entry(&engine, interrupted);
    assert!(engine.writers().interrupt(interrupted));
    let response = puller.join().expect("puller panicked")?;
    assert_eq!(response.status, WriterStatus::Error);
    assert!(engine.writers().entry(interrupted).is_none());

    let waiting = engine.writers().register();
    let puller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.pull(waiting, request(100, WriterMode::SemiSync, false)))
    };
    wait_for_entry(&engine, waiting);
    engine.shutdown()?;
    let response = puller.join().expect("puller panicked")?;
    assert_eq!(response.status, WriterStatus::Error);
    assert_eq!(response.server_state, ServerState::ShuttingDown);
    Ok(())
}

#[test]
fn negative_first_page_is_a_protocol_error() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let consumer = engine.writers().register();
    let response = engine.pull(consumer, request(-1, WriterMode::Async, false))?;
    assert_eq!(response.status, WriterStatus::Error);
    assert_eq!(engine.writers().min_needed_page(), None);
    Ok(())
}

#[test]
fn caught_up_sync_consumer_does_not_stall_commits() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.commit(engine.begin_transaction())?;

    let parked = engine.writers().register();
    let first = engine.pull(parked, request(0, WriterMode::Sync, false))?;
    assert_eq!(first.status, WriterStatus::Done);
    let tail = first.eof_lsa;
    let puller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.pull(parked, request(tail.page_id + 1, WriterMode::Sync, false)))
    };
    wait_for_park(&engine, parked, tail.page_id + 1);

    let started = Instant::now();
    for _ in 0..3 {
        let trid = engine.begin_transaction();
        engine.append(LogRecord::redo(trid, vec![0x42; 24]))?;
        engine.commit(trid)?;
    }
    assert!(
        started.elapsed() < Duration::from_millis(450),
        "commits waited {:?} on a consumer they cannot serve",
        started.elapsed()
    );
    assert!(engine.writers().interrupt(parked));
    let response = puller.join().expect("puller panicked")?;
    assert_eq!(response.status, WriterStatus::Error);

    let follower = engine.writers().register();
    let caught_up = engine.pull(follower, request(0, WriterMode::Async, false))?;
    assert_eq!(caught_up.status, WriterStatus::Done);
    let tail = caught_up.eof_lsa;
    let puller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.pull(follower, request(tail.page_id, WriterMode::Sync, false)))
    };
    wait_for_park(&engine, follower, tail.page_id);
    let trid = engine.begin_transaction();
    engine.append(LogRecord::redo(trid, vec![0x43; 24]))?;
    engine.commit(trid)?;

    let response = puller.join().expect("puller panicked")?;
    assert_eq!(response.status, WriterStatus::Done);
    assert_eq!(response.first_page_id, tail.page_id);
    assert!(response.page_count >= 1);
    assert!(response.eof_lsa > tail);
    Ok(())
}
