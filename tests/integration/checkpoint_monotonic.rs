#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use arclog::log::checkpoint::decode_checkpoint_payload;
use arclog::log::{
    FatalSink, LogRecordType, PageCache, TransactionSnapshot, TransactionState, TransactionTable,
};
use arclog::types::Result;
use arclog::{Collaborators, LogConfig, LogEngine, LogError, LogRecord, Lsa, NULL_LSA};
use parking_lot::Mutex;
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> LogConfig {
    LogConfig {
        page_size: 1024,
        active_pages: 128,
        buffer_pages: 4,
        max_buffer_pages: 8,
        group_commit: false,
        ..LogConfig::new(dir)
    }
}

/// Pretends the oldest dirty data page was last changed at `oldest`.
struct LaggingCache {
    oldest: Lsa,
    delay: Duration,
}

impl PageCache for LaggingCache {
    fn flush_dirty_data_pages_up_to(&self, _lsa: Lsa) -> Result<Lsa> {
        thread::sleep(self.delay);
        Ok(self.oldest)
    }
}

struct FailingCache;

impl PageCache for FailingCache {
    fn flush_dirty_data_pages_up_to(&self, _lsa: Lsa) -> Result<Lsa> {
        Err(LogError::Io(std::io::Error::other("data volume offline")))
    }
}

struct OneActive;

impl TransactionTable for OneActive {
    fn active_transaction_snapshot(&self) -> Vec<TransactionSnapshot> {
        vec![TransactionSnapshot {
            trid: 42,
            state: TransactionState::Active,
            begin_lsa: Lsa::new(0, 0),
            last_lsa: Lsa::new(0, 64),
            undo_next_lsa: Lsa::new(0, 64),
        }]
    }
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(&'static str, String)>>,
}

impl FatalSink for RecordingSink {
    fn report_fatal(&self, component: &'static str, _lsa: Lsa, reason: &str) {
        self.reports.lock().push((component, reason.to_string()));
    }
}

#[test]
fn checkpoints_advance_and_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let engine = LogEngine::open(config(dir.path()), Collaborators::default())?;
        let mut previous = NULL_LSA;
        for round in 0..3u8 {
            let trid = engine.begin_transaction();
            engine.append(LogRecord::undo_redo(trid, vec![round; 300]))?;
            engine.commit(trid)?;
            let outcome = engine.checkpoint()?;
            assert!(outcome.checkpoint_lsa > previous);
            assert!(outcome.redo_lsa <= outcome.checkpoint_lsa);
            assert_eq!(engine.header().checkpoint_lsa, outcome.checkpoint_lsa);
            previous = outcome.checkpoint_lsa;
        }
        engine.shutdown()?;
        previous
    };

    let engine = LogEngine::open(config(dir.path()), Collaborators::default())?;
    assert_eq!(engine.header().checkpoint_lsa, last);
    let records = engine
        .reader()
        .scan(last)?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(records[0].header.rectype, LogRecordType::StartCheckpoint);
    assert_eq!(records[0].header.trid, 0);
    assert_eq!(records[0].header.prev_tran_lsa, NULL_LSA);
    let end = &records[1];
    assert_eq!(end.header.rectype, LogRecordType::EndCheckpoint);
    let (redo, txns) = decode_checkpoint_payload(&end.data)?;
    assert_eq!(redo, last);
    assert!(txns.is_empty());
    Ok(())
}

#[test]
fn redo_point_comes_from_the_page_cache() -> Result<()> {
    let dir = tempdir()?;
    let oldest = Lsa::new(0, 64);
    let engine = LogEngine::open(
        config(dir.path()),
        Collaborators {
            page_cache: Arc::new(LaggingCache {
                oldest,
                delay: Duration::ZERO,
            }),
            transactions: Arc::new(OneActive),
            ..Collaborators::default()
        },
    )?;
    let trid = engine.begin_transaction();
    for _ in 0..6 {
        engine.append(LogRecord::redo(trid, vec![1; 200]))?;
    }
    let outcome = engine.checkpoint()?;
    assert_eq!(outcome.redo_lsa, oldest);
    assert_eq!(outcome.active_transactions, 1);
    assert!(outcome.checkpoint_lsa > oldest);
    assert_eq!(engine.header().redo_lsa, oldest);
    Ok(())
}

#[test]
fn concurrent_requests_share_one_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(
        config(dir.path()),
        Collaborators {
            page_cache: Arc::new(LaggingCache {
                oldest: NULL_LSA,
                delay: Duration::from_millis(300),
            }),
            ..Collaborators::default()
        },
    )?;
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if i > 0 {
                    thread::sleep(Duration::from_millis(50));
                }
                engine.checkpoint()
            })
        })
        .collect();
    let outcomes = handles
        .into_iter()
        .map(|h| h.join().expect("checkpoint thread panicked"))
        .collect::<Result<Vec<_>>>()?;
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(engine.stats().checkpoints, 1);
    Ok(())
}

#[test]
fn page_count_triggers_background_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(
        LogConfig {
            checkpoint_interval_pages: 3,
            ..config(dir.path())
        },
        Collaborators::default(),
    )?;
    let trid = engine.begin_transaction();
    for _ in 0..20 {
        engine.append(LogRecord::redo(trid, vec![9; 400]))?;
    }
    engine.commit(trid)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.stats().checkpoints == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(engine.stats().checkpoints > 0);
    assert!(!engine.header().checkpoint_lsa.is_null());
    Ok(())
}

#[test]
fn page_cache_failure_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    let sink = Arc::new(RecordingSink::default());
    let engine = LogEngine::open(
        config(dir.path()),
        Collaborators {
            page_cache: Arc::new(FailingCache),
            fatal_sink: Arc::clone(&sink) as Arc<dyn FatalSink>,
            ..Collaborators::default()
        },
    )?;
    let err = engine.checkpoint().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(sink.reports.lock().len(), 1);
    assert_eq!(sink.reports.lock()[0].0, "checkpoint");
    assert!(matches!(
        engine.append(LogRecord::redo(1, vec![0; 8])),
        Err(LogError::Fatal { .. })
    ));
    Ok(())
}
