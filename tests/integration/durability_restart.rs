#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::thread;

use arclog::log::LogRecordType;
use arclog::types::Result;
use arclog::{Collaborators, LogConfig, LogEngine, LogRecord, Lsa};
use tempfile::tempdir;

fn config(dir: &Path, group_commit: bool) -> LogConfig {
    LogConfig {
        page_size: 1024,
        active_pages: 64,
        buffer_pages: 4,
        max_buffer_pages: 16,
        group_commit,
        ..LogConfig::new(dir)
    }
}

fn record_types(engine: &LogEngine) -> Result<Vec<(Lsa, LogRecordType)>> {
    engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .map(|r| r.map(|r| (r.lsa, r.header.rectype)))
        .collect()
}

#[test]
fn committed_records_survive_a_crash() -> Result<()> {
    let dir = tempdir()?;
    let committed = {
        let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
        let trid = engine.begin_transaction();
        for i in 0..10u8 {
            engine.append(LogRecord::undo_redo(trid, vec![i; 64]))?;
        }
        let commit = engine.commit(trid)?;
        assert!(engine.durable_lsa() > commit);

        let loser = engine.begin_transaction();
        engine.append(LogRecord::undo_redo(loser, b"lost".to_vec()))?;
        let committed = record_types(&engine)?;
        // Dropping without shutdown would flush; leak the engine to model a crash.
        std::mem::forget(engine);
        committed
    };

    let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
    let recovered = record_types(&engine)?;
    assert_eq!(recovered.len(), 11);
    assert_eq!(&recovered[..], &committed[..11]);
    assert_eq!(recovered[10].1, LogRecordType::Commit);
    assert!(engine.next_lsa() > recovered[10].0);
    assert!(engine.header().next_trid >= 2);
    Ok(())
}

#[test]
fn group_commit_makes_concurrent_commits_durable() -> Result<()> {
    let dir = tempdir()?;
    let mut commits = Vec::new();
    {
        let engine = LogEngine::open(config(dir.path(), true), Collaborators::default())?;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || -> Result<Vec<Lsa>> {
                    let mut lsas = Vec::new();
                    for _ in 0..20 {
                        let trid = engine.begin_transaction();
                        engine.append(LogRecord::redo(trid, vec![0x5A; 40]))?;
                        let commit = engine.commit(trid)?;
                        assert!(engine.durable_lsa() > commit);
                        lsas.push(commit);
                    }
                    Ok(lsas)
                })
            })
            .collect();
        for handle in handles {
            commits.extend(handle.join().expect("committer panicked")?);
        }
        let stats = engine.stats();
        assert!(stats.fsyncs > 0);
        engine.shutdown()?;
    }

    let engine = LogEngine::open(config(dir.path(), true), Collaborators::default())?;
    let recovered = record_types(&engine)?;
    for commit in commits {
        assert!(recovered.contains(&(commit, LogRecordType::Commit)));
    }
    engine.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_flushes_pending_records() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
        let trid = engine.begin_transaction();
        let mut last = Lsa::new(0, 0);
        for i in 0..30u8 {
            last = engine.append(LogRecord::redo(trid, vec![i; 90]))?;
        }
        engine.shutdown()?;
        engine.shutdown()?;
        last
    };
    let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
    let recovered = record_types(&engine)?;
    assert_eq!(recovered.len(), 30);
    assert_eq!(recovered[29].0, last);
    assert!(engine.durable_lsa() > last);
    Ok(())
}

#[test]
fn back_chain_holds_when_the_log_ends_on_a_page_boundary() -> Result<()> {
    let dir = tempdir()?;
    let first = {
        let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
        let trid = engine.begin_transaction();
        let first = engine.append(LogRecord::redo(trid, vec![0x11; 900]))?;
        assert_eq!(first, Lsa::new(0, 0));
        assert_eq!(engine.flush()?, Lsa::new(1, 0));
        std::mem::forget(engine);
        first
    };

    let engine = LogEngine::open(config(dir.path(), false), Collaborators::default())?;
    assert_eq!(engine.next_lsa(), Lsa::new(1, 0));
    let trid = engine.begin_transaction();
    let second = engine.append(LogRecord::redo(trid, vec![0x22; 40]))?;
    engine.flush()?;

    let records = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].lsa, second);
    assert_eq!(records[1].header.back_lsa, first);
    Ok(())
}
