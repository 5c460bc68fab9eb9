#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use arclog::types::Result;
use arclog::{Collaborators, LogConfig, LogEngine, LogRecord, Lsa};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn tight_config(dir: &std::path::Path) -> LogConfig {
    LogConfig {
        page_size: 1024,
        active_pages: 256,
        buffer_pages: 3,
        max_buffer_pages: 3,
        group_commit: false,
        ..LogConfig::new(dir)
    }
}

#[test]
fn tiny_pool_recycles_pages_without_losing_records() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(tight_config(dir.path()), Collaborators::default())?;
    let trid = engine.begin_transaction();
    let mut expected = Vec::new();
    for i in 0..200u32 {
        let data: Vec<u8> = i.to_be_bytes().iter().copied().cycle().take(150 + (i as usize % 700)).collect();
        let lsa = engine.append(LogRecord::redo(trid, data.clone()))?;
        expected.push((lsa, data));
    }
    engine.commit(trid)?;

    let stats = engine.stats();
    assert!(stats.pages_written > 3);
    assert!(stats.evictions > 0, "a three-page pool must evict");
    assert_eq!(stats.pool_growths, 0);

    let scanned: Vec<_> = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(scanned.len(), expected.len() + 1);
    for (record, (lsa, data)) in scanned.iter().zip(&expected) {
        assert_eq!(record.lsa, *lsa);
        assert_eq!(&record.data, data);
    }
    engine.shutdown()?;
    Ok(())
}

#[test]
fn concurrent_appends_under_pressure_stay_readable() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(
        LogConfig {
            buffer_pages: 3,
            max_buffer_pages: 6,
            buffer_growth_percent: 50,
            ..tight_config(dir.path())
        },
        Collaborators::default(),
    )?;
    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || -> Result<()> {
                let trid = engine.begin_transaction();
                for _ in 0..50 {
                    engine.append(LogRecord::undo_redo(trid, vec![t; 600]))?;
                }
                engine.commit(trid)?;
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer panicked")?;
    }
    let count = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .filter(|r| r.as_ref().map_or(true, |r| r.data.len() == 600))
        .collect::<Result<Vec<_>>>()?
        .len();
    assert_eq!(count, 200);
    assert!(engine.stats().pages_written > 0);
    Ok(())
}

#[test]
fn spanning_records_survive_eviction_and_restart() -> Result<()> {
    let dir = tempdir()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut expected = Vec::new();
    {
        let engine = LogEngine::open(tight_config(dir.path()), Collaborators::default())?;
        let trid = engine.begin_transaction();
        for _ in 0..40 {
            let mut data = vec![0u8; rng.gen_range(300..=800)];
            rng.fill_bytes(&mut data);
            let lsa = engine.append(LogRecord::redo(trid, data.clone()))?;
            expected.push((lsa, data));
        }
        engine.commit(trid)?;
        assert!(engine.stats().evictions > 0);

        let scanned = engine
            .reader()
            .scan(Lsa::new(0, 0))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(scanned.len(), expected.len() + 1);
        for (record, (lsa, data)) in scanned.iter().zip(&expected) {
            assert_eq!(record.lsa, *lsa);
            assert_eq!(&record.data, data);
        }
        engine.shutdown()?;
    }

    let engine = LogEngine::open(tight_config(dir.path()), Collaborators::default())?;
    let scanned = engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(scanned.len(), expected.len() + 1);
    for (record, (lsa, data)) in scanned.iter().zip(&expected) {
        assert_eq!(record.lsa, *lsa);
        assert_eq!(&record.data, data);
    }
    Ok(())
}
