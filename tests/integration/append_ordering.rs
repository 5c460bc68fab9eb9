#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use arclog::log::{LogRecordType, ScannedRecord};
use arclog::types::Result;
use arclog::{Collaborators, LogConfig, LogEngine, LogError, LogRecord, Lsa, NULL_LSA};
use tempfile::tempdir;

const PRODUCERS: usize = 8;
const RECORDS_PER_PRODUCER: usize = 125;

fn config(dir: &std::path::Path) -> LogConfig {
    LogConfig {
        page_size: 4096,
        active_pages: 512,
        buffer_pages: 8,
        max_buffer_pages: 32,
        prior_drain_bytes: 8 * 1024,
        ..LogConfig::new(dir)
    }
}

fn payload(producer: usize, seq: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(16 + seq % 300);
    data.extend_from_slice(&(producer as u64).to_be_bytes());
    data.extend_from_slice(&(seq as u64).to_be_bytes());
    data.resize(16 + seq % 300, producer as u8);
    data
}

fn scan_all(engine: &LogEngine) -> Result<Vec<ScannedRecord>> {
    engine
        .reader()
        .scan(Lsa::new(0, 0))?
        .collect::<Result<Vec<_>>>()
}

#[test]
fn concurrent_producers_land_in_lsa_order() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(config(dir.path()), Collaborators::default())?;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || -> Result<Vec<Lsa>> {
                let trid = engine.begin_transaction();
                let mut lsas = Vec::with_capacity(RECORDS_PER_PRODUCER + 1);
                for seq in 0..RECORDS_PER_PRODUCER {
                    lsas.push(engine.append(LogRecord::undo_redo(trid, payload(producer, seq)))?);
                }
                lsas.push(engine.commit(trid)?);
                Ok(lsas)
            })
        })
        .collect();
    let mut reserved = Vec::new();
    for handle in handles {
        let lsas = handle.join().expect("producer panicked")?;
        assert!(lsas.windows(2).all(|w| w[0] < w[1]));
        reserved.extend(lsas);
    }
    engine.flush()?;

    let records = scan_all(&engine)?;
    assert_eq!(records.len(), PRODUCERS * (RECORDS_PER_PRODUCER + 1));

    reserved.sort();
    let scanned: Vec<Lsa> = records.iter().map(|r| r.lsa).collect();
    assert_eq!(scanned, reserved, "physical order must equal reservation order");

    let mut prev = NULL_LSA;
    let mut tails: HashMap<i32, Lsa> = HashMap::new();
    let mut next_seq: HashMap<u64, u64> = HashMap::new();
    for record in &records {
        assert_eq!(record.header.back_lsa, prev);
        prev = record.lsa;

        let expected_tail = tails.get(&record.header.trid).copied().unwrap_or(NULL_LSA);
        assert_eq!(record.header.prev_tran_lsa, expected_tail);
        tails.insert(record.header.trid, record.lsa);

        if record.header.rectype == LogRecordType::UndoRedoData {
            let producer = u64::from_be_bytes(record.data[0..8].try_into().unwrap());
            let seq = u64::from_be_bytes(record.data[8..16].try_into().unwrap());
            let expected = next_seq.entry(producer).or_insert(0);
            assert_eq!(seq, *expected, "producer {producer} records out of order");
            *expected += 1;
            assert_eq!(record.data, payload(producer as usize, seq as usize));
        }
    }
    assert!(next_seq.values().all(|&n| n == RECORDS_PER_PRODUCER as u64));
    engine.shutdown()?;
    Ok(())
}

#[test]
fn records_span_pages_and_oversized_records_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = LogEngine::open(
        LogConfig {
            page_size: 1024,
            active_pages: 8,
            buffer_pages: 4,
            max_buffer_pages: 8,
            group_commit: false,
            ..LogConfig::new(dir.path())
        },
        Collaborators::default(),
    )?;
    let trid = engine.begin_transaction();
    let big: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let lsa = engine.append(LogRecord::redo(trid, big.clone()))?;
    let after = engine.append(LogRecord::redo(trid, b"tail".to_vec()))?;
    assert!(after.page_id >= lsa.page_id + 2);
    engine.commit(trid)?;

    let records = scan_all(&engine)?;
    assert_eq!(records[0].lsa, lsa);
    assert_eq!(records[0].data, big);
    assert_eq!(records[1].lsa, after);
    assert!(engine.reader().read_page(lsa.page_id + 1)?.is_continuation());

    let err = engine
        .append(LogRecord::redo(trid, vec![0u8; 1024 * 8]))
        .unwrap_err();
    assert!(matches!(err, LogError::InvalidOwned(_)));
    let err = engine
        .append(LogRecord::new(trid, LogRecordType::EndOfLog, Vec::new()))
        .unwrap_err();
    assert!(matches!(err, LogError::Invalid(_)));
    Ok(())
}
