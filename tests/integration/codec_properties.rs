#![allow(missing_docs)]

use arclog::log::page::LogPage;
use arclog::log::record::{RecordLayout, LOG_RECORD_ALIGN, LOG_RECORD_HDR_LEN};
use arclog::log::{Payload, PullResponse, ServerState, WriterStatus};
use arclog::types::PhysicalSlot;
use arclog::{LogError, Lsa};
use proptest::prelude::*;

const PAGE_SIZES: [usize; 3] = [512, 1024, 4096];

fn layout_and_start() -> impl Strategy<Value = (RecordLayout, Lsa)> {
    prop::sample::select(PAGE_SIZES.to_vec()).prop_flat_map(|page_size| {
        let layout = RecordLayout::new(page_size).expect("layout");
        let slots = (layout.body_len() - LOG_RECORD_HDR_LEN) / LOG_RECORD_ALIGN;
        (0i64..1_000, 0..=slots).prop_map(move |(page, slot)| {
            (layout, Lsa::new(page, (slot * LOG_RECORD_ALIGN) as i32))
        })
    })
}

proptest! {
    #[test]
    fn next_record_is_aligned_and_fits_a_header(
        (layout, start) in layout_and_start(),
        data_len in 0usize..20_000,
    ) {
        let total = LOG_RECORD_HDR_LEN + data_len;
        let next = layout.next_record(start, total);
        prop_assert!(next > start);
        prop_assert_eq!(next.offset as usize % LOG_RECORD_ALIGN, 0);
        prop_assert!(next.offset as usize + LOG_RECORD_HDR_LEN <= layout.body_len());

        let spanned = layout.pages_spanned(start, total);
        prop_assert!(next.page_id >= start.page_id + spanned - 1);
        prop_assert!(next.page_id <= start.page_id + spanned);
    }

    #[test]
    fn any_flipped_byte_breaks_the_page_checksum(
        page_id in 0i64..1_000_000,
        fill in any::<u8>(),
        index in 0usize..1024,
        flip in 1u8..=255,
    ) {
        let mut page = LogPage::new(page_id, 1024);
        page.body_mut().fill(fill);
        page.seal();
        prop_assert!(page.verify(page_id).is_ok());

        let mut bytes = page.as_bytes().to_vec();
        bytes[index] ^= flip;
        let damaged = LogPage::from_bytes(bytes.into_boxed_slice()).expect("page bytes");
        prop_assert!(damaged.verify(page_id).is_err());
    }

    #[test]
    fn logical_pages_wrap_onto_the_ring(
        page_id in 0i64..10_000_000,
        capacity in 1u64..5_000,
    ) {
        let slot = PhysicalSlot::from_logical(page_id, capacity).expect("slot");
        let same = PhysicalSlot::from_logical(page_id + capacity as i64, capacity).expect("slot");
        prop_assert_eq!(slot, same);
        prop_assert!(slot.volume_page() >= 1);
        prop_assert!(slot.volume_page() <= capacity);
    }

    #[test]
    fn compressed_batches_restore_every_byte(
        seed in any::<u8>(),
        pages in 1usize..6,
        noisy in any::<bool>(),
    ) {
        let raw: Vec<u8> = (0..pages * 512)
            .map(|i| if noisy { (i as u8).wrapping_mul(31).wrapping_add(seed) } else { seed })
            .collect();
        let payload = Payload::compress(raw.clone()).expect("compress");
        if !noisy {
            prop_assert!(payload.is_compressed());
        }
        prop_assert!(payload.wire_len() <= raw.len());

        let response = PullResponse {
            status: WriterStatus::Delayed,
            batch_size: 8,
            first_page_id: 3,
            page_count: pages as i32,
            server_state: ServerState::Active,
            eof_lsa: Lsa::new(9, 0),
            payload,
        };
        let decoded = PullResponse::decode(&response.encode()).expect("decode");
        prop_assert_eq!(decoded.payload.into_raw().expect("raw"), raw);
    }
}

#[test]
fn negative_pages_have_no_slot() {
    assert!(matches!(
        PhysicalSlot::from_logical(-3, 16),
        Err(LogError::InvalidOwned(_) | LogError::Invalid(_))
    ));
}
