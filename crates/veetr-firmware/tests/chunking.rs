use proptest::prelude::*;
use veetr_core::{Command, wire};
use veetr_firmware::{Stage, TransferJob};

proptest! {
    #[test]
    fn test_chunks_cover_image_exactly(total in 1usize..20_000, chunk_size in 1usize..512) {
        let job = TransferJob::new(total, chunk_size).unwrap();
        prop_assert_eq!(job.chunk_count() as usize, total.div_ceil(chunk_size));

        let mut next = 0;
        for index in 0..job.chunk_count() {
            let range = job.chunk_range(index).unwrap();
            prop_assert_eq!(range.start, next);
            prop_assert!(!range.is_empty());
            prop_assert!(range.len() <= chunk_size);
            next = range.end;
        }
        prop_assert_eq!(next, total);
        prop_assert!(job.chunk_range(job.chunk_count()).is_none());
    }

    #[test]
    fn test_chunk_reassembles(data in proptest::collection::vec(any::<u8>(), 1..2_000)) {
        let job = TransferJob::new(data.len(), wire::DEFAULT_CHUNK_SIZE).unwrap();
        let mut rebuilt = Vec::with_capacity(data.len());
        for index in 0..job.chunk_count() {
            let range = job.chunk_range(index).unwrap();
            let command = Command::chunk(index, &data[range]);
            let payload = wire::encode(&command, wire::MAX_ENVELOPE_BYTES).unwrap();
            prop_assert!(payload.len() <= wire::MAX_ENVELOPE_BYTES);
            rebuilt.extend(command.decode_chunk().unwrap());
        }
        prop_assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_percent_never_passes_ceiling(total in 1usize..5_000, acked in 0u32..30) {
        let mut job = TransferJob::new(total, 200).unwrap();
        job.advance(Stage::Transferring);
        for index in 0..acked.min(job.chunk_count()) {
            prop_assert!(job.record_ack(index));
        }
        prop_assert!(job.transfer_percent(90) <= 90);
    }
}
