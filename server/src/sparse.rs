//! Sparse intra-file index builder.
//!
//! Samples `⌊1/rate⌋` offsets across a single archive file so consumers can
//! seek close to a target timestamp without decoding the whole stream. The
//! recorded offset is the byte just past the end of the sampled record, i.e.
//! the start of the next record.

use std::io::Read;

use crate::error::ArchiveError;
use crate::mrt::RecordReader;
use crate::types::EntryOffset;

/// Sample rate used when the requested rate falls outside `(0, 1]`.
pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;

/// Decodes a raw record into the value stored alongside its offset.
pub type Translate = dyn Fn(&[u8]) -> Result<i64, ArchiveError> + Sync;

/// Walk the record stream and fill an offset table of exactly `⌊1/rate⌋`
/// slots. Slot `k` receives the first record whose cumulative end position
/// reaches the `k+1`-th rate fraction of `size`. Records the decoder rejects
/// do not advance the slot cursor; slots with no decodable record in their
/// region stay `None`.
pub fn build_offsets<R: Read>(
    records: &mut RecordReader<R>,
    size: u64,
    rate: f64,
    translate: &Translate,
) -> Vec<Option<EntryOffset>> {
    let rate = if rate > 0.0 && rate <= 1.0 { rate } else { DEFAULT_SAMPLE_RATE };
    let slots = (1.0 / rate).floor() as usize;
    let mut out = vec![None; slots];

    let mut pos: u64 = 0;
    let mut k = 0usize;
    loop {
        let raw = match records.next_record() {
            Ok(Some(raw)) => raw,
            // Clean EOF or a framing error both end sampling; unfilled slots
            // stay empty and signal that no record was sampled there.
            Ok(None) | Err(_) => break,
        };
        pos += raw.len() as u64;

        if k < slots && pos as f64 >= (k as f64 + 1.0) * rate * size as f64 {
            if let Ok(value) = translate(raw) {
                out[k] = Some(EntryOffset { value, offset: pos });
                k += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrt::CommonHeader;
    use crate::testutil::padded_record;

    fn stream(lens: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, &len) in lens.iter().enumerate() {
            out.extend_from_slice(&padded_record(1000 + i as u32, len));
        }
        out
    }

    fn by_timestamp(raw: &[u8]) -> Result<i64, ArchiveError> {
        CommonHeader::parse(raw).map(|h| i64::from(h.timestamp))
    }

    #[test]
    fn quarter_rate_samples_four_offsets() {
        // Ten 100-byte records, 1000 bytes total, rate 0.25
        let data = stream(&[100; 10]);
        let mut rdr = RecordReader::new(data.as_slice());
        let idx = build_offsets(&mut rdr, 1000, 0.25, &by_timestamp);

        assert_eq!(idx.len(), 4);
        let offsets: Vec<u64> = idx.iter().map(|s| s.unwrap().offset).collect();
        assert_eq!(offsets, vec![300, 500, 800, 1000]);
        // Values are the sampled records' timestamps
        let values: Vec<i64> = idx.iter().map(|s| s.unwrap().value).collect();
        assert_eq!(values, vec![1002, 1004, 1007, 1009]);
    }

    #[test]
    fn slot_count_is_floor_of_inverse_rate() {
        let data = stream(&[100; 10]);
        let mut rdr = RecordReader::new(data.as_slice());
        assert_eq!(build_offsets(&mut rdr, 1000, 0.3, &by_timestamp).len(), 3);
    }

    #[test]
    fn out_of_range_rate_clamps_to_default() {
        for bad in [0.0, -0.5, 1.5] {
            let data = stream(&[100; 10]);
            let mut rdr = RecordReader::new(data.as_slice());
            assert_eq!(build_offsets(&mut rdr, 1000, bad, &by_timestamp).len(), 10);
        }
    }

    #[test]
    fn decoder_failure_retries_on_next_record() {
        // Reject the record ending at 200 so slot 0 falls through to 300
        let reject_1001 = |raw: &[u8]| -> Result<i64, ArchiveError> {
            let h = CommonHeader::parse(raw)?;
            if h.timestamp == 1001 {
                return Err(ArchiveError::Decode("unreadable".into()));
            }
            Ok(i64::from(h.timestamp))
        };
        let data = stream(&[100; 4]);
        let mut rdr = RecordReader::new(data.as_slice());
        let idx = build_offsets(&mut rdr, 400, 0.5, &reject_1001);

        assert_eq!(idx.len(), 2);
        assert_eq!(idx[0], Some(EntryOffset { value: 1002, offset: 300 }));
        assert_eq!(idx[1], Some(EntryOffset { value: 1003, offset: 400 }));
    }

    #[test]
    fn offsets_are_increasing_and_bounded() {
        let data = stream(&[64, 200, 48, 100, 88, 500]);
        let size = data.len() as u64;
        let mut rdr = RecordReader::new(data.as_slice());
        let idx = build_offsets(&mut rdr, size, 0.2, &by_timestamp);

        let filled: Vec<u64> = idx.iter().flatten().map(|s| s.offset).collect();
        assert!(filled.windows(2).all(|w| w[0] < w[1]));
        assert!(filled.iter().all(|&o| o <= size));
    }

    #[test]
    fn truncated_tail_leaves_slots_empty() {
        let mut data = stream(&[100; 10]);
        data.truncate(450);
        let mut rdr = RecordReader::new(data.as_slice());
        let idx = build_offsets(&mut rdr, 1000, 0.25, &by_timestamp);

        assert_eq!(idx.len(), 4);
        assert_eq!(idx[0].unwrap().offset, 300);
        assert!(idx[1].is_none() && idx[2].is_none() && idx[3].is_none());
    }
}
