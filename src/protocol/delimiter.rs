//! Packet-boundary recovery for the upstream byte stream.
//!
//! TCP delivers an unframed byte stream; the upstream protocol terminates
//! every envelope with a configurable delimiter literal. The reassembler
//! accumulates bytes and yields one record per delimiter hit, so downstream
//! decoding never sees a torn or glued frame.

use bytes::{Bytes, BytesMut};

/// Splits an incoming byte stream into delimiter-bounded records.
///
/// Owned by a single read loop; never shared.
pub struct Reassembler {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    max_packet_length: usize,
}

impl Reassembler {
    pub fn new(delimiter: Vec<u8>, max_packet_length: usize) -> Self {
        debug_assert!(!delimiter.is_empty());
        Self {
            delimiter,
            buffer: BytesMut::with_capacity(4096),
            max_packet_length,
        }
    }

    /// Appends `data` and drains every complete record from the buffer.
    ///
    /// Empty records (back-to-back delimiters) are discarded. A record
    /// longer than `max_packet_length` is dropped, and a buffer that grows
    /// past `max_packet_length` without a delimiter in sight is discarded
    /// wholesale: the stream is treated as line noise until the next
    /// delimiter resynchronizes it.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut records = Vec::new();
        loop {
            match find_subsequence(&self.buffer, &self.delimiter) {
                Some(index) => {
                    let mut record = self.buffer.split_to(index + self.delimiter.len());
                    record.truncate(index);

                    if record.is_empty() {
                        continue;
                    }
                    if record.len() > self.max_packet_length {
                        tracing::warn!(
                            len = record.len(),
                            max = self.max_packet_length,
                            "dropping oversized record"
                        );
                        continue;
                    }
                    records.push(record.freeze());
                }
                None => {
                    if self.buffer.len() > self.max_packet_length {
                        tracing::warn!(
                            buffered = self.buffer.len(),
                            max = self.max_packet_length,
                            "reassembly buffer overflow, discarding"
                        );
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }

        records
    }

    /// Appends the delimiter to an outgoing payload.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(payload.len() + self.delimiter.len());
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&self.delimiter);
        framed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELIM: &[u8] = &[0x78, 0x78, 0x78, 0x78, 0x88, 0x88, 0x88, 0x88];

    fn reassembler() -> Reassembler {
        Reassembler::new(DELIM.to_vec(), 1024)
    }

    #[test]
    fn splits_records_at_delimiters() {
        let mut r = reassembler();

        let mut stream = Vec::new();
        stream.extend_from_slice(&[0xAA, 0xBB]);
        stream.extend_from_slice(DELIM);
        stream.extend_from_slice(&[0xCC]);
        stream.extend_from_slice(DELIM);

        let records = r.feed(&stream);
        assert_eq!(records, vec![Bytes::from_static(&[0xAA, 0xBB]), Bytes::from_static(&[0xCC])]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn reassembly_is_chunking_invariant() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0xAA, 0xBB]);
        stream.extend_from_slice(DELIM);
        stream.extend_from_slice(&[0xCC]);
        stream.extend_from_slice(DELIM);
        stream.extend_from_slice(&[1, 2, 3, 4, 5]);
        stream.extend_from_slice(DELIM);

        let whole: Vec<Bytes> = reassembler().feed(&stream);

        // Every possible two-way split, including ones landing mid-delimiter.
        for cut in 0..=stream.len() {
            let mut r = reassembler();
            let mut records = r.feed(&stream[..cut]);
            records.extend(r.feed(&stream[cut..]));
            assert_eq!(records, whole, "split at {cut}");
        }

        // Byte-at-a-time.
        let mut r = reassembler();
        let mut records = Vec::new();
        for byte in &stream {
            records.extend(r.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(records, whole);
    }

    #[test]
    fn empty_records_are_discarded() {
        let mut r = reassembler();

        let mut stream = Vec::new();
        stream.extend_from_slice(DELIM);
        stream.extend_from_slice(DELIM);
        stream.extend_from_slice(&[0x01]);
        stream.extend_from_slice(DELIM);

        assert_eq!(r.feed(&stream), vec![Bytes::from_static(&[0x01])]);
    }

    #[test]
    fn overflow_discards_buffer_and_recovers() {
        let mut r = Reassembler::new(DELIM.to_vec(), 16);

        assert!(r.feed(&[0xEE; 17]).is_empty());
        assert_eq!(r.buffered(), 0);

        // The stream resynchronizes at the next delimiter.
        let mut stream = vec![0x0F, 0x0E];
        stream.extend_from_slice(DELIM);
        assert_eq!(r.feed(&stream), vec![Bytes::from_static(&[0x0F, 0x0E])]);
    }

    #[test]
    fn oversized_record_is_dropped() {
        let mut r = Reassembler::new(DELIM.to_vec(), 4);

        let mut stream = vec![0xAB; 5];
        stream.extend_from_slice(DELIM);
        stream.push(0xCD);
        stream.extend_from_slice(DELIM);

        assert_eq!(r.feed(&stream), vec![Bytes::from_static(&[0xCD])]);
    }

    #[test]
    fn partial_delimiter_is_kept_pending() {
        let mut r = reassembler();

        assert!(r.feed(&[0x42]).is_empty());
        assert!(r.feed(&DELIM[..3]).is_empty());
        assert_eq!(r.feed(&DELIM[3..]), vec![Bytes::from_static(&[0x42])]);
    }

    #[test]
    fn wrap_appends_delimiter() {
        let r = reassembler();
        let mut expected = vec![1, 2, 3];
        expected.extend_from_slice(DELIM);

        assert_eq!(r.wrap(&[1, 2, 3]), expected);
    }
}
