use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::util::crc;

use super::{BLOCK_SIZE, HEADER_SIZE, TYPE_FIRST, TYPE_FULL, TYPE_LAST, TYPE_MIDDLE, TYPE_ZERO};

/// Callback invoked for every region of the journal the reader skips:
/// `(bytes_skipped, reason)`.
pub type Dropper = Box<dyn FnMut(u64, &str) + Send>;

/// Journal reader reassembling logical records from the physical stream.
///
/// Corruption (checksum mismatch, unknown type, out-of-order fragments,
/// lengths overrunning the block) never fails the iteration: the damaged
/// region is reported through the drop callback and the reader resyncs to
/// the next block boundary. Only I/O errors from the underlying stream
/// surface as `Err`.
pub struct Reader<R: Read> {
    r: R,
    buf: [u8; BLOCK_SIZE],
    /// Valid bytes in `buf`.
    len: usize,
    /// Parse position within `buf`.
    pos: usize,
    eof: bool,
    verify_checksum: bool,
    dropper: Option<Dropper>,
}

impl<R: Read> Reader<R> {
    pub fn new(r: R) -> Self {
        Self::with_dropper(r, true, None)
    }

    pub fn with_dropper(r: R, verify_checksum: bool, dropper: Option<Dropper>) -> Self {
        Self {
            r,
            buf: [0; BLOCK_SIZE],
            len: 0,
            pos: 0,
            eof: false,
            verify_checksum,
            dropper,
        }
    }

    /// Reads the next logical record, or `None` at end of journal.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        let mut in_fragment = false;

        loop {
            if self.pos + HEADER_SIZE > self.len {
                // The tail too short for a header is writer padding.
                if !self.fill_block()? {
                    if in_fragment {
                        self.report(record.len() as u64, "truncated record at end of journal");
                    }
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buf[self.pos..];
            let stored = LittleEndian::read_u32(header);
            let length = LittleEndian::read_u16(&header[4..]) as usize;
            let rtype = header[6];

            if rtype == TYPE_ZERO && self.is_zero_tail() {
                // Clean zero padding, not damage.
                self.pos = self.len;
                continue;
            }

            if self.pos + HEADER_SIZE + length > self.len {
                let skipped = self.skip_block();
                self.report(skipped, "record length overruns block");
                if in_fragment {
                    record.clear();
                    in_fragment = false;
                }
                continue;
            }

            let payload_start = self.pos + HEADER_SIZE;
            let payload = &self.buf[payload_start..payload_start + length];
            if self.verify_checksum && crc::masked_checksum2(&[rtype], payload) != stored {
                let skipped = self.skip_block();
                self.report(skipped, "checksum mismatch");
                if in_fragment {
                    record.clear();
                    in_fragment = false;
                }
                continue;
            }

            self.pos += HEADER_SIZE + length;

            match rtype {
                TYPE_FULL => {
                    if in_fragment {
                        self.report(record.len() as u64, "partial record without LAST");
                        record.clear();
                    }
                    record.extend_from_slice(payload_of(&self.buf, payload_start, length));
                    return Ok(Some(record));
                }
                TYPE_FIRST => {
                    if in_fragment {
                        self.report(record.len() as u64, "partial record without LAST");
                        record.clear();
                    }
                    record.extend_from_slice(payload_of(&self.buf, payload_start, length));
                    in_fragment = true;
                }
                TYPE_MIDDLE => {
                    if !in_fragment {
                        let skipped = (HEADER_SIZE + length) as u64 + self.skip_block();
                        self.report(skipped, "MIDDLE record without FIRST");
                    } else {
                        record.extend_from_slice(payload_of(&self.buf, payload_start, length));
                    }
                }
                TYPE_LAST => {
                    if !in_fragment {
                        let skipped = (HEADER_SIZE + length) as u64 + self.skip_block();
                        self.report(skipped, "LAST record without FIRST");
                    } else {
                        record.extend_from_slice(payload_of(&self.buf, payload_start, length));
                        return Ok(Some(record));
                    }
                }
                _ => {
                    // Unknown type, also the case of a nonzero-length
                    // zero-type record.
                    let unparsed = (self.len - self.pos) as u64 + (HEADER_SIZE + length) as u64;
                    self.pos = self.len;
                    self.report(unparsed, "unknown record type");
                    if in_fragment {
                        record.clear();
                        in_fragment = false;
                    }
                }
            }
        }
    }

    fn fill_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.len = 0;
        self.pos = 0;
        while self.len < BLOCK_SIZE {
            match self.r.read(&mut self.buf[self.len..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.len += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(self.len > 0)
    }

    /// Whether everything from the current position to the end of the block
    /// is zero, i.e. a legal writer pad.
    fn is_zero_tail(&self) -> bool {
        self.buf[self.pos..self.len].iter().all(|&b| b == 0)
    }

    /// Abandons the rest of the current block, returning the skipped size.
    fn skip_block(&mut self) -> u64 {
        let skipped = (self.len - self.pos) as u64;
        self.pos = self.len;
        skipped
    }

    fn report(&mut self, bytes: u64, reason: &str) {
        tracing::warn!(bytes, reason, "journal: dropping damaged region");
        if let Some(dropper) = &mut self.dropper {
            dropper(bytes, reason);
        }
    }
}

fn payload_of(buf: &[u8], start: usize, len: usize) -> &[u8] {
    &buf[start..start + len]
}

impl<R: Read> Iterator for Reader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Writer;
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn encode(records: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        for r in records {
            w.append(r).expect("append");
        }
        buf
    }

    fn drops() -> (Dropper, Arc<Mutex<Vec<(u64, String)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let dropper: Dropper = Box::new(move |n, reason| {
            sink.lock().unwrap().push((n, reason.to_string()));
        });
        (dropper, log)
    }

    #[test]
    fn test_reads_records_in_order() {
        let buf = encode(&[b"one", b"two", b"three"]);
        let records: Vec<_> = Reader::new(Cursor::new(buf))
            .collect::<Result<Vec<_>>>()
            .expect("read");
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_corrupt_record_dropped_next_block_recovered() {
        let mut buf = encode(&[b"good", b"mangled"]);
        // Flip a payload byte of the second record.
        let idx = HEADER_SIZE + 4 + HEADER_SIZE + 2;
        buf[idx] ^= 0xff;
        // A third record in the next block survives the resync.
        buf.resize(BLOCK_SIZE, 0);
        let mut w = Writer::new(&mut buf);
        // The writer starts at a fresh block boundary.
        w.append(b"recovered").expect("append");

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(buf), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert_eq!(records, vec![b"good".to_vec(), b"recovered".to_vec()]);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].1.contains("checksum"), "reason: {}", log[0].1);
    }

    #[test]
    fn test_unknown_type_resyncs() {
        let mut buf = encode(&[b"first", b"second"]);
        // Corrupt the second record's type byte; its checksum still covers
        // the old type, so the checksum path or the type path must drop it.
        let second_header = HEADER_SIZE + 5;
        buf[second_header + 6] = 9;

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(buf), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert_eq!(records, vec![b"first".to_vec()]);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    fn raw_record(buf: &mut Vec<u8>, rtype: u8, payload: &[u8]) {
        let checksum = crc::masked_checksum2(&[rtype], payload);
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header, checksum);
        LittleEndian::write_u16(&mut header[4..], payload.len() as u16);
        header[6] = rtype;
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
    }

    #[test]
    fn test_middle_without_first_skips_rest_of_block() {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            w.append(b"ok").expect("append");
        }
        // An orphan MIDDLE with a valid checksum, then a valid FULL record
        // in the same block. The resync abandons both.
        raw_record(&mut buf, TYPE_MIDDLE, b"orphan");
        raw_record(&mut buf, TYPE_FULL, b"shadowed");

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(buf), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert_eq!(records, vec![b"ok".to_vec()]);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].1.contains("MIDDLE"), "reason: {}", log[0].1);
        // The skip covers the orphan and everything after it in the block.
        assert_eq!(
            log[0].0,
            (2 * HEADER_SIZE + b"orphan".len() + b"shadowed".len()) as u64
        );
    }

    #[test]
    fn test_orphan_fragment_recovery_at_next_block() {
        let mut buf = Vec::new();
        raw_record(&mut buf, TYPE_LAST, b"orphan");
        raw_record(&mut buf, TYPE_FULL, b"lost");
        buf.resize(BLOCK_SIZE, 0);
        raw_record(&mut buf, TYPE_FULL, b"recovered");

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(buf), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert_eq!(records, vec![b"recovered".to_vec()]);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].1.contains("LAST"), "reason: {}", log[0].1);
    }

    #[test]
    fn test_truncated_tail_reported_not_error() {
        let buf = encode(&[&vec![5u8; 2 * BLOCK_SIZE]]);
        // Drop the final fragment.
        let truncated = buf[..2 * BLOCK_SIZE].to_vec();

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(truncated), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert!(records.is_empty());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].1.contains("truncated"), "reason: {}", log[0].1);
    }

    #[test]
    fn test_zero_padding_is_not_a_drop() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        // Ends the block 3 bytes short, forcing a zero pad.
        w.append(&vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3]).expect("append");
        w.append(b"next").expect("append");

        let (dropper, log) = drops();
        let reader = Reader::with_dropper(Cursor::new(buf), true, Some(dropper));
        let records: Vec<_> = reader.collect::<Result<Vec<_>>>().expect("read");
        assert_eq!(records.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }
}
