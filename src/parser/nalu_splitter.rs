use std::sync::LazyLock;

use bytes::{BufMut, BytesMut};
use memchr::memmem::Finder;

use super::nalu_parser::Nalu;

static START_CODE_FINDER: LazyLock<Finder> = LazyLock::new(|| Finder::new(&[0, 0, 1]));

/// Splits an append-only Annex-B byte stream into NAL units.
///
/// A unit is emitted once the *next* start code is seen; the residual unit is
/// only known to be complete when the producer closes the stream and calls
/// [`NaluSplitter::flush`]. Emitted units start at the header byte; start
/// codes and any zero padding preceding a start code belong to no unit.
#[derive(Debug, Default)]
pub struct NaluSplitter {
    buffer: BytesMut,
    search_start: usize,
    synchronized: bool,
}

impl NaluSplitter {
    pub fn push(&mut self, bytestream: &[u8]) -> Vec<Nalu> {
        self.buffer.put(bytestream);

        let mut nalus = Vec::new();
        self.extract_complete(&mut nalus);
        nalus
    }

    /// Drains the residual unit after the producer signaled end of stream.
    pub fn flush(&mut self) -> Vec<Nalu> {
        let mut nalus = Vec::new();
        self.extract_complete(&mut nalus);

        if self.synchronized {
            let residual = self.buffer.split();
            push_unit(&mut nalus, &residual);
        }

        self.buffer = BytesMut::new();
        self.search_start = 0;
        self.synchronized = false;

        nalus
    }

    fn extract_complete(&mut self, nalus: &mut Vec<Nalu>) {
        while let Some(i) = START_CODE_FINDER.find(&self.buffer[self.search_start..]) {
            let start_code_pos = self.search_start + i;
            let unit = self.buffer.split_to(start_code_pos + 3);
            self.search_start = 0;

            if self.synchronized {
                push_unit(nalus, &unit[..start_code_pos]);
            } else {
                // Bytes before the first start code of the stream are not a
                // unit; drop them and synchronize.
                self.synchronized = true;
            }
        }

        // A start code may straddle the chunk boundary; keep its possible
        // prefix in the search window.
        self.search_start = self.buffer.len().saturating_sub(2);
    }
}

fn push_unit(nalus: &mut Vec<Nalu>, bytes: &[u8]) {
    // The third zero of a long start code and any zero padding trail the
    // previous unit; neither belongs to it.
    let end = bytes
        .iter()
        .rposition(|byte| *byte != 0)
        .map(|i| i + 1)
        .unwrap_or(0);

    if end > 0 {
        nalus.push(Nalu::new(bytes[..end].to_vec().into()));
    }
}
