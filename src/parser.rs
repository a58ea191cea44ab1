use rustc_hash::FxHashMap;

pub mod bit_reader;
pub mod nalu_parser;
pub mod nalu_splitter;


pub use bit_reader::{BitReader, BitReaderError};
pub use nalu_parser::{
    FrameCropping, Nalu, NaluKind, ParserError, PicOrderCnt, Pps, SliceFamily, SliceHeader, Sps,
};
pub use nalu_splitter::NaluSplitter;

/// Chroma format assumed for a picture parameter set parsed before the
/// sequence parameter set it references has been seen.
pub const DEFAULT_CHROMA_FORMAT_IDC: u8 = 1;

/// Parameter sets seen so far, keyed by their ids. Entries are overwritten on
/// re-arrival and live until teardown.
#[derive(Debug, Default)]
pub struct StreamState {
    sps: FxHashMap<u8, Sps>,
    pps: FxHashMap<u8, Pps>,
}

impl StreamState {
    pub fn put_sps(&mut self, sps: Sps) {
        self.sps.insert(sps.seq_parameter_set_id, sps);
    }

    pub fn put_pps(&mut self, pps: Pps) {
        self.pps.insert(pps.pic_parameter_set_id, pps);
    }

    pub fn sps(&self, id: u8) -> Option<&Sps> {
        self.sps.get(&id)
    }

    pub fn pps(&self, id: u8) -> Option<&Pps> {
        self.pps.get(&id)
    }

    /// Chroma format for PPS parsing: the one advertised by the referenced
    /// SPS when it is already known, 4:2:0 otherwise.
    pub fn chroma_format_for_pps(&self, seq_parameter_set_id: u8) -> u8 {
        self.sps(seq_parameter_set_id)
            .map(|sps| sps.chroma_format_idc)
            .unwrap_or(DEFAULT_CHROMA_FORMAT_IDC)
    }
}
