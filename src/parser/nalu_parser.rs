use bytes::Bytes;

use super::StreamState;
use super::bit_reader::{BitReader, BitReaderError};

/// The slice parser only consumes header fields, which fit comfortably in this
/// many bytes even with worst-case Exp-Golomb lengths.
const SLICE_HEADER_RBSP_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParserError {
    #[error("malformed {field}: {source}")]
    Field {
        field: &'static str,
        source: BitReaderError,
    },

    #[error("{field} value {value} is out of range")]
    ValueOutOfRange { field: &'static str, value: i64 },

    #[error("slice references unknown picture parameter set {0}")]
    UnknownPps(u8),

    #[error("picture parameter set references unknown sequence parameter set {0}")]
    UnknownSps(u8),

    #[error("bitstreams with more than one slice group are not supported")]
    SliceGroupsNotSupported,
}

fn at(field: &'static str) -> impl Fn(BitReaderError) -> ParserError {
    move |source| ParserError::Field { field, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    NonIdrSlice,
    PartitionedSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Filler,
    Other(u8),
}

impl NaluKind {
    fn from_nal_unit_type(id: u8) -> Self {
        match id {
            1 => NaluKind::NonIdrSlice,
            2..=4 => NaluKind::PartitionedSlice,
            5 => NaluKind::IdrSlice,
            6 => NaluKind::Sei,
            7 => NaluKind::Sps,
            8 => NaluKind::Pps,
            9 => NaluKind::AccessUnitDelimiter,
            10 => NaluKind::EndOfSequence,
            11 => NaluKind::EndOfStream,
            12 => NaluKind::Filler,
            other => NaluKind::Other(other),
        }
    }
}

/// One H.264 Network Abstraction Layer unit: the header byte and the escaped
/// payload, without any start code.
#[derive(derivative::Derivative, Clone)]
#[derivative(Debug)]
pub struct Nalu {
    #[derivative(Debug = "ignore")]
    bytes: Bytes,
    kind: NaluKind,
    ref_idc: u8,
}

impl Nalu {
    pub(crate) fn new(bytes: Bytes) -> Self {
        debug_assert!(!bytes.is_empty());
        let header = bytes[0];

        Self {
            kind: NaluKind::from_nal_unit_type(header & 0x1F),
            ref_idc: (header >> 5) & 0x3,
            bytes,
        }
    }

    /// Raw unit bytes, header byte included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> NaluKind {
        self.kind
    }

    /// The 2-bit `nal_ref_idc`; non-zero marks the picture as a reference.
    pub fn ref_idc(&self) -> u8 {
        self.ref_idc
    }

    pub fn is_idr(&self) -> bool {
        self.kind == NaluKind::IdrSlice
    }

    /// Escaped payload after the header byte.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[1..]
    }
}

/// Removes emulation-prevention bytes (`00 00 03`) from at most `limit` bytes
/// of escaped payload.
fn unescape_rbsp(data: &[u8], limit: usize) -> Vec<u8> {
    let data = &data[..data.len().min(limit)];
    let mut rbsp = Vec::with_capacity(data.len());
    let mut zeros = 0usize;

    for &byte in data {
        if zeros >= 2 && byte == 3 {
            zeros = 0;
            continue;
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        rbsp.push(byte);
    }

    rbsp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCropping {
    pub left_offset: u32,
    pub right_offset: u32,
    pub top_offset: u32,
    pub bottom_offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PicOrderCnt {
    TypeZero {
        log2_max_pic_order_cnt_lsb_minus4: u8,
    },
    TypeOne {
        delta_pic_order_always_zero_flag: bool,
        offset_for_non_ref_pic: i32,
        offset_for_top_to_bottom_field: i32,
        offsets_for_ref_frames: Vec<i32>,
    },
    TypeTwo,
}

impl PicOrderCnt {
    pub fn type_id(&self) -> u8 {
        match self {
            PicOrderCnt::TypeZero { .. } => 0,
            PicOrderCnt::TypeOne { .. } => 1,
            PicOrderCnt::TypeTwo => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt: PicOrderCnt,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping: Option<FrameCropping>,
}

impl Sps {
    pub fn frame_num_bits(&self) -> u32 {
        self.log2_max_frame_num_minus4 as u32 + 4
    }

    pub fn pic_order_cnt_lsb_bits(&self) -> Option<u32> {
        match self.pic_order_cnt {
            PicOrderCnt::TypeZero {
                log2_max_pic_order_cnt_lsb_minus4,
            } => Some(log2_max_pic_order_cnt_lsb_minus4 as u32 + 4),
            _ => None,
        }
    }

    /// Display width in pixels, cropping applied (4:2:0 chroma step).
    pub fn width(&self) -> u32 {
        let width = (self.pic_width_in_mbs_minus1 + 1) * 16;
        match &self.frame_cropping {
            Some(crop) => width.saturating_sub(2 * (crop.left_offset + crop.right_offset)),
            None => width,
        }
    }

    /// Display height in pixels, cropping applied (4:2:0 chroma step).
    pub fn height(&self) -> u32 {
        let field_factor = if self.frame_mbs_only_flag { 1 } else { 2 };
        let height = field_factor * (self.pic_height_in_map_units_minus1 + 1) * 16;
        match &self.frame_cropping {
            Some(crop) => {
                height.saturating_sub(2 * field_factor * (crop.top_offset + crop.bottom_offset))
            }
            None => height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub second_chroma_qp_index_offset: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceFamily {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceFamily {
    pub fn from_slice_type(slice_type: u8) -> Self {
        match slice_type % 5 {
            0 => SliceFamily::P,
            1 => SliceFamily::B,
            2 => SliceFamily::I,
            3 => SliceFamily::Sp,
            _ => SliceFamily::Si,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: Option<u16>,
    pub pic_order_cnt_lsb: Option<u16>,
    pub delta_pic_order_cnt_bottom: Option<i32>,
    pub delta_pic_order_cnt: [Option<i32>; 2],
}

impl SliceHeader {
    pub fn family(&self) -> SliceFamily {
        SliceFamily::from_slice_type(self.slice_type)
    }
}

/// Parses a sequence parameter set payload (header byte already stripped).
pub fn parse_sps(payload: &[u8]) -> Result<Sps, ParserError> {
    let rbsp = unescape_rbsp(payload, usize::MAX);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8).map_err(at("profile_idc"))? as u8;
    let constraint_set_flags = r.read_bits(8).map_err(at("constraint_set_flags"))? as u8;
    let level_idc = r.read_bits(8).map_err(at("level_idc"))? as u8;
    let seq_parameter_set_id = read_bounded(&mut r, "seq_parameter_set_id", 31)? as u8;

    let mut chroma_format_idc = 1u8;
    let mut separate_colour_plane_flag = false;
    let mut bit_depth_luma_minus8 = 0u8;
    let mut bit_depth_chroma_minus8 = 0u8;

    if has_chroma_format(profile_idc) {
        chroma_format_idc = read_bounded(&mut r, "chroma_format_idc", 3)? as u8;
        if chroma_format_idc == 3 {
            separate_colour_plane_flag =
                r.read_flag().map_err(at("separate_colour_plane_flag"))?;
        }
        bit_depth_luma_minus8 = read_bounded(&mut r, "bit_depth_luma_minus8", 6)? as u8;
        bit_depth_chroma_minus8 = read_bounded(&mut r, "bit_depth_chroma_minus8", 6)? as u8;
        let _qpprime_y_zero_transform_bypass_flag = r
            .read_flag()
            .map_err(at("qpprime_y_zero_transform_bypass_flag"))?;

        let seq_scaling_matrix_present_flag = r
            .read_flag()
            .map_err(at("seq_scaling_matrix_present_flag"))?;
        if seq_scaling_matrix_present_flag {
            let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
            for list in 0..list_count {
                let present = r.read_flag().map_err(at("seq_scaling_list_present_flag"))?;
                if present {
                    skip_scaling_list(&mut r, if list < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let log2_max_frame_num_minus4 = read_bounded(&mut r, "log2_max_frame_num_minus4", 12)? as u8;
    let pic_order_cnt_type = read_bounded(&mut r, "pic_order_cnt_type", 2)?;

    let pic_order_cnt = match pic_order_cnt_type {
        0 => PicOrderCnt::TypeZero {
            log2_max_pic_order_cnt_lsb_minus4: read_bounded(
                &mut r,
                "log2_max_pic_order_cnt_lsb_minus4",
                12,
            )? as u8,
        },
        1 => {
            let delta_pic_order_always_zero_flag = r
                .read_flag()
                .map_err(at("delta_pic_order_always_zero_flag"))?;
            let offset_for_non_ref_pic = r
                .read_signed_exp_golomb()
                .map_err(at("offset_for_non_ref_pic"))?;
            let offset_for_top_to_bottom_field = r
                .read_signed_exp_golomb()
                .map_err(at("offset_for_top_to_bottom_field"))?;
            let num_offsets =
                read_bounded(&mut r, "num_ref_frames_in_pic_order_cnt_cycle", 255)?;
            let mut offsets_for_ref_frames = Vec::with_capacity(num_offsets as usize);
            for _ in 0..num_offsets {
                offsets_for_ref_frames.push(
                    r.read_signed_exp_golomb()
                        .map_err(at("offset_for_ref_frame"))?,
                );
            }

            PicOrderCnt::TypeOne {
                delta_pic_order_always_zero_flag,
                offset_for_non_ref_pic,
                offset_for_top_to_bottom_field,
                offsets_for_ref_frames,
            }
        }
        _ => PicOrderCnt::TypeTwo,
    };

    let max_num_ref_frames = r
        .read_unsigned_exp_golomb()
        .map_err(at("max_num_ref_frames"))?;
    let gaps_in_frame_num_value_allowed_flag = r
        .read_flag()
        .map_err(at("gaps_in_frame_num_value_allowed_flag"))?;
    let pic_width_in_mbs_minus1 = r
        .read_unsigned_exp_golomb()
        .map_err(at("pic_width_in_mbs_minus1"))?;
    let pic_height_in_map_units_minus1 = r
        .read_unsigned_exp_golomb()
        .map_err(at("pic_height_in_map_units_minus1"))?;
    let frame_mbs_only_flag = r.read_flag().map_err(at("frame_mbs_only_flag"))?;
    let mb_adaptive_frame_field_flag = if frame_mbs_only_flag {
        false
    } else {
        r.read_flag().map_err(at("mb_adaptive_frame_field_flag"))?
    };
    let direct_8x8_inference_flag = r.read_flag().map_err(at("direct_8x8_inference_flag"))?;

    let frame_cropping_flag = r.read_flag().map_err(at("frame_cropping_flag"))?;
    let frame_cropping = if frame_cropping_flag {
        Some(FrameCropping {
            left_offset: r
                .read_unsigned_exp_golomb()
                .map_err(at("frame_crop_left_offset"))?,
            right_offset: r
                .read_unsigned_exp_golomb()
                .map_err(at("frame_crop_right_offset"))?,
            top_offset: r
                .read_unsigned_exp_golomb()
                .map_err(at("frame_crop_top_offset"))?,
            bottom_offset: r
                .read_unsigned_exp_golomb()
                .map_err(at("frame_crop_bottom_offset"))?,
        })
    } else {
        None
    };

    Ok(Sps {
        profile_idc,
        constraint_set_flags,
        level_idc,
        seq_parameter_set_id,
        chroma_format_idc,
        separate_colour_plane_flag,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        log2_max_frame_num_minus4,
        pic_order_cnt,
        max_num_ref_frames,
        gaps_in_frame_num_value_allowed_flag,
        pic_width_in_mbs_minus1,
        pic_height_in_map_units_minus1,
        frame_mbs_only_flag,
        mb_adaptive_frame_field_flag,
        direct_8x8_inference_flag,
        frame_cropping,
    })
}

/// Parses a picture parameter set payload. `chroma_format_idc` comes from the
/// referenced sequence parameter set; callers pass the 4:2:0 default when no
/// set is linked yet, it only affects how many scaling lists get skipped.
pub fn parse_pps(payload: &[u8], chroma_format_idc: u8) -> Result<Pps, ParserError> {
    let rbsp = unescape_rbsp(payload, usize::MAX);
    let mut r = BitReader::new(&rbsp);

    let pic_parameter_set_id = read_bounded(&mut r, "pic_parameter_set_id", 255)? as u8;
    let seq_parameter_set_id = read_bounded(&mut r, "seq_parameter_set_id", 31)? as u8;
    let entropy_coding_mode_flag = r.read_flag().map_err(at("entropy_coding_mode_flag"))?;
    let bottom_field_pic_order_in_frame_present_flag = r
        .read_flag()
        .map_err(at("bottom_field_pic_order_in_frame_present_flag"))?;

    let num_slice_groups_minus1 = r
        .read_unsigned_exp_golomb()
        .map_err(at("num_slice_groups_minus1"))?;
    if num_slice_groups_minus1 > 0 {
        // Parsing the slice-group map would be required to stay aligned.
        return Err(ParserError::SliceGroupsNotSupported);
    }

    let num_ref_idx_l0_default_active_minus1 =
        read_bounded(&mut r, "num_ref_idx_l0_default_active_minus1", 31)? as u8;
    let num_ref_idx_l1_default_active_minus1 =
        read_bounded(&mut r, "num_ref_idx_l1_default_active_minus1", 31)? as u8;
    let weighted_pred_flag = r.read_flag().map_err(at("weighted_pred_flag"))?;
    let weighted_bipred_idc = r.read_bits(2).map_err(at("weighted_bipred_idc"))? as u8;
    let pic_init_qp_minus26 = read_signed_bounded(&mut r, "pic_init_qp_minus26", -62, 25)? as i8;
    let pic_init_qs_minus26 = read_signed_bounded(&mut r, "pic_init_qs_minus26", -26, 25)? as i8;
    let chroma_qp_index_offset =
        read_signed_bounded(&mut r, "chroma_qp_index_offset", -12, 12)? as i8;
    let deblocking_filter_control_present_flag = r
        .read_flag()
        .map_err(at("deblocking_filter_control_present_flag"))?;
    let constrained_intra_pred_flag =
        r.read_flag().map_err(at("constrained_intra_pred_flag"))?;
    let redundant_pic_cnt_present_flag = r
        .read_flag()
        .map_err(at("redundant_pic_cnt_present_flag"))?;

    let mut transform_8x8_mode_flag = false;
    let mut pic_scaling_matrix_present_flag = false;
    let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

    if r.has_more_rbsp_data() {
        transform_8x8_mode_flag = r.read_flag().map_err(at("transform_8x8_mode_flag"))?;
        pic_scaling_matrix_present_flag = r
            .read_flag()
            .map_err(at("pic_scaling_matrix_present_flag"))?;
        if pic_scaling_matrix_present_flag {
            let extra = if transform_8x8_mode_flag {
                if chroma_format_idc == 3 { 6 } else { 2 }
            } else {
                0
            };
            for list in 0..(6 + extra) {
                let present = r.read_flag().map_err(at("pic_scaling_list_present_flag"))?;
                if present {
                    skip_scaling_list(&mut r, if list < 6 { 16 } else { 64 })?;
                }
            }
        }
        second_chroma_qp_index_offset =
            read_signed_bounded(&mut r, "second_chroma_qp_index_offset", -12, 12)? as i8;
    }

    Ok(Pps {
        pic_parameter_set_id,
        seq_parameter_set_id,
        entropy_coding_mode_flag,
        bottom_field_pic_order_in_frame_present_flag,
        num_slice_groups_minus1,
        num_ref_idx_l0_default_active_minus1,
        num_ref_idx_l1_default_active_minus1,
        weighted_pred_flag,
        weighted_bipred_idc,
        pic_init_qp_minus26,
        pic_init_qs_minus26,
        chroma_qp_index_offset,
        deblocking_filter_control_present_flag,
        constrained_intra_pred_flag,
        redundant_pic_cnt_present_flag,
        transform_8x8_mode_flag,
        pic_scaling_matrix_present_flag,
        second_chroma_qp_index_offset,
    })
}

/// Parses the leading fields of a slice header, resolving the parameter sets
/// it references from `state`.
pub fn parse_slice_header<'a>(
    nalu: &Nalu,
    state: &'a StreamState,
) -> Result<(SliceHeader, &'a Sps, &'a Pps), ParserError> {
    let rbsp = unescape_rbsp(nalu.payload(), SLICE_HEADER_RBSP_LIMIT);
    let mut r = BitReader::new(&rbsp);

    let first_mb_in_slice = r
        .read_unsigned_exp_golomb()
        .map_err(at("first_mb_in_slice"))?;
    let slice_type = read_bounded(&mut r, "slice_type", 9)? as u8;
    let pic_parameter_set_id = read_bounded(&mut r, "pic_parameter_set_id", 255)? as u8;

    let pps = state
        .pps(pic_parameter_set_id)
        .ok_or(ParserError::UnknownPps(pic_parameter_set_id))?;
    let sps = state
        .sps(pps.seq_parameter_set_id)
        .ok_or(ParserError::UnknownSps(pps.seq_parameter_set_id))?;

    if sps.separate_colour_plane_flag {
        let _colour_plane_id = r.read_bits(2).map_err(at("colour_plane_id"))?;
    }

    let frame_num = r
        .read_bits(sps.frame_num_bits())
        .map_err(at("frame_num"))? as u16;

    let mut field_pic_flag = false;
    let mut bottom_field_flag = false;
    if !sps.frame_mbs_only_flag {
        field_pic_flag = r.read_flag().map_err(at("field_pic_flag"))?;
        if field_pic_flag {
            bottom_field_flag = r.read_flag().map_err(at("bottom_field_flag"))?;
        }
    }

    let idr_pic_id = if nalu.is_idr() {
        Some(read_bounded(&mut r, "idr_pic_id", 65_535)? as u16)
    } else {
        None
    };

    let mut pic_order_cnt_lsb = None;
    let mut delta_pic_order_cnt_bottom = None;
    let mut delta_pic_order_cnt = [None, None];

    match &sps.pic_order_cnt {
        PicOrderCnt::TypeZero { .. } => {
            let bits = sps.pic_order_cnt_lsb_bits().unwrap_or(4);
            pic_order_cnt_lsb =
                Some(r.read_bits(bits).map_err(at("pic_order_cnt_lsb"))? as u16);
            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt_bottom = Some(
                    r.read_signed_exp_golomb()
                        .map_err(at("delta_pic_order_cnt_bottom"))?,
                );
            }
        }
        PicOrderCnt::TypeOne {
            delta_pic_order_always_zero_flag,
            ..
        } => {
            if !delta_pic_order_always_zero_flag {
                delta_pic_order_cnt[0] = Some(
                    r.read_signed_exp_golomb()
                        .map_err(at("delta_pic_order_cnt"))?,
                );
                if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                    delta_pic_order_cnt[1] = Some(
                        r.read_signed_exp_golomb()
                            .map_err(at("delta_pic_order_cnt"))?,
                    );
                }
            }
        }
        PicOrderCnt::TypeTwo => {}
    }

    let header = SliceHeader {
        first_mb_in_slice,
        slice_type,
        pic_parameter_set_id,
        frame_num,
        field_pic_flag,
        bottom_field_flag,
        idr_pic_id,
        pic_order_cnt_lsb,
        delta_pic_order_cnt_bottom,
        delta_pic_order_cnt,
    };

    Ok((header, sps, pps))
}

fn has_chroma_format(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134
    )
}

fn read_bounded(
    r: &mut BitReader<'_>,
    field: &'static str,
    max: u32,
) -> Result<u32, ParserError> {
    let value = r.read_unsigned_exp_golomb().map_err(at(field))?;
    if value > max {
        return Err(ParserError::ValueOutOfRange {
            field,
            value: value as i64,
        });
    }
    Ok(value)
}

fn read_signed_bounded(
    r: &mut BitReader<'_>,
    field: &'static str,
    min: i32,
    max: i32,
) -> Result<i32, ParserError> {
    let value = r.read_signed_exp_golomb().map_err(at(field))?;
    if value < min || value > max {
        return Err(ParserError::ValueOutOfRange {
            field,
            value: value as i64,
        });
    }
    Ok(value)
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: u32) -> Result<(), ParserError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_signed_exp_golomb().map_err(at("delta_scale"))?;
            next_scale = (last_scale + delta_scale + 256).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }

    Ok(())
}
