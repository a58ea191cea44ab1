//! Fixed-layout payloads for the stateless H.264 codec controls, mirroring
//! the kernel's `v4l2_ctrl_h264_*` structures, and the pure mappers that fill
//! them from parsed bitstream state.

use bytemuck::{Pod, Zeroable};

use crate::decoder::dpb::Dpb;
use crate::parser::{PicOrderCnt, Pps, SliceFamily, SliceHeader, Sps};

pub const DPB_CAPACITY: usize = 16;
pub const REF_LIST_CAPACITY: usize = 32;
const REF_FRAME_OFFSETS_CAPACITY: usize = 255;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SpsPayload {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub max_num_ref_frames: u8,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; REF_FRAME_OFFSETS_CAPACITY],
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub flags: u32,
}

impl SpsPayload {
    pub const FLAG_SEPARATE_COLOUR_PLANE: u32 = 0x01;
    pub const FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS: u32 = 0x02;
    pub const FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO: u32 = 0x04;
    pub const FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED: u32 = 0x08;
    pub const FLAG_FRAME_MBS_ONLY: u32 = 0x10;
    pub const FLAG_MB_ADAPTIVE_FRAME_FIELD: u32 = 0x20;
    pub const FLAG_DIRECT_8X8_INFERENCE: u32 = 0x40;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PpsPayload {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub reserved: u8,
    pub flags: u16,
}

impl PpsPayload {
    pub const FLAG_ENTROPY_CODING_MODE: u16 = 0x01;
    pub const FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT: u16 = 0x02;
    pub const FLAG_WEIGHTED_PRED: u16 = 0x04;
    pub const FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT: u16 = 0x08;
    pub const FLAG_CONSTRAINED_INTRA_PRED: u16 = 0x10;
    pub const FLAG_REDUNDANT_PIC_CNT_PRESENT: u16 = 0x20;
    pub const FLAG_TRANSFORM_8X8_MODE: u16 = 0x40;
    pub const FLAG_SCALING_MATRIX_PRESENT: u16 = 0x80;
}

/// One slot of a slice's reference picture list: an index into the decode
/// parameters' DPB array.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ReferenceIndex {
    pub fields: u8,
    pub index: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SliceParamsPayload {
    pub header_bit_size: u32,
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub colour_plane_id: u8,
    pub redundant_pic_cnt: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub reserved: u8,
    pub ref_pic_list0: [ReferenceIndex; REF_LIST_CAPACITY],
    pub ref_pic_list1: [ReferenceIndex; REF_LIST_CAPACITY],
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DpbEntryPayload {
    pub reference_ts: u64,
    pub pic_num: u32,
    pub frame_num: u16,
    pub fields: u8,
    pub reserved: [u8; 5],
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub flags: u32,
}

impl DpbEntryPayload {
    pub const FLAG_VALID: u32 = 0x01;
    pub const FLAG_ACTIVE: u32 = 0x02;
    pub const FLAG_LONG_TERM: u32 = 0x04;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DecodeParamsPayload {
    pub dpb: [DpbEntryPayload; DPB_CAPACITY],
    pub nal_ref_idc: u16,
    pub frame_num: u16,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub dec_ref_pic_marking_bit_size: u32,
    pub pic_order_cnt_bit_size: u32,
    pub slice_group_change_cycle: u32,
    pub reserved: u32,
    pub flags: u32,
}

impl DecodeParamsPayload {
    pub const FLAG_IDR_PIC: u32 = 0x01;
    pub const FLAG_FIELD_PIC: u32 = 0x02;
    pub const FLAG_BOTTOM_FIELD: u32 = 0x04;
    pub const FLAG_P_FRAME: u32 = 0x08;
    pub const FLAG_B_FRAME: u32 = 0x10;
}

fn flag(condition: bool, bit: u32) -> u32 {
    if condition { bit } else { 0 }
}

fn flag16(condition: bool, bit: u16) -> u16 {
    if condition { bit } else { 0 }
}

fn clamp_u8(value: u32) -> u8 {
    value.min(u8::MAX as u32) as u8
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Lowers a parsed sequence parameter set into the control payload.
pub(crate) fn sps_payload(sps: &Sps) -> SpsPayload {
    let mut payload = SpsPayload::zeroed();

    payload.profile_idc = sps.profile_idc;
    payload.constraint_set_flags = sps.constraint_set_flags;
    payload.level_idc = sps.level_idc;
    payload.seq_parameter_set_id = sps.seq_parameter_set_id;
    payload.chroma_format_idc = sps.chroma_format_idc;
    payload.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
    payload.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
    payload.log2_max_frame_num_minus4 = sps.log2_max_frame_num_minus4;
    payload.pic_order_cnt_type = sps.pic_order_cnt.type_id();
    payload.max_num_ref_frames = clamp_u8(sps.max_num_ref_frames);
    payload.pic_width_in_mbs_minus1 = clamp_u16(sps.pic_width_in_mbs_minus1);
    payload.pic_height_in_map_units_minus1 = clamp_u16(sps.pic_height_in_map_units_minus1);

    match &sps.pic_order_cnt {
        PicOrderCnt::TypeZero {
            log2_max_pic_order_cnt_lsb_minus4,
        } => {
            payload.log2_max_pic_order_cnt_lsb_minus4 = *log2_max_pic_order_cnt_lsb_minus4;
        }
        PicOrderCnt::TypeOne {
            offset_for_non_ref_pic,
            offset_for_top_to_bottom_field,
            offsets_for_ref_frames,
            ..
        } => {
            payload.offset_for_non_ref_pic = *offset_for_non_ref_pic;
            payload.offset_for_top_to_bottom_field = *offset_for_top_to_bottom_field;
            let count = offsets_for_ref_frames.len().min(REF_FRAME_OFFSETS_CAPACITY);
            payload.num_ref_frames_in_pic_order_cnt_cycle = count as u8;
            payload.offset_for_ref_frame[..count]
                .copy_from_slice(&offsets_for_ref_frames[..count]);
        }
        PicOrderCnt::TypeTwo => {}
    }

    payload.flags = flag(
        sps.separate_colour_plane_flag,
        SpsPayload::FLAG_SEPARATE_COLOUR_PLANE,
    ) | flag(
        matches!(sps.pic_order_cnt, PicOrderCnt::TypeOne { delta_pic_order_always_zero_flag: true, .. }),
        SpsPayload::FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO,
    ) | flag(
        sps.gaps_in_frame_num_value_allowed_flag,
        SpsPayload::FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED,
    ) | flag(sps.frame_mbs_only_flag, SpsPayload::FLAG_FRAME_MBS_ONLY)
        | flag(
            sps.mb_adaptive_frame_field_flag,
            SpsPayload::FLAG_MB_ADAPTIVE_FRAME_FIELD,
        )
        | flag(
            sps.direct_8x8_inference_flag,
            SpsPayload::FLAG_DIRECT_8X8_INFERENCE,
        );

    payload
}

/// Lowers a parsed picture parameter set into the control payload.
pub(crate) fn pps_payload(pps: &Pps) -> PpsPayload {
    let mut payload = PpsPayload::zeroed();

    payload.pic_parameter_set_id = pps.pic_parameter_set_id;
    payload.seq_parameter_set_id = pps.seq_parameter_set_id;
    payload.num_ref_idx_l0_default_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
    payload.num_ref_idx_l1_default_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
    payload.weighted_bipred_idc = pps.weighted_bipred_idc;
    payload.pic_init_qp_minus26 = pps.pic_init_qp_minus26;
    payload.pic_init_qs_minus26 = pps.pic_init_qs_minus26;
    payload.chroma_qp_index_offset = pps.chroma_qp_index_offset;
    payload.second_chroma_qp_index_offset = pps.second_chroma_qp_index_offset;

    payload.flags = flag16(
        pps.entropy_coding_mode_flag,
        PpsPayload::FLAG_ENTROPY_CODING_MODE,
    ) | flag16(
        pps.bottom_field_pic_order_in_frame_present_flag,
        PpsPayload::FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT,
    ) | flag16(pps.weighted_pred_flag, PpsPayload::FLAG_WEIGHTED_PRED)
        | flag16(
            pps.deblocking_filter_control_present_flag,
            PpsPayload::FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT,
        )
        | flag16(
            pps.constrained_intra_pred_flag,
            PpsPayload::FLAG_CONSTRAINED_INTRA_PRED,
        )
        | flag16(
            pps.redundant_pic_cnt_present_flag,
            PpsPayload::FLAG_REDUNDANT_PIC_CNT_PRESENT,
        )
        | flag16(
            pps.transform_8x8_mode_flag,
            PpsPayload::FLAG_TRANSFORM_8X8_MODE,
        )
        | flag16(
            pps.pic_scaling_matrix_present_flag,
            PpsPayload::FLAG_SCALING_MATRIX_PRESENT,
        );

    payload
}

/// Lowers the parsed slice header fields the hardware consumes; fields this
/// core does not parse stay zero, reference lists index the DPB in order.
pub(crate) fn slice_params_payload(header: &SliceHeader, pps: &Pps, dpb: &Dpb) -> SliceParamsPayload {
    let mut payload = SliceParamsPayload::zeroed();

    payload.first_mb_in_slice = header.first_mb_in_slice;
    payload.slice_type = header.slice_type % 5;
    payload.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
    payload.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;

    let references = dpb.len().min(REF_LIST_CAPACITY).min(DPB_CAPACITY);
    for (i, slot) in payload.ref_pic_list0[..references].iter_mut().enumerate() {
        slot.index = i as u8;
    }
    if header.family() == SliceFamily::B {
        for (i, slot) in payload.ref_pic_list1[..references].iter_mut().enumerate() {
            slot.index = i as u8;
        }
    }

    payload
}

/// Builds the decode parameters for one frame from the slice header and the
/// coordinator's DPB.
pub(crate) fn decode_params_payload(
    header: &SliceHeader,
    nal_ref_idc: u8,
    is_idr: bool,
    dpb: &Dpb,
) -> DecodeParamsPayload {
    let mut payload = DecodeParamsPayload::zeroed();

    for (slot, entry) in payload.dpb.iter_mut().zip(dpb.iter()) {
        slot.pic_num = entry.frame_num as u32;
        slot.frame_num = entry.frame_num;
        slot.top_field_order_cnt = entry.pic_order_cnt;
        slot.bottom_field_order_cnt = entry.pic_order_cnt;
        slot.flags = DpbEntryPayload::FLAG_VALID
            | DpbEntryPayload::FLAG_ACTIVE
            | flag(entry.is_long_term, DpbEntryPayload::FLAG_LONG_TERM);
    }

    payload.nal_ref_idc = nal_ref_idc as u16;
    payload.frame_num = header.frame_num;
    payload.idr_pic_id = header.idr_pic_id.unwrap_or(0);

    let pic_order_cnt_lsb = header.pic_order_cnt_lsb.unwrap_or(0);
    payload.pic_order_cnt_lsb = pic_order_cnt_lsb;
    payload.top_field_order_cnt = pic_order_cnt_lsb as i32;
    payload.bottom_field_order_cnt =
        pic_order_cnt_lsb as i32 + header.delta_pic_order_cnt_bottom.unwrap_or(0);
    payload.delta_pic_order_cnt_bottom = header.delta_pic_order_cnt_bottom.unwrap_or(0);
    payload.delta_pic_order_cnt0 = header.delta_pic_order_cnt[0].unwrap_or(0);
    payload.delta_pic_order_cnt1 = header.delta_pic_order_cnt[1].unwrap_or(0);

    let family = header.family();
    payload.flags = flag(is_idr, DecodeParamsPayload::FLAG_IDR_PIC)
        | flag(header.field_pic_flag, DecodeParamsPayload::FLAG_FIELD_PIC)
        | flag(header.bottom_field_flag, DecodeParamsPayload::FLAG_BOTTOM_FIELD)
        | flag(
            matches!(family, SliceFamily::P | SliceFamily::Sp),
            DecodeParamsPayload::FLAG_P_FRAME,
        )
        | flag(family == SliceFamily::B, DecodeParamsPayload::FLAG_B_FRAME);

    payload
}
