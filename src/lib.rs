#![doc = include_str!("../README.md")]

pub mod decoder;
pub mod device;

#[cfg(feature = "expose-parsers")]
pub mod parser;
#[cfg(not(feature = "expose-parsers"))]
pub(crate) mod parser;

pub use decoder::{
    CancellationToken, DecodeStats, DecodedFrame, Decoder, DecoderError, DecoderOptions,
};
pub use device::{DeviceError, Fourcc, VideoDevice};
