#![doc = include_str!("../README.md")]

mod error;
pub mod prelude;

pub mod framing;
pub mod pipeline;
pub mod readout;

pub use error::{Error, Result};
pub use pipeline::{decode, decode_with, DecodeOpts, DecodePipeline, EventRecord, Summary};
