//! Advertisement TLV parsing and payload decoding.

mod decoder;
mod parser;
pub mod vendor;

pub use decoder::{DecodedValue, PayloadDecoder, PayloadDecoderRegistry};
pub use parser::{data_type, AdParser, AdStructure, AdvertisementRecord, BeaconKind, EddystoneFrame, IBeaconFrame, RawAdvertisement};
