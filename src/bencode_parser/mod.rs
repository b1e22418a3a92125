pub mod encoder;
pub mod errors;
pub mod parser;

pub use encoder::encode;
pub use errors::DecodeError;
pub use parser::{Dictionary, RawSpan, Value, decode, parse};
