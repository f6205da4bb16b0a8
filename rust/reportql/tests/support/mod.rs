mod harness;

pub use harness::{harness, read_json, result_set};
