mod address;

pub use address::{AddressInfo, AddressParseError};
