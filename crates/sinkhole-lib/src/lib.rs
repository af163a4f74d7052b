mod buf;
mod dns_header;
mod message;

pub use buf::ByteBuf;
pub use dns_header::{HeaderFlags, ResponseCode};
pub use message::{
    blocked_response_flags, cache_key_material, extract_qname, extract_qname_lossy, nxdomain_response,
    transaction_id, with_transaction_id, QnameError,
};

/// Size of the fixed DNS header
pub const HEADER_LEN: usize = 12;
