#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ResponseCode {
    #[default]
    Success,
    /// Server was unable to interpret the query
    FormatError,
    /// Server was unable to process the query due to an internal error
    ServerFailure,
    /// Domain name referenced in the query doesn't exist
    NameError,
    /// Requested type of query is not supported by the server
    NotImplemented,
    /// Server refuses to complete the specified operation
    Refused,
}

/// The flags word of a DNS header (bytes 2 and 3), limited to the bits the proxy writes.
///
/// Opcode, AA, TC and Z are always zero.
#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct HeaderFlags {
    /// Query/Response
    pub is_response: bool,
    /// Set by the sender. Enables recursive resolution
    pub recursion_desired: bool,
    /// Set by the server. Indicate whether recursion is allowed
    pub recursion_available: bool,
    /// Set by the server. Indicates status of the response
    pub response_code: ResponseCode,
}

impl HeaderFlags {
    pub fn to_u16(self) -> u16 {
        let first_byte = (self.is_response as u8) << 7 | self.recursion_desired as u8;
        let second_byte = (self.recursion_available as u8) << 7 | self.response_code as u8;
        (first_byte as u16) << 8 | (second_byte as u16)
    }
}
