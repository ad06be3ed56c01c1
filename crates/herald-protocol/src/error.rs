/// Parse failure kinds.
///
/// Every kind terminates the peer at the connection layer (BYE with the
/// error text), but the parser itself stays usable: dot-message state is
/// unwound back to `Base` and the partial message dropped, so a test
/// harness or lenient caller may keep feeding lines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Grammar violation: a token that is not valid in the current state.
    #[error("unexpected token {token:?} in state {state}")]
    UnexpectedToken { token: String, state: &'static str },
    /// Token recognized but its arguments are wrong.
    #[error("malformed message: {detail}")]
    Malformed { detail: String },
    /// The UUID argument of an EVENT failed to parse.
    #[error("invalid event UUID {uuid:?}")]
    WrongUuid { uuid: String },
    /// Trailing bytes after `.` on a dot-message terminator line.
    #[error("garbage after terminator: {line:?}")]
    Garbage { line: String },
}
