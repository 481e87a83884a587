//! Protocol primitives shared by the warden supervisor and the sandboxed
//! runtimes it launches: instance credentials, identifiers and the control
//! frame codec.

mod frame;
mod token;

pub use frame::{
    already_stopped_payload, ControlFrame, FrameError, FrameKind, ALL_STOPPED_EVENT,
    ALREADY_STOPPED_PAYLOAD, STOP_ALL_METHOD,
};
pub use token::{
    CorrelationId, InstanceId, InstanceToken, TokenError, CORRELATION_ID_BYTE_LENGTH,
    INSTANCE_TOKEN_BYTE_LENGTH, INSTANCE_TOKEN_ENCODED_LENGTH,
};

/// Query parameter carrying the instance token on the upgrade request.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Builds the URL a child uses to reach its control server.
pub fn control_url(addr: std::net::SocketAddr, token: &InstanceToken) -> String {
    format!("ws://{addr}/?{TOKEN_QUERY_PARAM}={}", token.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_url_carries_the_token() {
        let token = InstanceToken::generate();
        let url = control_url("127.0.0.1:4100".parse().unwrap(), &token);
        assert_eq!(url, format!("ws://127.0.0.1:4100/?token={}", token.to_hex()));
    }
}
