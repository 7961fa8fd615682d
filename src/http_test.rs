use super::*;

fn api_config(base: &str) -> ApiConfig {
    ApiConfig {
        api_base: base.to_owned(),
        api_key: "key-1".to_owned(),
        request_timeout_secs: 5,
        connect_timeout_secs: 5,
    }
}

#[test]
fn backend_message_prefers_error_field() {
    assert_eq!(backend_message(r#"{"error":"bad fingerprint"}"#, "fallback"), "bad fingerprint");
}

#[test]
fn backend_message_reads_message_field() {
    assert_eq!(backend_message(r#"{"message":"expired"}"#, "fallback"), "expired");
}

#[test]
fn backend_message_falls_back_on_unparsable_body() {
    assert_eq!(backend_message("<html>502</html>", "Failed to create session"), "Failed to create session");
    assert_eq!(backend_message("", "fallback"), "fallback");
    assert_eq!(backend_message(r#"{"error":"  "}"#, "fallback"), "fallback");
}

#[test]
fn client_trims_trailing_slash_from_base() {
    let client = ApiClient::new(&api_config("https://chat.example.com/api/")).expect("client");
    assert_eq!(client.api_base(), "https://chat.example.com/api");
    assert_eq!(client.url("/widget/session"), "https://chat.example.com/api/widget/session");
}

#[test]
fn client_rejects_non_http_base() {
    let err = ApiClient::new(&api_config("ftp://chat.example.com")).expect_err("should fail");
    assert!(matches!(err, ApiError::InvalidBaseUrl(_)));
}

#[test]
fn backend_error_exposes_status() {
    let err = ApiError::Backend { status: 401, message: "nope".to_owned() };
    assert_eq!(err.status(), Some(401));
    assert_eq!(err.to_string(), "nope (HTTP 401)");
}
