//! Small shared helpers

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// `user:pass` encoded for a Basic authorization header value.
pub fn basic_auth(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_credentials() {
        assert_eq!(basic_auth("Aladdin", "open sesame"), "QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }
}
