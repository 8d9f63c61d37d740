use super::options::AuthOptions;

/// Opaque-token authenticator (§4.5). When disabled, every `Connect`
/// succeeds; there is no per-queue authorization in the core.
#[derive(Debug, Clone)]
pub struct Authenticator {
    enabled: bool,
    token: Option<String>,
}

impl Authenticator {
    pub fn new(options: &AuthOptions) -> Self {
        Self { enabled: options.enabled, token: options.token.clone() }
    }

    pub fn check(&self, presented: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        match (&self.token, presented) {
            (Some(expected), Some(actual)) => constant_time_eq(expected.as_bytes(), actual.as_bytes()),
            _ => false,
        }
    }
}

/// Compares two byte strings in time independent of where they first differ,
/// so a timing side channel cannot be used to guess the token byte by byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_accepts_anything() {
        let auth = Authenticator::new(&AuthOptions { enabled: false, token: None });
        assert!(auth.check(None));
        assert!(auth.check(Some("whatever")));
    }

    #[test]
    fn enabled_auth_requires_matching_token() {
        let auth = Authenticator::new(&AuthOptions {
            enabled: true,
            token: Some("secret-token".to_string()),
        });
        assert!(auth.check(Some("secret-token")));
        assert!(!auth.check(Some("wrong-token")));
        assert!(!auth.check(None));
    }

    #[test]
    fn constant_time_eq_matches_naive_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
