/// Redacts a credential for logging: the first 5 characters survive, the
/// rest becomes an ellipsis.
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(5).collect();
    if prefix.len() == value.len() {
        prefix
    } else {
        format!("{prefix}...")
    }
}

#[cfg(test)]
mod tests {
    use super::redact;

    #[test]
    fn long_values_keep_five_characters() {
        assert_eq!(redact("super-secret-key"), "super...");
    }

    #[test]
    fn short_values_pass_through() {
        assert_eq!(redact("key"), "key");
        assert_eq!(redact(""), "");
    }
}
