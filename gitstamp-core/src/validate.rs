//! Request fingerprint validation (§3, testable property 1). Grounded in
//! `original_source/zeitgitter/stamper.py` (`valid_commit`/`valid_tag`).

/// `^[0-9a-f]{40}$`, no embedded newline (the regex already excludes it,
/// but the check is kept explicit to match the spec's "⇔" definition).
pub fn valid_commit(commit: &str) -> bool {
    commit.len() == 40
        && commit.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        && !commit.contains('\n')
}

/// `^[_a-zA-Z][-._a-zA-Z0-9]{0,99}$`, no `..`, no embedded newline.
pub fn valid_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 100 || tag.contains('\n') || tag.contains("..") {
        return false;
    }
    let mut chars = tag.chars();
    let first = chars.next().unwrap();
    if !(first == '_' || first.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c == '-' || c == '.' || c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_commit_accepts_only_well_formed_hex() {
        assert!(valid_commit(&"1".repeat(40)));
        assert!(!valid_commit(&"0".repeat(39)));
        assert!(!valid_commit(&"0".repeat(41)));
        assert!(!valid_commit(&format!("{}\n", "0".repeat(39))));
        assert!(!valid_commit("G".to_string().repeat(40).as_str()));
        assert!(!valid_commit(&"A".repeat(40))); // uppercase hex rejected
    }

    #[test]
    fn valid_tag_rejects_dotdot_and_overlong_and_newline() {
        assert!(valid_tag("sample-timestamping-tag"));
        assert!(!valid_tag(".."));
        assert!(!valid_tag("0")); // must start with letter or underscore
        assert!(valid_tag("_ok"));
        assert!(!valid_tag(&"a".repeat(101)));
        assert!(valid_tag(&"a".repeat(100)));
        assert!(!valid_tag("has\nnewline"));
        assert!(!valid_tag("a..b"));
    }
}
