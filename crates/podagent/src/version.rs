//! Build identity reported by `--version` and the startup banner.

use std::sync::LazyLock;

/// Crate version plus the commit the binary was built from, e.g.
/// `0.9.0+3f2a91c` or `0.9.0+3f2a91c-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let commit = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    let dirty = if matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true")) {
        "-dirty"
    } else {
        ""
    };
    format!("{}+{commit}{dirty}", env!("CARGO_PKG_VERSION"))
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_embeds_crate_version_and_commit() {
        assert!(VERSION.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(VERSION.contains('+'));
    }
}
