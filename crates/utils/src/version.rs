use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Version string reported by the CLI and logged at daemon startup.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    render(
        env!("RELEASE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.is_dirty(),
    )
});

fn render(release_version: &str, commit_sha1: Option<&str>, git_dirty: bool) -> String {
    let commit = commit_sha1
        .map(|sha| &sha[..sha.len().min(12)])
        .unwrap_or("unknown");
    format!(
        "{release_version}-{commit}{}",
        if git_dirty { "-dirty" } else { "" }
    )
}
