use std::path::PathBuf;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Files whose change moves HEAD: HEAD itself, the branch ref it points at,
/// and packed-refs.
fn head_files() -> Vec<PathBuf> {
    let Some(git_dir) = git(&["rev-parse", "--git-dir"]) else {
        return Vec::new();
    };
    let mut git_dir = PathBuf::from(git_dir);
    if git_dir.is_relative() {
        if let Ok(manifest) = std::env::var("CARGO_MANIFEST_DIR") {
            git_dir = PathBuf::from(manifest).join(git_dir);
        }
    }

    let mut files = vec![git_dir.join("HEAD"), git_dir.join("packed-refs")];
    if let Some(branch) = git(&["symbolic-ref", "-q", "HEAD"]) {
        files.push(git_dir.join(branch));
    }
    files.retain(|f| f.exists());
    files
}

fn main() {
    // Prefer an explicit revision (release pipelines), then git, then "unknown".
    let revision = std::env::var("LAYERD_REVISION")
        .ok()
        .filter(|r| !r.is_empty())
        .or_else(|| git(&["rev-parse", "--short=12", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_owned());

    println!("cargo:rustc-env=LAYERD_REVISION={revision}");
    println!("cargo:rerun-if-env-changed=LAYERD_REVISION");
    println!("cargo:rerun-if-changed=build.rs");
    for file in head_files() {
        println!("cargo:rerun-if-changed={}", file.display());
    }
}
