//! Stamps the binary with the revision it was built from
//!
//! `QBANK_BUILD_ID` is `<short commit>[+dirty]/<profile>`; `QBANK_BUILD_DATE`
//! is the UTC build date. Both fall back to `unknown` outside a checkout.

use std::process::Command;

/// Output of a git subcommand, or `None` when git is missing or fails
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    let revision = match git(&["rev-parse", "--short=10", "HEAD"]) {
        Some(hash) => {
            let dirty = git(&["status", "--porcelain", "--untracked-files=no"]).is_some_and(|s| !s.is_empty());
            if dirty {
                format!("{}+dirty", hash)
            } else {
                hash
            }
        }
        None => "unknown".to_string(),
    };
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=QBANK_BUILD_ID={}/{}", revision, profile);
    println!(
        "cargo:rustc-env=QBANK_BUILD_DATE={}",
        chrono::Utc::now().format("%Y-%m-%d")
    );
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
