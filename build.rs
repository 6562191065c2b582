use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=SFAN_BENCH_GIT_SHA");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    if let Ok(sha) = env::var("SFAN_BENCH_GIT_SHA") {
        if !sha.trim().is_empty() {
            println!("cargo:rustc-env=SFAN_BENCH_GIT_SHA={}", sha.trim());
        }
        return;
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output();

    let mut sha = String::from("unknown");
    if let Ok(output) = output {
        if output.status.success() {
            let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !found.is_empty() {
                sha = found;
            }
        }
    }
    println!("cargo:rustc-env=SFAN_BENCH_GIT_SHA={}", sha);
}
