use std::env;
use std::path::PathBuf;

use cc::Build;

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let include_dir = manifest_dir.join("include");
    let sources = ["csrc/tuple_pack.c"];

    println!(
        "cargo:rerun-if-changed={}",
        include_dir.join("molt_capi.h").display()
    );
    for src in sources {
        println!("cargo:rerun-if-changed={}", manifest_dir.join(src).display());
    }

    if target_os == "macos" {
        println!("cargo:rustc-link-arg-cdylib=-Wl,-undefined,dynamic_lookup");
    }

    let mut build = Build::new();
    build.include(&include_dir);
    for src in sources {
        build.file(manifest_dir.join(src));
    }
    build.flag_if_supported("-std=c99");
    build.warnings(true);
    build.compile("molt_capi_shim");
}
