use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use libbpf_cargo::SkeletonBuilder;

const SRC: [&str; 1] = ["src/bpf/waittrace.bpf.c"];

fn main() {
    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR must be set in build script"));

    // The uapi headers pull in <asm/types.h>, which lives under the multiarch
    // include directory on Debian-style systems.
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_else(|_| "x86_64".to_string());
    let include_args = [
        format!("-I{}", out_dir.display()),
        format!("-I/usr/include/{}-linux-gnu", arch),
    ];

    for src in SRC {
        let srcpath = Path::new(src);
        let fname = srcpath.file_name().unwrap().to_str().unwrap();
        let prefix = match fname.split_once(".bpf.c") {
            Some((prefix, _)) => prefix,
            None => fname,
        };
        let skel_path = out_dir.join(format!("{}.skel.rs", prefix));
        SkeletonBuilder::new()
            .source(src)
            .clang_args(include_args.iter().map(OsStr::new))
            .build_and_generate(&skel_path)
            .expect("Failed to build BPF skeleton");
        println!("cargo:rerun-if-changed={}", src);
    }
}
