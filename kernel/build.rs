// build.rs
fn main() {
    // host builds only run the unit tests and link normally
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg-bins=-T{}/linker.ld", dir);
    }
    println!("cargo:rerun-if-changed=linker.ld");
}
