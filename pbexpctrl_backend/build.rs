use std::env;

// Adds the driver library directories to the link search path for the `hardware` feature.
fn main() {
    if env::var_os("CARGO_FEATURE_HARDWARE").is_none() {
        return;
    }
    for var in ["SPINAPI_LIB_DIR", "NIDAQMX_LIB_DIR"] {
        println!("cargo:rerun-if-env-changed={}", var);
        if let Ok(dir) = env::var(var) {
            println!("cargo:rustc-link-search=native={}", dir);
        }
    }
}
