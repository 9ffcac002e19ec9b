use std::env;

const TARGET: &str = "thumbv7em-none-eabihf";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target = env::var("TARGET").unwrap_or_default();

    // host builds are only used to run the unit tests against the simulated register file
    if target != TARGET && env::var("HOST").map(|host| host != target).unwrap_or(true) {
        println!("cargo:warning=Unsupported target! Please run with '--target thumbv7em-none-eabihf'.")
    }
}
