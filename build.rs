//! Build script for gpu-stress.
//!
//! The CUDA backend loads the driver, cuRAND and cuBLAS at runtime, so
//! nothing is linked here. cudarc picks its bindings from the toolkit
//! version reported by `nvcc`; rebuild when the toolkit location changes.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "cuda")]
    {
        println!("cargo:rerun-if-env-changed=CUDA_PATH");
        println!("cargo:rerun-if-env-changed=CUDA_ROOT");
        println!("cargo:warning=CUDA feature enabled - ensure CUDA toolkit is installed");
    }
}
