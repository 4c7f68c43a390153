//! Build script: assembles the architecture-specific boot stubs and linker script.

fn main() {
	println!("cargo::rerun-if-changed=src/arch");
	cc::Build::new()
		.file("src/arch/x86/boot.S")
		.compile("boot");
	println!("cargo::rustc-link-arg=-Tsrc/arch/x86/linker.ld");
}
