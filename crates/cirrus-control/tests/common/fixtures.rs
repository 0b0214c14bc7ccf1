//! Test fixtures for control plane integration tests.

use bytes::Bytes;

/// A library with exactly one handler.
pub const ONE_HANDLER: &str = r#"use cirrus_sdk::FunctionHandler;

#[derive(Default)]
pub struct Echo;

impl FunctionHandler for Echo {}
"#;

/// A library with no handler.
pub const NO_HANDLER: &str = "pub fn helper() -> u32 { 7 }\n";

/// A library with two handlers.
pub const TWO_HANDLERS: &str = r#"use cirrus_sdk::FunctionHandler;

#[derive(Default)]
pub struct First;
impl FunctionHandler for First {}

#[derive(Default)]
pub struct Second;
impl FunctionHandler for Second {}
"#;

const MANIFEST: &str = r#"[package]
name = "echo-fn"
version = "0.1.0"
edition = "2021"

[dependencies]
cirrus-sdk = "0.1"

[dev-dependencies]
insta = "1"
"#;

/// Builder for source archives.
pub struct ArchiveBuilder {
    files: Vec<(String, String)>,
}

impl ArchiveBuilder {
    /// Starts an archive containing a manifest and `lib` as `src/lib.rs`.
    pub fn crate_with_lib(lib: &str) -> Self {
        Self {
            files: vec![
                ("Cargo.toml".to_owned(), MANIFEST.to_owned()),
                ("src/lib.rs".to_owned(), lib.to_owned()),
            ],
        }
    }

    /// Adds a file.
    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.push((path.to_owned(), contents.to_owned()));
        self
    }

    /// Builds an uncompressed tar.
    pub fn tar(&self) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Builds a zstd-compressed tar.
    pub fn tar_zst(&self) -> Bytes {
        Bytes::from(zstd::encode_all(self.tar().as_slice(), 3).unwrap())
    }
}

/// A tar.zst archive of a crate with a single handler.
pub fn handler_archive() -> Bytes {
    ArchiveBuilder::crate_with_lib(ONE_HANDLER).tar_zst()
}
