//! Unpacking the boot archive into `/initrd`.

use tar_decoder::{EntryType, TarDecoder};

use crate::prelude::*;
use crate::process::Credentials;

use super::vfs::file::{self, OpenFlags};

/// Creates `/initrd` and unpacks the tar archive the bootloader handed
/// over into it, file names taken verbatim from the headers.
pub(super) fn unpack() {
    let creds = Credentials::default();
    let root = super::root_walker();

    super::create_directory(&root, &creds, "/initrd", 0o755)
        .expect("failed to create /initrd");

    let archive = osmium_frame::boot::initrd_bytes();
    info!("initrd: unpacking {} bytes", archive.len());

    for entry in TarDecoder::new(archive) {
        let entry = entry.expect("corrupted initrd archive");
        let mut path = String::from("/initrd/");
        path.push_str(entry.name());

        match entry.entry_type() {
            EntryType::Dir => {
                let path = path.trim_end_matches('/');
                super::create_directory(&root, &creds, path, 0o755)
                    .unwrap_or_else(|err| panic!("initrd: mkdir {}: {:?}", path, err));
            }
            EntryType::File => {
                let fp = file::open(
                    &root,
                    &root,
                    &creds,
                    0,
                    &path,
                    OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL,
                    0o755,
                )
                .unwrap_or_else(|err| panic!("initrd: create {}: {:?}", path, err));
                let written = fp
                    .write(entry.data())
                    .unwrap_or_else(|err| panic!("initrd: write {}: {:?}", path, err));
                assert_eq!(written, entry.data().len());
            }
        }
    }
}
