//! Loading ELF64 executables into a fresh address space.

use osmium_frame::user::UserContext;
use xmas_elf::header;
use xmas_elf::program::{self, ProgramHeader};
use xmas_elf::ElfFile;

use crate::fs::vfs::file::{self, OpenFlags};
use crate::fs::vfs::inode::Access;
use crate::prelude::*;
use crate::process::mem::{MmapFlags, ProtFlags};

/// The fixed user stack region.
pub const USER_STACK_BASE: Vaddr = 0x20_0000;
pub const USER_STACK_SIZE: usize = 0x20_0000;

/// Loads the static executable at `path` into the calling process's
/// address space and returns the entry context: program counter at the
/// ELF entry point, stack pointer at the top of the fresh stack, FPU
/// state reset.
pub fn load_program(path: &str) -> Result<UserContext> {
    let proc = current!();
    let creds = proc.credentials();
    let (root, cwd) = {
        let dirs = proc.dirs.lock();
        (dirs.root.clone(), dirs.cwd.clone())
    };

    let fp = file::open(&cwd, &root, &creds, 0, path, OpenFlags::RDONLY, 0)?;
    if !fp.inode().check_access(&creds, Access::EXEC) {
        return_errno!(Errno::EACCES);
    }

    // Small static executables; pull the whole image through the page
    // cache and hand it to the parser.
    let size = fp.inode().size() as usize;
    let mut image = vec![0u8; size];
    let read = fp.pread(&mut image, 0)?;
    if read != size {
        return_errno!(Errno::ENOEXEC);
    }

    let elf = ElfFile::new(&image).map_err(|_| Error::new(Errno::ENOEXEC))?;
    check_header(&elf)?;

    for ph in elf.program_iter() {
        let ProgramHeader::Ph64(ph) = ph else {
            return_errno!(Errno::ENOEXEC);
        };
        match ph.get_type().map_err(|_| Error::new(Errno::ENOEXEC))? {
            program::Type::Null => continue,
            program::Type::Load => load_segment(&fp, ph)?,
            // Anything else (interpreters included) means this is not
            // the static executable we support.
            _ => return_errno!(Errno::ENOEXEC),
        }
    }

    // The stack goes in last, fixed, read-write.
    let space = proc.address_space();
    space.mmap(
        USER_STACK_BASE,
        USER_STACK_SIZE,
        ProtFlags::READ | ProtFlags::WRITE,
        MmapFlags::ANON | MmapFlags::PRIVATE | MmapFlags::FIXED,
        None,
        0,
    )?;

    let mut ctx = UserContext::new();
    ctx.rip = elf.header.pt2.entry_point();
    ctx.rsp = (USER_STACK_BASE + USER_STACK_SIZE) as u64;
    ctx.fpu.reset();
    Ok(ctx)
}

fn check_header(elf: &ElfFile) -> Result<()> {
    let pt1 = &elf.header.pt1;
    if pt1.class() != header::Class::SixtyFour {
        return_errno!(Errno::ENOEXEC);
    }
    if pt1.data() != header::Data::LittleEndian {
        return_errno!(Errno::ENOEXEC);
    }
    if elf.header.pt2.type_().as_type() != header::Type::Executable {
        return_errno!(Errno::ENOEXEC);
    }
    if elf.header.pt2.machine().as_machine() != header::Machine::X86_64 {
        return_errno!(Errno::ENOEXEC);
    }
    Ok(())
}

/// One PT_LOAD segment: the whole memory image anonymous first, then the
/// file-backed prefix mapped over it. Bytes between the file size and
/// the memory size read zero either way (anonymous pages, or the
/// zero-fill past end-of-file in the page cache).
fn load_segment(fp: &Arc<file::File>, ph: &program::ProgramHeader64) -> Result<()> {
    if ph.virtual_addr & 0xFFF != ph.offset & 0xFFF {
        // Not congruent modulo the page size.
        return_errno!(Errno::ENOEXEC);
    }
    if ph.file_size > ph.mem_size {
        return_errno!(Errno::ENOEXEC);
    }

    let page_off = (ph.virtual_addr & 0xFFF) as usize;
    let vaddr = (ph.virtual_addr & !0xFFF) as Vaddr;
    let offset = ph.offset & !0xFFF;
    let mem_size = ph.mem_size as usize + page_off;
    let file_size = ph.file_size as usize + page_off;

    let mut prot = ProtFlags::empty();
    if ph.flags.is_read() {
        prot |= ProtFlags::READ;
    }
    if ph.flags.is_write() {
        prot |= ProtFlags::WRITE;
    }
    if ph.flags.is_execute() {
        prot |= ProtFlags::EXEC;
    }

    let space = current!().address_space();
    space.mmap(
        vaddr,
        mem_size,
        prot,
        MmapFlags::ANON | MmapFlags::PRIVATE | MmapFlags::FIXED,
        None,
        0,
    )?;
    if file_size != 0 {
        space.mmap(
            vaddr,
            file_size,
            prot,
            MmapFlags::PRIVATE | MmapFlags::FIXED,
            Some((fp.inode().clone(), fp.oflags())),
            offset,
        )?;
    }
    Ok(())
}
