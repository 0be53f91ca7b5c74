//! The bootloader hand-off.
//!
//! A single structure arrives from the bootloader; everything the kernel
//! knows about the machine at entry is in here. Optional trailing blocks
//! are only valid when the matching feature bit is set.

pub mod memory_region;

use spin::Once;

use crate::config::PAGE_SIZE;
use memory_region::MemoryMapIter;

pub const FEATURE_BOOT_ID: u64 = 1 << 0;
pub const FEATURE_VIDEO: u64 = 1 << 1;
pub const FEATURE_RSDP: u64 = 1 << 2;

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PixelFormat {
    pub bpp: i32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub alpha_mask: u32,
    pub pixel_spacing: u32,
    pub scanline_spacing: u32,
}

/// The boot information block, exactly as the bootloader writes it.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BootInfo {
    pub features: u64,
    pub kernel_main: u64,
    pub gdt_pointer_virt: u64,
    pub pml4_phys: u32,
    pub mmap_size: u32,
    pub mmap: u64,
    pub initrd_size: u64,
    /// First free physical address past the kernel image and initrd.
    pub end: u64,
    pub initrd_symtab_offset: u64,
    pub initrd_strtab_offset: u64,
    pub num_symbols: u64,

    /* FEATURE_BOOT_ID */
    pub boot_id: [u8; 16],

    /* FEATURE_VIDEO */
    pub framebuffer: u64,
    pub backbuffer: u64,
    pub fb_width: u32,
    pub fb_height: u32,
    pub fb_format: PixelFormat,

    /* FEATURE_RSDP */
    pub pad_before_rsdp: u32,
    pub rsdp_phys: u64,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

extern "C" {
    /// Start of the `.initrd` section the bootloader fills in.
    fn __initrd_start();
}

pub(crate) fn init(boot_info_vaddr: usize) {
    // Safety: the boot path passes the address of the structure the
    // bootloader handed over, mapped by the bootloader's page tables which
    // are still live at this point.
    let info = unsafe { core::ptr::read_unaligned(boot_info_vaddr as *const BootInfo) };
    BOOT_INFO.call_once(|| info);
    // Copies first: the struct is packed, so the fields cannot be
    // borrowed by the format machinery.
    let (features, mmap, mmap_size, initrd_size) =
        (info.features, info.mmap, info.mmap_size, info.initrd_size);
    log::info!(
        "boot: features {:#x}, memory map at {:#x} ({} bytes), initrd {} bytes",
        features,
        mmap,
        mmap_size,
        initrd_size,
    );
}

pub fn boot_info() -> &'static BootInfo {
    BOOT_INFO.get().expect("boot info not initialized")
}

/// Iterates the bootloader memory map.
pub fn memory_regions() -> MemoryMapIter {
    let info = boot_info();
    // Safety: the map was valid at hand-off and lives in the kernel image
    // area, which stays mapped.
    unsafe { MemoryMapIter::new(info.mmap as usize, info.mmap_size as usize) }
}

/// The first physical address the frame pool may claim: everything below
/// `end` holds the kernel image, boot structures and the initrd.
pub fn first_free_paddr() -> u64 {
    (boot_info().end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// The initrd archive, linked into a dedicated section of the image.
pub fn initrd_bytes() -> &'static [u8] {
    let size = boot_info().initrd_size as usize;
    // Safety: the bootloader copies `initrd_size` bytes to the `.initrd`
    // section before jumping to the kernel.
    unsafe { core::slice::from_raw_parts(__initrd_start as usize as *const u8, size) }
}

/// Physical address of the ACPI RSDP, when the bootloader found one.
pub fn rsdp_phys() -> Option<u64> {
    let info = boot_info();
    let (features, rsdp_phys) = (info.features, info.rsdp_phys);
    (features & FEATURE_RSDP != 0).then_some(rsdp_phys)
}
